pub mod intake;
pub mod ops;
pub mod release;
pub mod remediation;
