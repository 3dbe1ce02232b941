pub mod deploys;
pub mod rollbacks;
