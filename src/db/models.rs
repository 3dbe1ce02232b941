mod breaker;
mod heal;
mod incident;
mod ops;
mod pattern;
mod release;
mod report;

pub use breaker::*;
pub use heal::*;
pub use incident::*;
pub use ops::*;
pub use pattern::*;
pub use release::*;
pub use report::*;
