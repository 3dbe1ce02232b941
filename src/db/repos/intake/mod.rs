pub mod patterns;
pub mod reports;
