pub mod baselines;
pub mod escalations;
pub mod runs;
pub mod sessions;
