//! Constant-rate sampled birth–death machinery: crown capture probability,
//! the Stadler likelihood, maximum-likelihood rate estimation, and draws of
//! new branching times from the reconstructed process.

mod ccp;
mod likelihood;
mod optim;
mod times;

pub use ccp::crown_capture_probability;
pub use likelihood::{log_likelihood, p0, p1};
pub use optim::{estimate_birth_death, BirthDeathEstimate};
pub use times::branching_times;

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ProcessError {
    #[error("invalid branching-time interval: upper bound {t_old} does not exceed lower bound {t_young}")]
    InvalidInterval { t_old: f64, t_young: f64 },
}
