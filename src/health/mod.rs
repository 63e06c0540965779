//! Phi-accrual failure detection for backend servers.

mod detector;
mod history;

pub use detector::{FailureDetector, HealthUpdateFn};
pub use history::{ProbeHistory, SAMPLE_SIZE};
