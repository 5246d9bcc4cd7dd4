//! Construction-time configuration failures (see `ConfigError`).
//!
//! Two other error classes exist but are not `Result`-shaped. A protocol
//! violation is a programming-error-class bug that aborts the run with an
//! `assert!`/`panic!` carrying the offending server and request. A
//! measurement gap is handled by the accessor quietly omitting the value
//! rather than fabricating one.

use thiserror::Error;

/// Failures detected when constructing a [`crate::Server`] or
/// [`crate::LoadGenerator`]. All of these are caller bugs: a misconfigured
/// topology, not a runtime condition.
#[derive(Debug, Error, Clone, Copy, PartialEq)]
pub enum ConfigError {
    #[error("avg_service_time must be positive, got {0}")]
    NonPositiveServiceTime(f64),
    #[error("cores must be at least 1, got {0}")]
    ZeroCores(usize),
    #[error("max_pool_size must be at least 1, got {0}")]
    ZeroPoolSize(usize),
    #[error("time_slice must be positive, got {0}")]
    NonPositiveTimeSlice(f64),
    #[error("cs_overhead must be non-negative, got {0}")]
    NegativeOverhead(f64),
    #[error("avg_think_time must be non-negative, got {0}")]
    NegativeThinkTime(f64),
    #[error("no_of_users must be at least 1, got {0}")]
    ZeroUsers(u64),
}
