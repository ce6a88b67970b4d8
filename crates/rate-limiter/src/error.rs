use thiserror::Error;

/// Result type for rate limiter operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur when configuring a rate limiter.
#[derive(Debug, Clone, Copy, PartialEq, Error)]
pub enum Error {
    /// The rate is not a positive, finite number of permits per second.
    #[error("invalid rate: {0} permits/second")]
    InvalidRate(f64),
}
