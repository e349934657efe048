//! Errors in the library.
use thiserror::Error;

/// Message attached to the `DeadlineExceeded` raised when a rate limiter
/// times out. Clients match on it to tell limiter timeouts apart from
/// other deadline expirations, e.g. to convert them into end-of-sequence.
pub const RATE_LIMITER_TIMEOUT_MSG: &str =
    "Rate limiter: timeout exceeded before the operation could be admitted";

/// Errors in the library.
///
/// Variants correspond to the status kinds that cross the service
/// boundary. Components propagate these up to the [`Table`], which maps
/// them onto stream statuses unchanged.
///
/// [`Table`]: crate::Table
#[derive(Clone, Error, Debug, PartialEq, Eq)]
pub enum ResoundError {
    /// The caller passed something malformed: a duplicate key, a negative
    /// priority, a shape mismatch.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// A chunk or table that should exist does not.
    #[error("Not found: {0}")]
    NotFound(String),

    /// The operation is not valid in the current state, e.g. an expired
    /// cell reference or use after close.
    #[error("Failed precondition: {0}")]
    FailedPrecondition(String),

    /// A bounded queue or capacity was exhausted under a non-blocking
    /// operation.
    #[error("Resource exhausted: {0}")]
    ResourceExhausted(String),

    /// A blocking operation did not complete before its deadline.
    #[error("Deadline exceeded: {0}")]
    DeadlineExceeded(String),

    /// The target was closed while the operation was in flight.
    #[error("Cancelled: {0}")]
    Cancelled(String),

    /// The operation was aborted mid-flight; safe to retry.
    #[error("Aborted: {0}")]
    Aborted(String),

    /// Transient transport failure; retried by clients with backoff.
    #[error("Unavailable: {0}")]
    Unavailable(String),

    /// An internal invariant was violated. Not recoverable.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl ResoundError {
    /// Returns true for statuses that clients retry with backoff.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ResoundError::Unavailable(_) | ResoundError::Aborted(_)
        )
    }
}

/// Result type of the library.
pub type Result<T> = std::result::Result<T, ResoundError>;

/// The error returned when a rate limiter deadline expires.
pub fn rate_limiter_timeout() -> ResoundError {
    ResoundError::DeadlineExceeded(RATE_LIMITER_TIMEOUT_MSG.to_string())
}

/// Whether `err` is the rate limiter timeout (as opposed to any other
/// expired deadline).
pub fn is_rate_limiter_timeout(err: &ResoundError) -> bool {
    matches!(err, ResoundError::DeadlineExceeded(msg) if msg.contains(RATE_LIMITER_TIMEOUT_MSG))
}

impl From<std::io::Error> for ResoundError {
    fn from(e: std::io::Error) -> Self {
        ResoundError::Internal(format!("I/O error: {}", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_limiter_timeout_is_detectable() {
        assert!(is_rate_limiter_timeout(&rate_limiter_timeout()));
        assert!(!is_rate_limiter_timeout(&ResoundError::DeadlineExceeded(
            "flush timed out".into()
        )));
        assert!(!is_rate_limiter_timeout(&ResoundError::Cancelled(
            RATE_LIMITER_TIMEOUT_MSG.into()
        )));
    }

    #[test]
    fn transient_statuses() {
        assert!(ResoundError::Unavailable("conn reset".into()).is_transient());
        assert!(ResoundError::Aborted("stream rotated".into()).is_transient());
        assert!(!ResoundError::Internal("bug".into()).is_transient());
    }
}
