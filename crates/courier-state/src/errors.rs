//! Backing-store error types.

use thiserror::Error;

/// Failure of a presence or offline-queue backing store.
///
/// Callers never surface these to clients: they log, count the degradation
/// and answer from process-local state instead.
#[derive(Debug, Error)]
pub enum StateError {
    /// Redis command or connection failure.
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// The call did not finish inside its bound.
    #[error("{operation} timed out after {timeout_ms}ms")]
    Timeout {
        /// Operation name, e.g. `presence.add_connection`.
        operation: &'static str,
        /// Bound that elapsed.
        timeout_ms: u64,
    },

    /// A stored payload could not be encoded or decoded.
    #[error("serde error: {0}")]
    Serde(#[from] serde_json::Error),
}

/// Result type for backing-store operations.
pub type Result<T> = std::result::Result<T, StateError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_display() {
        let err = StateError::Timeout {
            operation: "queue.enqueue",
            timeout_ms: 5000,
        };
        assert_eq!(err.to_string(), "queue.enqueue timed out after 5000ms");
    }

    #[test]
    fn redis_error_converts() {
        let err: StateError =
            redis::RedisError::from((redis::ErrorKind::IoError, "connection refused")).into();
        assert!(err.to_string().starts_with("redis error"));
    }
}
