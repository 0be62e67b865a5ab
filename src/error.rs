//! Error types for throttling operations.
//!
//! This module provides the error hierarchy for all rate limiting
//! operations: storage/transport failures, construction-time invalid
//! arguments, and configuration errors. The domain signal for "this
//! request is blocked" is [`crate::throttle::Throttled`], not an error
//! variant here — it carries a reference to the state that caused it
//! rather than just a message, so callers can read `retry_after` off it.

use std::time::Duration;
use thiserror::Error;

/// Result type for rate limiting operations.
pub type Result<T> = std::result::Result<T, RateLimitError>;

/// Main error type for rate limiting operations.
#[derive(Debug, Error)]
pub enum RateLimitError {
    /// Storage backend error (I/O, transport, SQL, Redis).
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// Configuration or construction error.
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Connection error establishing a backend client (Redis, Postgres, SQLite pool).
    #[error("connection error: {0}")]
    Connection(#[from] ConnectionError),
}

/// Storage-related errors. Propagated unchanged to the caller; the core
/// never retries internally — see spec's StoreFailure kind.
#[derive(Debug, Error)]
pub enum StorageError {
    /// Generic storage operation failed (I/O, transport, SQL driver error).
    #[error("{message}")]
    OperationFailed {
        /// Error message from the underlying driver.
        message: String,
        /// Whether the operation can plausibly be retried.
        retryable: bool,
    },

    /// Serialization/deserialization error (Redis entry encoding).
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Connection pool exhausted.
    #[error("connection pool exhausted")]
    PoolExhausted,
}

impl StorageError {
    /// Create a new operation-failed error.
    pub fn operation_failed(message: impl Into<String>, retryable: bool) -> Self {
        Self::OperationFailed {
            message: message.into(),
            retryable,
        }
    }

    /// Check if this error is plausibly retryable.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::OperationFailed { retryable, .. } => *retryable,
            Self::PoolExhausted => true,
            _ => false,
        }
    }
}

/// Configuration/construction errors — the spec's `InvalidArgument` kind.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Both or neither of `leak_rate`/`over_time` were supplied.
    #[error("exactly one of leak_rate or over_time must be provided")]
    AmbiguousRate,

    /// `capacity` was not strictly positive.
    #[error("capacity must be > 0, got {0}")]
    InvalidCapacity(f64),

    /// `leak_rate` (explicit or derived from `over_time`) was not strictly positive.
    #[error("leak_rate must be > 0, got {0}")]
    InvalidLeakRate(f64),

    /// No default adapter has been configured and none was supplied explicitly.
    #[error("no default adapter configured")]
    NoDefaultAdapter,

    /// `set_block` called with a non-positive duration.
    #[error("block_for must be positive, got {0:?}")]
    InvalidBlockDuration(Duration),

    /// Missing required configuration field.
    #[error("missing required configuration: {0}")]
    MissingRequired(String),
}

/// Connection-related errors.
#[derive(Debug, Error)]
pub enum ConnectionError {
    /// Failed to connect.
    #[error("failed to connect: {0}")]
    ConnectionFailed(String),

    /// Connection timeout.
    #[error("connection timeout after {0:?}")]
    Timeout(Duration),

    /// Connection closed unexpectedly.
    #[error("connection closed unexpectedly")]
    Closed,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_storage_error_retryable() {
        let err = StorageError::operation_failed("timeout", true);
        assert!(err.is_retryable());

        let err = StorageError::operation_failed("bad query", false);
        assert!(!err.is_retryable());

        assert!(StorageError::PoolExhausted.is_retryable());
        assert!(!StorageError::Serialization("x".into()).is_retryable());
    }

    #[test]
    fn test_error_display() {
        let err = RateLimitError::Config(ConfigError::AmbiguousRate);
        assert!(err.to_string().contains("leak_rate"));
    }
}
