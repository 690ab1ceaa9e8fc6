//! Error types for the herald-store crate.
//!
//! Store failures are split into transient ones (timeouts, dropped
//! connections, an exhausted pool) that a caller may treat as "try later",
//! and permanent ones (type mismatches, bad configuration) that indicate a bug
//! or an operator mistake.

use std::time::Duration;

use thiserror::Error;

/// Top-level store error type.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The operation did not complete within the configured store timeout.
    #[error("Store operation timed out after {0:?}")]
    Timeout(Duration),

    /// The backend connection failed or was dropped.
    #[error("Store connection error: {0}")]
    Connection(String),

    /// No pooled connection could be obtained.
    #[error("Store pool error: {0}")]
    Pool(String),

    /// The backend rejected the command.
    #[error("Store backend error: {0}")]
    Backend(String),

    /// A key holds a value of a different shape than the operation expects.
    #[error("Unexpected value at '{key}': expected {expected}")]
    UnexpectedValue { key: String, expected: &'static str },

    /// Invalid store configuration.
    #[error("Invalid store configuration: {0}")]
    Configuration(String),
}

impl StoreError {
    /// Whether retrying the same operation later may succeed.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Timeout(_) | Self::Connection(_) | Self::Pool(_)
        )
    }

    pub(crate) fn unexpected(key: &str, expected: &'static str) -> Self {
        Self::UnexpectedValue {
            key: key.to_string(),
            expected,
        }
    }
}

impl From<redis::RedisError> for StoreError {
    fn from(err: redis::RedisError) -> Self {
        if err.is_timeout() {
            Self::Timeout(Duration::ZERO)
        } else if err.is_connection_dropped() || err.is_connection_refusal() || err.is_io_error() {
            Self::Connection(err.to_string())
        } else {
            Self::Backend(err.to_string())
        }
    }
}

/// Specialized `Result` type for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;
