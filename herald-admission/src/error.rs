//! Typed errors for admission operations.
//!
//! - [`ConfigError`]: rejected input, never retried
//! - [`LockError`]: the lock backend could not answer, treated as "not acquired"
//! - [`AdmissionError`]: what callers of the engine see

use std::time::Duration;

use herald_store::StoreError;
use thiserror::Error;

/// Invalid configuration or input, detected synchronously.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// No quotas were given for a campaign.
    #[error("No ESP quotas configured")]
    EmptyQuotas,

    /// Quota percentages do not add up to 100.
    #[error("ESP quotas sum to {0}%, expected 100%")]
    QuotaSum(f64),

    /// A profile appears twice in one quota set.
    #[error("Duplicate ESP profile: {0}")]
    DuplicateProfile(String),

    /// A quota has an empty profile id.
    #[error("ESP profile id must not be empty")]
    EmptyProfile,

    /// A percentage is not a positive finite number.
    #[error("Invalid percentage {value} for ESP profile {profile}")]
    InvalidPercentage { profile: String, value: f64 },

    /// Throttle limits or ISP groups are inconsistent.
    #[error("Invalid throttle configuration: {0}")]
    InvalidThrottle(String),

    /// Backoff policy values are out of range.
    #[error("Invalid backoff policy: {0}")]
    InvalidBackoff(String),

    /// Suppression list loaded without an id.
    #[error("Suppression list id must not be empty")]
    EmptyListId,

    /// A suppression source file could not be read.
    #[error("Failed to read suppression source {path}: {source}")]
    SourceRead {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// Failover settings are out of range.
    #[error("Invalid distribution configuration: {0}")]
    InvalidDistribution(String),

    /// Lock backend settings are unusable.
    #[error("Invalid lock configuration: {0}")]
    InvalidLock(String),
}

/// Failure talking to a lock backend.
#[derive(Debug, Error)]
pub enum LockError {
    #[error("Lock store error: {0}")]
    Store(#[from] StoreError),

    #[error("PostgreSQL error: {0}")]
    Postgres(#[from] tokio_postgres::Error),

    #[error("PostgreSQL pool error: {0}")]
    Pool(String),

    #[error("Lock operation timed out after {0:?}")]
    Timeout(Duration),
}

impl LockError {
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        match self {
            Self::Store(err) => err.is_transient(),
            Self::Postgres(_) | Self::Pool(_) | Self::Timeout(_) => true,
        }
    }
}

/// Top-level admission error type.
#[derive(Debug, Error)]
pub enum AdmissionError {
    #[error("Configuration error: {0}")]
    Configuration(#[from] ConfigError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Lock error: {0}")]
    Lock(#[from] LockError),

    /// The recipient address has no usable domain.
    #[error("Recipient address is malformed")]
    InvalidRecipient,

    /// A scheduled job failed.
    #[error("Job {job} failed: {reason}")]
    Job { job: String, reason: String },
}

impl AdmissionError {
    /// Whether the same call may succeed later.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        match self {
            Self::Store(err) => err.is_transient(),
            Self::Lock(err) => err.is_transient(),
            Self::Configuration(_) | Self::InvalidRecipient | Self::Job { .. } => false,
        }
    }

    #[must_use]
    pub const fn is_configuration(&self) -> bool {
        matches!(self, Self::Configuration(_))
    }
}

pub type Result<T, E = AdmissionError> = std::result::Result<T, E>;
