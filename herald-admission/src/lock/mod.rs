//! Crash-safe mutual exclusion over a named resource
//!
//! A [`DistLock`] owns a random token for one resource key. Whoever holds the
//! key can release or extend it only while presenting the same token, so a
//! lock that expired and was taken over by another worker cannot be released
//! by its former owner.
//!
//! Two backends are available:
//!
//! - [`CacheLockBackend`]: a TTL-bound marker in the shared store; a crashed
//!   holder's marker expires on its own.
//! - [`AdvisoryLockBackend`]: a PostgreSQL session advisory lock; a crashed
//!   holder's connection drop releases it.

mod advisory;
mod cache;

use std::{fmt, sync::Arc, time::Duration};

use async_trait::async_trait;
use herald_metrics::LockOutcome;
use herald_store::SharedStore;
use serde::Deserialize;

pub use self::{
    advisory::{AdvisoryLockBackend, PostgresConfig},
    cache::CacheLockBackend,
};
use crate::error::{ConfigError, LockError};

const fn default_ttl_secs() -> u64 {
    60
}

/// A store able to hold token-owned, exclusive markers.
#[async_trait]
pub trait LockBackend: Send + Sync + fmt::Debug {
    /// Take `key` for `token` unless someone already holds it.
    async fn try_acquire(&self, key: &str, token: &str, ttl: Duration) -> Result<bool, LockError>;

    /// Give `key` up, only if it is held by `token`.
    async fn release(&self, key: &str, token: &str) -> Result<bool, LockError>;

    /// Keep holding `key` for another `ttl`, only if it is held by `token`.
    async fn extend(&self, key: &str, token: &str, ttl: Duration) -> Result<bool, LockError>;
}

/// Which backend the fleet coordinates through
///
/// ```ron
/// lock: (
///     ttl_secs: 120,
///     backend: (type: "Advisory", host: "db.internal", dbname: "herald"),
/// )
/// ```
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(tag = "type")]
pub enum LockBackendConfig {
    #[default]
    Cache,
    Advisory(PostgresConfig),
}

#[derive(Debug, Clone, Deserialize)]
pub struct LockConfig {
    /// Default time a lock is held before it expires
    #[serde(default = "default_ttl_secs")]
    pub ttl_secs: u64,

    #[serde(default)]
    pub backend: LockBackendConfig,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            ttl_secs: default_ttl_secs(),
            backend: LockBackendConfig::default(),
        }
    }
}

impl LockConfig {
    #[must_use]
    pub const fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }
}

/// Hands out [`DistLock`]s sharing one backend.
#[derive(Debug, Clone)]
pub struct LockService {
    backend: Arc<dyn LockBackend>,
    ttl: Duration,
}

impl LockService {
    /// Build the configured backend. The cache backend uses `store`.
    ///
    /// # Errors
    ///
    /// Returns a configuration error for a zero TTL or an unusable PostgreSQL
    /// configuration.
    pub fn open(config: &LockConfig, store: Arc<dyn SharedStore>) -> Result<Self, ConfigError> {
        if config.ttl_secs == 0 {
            return Err(ConfigError::InvalidLock(
                "ttl_secs must be positive".to_string(),
            ));
        }

        let backend: Arc<dyn LockBackend> = match &config.backend {
            LockBackendConfig::Cache => Arc::new(CacheLockBackend::new(store)),
            LockBackendConfig::Advisory(postgres) => Arc::new(AdvisoryLockBackend::open(postgres)?),
        };

        Ok(Self::with_backend(backend, config.ttl()))
    }

    #[must_use]
    pub fn with_backend(backend: Arc<dyn LockBackend>, ttl: Duration) -> Self {
        Self { backend, ttl }
    }

    /// A fresh lock handle for `resource` with its own ownership token.
    #[must_use]
    pub fn lock(&self, resource: &str) -> DistLock {
        DistLock::new(self.backend.clone(), resource, self.ttl)
    }

    #[must_use]
    pub const fn ttl(&self) -> Duration {
        self.ttl
    }
}

/// An exclusive claim on one resource, identified by a random token.
///
/// `Unheld -> Held` on [`acquire`](Self::acquire); back to `Unheld` on
/// [`release`](Self::release), on TTL expiry, or when the advisory backend's
/// connection drops. [`extend`](Self::extend) keeps it `Held`.
///
/// Backend failures are reported as "not acquired" / "not held".
#[derive(Debug)]
pub struct DistLock {
    backend: Arc<dyn LockBackend>,
    key: String,
    token: String,
    ttl: Duration,
}

fn record(outcome: LockOutcome) {
    if let Some(metrics) = herald_metrics::try_metrics() {
        metrics.admission.record_lock(outcome);
    }
}

impl DistLock {
    #[must_use]
    pub fn new(backend: Arc<dyn LockBackend>, resource: &str, ttl: Duration) -> Self {
        Self {
            backend,
            key: format!("lock:{resource}"),
            token: hex::encode(rand::random::<[u8; 16]>()),
            ttl,
        }
    }

    #[must_use]
    pub fn key(&self) -> &str {
        &self.key
    }

    #[must_use]
    pub fn token(&self) -> &str {
        &self.token
    }

    /// Try to take the lock without waiting.
    pub async fn acquire(&self) -> bool {
        match self.try_acquire().await {
            Ok(true) => {
                record(LockOutcome::Acquired);
                tracing::debug!(key = %self.key, "Lock acquired");
                true
            }
            Ok(false) => {
                record(LockOutcome::Contended);
                tracing::debug!(key = %self.key, "Lock held elsewhere");
                false
            }
            Err(err) => {
                record(LockOutcome::Failed);
                tracing::warn!(key = %self.key, error = %err, "Lock backend failed, treating as not acquired");
                false
            }
        }
    }

    /// Like [`acquire`](Self::acquire), surfacing backend failures.
    ///
    /// # Errors
    ///
    /// Returns the backend error when it could not be reached.
    pub async fn try_acquire(&self) -> Result<bool, LockError> {
        self.backend
            .try_acquire(&self.key, &self.token, self.ttl)
            .await
    }

    /// Give the lock up. Returns `false`, and changes nothing, if this handle
    /// no longer owns it.
    pub async fn release(&self) -> bool {
        match self.backend.release(&self.key, &self.token).await {
            Ok(released) => {
                if !released {
                    tracing::debug!(key = %self.key, "Release ignored, lock not owned");
                }
                released
            }
            Err(err) => {
                tracing::warn!(key = %self.key, error = %err, "Failed to release lock");
                false
            }
        }
    }

    /// Push expiry out to `ttl` from now. Returns `false`, and changes
    /// nothing, if this handle no longer owns the lock.
    pub async fn extend(&self, ttl: Duration) -> bool {
        match self.backend.extend(&self.key, &self.token, ttl).await {
            Ok(extended) => extended,
            Err(err) => {
                tracing::warn!(key = %self.key, error = %err, "Failed to extend lock");
                false
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use herald_common::ManualClock;
    use herald_store::MemoryStore;

    use super::*;

    fn service() -> (Arc<ManualClock>, LockService) {
        let clock = Arc::new(ManualClock::at_unix(1_700_000_000));
        let store = Arc::new(MemoryStore::new(clock.clone()));
        let service = LockService::open(&LockConfig::default(), store).unwrap();
        (clock, service)
    }

    #[test]
    fn test_tokens_are_unique_and_hex() {
        let (_clock, service) = service();
        let first = service.lock("cleanup");
        let second = service.lock("cleanup");

        assert_eq!(first.key(), "lock:cleanup");
        assert_eq!(first.token().len(), 32);
        assert!(first.token().chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(first.token(), second.token());
    }

    #[tokio::test]
    async fn test_single_owner() {
        let (_clock, service) = service();
        let first = service.lock("recovery");
        let second = service.lock("recovery");

        assert!(first.acquire().await);
        assert!(!second.acquire().await);

        assert!(first.release().await);
        assert!(second.acquire().await);
    }

    #[tokio::test]
    async fn test_foreign_release_and_extend_are_noops() {
        let (_clock, service) = service();
        let owner = service.lock("recovery");
        let intruder = service.lock("recovery");

        assert!(owner.acquire().await);
        assert!(!intruder.release().await);
        assert!(!intruder.extend(Duration::from_secs(600)).await);

        // Still held by the owner
        assert!(!intruder.acquire().await);
        assert!(owner.release().await);
    }

    #[tokio::test]
    async fn test_expiry_frees_lock_and_stale_owner_cannot_release() {
        let (clock, service) = service();
        let stale = service.lock("recovery");
        let next = service.lock("recovery");

        assert!(stale.acquire().await);
        clock.advance(Duration::from_secs(61));

        assert!(next.acquire().await);
        assert!(!stale.release().await);
        assert!(!stale.extend(Duration::from_secs(60)).await);
        assert!(next.release().await);
    }

    #[tokio::test]
    async fn test_extend_outlives_original_ttl() {
        let (clock, service) = service();
        let owner = service.lock("recovery");
        let other = service.lock("recovery");

        assert!(owner.acquire().await);
        clock.advance(Duration::from_secs(50));
        assert!(owner.extend(Duration::from_secs(60)).await);

        clock.advance(Duration::from_secs(50));
        assert!(!other.acquire().await);
    }

    #[test]
    fn test_default_config_opens() {
        let config = LockConfig::default();
        assert_eq!(config.ttl(), Duration::from_secs(60));

        let service = LockService::open(&config, Arc::new(MemoryStore::default())).unwrap();
        assert_eq!(service.ttl(), Duration::from_secs(60));
    }

    #[test]
    fn test_zero_ttl_rejected() {
        let config = LockConfig {
            ttl_secs: 0,
            backend: LockBackendConfig::Cache,
        };
        let err = LockService::open(&config, Arc::new(MemoryStore::default())).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidLock(_)));
    }

    #[test]
    fn test_config_from_ron() {
        let config: LockConfig = ron::from_str(
            r#"(ttl_secs: 30, backend: (type: "Advisory", host: "db", dbname: "herald"))"#,
        )
        .unwrap();
        assert_eq!(config.ttl(), Duration::from_secs(30));
        let LockBackendConfig::Advisory(postgres) = config.backend else {
            panic!("expected advisory backend");
        };
        assert_eq!(postgres.host, "db");
        assert_eq!(postgres.port, 5432);

        let config: LockConfig = ron::from_str("()").unwrap();
        assert_eq!(config.ttl(), Duration::from_secs(60));
        assert!(matches!(config.backend, LockBackendConfig::Cache));
    }
}
