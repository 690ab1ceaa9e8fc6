use std::{sync::Arc, time::Duration};

use herald_common::SharedClock;
use serde::Deserialize;

use crate::{MemoryStore, RedisStore, Result, SharedStore};

const fn default_timeout_ms() -> u64 {
    500
}

const fn default_pool_size() -> usize {
    16
}

const fn default_connect_timeout_ms() -> u64 {
    5_000
}

const fn default_purge_interval_secs() -> u64 {
    60
}

/// Configuration for the shared store backend
///
/// # Examples
///
/// Redis in RON config:
/// ```ron
/// Herald (
///     store: (
///         type: "Redis",
///         url: "redis://127.0.0.1:6379",
///         pool_size: 32,
///     ),
/// )
/// ```
///
/// Single-process in-memory store:
/// ```ron
/// Herald (
///     store: (type: "Memory"),
/// )
/// ```
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type")]
pub enum StoreConfig {
    /// In-process store, only coordinates callers within one process
    Memory(MemoryConfig),
    /// Redis, shared by the whole fleet
    Redis(RedisConfig),
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self::Memory(MemoryConfig::default())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct MemoryConfig {
    /// How often the runtime sweeps expired entries
    #[serde(default = "default_purge_interval_secs")]
    pub purge_interval_secs: u64,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            purge_interval_secs: default_purge_interval_secs(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RedisConfig {
    pub url: String,

    /// Maximum pooled connections
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,

    /// Upper bound on any single store operation, including pool wait
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,

    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
}

impl RedisConfig {
    #[must_use]
    pub const fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    #[must_use]
    pub const fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

/// A store opened from configuration, keeping the concrete memory store
/// reachable for maintenance.
#[derive(Debug, Clone)]
pub enum OpenedStore {
    Memory(MemoryStore),
    Redis(Arc<RedisStore>),
}

impl OpenedStore {
    #[must_use]
    pub fn shared(&self) -> Arc<dyn SharedStore> {
        match self {
            Self::Memory(store) => Arc::new(store.clone()),
            Self::Redis(store) => store.clone(),
        }
    }
}

impl StoreConfig {
    /// Build the configured backend.
    ///
    /// The Redis pool connects lazily, so an unreachable server surfaces on
    /// first use as a transient error rather than here.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if the Redis URL is invalid or the pool
    /// cannot be built.
    pub fn open(&self, clock: SharedClock) -> Result<OpenedStore> {
        match self {
            Self::Memory(_) => Ok(OpenedStore::Memory(MemoryStore::new(clock))),
            Self::Redis(config) => Ok(OpenedStore::Redis(Arc::new(RedisStore::open(config)?))),
        }
    }

    /// Interval for sweeping expired in-memory entries, if applicable.
    #[must_use]
    pub const fn purge_interval(&self) -> Option<Duration> {
        match self {
            Self::Memory(config) => Some(Duration::from_secs(config.purge_interval_secs)),
            Self::Redis(_) => None,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_redis_defaults() {
        let config: StoreConfig =
            ron::from_str(r#"(type: "Redis", url: "redis://localhost")"#).unwrap();

        let StoreConfig::Redis(redis) = config else {
            panic!("expected redis config");
        };
        assert_eq!(redis.url, "redis://localhost");
        assert_eq!(redis.pool_size, 16);
        assert_eq!(redis.timeout(), Duration::from_millis(500));
    }

    #[test]
    fn test_memory_config() {
        let config: StoreConfig = ron::from_str(r#"(type: "Memory")"#).unwrap();
        assert_eq!(config.purge_interval(), Some(Duration::from_secs(60)));
    }

    #[test]
    fn test_invalid_redis_url_rejected() {
        let config = StoreConfig::Redis(RedisConfig {
            url: "not a url".to_string(),
            pool_size: 1,
            timeout_ms: 10,
            connect_timeout_ms: 10,
        });

        let err = config.open(herald_common::SystemClock::shared()).unwrap_err();
        assert!(matches!(err, crate::StoreError::Configuration(_)));
    }
}
