//! PostgreSQL session advisory locks
//!
//! Each held lock pins one pooled connection: the server ties a session lock
//! to its connection and frees it when that connection closes, which is what
//! makes a crashed holder safe. Session locks have no TTL, so `extend` only
//! confirms the session still holds the lock.

use std::time::Duration;

use ahash::AHashMap;
use async_trait::async_trait;
use deadpool_postgres::{Config, ManagerConfig, Object, Pool, PoolConfig, RecyclingMethod, Runtime};
use parking_lot::Mutex;
use serde::Deserialize;
use tokio_postgres::NoTls;

use super::LockBackend;
use crate::error::{ConfigError, LockError};

const fn default_port() -> u16 {
    5432
}

fn default_user() -> String {
    "herald".to_string()
}

const fn default_pool_size() -> usize {
    8
}

const fn default_timeout_ms() -> u64 {
    2_000
}

#[derive(Debug, Clone, Deserialize)]
pub struct PostgresConfig {
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default = "default_user")]
    pub user: String,

    #[serde(default)]
    pub password: Option<String>,

    pub dbname: String,

    /// Upper bound on connections, held locks each pin one
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,

    /// Upper bound on any single lock operation, including pool wait
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

impl PostgresConfig {
    #[must_use]
    pub const fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// The 64-bit advisory lock id for a key: the first 8 bytes of its MD5.
#[must_use]
pub fn lock_id(key: &str) -> i64 {
    let digest = md5::compute(key.as_bytes());
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest.0[..8]);
    i64::from_be_bytes(bytes)
}

/// A connection that can be closed instead of returned to its pool.
trait Detach {
    fn detach(self);
}

impl Detach for Object {
    fn detach(self) {
        drop(Self::take(self));
    }
}

/// A pooled connection whose session may own an advisory lock.
///
/// Dropping it closes the session, so a lock granted by a query whose
/// response was lost to a timeout or a cancelled caller dies with it.
/// Only [`Pinned::recycle`] hands the connection back to the pool.
struct Pinned<C: Detach> {
    conn: Option<C>,
}

impl<C: Detach> Pinned<C> {
    const fn new(conn: C) -> Self {
        Self { conn: Some(conn) }
    }

    /// Return the connection to the pool. The session must hold no lock.
    fn recycle(mut self) {
        drop(self.conn.take());
    }
}

impl<C: Detach> Drop for Pinned<C> {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            conn.detach();
        }
    }
}

impl Pinned<Object> {
    async fn query_flag(&self, sql: &str, id: i64) -> Result<bool, LockError> {
        let Some(conn) = &self.conn else {
            return Err(LockError::Pool("connection already released".to_string()));
        };
        let row = conn.query_one(sql, &[&id]).await?;
        Ok(row.try_get(0)?)
    }
}

struct Held {
    token: String,
    conn: Pinned<Object>,
}

pub struct AdvisoryLockBackend {
    pool: Pool,
    held: Mutex<AHashMap<String, Held>>,
    timeout: Duration,
}

impl std::fmt::Debug for AdvisoryLockBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdvisoryLockBackend")
            .field("held", &self.held.lock().len())
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl AdvisoryLockBackend {
    /// Build the connection pool. Connections are opened lazily.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if the pool cannot be created.
    pub fn open(config: &PostgresConfig) -> Result<Self, ConfigError> {
        if config.pool_size == 0 {
            return Err(ConfigError::InvalidLock(
                "pool_size must be positive".to_string(),
            ));
        }

        let mut cfg = Config::new();
        cfg.host = Some(config.host.clone());
        cfg.port = Some(config.port);
        cfg.user = Some(config.user.clone());
        cfg.password.clone_from(&config.password);
        cfg.dbname = Some(config.dbname.clone());
        cfg.connect_timeout = Some(config.timeout());
        cfg.manager = Some(ManagerConfig {
            recycling_method: RecyclingMethod::Fast,
        });
        cfg.pool = Some(PoolConfig::new(config.pool_size));

        let pool = cfg
            .create_pool(Some(Runtime::Tokio1), NoTls)
            .map_err(|err| ConfigError::InvalidLock(err.to_string()))?;

        Ok(Self {
            pool,
            held: Mutex::new(AHashMap::new()),
            timeout: config.timeout(),
        })
    }

    async fn bounded<T, F>(&self, fut: F) -> Result<T, LockError>
    where
        F: Future<Output = Result<T, LockError>>,
    {
        tokio::time::timeout(self.timeout, fut)
            .await
            .map_err(|_| LockError::Timeout(self.timeout))?
    }

    /// Take the held connection for `key` out of the map if `token` owns it.
    fn take_owned(&self, key: &str, token: &str) -> Option<Held> {
        let mut held = self.held.lock();
        if held.get(key).is_some_and(|entry| entry.token == token) {
            held.remove(key)
        } else {
            None
        }
    }
}

#[async_trait]
impl LockBackend for AdvisoryLockBackend {
    #[tracing::instrument(level = "trace", skip(self, token, _ttl))]
    async fn try_acquire(&self, key: &str, token: &str, _ttl: Duration) -> Result<bool, LockError> {
        if self.held.lock().contains_key(key) {
            return Ok(false);
        }

        let id = lock_id(key);
        let conn = self
            .bounded(async {
                self.pool
                    .get()
                    .await
                    .map_err(|err| LockError::Pool(err.to_string()))
            })
            .await?;

        let conn = Pinned::new(conn);
        let acquired = self
            .bounded(conn.query_flag("SELECT pg_try_advisory_lock($1)", id))
            .await?;

        if !acquired {
            conn.recycle();
            return Ok(false);
        }

        self.held.lock().insert(
            key.to_string(),
            Held {
                token: token.to_string(),
                conn,
            },
        );
        Ok(true)
    }

    #[tracing::instrument(level = "trace", skip(self, token))]
    async fn release(&self, key: &str, token: &str) -> Result<bool, LockError> {
        let Some(Held { conn, .. }) = self.take_owned(key, token) else {
            return Ok(false);
        };

        let unlocked = self
            .bounded(conn.query_flag("SELECT pg_advisory_unlock($1)", lock_id(key)))
            .await;

        if let Ok(true) = unlocked {
            conn.recycle();
        } else {
            // Closing the session frees every lock it holds
            tracing::warn!(key, "Advisory unlock failed, discarding connection");
        }
        Ok(true)
    }

    #[tracing::instrument(level = "trace", skip(self, token, _ttl))]
    async fn extend(&self, key: &str, token: &str, _ttl: Duration) -> Result<bool, LockError> {
        let Some(held) = self.take_owned(key, token) else {
            return Ok(false);
        };

        let still_held = self
            .bounded(held.conn.query_flag(
                "SELECT EXISTS (SELECT 1 FROM pg_locks WHERE locktype = 'advisory' \
                 AND granted AND pid = pg_backend_pid() \
                 AND ((classid::bigint << 32) | objid::bigint) = $1)",
                lock_id(key),
            ))
            .await;

        // Anything but a confirmed hold drops `held`, closing its session
        if matches!(still_held, Ok(true)) {
            self.held.lock().insert(key.to_string(), held);
        }
        still_held
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    };

    use super::*;

    #[derive(Default)]
    struct Tally {
        detached: AtomicUsize,
        dropped: AtomicUsize,
    }

    struct FakeConn(Arc<Tally>);

    impl Detach for FakeConn {
        fn detach(self) {
            self.0.detached.fetch_add(1, Ordering::SeqCst);
        }
    }

    impl Drop for FakeConn {
        fn drop(&mut self) {
            self.0.dropped.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_recycled_connection_returns_to_pool() {
        let tally = Arc::new(Tally::default());
        Pinned::new(FakeConn(tally.clone())).recycle();

        assert_eq!(tally.detached.load(Ordering::SeqCst), 0);
        assert_eq!(tally.dropped.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_dropped_connection_is_detached() {
        let tally = Arc::new(Tally::default());
        drop(Pinned::new(FakeConn(tally.clone())));

        assert_eq!(tally.detached.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_acquire_detaches_connection() {
        let tally = Arc::new(Tally::default());

        // The server may have granted the lock before the caller gave up
        let conn = Pinned::new(FakeConn(tally.clone()));
        let attempt = async move {
            std::future::pending::<()>().await;
            conn.recycle();
        };
        let timed_out = tokio::time::timeout(Duration::from_millis(50), attempt).await;

        assert!(timed_out.is_err());
        assert_eq!(tally.detached.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_lock_id_is_stable() {
        assert_eq!(lock_id("lock:cleanup"), lock_id("lock:cleanup"));
        assert_ne!(lock_id("lock:cleanup"), lock_id("lock:recovery"));

        let digest = md5::compute(b"lock:cleanup");
        assert_eq!(
            lock_id("lock:cleanup").to_be_bytes(),
            <[u8; 8]>::try_from(&digest.0[..8]).unwrap()
        );
    }

    #[test]
    fn test_config_defaults() {
        let config: PostgresConfig = ron::from_str(r#"(host: "db", dbname: "herald")"#).unwrap();
        assert_eq!(config.port, 5432);
        assert_eq!(config.user, "herald");
        assert!(config.password.is_none());
        assert_eq!(config.timeout(), Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_pool_created_lazily() {
        let config: PostgresConfig = ron::from_str(r#"(host: "127.0.0.1", dbname: "herald")"#).unwrap();
        let backend = AdvisoryLockBackend::open(&config).unwrap();

        // Nothing held locally, so release and extend never touch the server
        assert!(!backend.release("lock:a", "t").await.unwrap());
        assert!(!backend.extend("lock:a", "t", Duration::from_secs(1)).await.unwrap());
    }
}
