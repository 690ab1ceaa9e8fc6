//! Redis backend
//!
//! Single commands go straight to the server, multi-step updates use atomic
//! (`MULTI`/`EXEC`) pipelines and anything that has to read before it writes
//! runs as a Lua script. All keys touched by one script must live on the same
//! node, so this backend targets a single primary.

mod pool;
mod scripts;

use std::{collections::HashMap, future::Future, time::Duration};

use async_trait::async_trait;
use deadpool::{
    Runtime,
    managed::{Object, Pool, PoolError},
};
use redis::{Client, aio::MultiplexedConnection};

use crate::{LimitCheck, RedisConfig, Result, SharedStore, StoreError, WindowCounter};

#[derive(Debug)]
struct RedisConnectionManager {
    client: Client,
    connect_timeout: Duration,
}

/// [`SharedStore`] over a pool of multiplexed Redis connections
pub struct RedisStore {
    pool: Pool<RedisConnectionManager>,
    timeout: Duration,
}

impl std::fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStore")
            .field("status", &self.pool.status())
            .field("timeout", &self.timeout)
            .finish()
    }
}

fn ttl_millis(ttl: Duration) -> i64 {
    i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX).max(1)
}

impl From<PoolError<StoreError>> for StoreError {
    fn from(err: PoolError<StoreError>) -> Self {
        match err {
            PoolError::Backend(err) => err,
            other => Self::Pool(other.to_string()),
        }
    }
}

impl RedisStore {
    /// Build the client and the (lazily connecting) pool.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Configuration`] for an unparsable URL or an
    /// invalid pool setup.
    pub fn open(config: &RedisConfig) -> Result<Self> {
        let client = Client::open(config.url.as_str()).map_err(|err| {
            StoreError::Configuration(format!("Failed to open Redis client: {err}"))
        })?;

        let manager = RedisConnectionManager {
            client,
            connect_timeout: config.connect_timeout(),
        };

        let pool = Pool::builder(manager)
            .runtime(Runtime::Tokio1)
            .max_size(config.pool_size)
            .create_timeout(Some(config.connect_timeout()))
            .wait_timeout(Some(config.timeout()))
            .recycle_timeout(Some(config.timeout()))
            .build()
            .map_err(|err| StoreError::Configuration(format!("Failed to build Redis pool: {err}")))?;

        Ok(Self {
            pool,
            timeout: config.timeout(),
        })
    }

    async fn conn(&self) -> Result<Object<RedisConnectionManager>> {
        Ok(self.pool.get().await?)
    }

    /// Bound the whole operation, pool wait included, by the store timeout.
    async fn bounded<T>(&self, op: impl Future<Output = Result<T>> + Send) -> Result<T> {
        tokio::time::timeout(self.timeout, op)
            .await
            .map_err(|_| StoreError::Timeout(self.timeout))?
    }
}

fn connection(conn: &mut Object<RedisConnectionManager>) -> &mut MultiplexedConnection {
    conn
}

#[async_trait]
impl SharedStore for RedisStore {
    #[tracing::instrument(level = "trace", skip(self))]
    async fn get(&self, key: &str) -> Result<Option<String>> {
        self.bounded(async {
            let mut conn = self.conn().await?;
            let value: Option<String> = redis::cmd("GET")
                .arg(key)
                .query_async(connection(&mut conn))
                .await?;
            Ok(value)
        })
        .await
    }

    #[tracing::instrument(level = "trace", skip(self, value))]
    async fn set_nx(&self, key: &str, value: &str, ttl: Duration) -> Result<bool> {
        self.bounded(async {
            let mut conn = self.conn().await?;
            let reply: Option<String> = redis::cmd("SET")
                .arg(key)
                .arg(value)
                .arg("NX")
                .arg("PX")
                .arg(ttl_millis(ttl))
                .query_async(connection(&mut conn))
                .await?;
            Ok(reply.is_some())
        })
        .await
    }

    #[tracing::instrument(level = "trace", skip(self, value))]
    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        self.bounded(async {
            let mut conn = self.conn().await?;
            let _: Option<String> = redis::cmd("SET")
                .arg(key)
                .arg(value)
                .arg("PX")
                .arg(ttl_millis(ttl))
                .query_async(connection(&mut conn))
                .await?;
            Ok(())
        })
        .await
    }

    #[tracing::instrument(level = "trace", skip(self, expected))]
    async fn compare_and_delete(&self, key: &str, expected: &str) -> Result<bool> {
        self.bounded(async {
            let mut conn = self.conn().await?;
            let mut invocation = scripts::COMPARE_AND_DELETE.prepare_invoke();
            invocation.key(key).arg(expected);
            let removed: i64 = invocation.invoke_async(connection(&mut conn)).await?;
            Ok(removed == 1)
        })
        .await
    }

    #[tracing::instrument(level = "trace", skip(self, expected))]
    async fn compare_and_expire(&self, key: &str, expected: &str, ttl: Duration) -> Result<bool> {
        self.bounded(async {
            let mut conn = self.conn().await?;
            let mut invocation = scripts::COMPARE_AND_EXPIRE.prepare_invoke();
            invocation.key(key).arg(expected).arg(ttl_millis(ttl));
            let refreshed: i64 = invocation.invoke_async(connection(&mut conn)).await?;
            Ok(refreshed == 1)
        })
        .await
    }

    #[tracing::instrument(level = "trace", skip(self))]
    async fn delete(&self, keys: &[String]) -> Result<()> {
        if keys.is_empty() {
            return Ok(());
        }

        self.bounded(async {
            let mut conn = self.conn().await?;
            let _: i64 = redis::cmd("DEL")
                .arg(keys)
                .query_async(connection(&mut conn))
                .await?;
            Ok(())
        })
        .await
    }

    #[tracing::instrument(level = "trace", skip(self))]
    async fn incr(&self, key: &str, delta: i64, ttl: Option<Duration>) -> Result<i64> {
        self.bounded(async {
            let mut conn = self.conn().await?;
            let mut pipe = redis::pipe();
            pipe.atomic().incr(key, delta);
            if let Some(ttl) = ttl {
                pipe.pexpire(key, ttl_millis(ttl)).ignore();
            }

            let values: Vec<i64> = pipe.query_async(connection(&mut conn)).await?;
            values
                .first()
                .copied()
                .ok_or_else(|| StoreError::unexpected(key, "integer reply"))
        })
        .await
    }

    #[tracing::instrument(level = "trace", skip(self))]
    async fn hash_incr(
        &self,
        key: &str,
        fields: &[(&str, i64)],
        ttl: Option<Duration>,
    ) -> Result<Vec<i64>> {
        if fields.is_empty() {
            return Ok(Vec::new());
        }

        self.bounded(async {
            let mut conn = self.conn().await?;
            let mut pipe = redis::pipe();
            pipe.atomic();
            for (field, delta) in fields {
                pipe.hincr(key, *field, *delta);
            }
            if let Some(ttl) = ttl {
                pipe.pexpire(key, ttl_millis(ttl)).ignore();
            }

            let values: Vec<i64> = pipe.query_async(connection(&mut conn)).await?;
            Ok(values)
        })
        .await
    }

    #[tracing::instrument(level = "trace", skip(self))]
    async fn hash_remove(&self, key: &str, fields: &[&str]) -> Result<()> {
        if fields.is_empty() {
            return Ok(());
        }

        self.bounded(async {
            let mut conn = self.conn().await?;
            let _: i64 = redis::cmd("HDEL")
                .arg(key)
                .arg(fields)
                .query_async(connection(&mut conn))
                .await?;
            Ok(())
        })
        .await
    }

    #[tracing::instrument(level = "trace", skip(self))]
    async fn hash_get_all(&self, key: &str) -> Result<Vec<(String, i64)>> {
        self.bounded(async {
            let mut conn = self.conn().await?;
            let hash: HashMap<String, i64> = redis::cmd("HGETALL")
                .arg(key)
                .query_async(connection(&mut conn))
                .await?;

            let mut fields: Vec<_> = hash.into_iter().collect();
            fields.sort();
            Ok(fields)
        })
        .await
    }

    #[tracing::instrument(level = "trace", skip_all, fields(counters = counters.len()))]
    async fn incr_within_limits(&self, counters: &[WindowCounter]) -> Result<LimitCheck> {
        if counters.is_empty() {
            return Ok(LimitCheck::Admitted);
        }

        self.bounded(async {
            let mut conn = self.conn().await?;
            let mut invocation = scripts::INCR_WITHIN_LIMITS.prepare_invoke();
            for counter in counters {
                invocation
                    .key(counter.key.as_str())
                    .arg(counter.limit)
                    .arg(ttl_millis(counter.ttl));
            }

            let reply: Vec<i64> = invocation.invoke_async(connection(&mut conn)).await?;
            match reply.as_slice() {
                [0, _] => Ok(LimitCheck::Admitted),
                [index, current] if *index > 0 => Ok(LimitCheck::Exceeded {
                    index: usize::try_from(*index - 1).unwrap_or_default(),
                    current: u64::try_from(*current).unwrap_or_default(),
                }),
                _ => Err(StoreError::unexpected(
                    &counters[0].key,
                    "limit check reply",
                )),
            }
        })
        .await
    }
}
