use std::time::Duration;

use async_trait::async_trait;

use crate::Result;

/// One counter taking part in an atomic check-and-increment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WindowCounter {
    pub key: String,
    /// Highest value the counter may reach after the increment.
    pub limit: u64,
    /// Lifetime given to the counter when it is first created.
    pub ttl: Duration,
}

impl WindowCounter {
    #[must_use]
    pub fn new(key: impl Into<String>, limit: u64, ttl: Duration) -> Self {
        Self {
            key: key.into(),
            limit,
            ttl,
        }
    }
}

/// Outcome of [`SharedStore::incr_within_limits`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LimitCheck {
    /// Every counter had headroom and every counter was incremented.
    Admitted,
    /// The counter at `index` was already at `current`; nothing was incremented.
    Exceeded { index: usize, current: u64 },
}

impl LimitCheck {
    #[must_use]
    pub const fn is_admitted(&self) -> bool {
        matches!(self, Self::Admitted)
    }
}

/// The TTL-capable key/value store shared by every worker in the fleet.
///
/// Every method is one atomic operation on the backend. Keys that have
/// outlived their TTL behave exactly like keys that were never written.
#[async_trait]
pub trait SharedStore: Send + Sync + std::fmt::Debug {
    /// Read a string (or counter rendered as a string).
    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Write `value` under `key` only if no live value exists.
    ///
    /// Returns `true` if the value was written.
    async fn set_nx(&self, key: &str, value: &str, ttl: Duration) -> Result<bool>;

    /// Write `value` under `key`, replacing whatever was there.
    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<()>;

    /// Delete `key` only if it currently holds `expected`.
    async fn compare_and_delete(&self, key: &str, expected: &str) -> Result<bool>;

    /// Reset the TTL of `key` only if it currently holds `expected`.
    async fn compare_and_expire(&self, key: &str, expected: &str, ttl: Duration) -> Result<bool>;

    /// Remove the given keys. Missing keys are ignored.
    async fn delete(&self, keys: &[String]) -> Result<()>;

    /// Add `delta` to an integer counter, creating it at zero when absent.
    ///
    /// When `ttl` is given the counter's lifetime is reset on every call.
    async fn incr(&self, key: &str, delta: i64, ttl: Option<Duration>) -> Result<i64>;

    /// Add to several integer fields of one hash, returning the new values in
    /// the same order.
    async fn hash_incr(
        &self,
        key: &str,
        fields: &[(&str, i64)],
        ttl: Option<Duration>,
    ) -> Result<Vec<i64>>;

    /// Remove fields from a hash. Missing fields are ignored.
    async fn hash_remove(&self, key: &str, fields: &[&str]) -> Result<()>;

    /// Read every field of an integer hash. A missing key is an empty hash.
    async fn hash_get_all(&self, key: &str) -> Result<Vec<(String, i64)>>;

    /// Increment every counter by one, but only if none of them would go
    /// above its limit. Check and increments are indivisible.
    async fn incr_within_limits(&self, counters: &[WindowCounter]) -> Result<LimitCheck>;
}
