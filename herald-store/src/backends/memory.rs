use std::{collections::HashMap, sync::Arc, time::Duration};

use ahash::AHashMap;
use async_trait::async_trait;
use herald_common::{SharedClock, SystemClock};
use parking_lot::Mutex;

use crate::{LimitCheck, Result, SharedStore, StoreError, WindowCounter};

#[derive(Debug, Clone)]
enum Value {
    Text(String),
    Counter(i64),
    Hash(AHashMap<String, i64>),
}

#[derive(Debug, Clone)]
struct Entry {
    value: Value,
    /// Unix millis after which the entry is gone
    expires_at: Option<i64>,
}

impl Entry {
    fn is_live(&self, now: i64) -> bool {
        self.expires_at.is_none_or(|at| at > now)
    }
}

/// In-process implementation of [`SharedStore`]
///
/// All entries live in one `HashMap` behind a single mutex, so every trait
/// operation is one critical section and therefore atomic with respect to
/// every other caller sharing the same `MemoryStore` (clones share state).
///
/// TTLs are evaluated against the injected clock. Expired entries are
/// invisible immediately and physically removed lazily on access or by
/// [`MemoryStore::purge_expired`].
#[derive(Debug, Clone)]
pub struct MemoryStore {
    entries: Arc<Mutex<HashMap<String, Entry>>>,
    clock: SharedClock,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new(SystemClock::shared())
    }
}

fn ttl_millis(ttl: Duration) -> i64 {
    i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX)
}

impl MemoryStore {
    #[must_use]
    pub fn new(clock: SharedClock) -> Self {
        Self {
            entries: Arc::new(Mutex::new(HashMap::new())),
            clock,
        }
    }

    /// Number of live entries.
    #[must_use]
    pub fn len(&self) -> usize {
        let now = self.clock.now_millis();
        self.entries.lock().values().filter(|e| e.is_live(now)).count()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every expired entry, returning how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = self.clock.now_millis();
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|_, e| e.is_live(now));
        before - entries.len()
    }

    fn expiry(&self, ttl: Duration) -> i64 {
        self.clock.now_millis().saturating_add(ttl_millis(ttl))
    }

    /// Fetch a live entry, evicting it first if it has expired.
    fn live<'a>(
        entries: &'a mut HashMap<String, Entry>,
        key: &str,
        now: i64,
    ) -> Option<&'a mut Entry> {
        Self::evict_expired(entries, key, now);
        entries.get_mut(key)
    }

    fn evict_expired(entries: &mut HashMap<String, Entry>, key: &str, now: i64) {
        if entries.get(key).is_some_and(|e| !e.is_live(now)) {
            entries.remove(key);
        }
    }

    fn counter_value(key: &str, entry: &Entry) -> Result<i64> {
        match &entry.value {
            Value::Counter(n) => Ok(*n),
            Value::Text(s) => s
                .parse()
                .map_err(|_| StoreError::unexpected(key, "integer")),
            Value::Hash(_) => Err(StoreError::unexpected(key, "integer")),
        }
    }
}

#[async_trait]
impl SharedStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let now = self.clock.now_millis();
        let mut entries = self.entries.lock();

        match Self::live(&mut entries, key, now).map(|e| &e.value) {
            None => Ok(None),
            Some(Value::Text(s)) => Ok(Some(s.clone())),
            Some(Value::Counter(n)) => Ok(Some(n.to_string())),
            Some(Value::Hash(_)) => Err(StoreError::unexpected(key, "string")),
        }
    }

    async fn set_nx(&self, key: &str, value: &str, ttl: Duration) -> Result<bool> {
        let now = self.clock.now_millis();
        let expires_at = Some(self.expiry(ttl));
        let mut entries = self.entries.lock();

        if Self::live(&mut entries, key, now).is_some() {
            return Ok(false);
        }

        entries.insert(
            key.to_string(),
            Entry {
                value: Value::Text(value.to_string()),
                expires_at,
            },
        );
        Ok(true)
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        let expires_at = Some(self.expiry(ttl));
        self.entries.lock().insert(
            key.to_string(),
            Entry {
                value: Value::Text(value.to_string()),
                expires_at,
            },
        );
        Ok(())
    }

    async fn compare_and_delete(&self, key: &str, expected: &str) -> Result<bool> {
        let now = self.clock.now_millis();
        let mut entries = self.entries.lock();

        let matches = Self::live(&mut entries, key, now)
            .is_some_and(|e| matches!(&e.value, Value::Text(s) if s == expected));
        if matches {
            entries.remove(key);
        }
        Ok(matches)
    }

    async fn compare_and_expire(&self, key: &str, expected: &str, ttl: Duration) -> Result<bool> {
        let now = self.clock.now_millis();
        let expires_at = Some(self.expiry(ttl));
        let mut entries = self.entries.lock();

        match Self::live(&mut entries, key, now) {
            Some(entry) if matches!(&entry.value, Value::Text(s) if s == expected) => {
                entry.expires_at = expires_at;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn delete(&self, keys: &[String]) -> Result<()> {
        let mut entries = self.entries.lock();
        for key in keys {
            entries.remove(key);
        }
        Ok(())
    }

    async fn incr(&self, key: &str, delta: i64, ttl: Option<Duration>) -> Result<i64> {
        let now = self.clock.now_millis();
        let new_expiry = ttl.map(|ttl| self.expiry(ttl));
        let mut entries = self.entries.lock();

        let current = match Self::live(&mut entries, key, now) {
            Some(entry) => Self::counter_value(key, entry)?,
            None => 0,
        };
        let next = current.saturating_add(delta);

        let expires_at = new_expiry.or_else(|| entries.get(key).and_then(|e| e.expires_at));
        entries.insert(
            key.to_string(),
            Entry {
                value: Value::Counter(next),
                expires_at,
            },
        );
        Ok(next)
    }

    async fn hash_incr(
        &self,
        key: &str,
        fields: &[(&str, i64)],
        ttl: Option<Duration>,
    ) -> Result<Vec<i64>> {
        let now = self.clock.now_millis();
        let new_expiry = ttl.map(|ttl| self.expiry(ttl));
        let mut entries = self.entries.lock();

        Self::evict_expired(&mut entries, key, now);
        let entry = entries.entry(key.to_string()).or_insert_with(|| Entry {
            value: Value::Hash(AHashMap::new()),
            expires_at: None,
        });

        let Value::Hash(hash) = &mut entry.value else {
            return Err(StoreError::unexpected(key, "hash"));
        };

        let values = fields
            .iter()
            .map(|(field, delta)| {
                let slot = hash.entry((*field).to_string()).or_insert(0);
                *slot = slot.saturating_add(*delta);
                *slot
            })
            .collect();

        if new_expiry.is_some() {
            entry.expires_at = new_expiry;
        }
        Ok(values)
    }

    async fn hash_remove(&self, key: &str, fields: &[&str]) -> Result<()> {
        let now = self.clock.now_millis();
        let mut entries = self.entries.lock();

        match Self::live(&mut entries, key, now).map(|e| &mut e.value) {
            None => Ok(()),
            Some(Value::Hash(hash)) => {
                for field in fields {
                    hash.remove(*field);
                }
                if hash.is_empty() {
                    entries.remove(key);
                }
                Ok(())
            }
            Some(_) => Err(StoreError::unexpected(key, "hash")),
        }
    }

    async fn hash_get_all(&self, key: &str) -> Result<Vec<(String, i64)>> {
        let now = self.clock.now_millis();
        let mut entries = self.entries.lock();

        match Self::live(&mut entries, key, now).map(|e| &e.value) {
            None => Ok(Vec::new()),
            Some(Value::Hash(hash)) => {
                let mut fields: Vec<_> = hash.iter().map(|(k, v)| (k.clone(), *v)).collect();
                fields.sort();
                Ok(fields)
            }
            Some(_) => Err(StoreError::unexpected(key, "hash")),
        }
    }

    async fn incr_within_limits(&self, counters: &[WindowCounter]) -> Result<LimitCheck> {
        let now = self.clock.now_millis();
        let mut entries = self.entries.lock();

        for (index, counter) in counters.iter().enumerate() {
            let current = match Self::live(&mut entries, &counter.key, now) {
                Some(entry) => Self::counter_value(&counter.key, entry)?,
                None => 0,
            };
            let current = u64::try_from(current).unwrap_or(0);
            if current >= counter.limit {
                return Ok(LimitCheck::Exceeded { index, current });
            }
        }

        for counter in counters {
            // Only the first increment of a window sets its lifetime
            let entry = entries
                .entry(counter.key.clone())
                .or_insert_with(|| Entry {
                    value: Value::Counter(0),
                    expires_at: Some(now.saturating_add(ttl_millis(counter.ttl))),
                });
            let current = Self::counter_value(&counter.key, entry)?;
            entry.value = Value::Counter(current.saturating_add(1));
        }

        Ok(LimitCheck::Admitted)
    }
}
