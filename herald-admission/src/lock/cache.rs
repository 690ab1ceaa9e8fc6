use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use herald_store::SharedStore;

use super::LockBackend;
use crate::error::LockError;

/// Locks as token-valued keys with a TTL in the shared store.
#[derive(Debug, Clone)]
pub struct CacheLockBackend {
    store: Arc<dyn SharedStore>,
}

impl CacheLockBackend {
    #[must_use]
    pub fn new(store: Arc<dyn SharedStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl LockBackend for CacheLockBackend {
    async fn try_acquire(&self, key: &str, token: &str, ttl: Duration) -> Result<bool, LockError> {
        Ok(self.store.set_nx(key, token, ttl).await?)
    }

    async fn release(&self, key: &str, token: &str) -> Result<bool, LockError> {
        Ok(self.store.compare_and_delete(key, token).await?)
    }

    async fn extend(&self, key: &str, token: &str, ttl: Duration) -> Result<bool, LockError> {
        Ok(self.store.compare_and_expire(key, token, ttl).await?)
    }
}
