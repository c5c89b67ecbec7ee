use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use super::CacheTier;
use crate::error::Result;
use crate::ports::KvStore;

/// Shared tier stored in the coordination `KvStore` under `{prefix}{key}`.
pub struct SharedCache {
    store: Arc<dyn KvStore>,
    prefix: String,
    default_ttl: Option<Duration>,
}

impl SharedCache {
    pub fn new(store: Arc<dyn KvStore>, prefix: impl Into<String>, default_ttl: Option<Duration>) -> Self {
        Self {
            store,
            prefix: prefix.into(),
            default_ttl,
        }
    }

    fn key(&self, key: &str) -> String {
        format!("{}{}", self.prefix, key)
    }
}

#[async_trait]
impl CacheTier for SharedCache {
    fn name(&self) -> &str {
        "shared"
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        self.store.get(&self.key(key)).await
    }

    async fn set(&self, key: &str, value: &[u8], ttl: Option<Duration>) -> Result<()> {
        self.store
            .set(&self.key(key), value, ttl.or(self.default_ttl))
            .await
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.store.delete(&self.key(key)).await.map(|_| ())
    }

    async fn clear(&self) -> Result<()> {
        self.store.delete_prefix(&self.prefix).await.map(|_| ())
    }
}
