use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, warn};

use super::CacheTier;
use crate::error::{Result, SpindleError, TierError};

/// Ordered chain of cache tiers, fastest first.
///
/// - `get`: first hit wins; earlier tiers are backfilled with their default TTL.
///   A tier failing on read is logged and treated as a miss.
/// - `set` / `delete` / `clear`: applied to every tier, failures collected into
///   `SpindleError::CacheTiers`. Tiers that succeeded keep their write; nothing is retried.
#[derive(Clone, Default)]
pub struct TieredCache {
    tiers: Vec<Arc<dyn CacheTier>>,
}

impl TieredCache {
    pub fn new(tiers: Vec<Arc<dyn CacheTier>>) -> Self {
        Self { tiers }
    }

    pub fn with_tier(mut self, tier: Arc<dyn CacheTier>) -> Self {
        self.tiers.push(tier);
        self
    }

    pub fn tiers(&self) -> &[Arc<dyn CacheTier>] {
        &self.tiers
    }

    pub async fn get(&self, key: &str) -> Result<Vec<u8>> {
        for (index, tier) in self.tiers.iter().enumerate() {
            match tier.get(key).await {
                Ok(Some(value)) => {
                    debug!(key, tier = tier.name(), "cache hit");
                    self.backfill(index, key, &value).await;
                    return Ok(value);
                }
                Ok(None) => {}
                Err(err) => warn!(key, tier = tier.name(), error = %err, "cache tier read failed"),
            }
        }
        Err(SpindleError::NotFound(format!("cache key {key}")))
    }

    async fn backfill(&self, hit: usize, key: &str, value: &[u8]) {
        for tier in &self.tiers[..hit] {
            if let Err(err) = tier.set(key, value, None).await {
                warn!(key, tier = tier.name(), error = %err, "cache backfill failed");
            }
        }
    }

    pub async fn set(&self, key: &str, value: &[u8], ttl: Option<Duration>) -> Result<()> {
        let mut errors = Vec::new();
        for (index, tier) in self.tiers.iter().enumerate() {
            if let Err(err) = tier.set(key, value, ttl).await {
                errors.push(tier_error(index, tier.as_ref(), &err));
            }
        }
        aggregate(errors)
    }

    pub async fn delete(&self, key: &str) -> Result<()> {
        let mut errors = Vec::new();
        for (index, tier) in self.tiers.iter().enumerate() {
            if let Err(err) = tier.delete(key).await {
                errors.push(tier_error(index, tier.as_ref(), &err));
            }
        }
        aggregate(errors)
    }

    pub async fn clear(&self) -> Result<()> {
        let mut errors = Vec::new();
        for (index, tier) in self.tiers.iter().enumerate() {
            if let Err(err) = tier.clear().await {
                errors.push(tier_error(index, tier.as_ref(), &err));
            }
        }
        aggregate(errors)
    }

    pub async fn get_json<T: DeserializeOwned>(&self, key: &str) -> Result<T> {
        let bytes = self.get(key).await?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    pub async fn set_json<T: Serialize>(&self, key: &str, value: &T, ttl: Option<Duration>) -> Result<()> {
        let bytes = serde_json::to_vec(value)?;
        self.set(key, &bytes, ttl).await
    }
}

fn tier_error(index: usize, tier: &dyn CacheTier, err: &SpindleError) -> TierError {
    warn!(tier = tier.name(), error = %err, "cache tier write failed");
    TierError {
        tier: index,
        name: tier.name().to_string(),
        message: err.to_string(),
    }
}

fn aggregate(errors: Vec<TierError>) -> Result<()> {
    if errors.is_empty() {
        Ok(())
    } else {
        Err(SpindleError::CacheTiers(errors))
    }
}
