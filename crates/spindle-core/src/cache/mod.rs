//! Tiered cache: a fast process-local tier in front of a shared tier.
//!
//! Reads fall through tiers in order; writes and deletes go to every tier and
//! report per-tier failures as one aggregate error.

mod local;
mod shared;
mod tiered;

pub use local::LocalCache;
pub use shared::SharedCache;
pub use tiered::TieredCache;

use std::time::Duration;

use async_trait::async_trait;

use crate::error::Result;

/// One backend in a `TieredCache` chain.
#[async_trait]
pub trait CacheTier: Send + Sync {
    /// Short name used in logs and `TierError`s.
    fn name(&self) -> &str;

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// `ttl = None` uses the tier's default TTL.
    async fn set(&self, key: &str, value: &[u8], ttl: Option<Duration>) -> Result<()>;

    async fn delete(&self, key: &str) -> Result<()>;

    async fn clear(&self) -> Result<()>;
}
