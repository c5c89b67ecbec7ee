//! KvStore port - 共有 coordination store
//!
//! プロセス間で共有される唯一の同期手段。lock と shared cache tier が使う。
//! 構造的な変更はすべて 1 回の atomic 操作として表現する（read-modify-write しない）。

use std::time::Duration;

use async_trait::async_trait;

use crate::error::Result;

#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Unconditional write. `ttl = None` keeps the value until deleted.
    async fn set(&self, key: &str, value: &[u8], ttl: Option<Duration>) -> Result<()>;

    /// Atomic create-if-absent with a TTL. Returns `true` when this call created the key.
    async fn set_if_absent(&self, key: &str, value: &[u8], ttl: Duration) -> Result<bool>;

    /// Returns `true` when a key was removed.
    async fn delete(&self, key: &str) -> Result<bool>;

    /// Atomic compare-and-delete: removes `key` only while it still holds `expected`.
    async fn delete_if_equals(&self, key: &str, expected: &[u8]) -> Result<bool>;

    /// Removes every key starting with `prefix`; returns how many were removed.
    async fn delete_prefix(&self, prefix: &str) -> Result<usize>;
}
