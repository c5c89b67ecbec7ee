//! MemoryKvStore - 単一プロセス用の KvStore
//!
//! TTL は Clock で判定する。期限切れのエントリは読み取り時に遅延削除するほか、
//! 書き込みでエントリ数が閾値を超えたときにまとめて掃除する（閾値は掃除後の件数の 2 倍）。
//! 一度も読まれない key も溜まり続けない。
//! tokio Mutex は各メソッド内で完結し、await を跨いで保持しない。

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tracing::trace;

use crate::domain::add_duration;
use crate::error::Result;
use crate::ports::{Clock, KvStore, SystemClock};

#[derive(Debug, Clone)]
struct Entry {
    value: Vec<u8>,
    expires_at: Option<DateTime<Utc>>,
}

impl Entry {
    fn is_live(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_none_or(|at| at > now)
    }
}

/// Entry count below which writes never sweep.
const SWEEP_MIN: usize = 64;

struct Entries {
    map: HashMap<String, Entry>,
    sweep_at: usize,
}

impl Entries {
    fn sweep(&mut self, now: DateTime<Utc>) -> usize {
        let before = self.map.len();
        self.map.retain(|_, e| e.is_live(now));
        self.sweep_at = (self.map.len() * 2).max(SWEEP_MIN);
        before - self.map.len()
    }

    fn insert(&mut self, key: &str, entry: Entry, now: DateTime<Utc>) {
        self.map.insert(key.to_string(), entry);
        if self.map.len() >= self.sweep_at {
            let swept = self.sweep(now);
            if swept > 0 {
                trace!(swept, live = self.map.len(), "swept expired keys");
            }
        }
    }
}

pub struct MemoryKvStore {
    entries: Mutex<Entries>,
    clock: Arc<dyn Clock>,
}

impl MemoryKvStore {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: Mutex::new(Entries {
                map: HashMap::new(),
                sweep_at: SWEEP_MIN,
            }),
            clock,
        }
    }

    /// Live keys, for tests and the demo.
    pub async fn len(&self) -> usize {
        let now = self.clock.now();
        let entries = self.entries.lock().await;
        entries.map.values().filter(|e| e.is_live(now)).count()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Drop every expired entry now; returns how many went.
    pub async fn purge_expired(&self) -> usize {
        let now = self.clock.now();
        self.entries.lock().await.sweep(now)
    }

    /// Entries held, expired or not.
    #[cfg(test)]
    async fn held(&self) -> usize {
        self.entries.lock().await.map.len()
    }

    fn expiry(&self, now: DateTime<Utc>, ttl: Option<Duration>) -> Option<DateTime<Utc>> {
        ttl.map(|ttl| add_duration(now, ttl))
    }
}

impl Default for MemoryKvStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl KvStore for MemoryKvStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let now = self.clock.now();
        let mut entries = self.entries.lock().await;
        match entries.map.get(key) {
            Some(entry) if entry.is_live(now) => Ok(Some(entry.value.clone())),
            Some(_) => {
                entries.map.remove(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: &[u8], ttl: Option<Duration>) -> Result<()> {
        let now = self.clock.now();
        let entry = Entry {
            value: value.to_vec(),
            expires_at: self.expiry(now, ttl),
        };
        self.entries.lock().await.insert(key, entry, now);
        Ok(())
    }

    async fn set_if_absent(&self, key: &str, value: &[u8], ttl: Duration) -> Result<bool> {
        let now = self.clock.now();
        let mut entries = self.entries.lock().await;
        if entries.map.get(key).is_some_and(|e| e.is_live(now)) {
            return Ok(false);
        }
        let entry = Entry {
            value: value.to_vec(),
            expires_at: self.expiry(now, Some(ttl)),
        };
        entries.insert(key, entry, now);
        Ok(true)
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let now = self.clock.now();
        let removed = self.entries.lock().await.map.remove(key);
        Ok(removed.is_some_and(|e| e.is_live(now)))
    }

    async fn delete_if_equals(&self, key: &str, expected: &[u8]) -> Result<bool> {
        let now = self.clock.now();
        let mut entries = self.entries.lock().await;
        let holds = entries
            .map
            .get(key)
            .is_some_and(|e| e.is_live(now) && e.value == expected);
        if holds {
            entries.map.remove(key);
        }
        Ok(holds)
    }

    async fn delete_prefix(&self, prefix: &str) -> Result<usize> {
        let now = self.clock.now();
        let mut entries = self.entries.lock().await;
        let mut removed = 0;
        entries.map.retain(|k, e| {
            if !k.starts_with(prefix) {
                return true;
            }
            if e.is_live(now) {
                removed += 1;
            }
            false
        });
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ports::ManualClock;
    use chrono::TimeZone;

    fn store() -> (Arc<ManualClock>, MemoryKvStore) {
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
        ));
        let store = MemoryKvStore::with_clock(clock.clone());
        (clock, store)
    }

    #[tokio::test]
    async fn set_if_absent_creates_once() {
        let (_, store) = store();
        assert!(store.set_if_absent("k", b"a", Duration::from_secs(10)).await.unwrap());
        assert!(!store.set_if_absent("k", b"b", Duration::from_secs(10)).await.unwrap());
        assert_eq!(store.get("k").await.unwrap(), Some(b"a".to_vec()));
    }

    #[tokio::test]
    async fn expired_keys_can_be_recreated() {
        let (clock, store) = store();
        store.set_if_absent("k", b"a", Duration::from_secs(10)).await.unwrap();
        clock.advance(Duration::from_secs(10));
        assert_eq!(store.get("k").await.unwrap(), None);
        assert!(store.set_if_absent("k", b"b", Duration::from_secs(10)).await.unwrap());
    }

    #[tokio::test]
    async fn delete_if_equals_fences_on_value() {
        let (_, store) = store();
        store.set("k", b"owner-1", None).await.unwrap();
        assert!(!store.delete_if_equals("k", b"owner-2").await.unwrap());
        assert!(store.delete_if_equals("k", b"owner-1").await.unwrap());
        assert_eq!(store.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn delete_prefix_only_touches_matching_keys() {
        let (_, store) = store();
        store.set("cache:a", b"1", None).await.unwrap();
        store.set("cache:b", b"2", None).await.unwrap();
        store.set("lock:a", b"3", None).await.unwrap();

        assert_eq!(store.delete_prefix("cache:").await.unwrap(), 2);
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn expired_keys_nobody_reads_are_swept_by_later_writes() {
        let (clock, store) = store();
        for i in 0..SWEEP_MIN - 2 {
            store
                .set(&format!("cache:stale:{i}"), b"x", Some(Duration::from_secs(1)))
                .await
                .unwrap();
        }
        store.set("lock:keep", b"owner", None).await.unwrap();
        clock.advance(Duration::from_secs(2));

        // the write that reaches the threshold sweeps
        store.set("cache:fresh", b"y", None).await.unwrap();
        assert_eq!(store.held().await, 2);
        assert_eq!(store.get("lock:keep").await.unwrap(), Some(b"owner".to_vec()));
    }

    #[tokio::test]
    async fn purge_expired_drops_everything_past_its_ttl() {
        let (clock, store) = store();
        store.set("short", b"1", Some(Duration::from_secs(1))).await.unwrap();
        store.set_if_absent("lease", b"2", Duration::from_secs(5)).await.unwrap();
        store.set("forever", b"3", None).await.unwrap();

        clock.advance(Duration::from_secs(2));
        assert_eq!(store.purge_expired().await, 1);
        assert_eq!(store.held().await, 2);

        clock.advance(Duration::from_secs(5));
        assert_eq!(store.purge_expired().await, 1);
        assert_eq!(store.held().await, 1);
    }
}
