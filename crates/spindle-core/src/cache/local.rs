use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::CacheTier;
use crate::domain::add_duration;
use crate::error::Result;
use crate::ports::{Clock, SystemClock};

struct Slot {
    value: Vec<u8>,
    expires_at: Option<DateTime<Utc>>,
}

#[derive(Default)]
struct LocalState {
    slots: HashMap<String, Slot>,
    /// Insertion order for FIFO eviction; may hold keys already removed.
    order: VecDeque<String>,
}

/// In-process tier: bounded, TTL-aware, FIFO eviction.
///
/// Uses a std `Mutex` held only for O(1) map operations, never across await points.
pub struct LocalCache {
    state: Mutex<LocalState>,
    capacity: usize,
    default_ttl: Option<Duration>,
    clock: Arc<dyn Clock>,
}

impl LocalCache {
    pub fn new(capacity: usize, default_ttl: Option<Duration>) -> Self {
        Self::with_clock(capacity, default_ttl, Arc::new(SystemClock))
    }

    pub fn with_clock(capacity: usize, default_ttl: Option<Duration>, clock: Arc<dyn Clock>) -> Self {
        Self {
            state: Mutex::new(LocalState::default()),
            capacity: capacity.max(1),
            default_ttl,
            clock,
        }
    }

    pub fn len(&self) -> usize {
        self.state().slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn state(&self) -> MutexGuard<'_, LocalState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl LocalState {
    fn evict_to(&mut self, capacity: usize) {
        while self.slots.len() >= capacity {
            let Some(oldest) = self.order.pop_front() else {
                break;
            };
            self.slots.remove(&oldest);
        }
    }
}

#[async_trait]
impl CacheTier for LocalCache {
    fn name(&self) -> &str {
        "local"
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let now = self.clock.now();
        let mut state = self.state();
        let expired = match state.slots.get(key) {
            None => return Ok(None),
            Some(slot) => slot.expires_at.is_some_and(|at| at <= now),
        };
        if expired {
            state.slots.remove(key);
            state.order.retain(|k| k != key);
            return Ok(None);
        }
        Ok(state.slots.get(key).map(|slot| slot.value.clone()))
    }

    async fn set(&self, key: &str, value: &[u8], ttl: Option<Duration>) -> Result<()> {
        let now = self.clock.now();
        let expires_at = ttl.or(self.default_ttl).map(|ttl| add_duration(now, ttl));
        let mut state = self.state();
        if !state.slots.contains_key(key) {
            state.evict_to(self.capacity);
            state.order.push_back(key.to_string());
        }
        state.slots.insert(
            key.to_string(),
            Slot {
                value: value.to_vec(),
                expires_at,
            },
        );
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let mut state = self.state();
        state.slots.remove(key);
        state.order.retain(|k| k != key);
        Ok(())
    }

    async fn clear(&self) -> Result<()> {
        let mut state = self.state();
        state.slots.clear();
        state.order.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ports::ManualClock;
    use chrono::TimeZone;

    #[tokio::test]
    async fn evicts_oldest_when_full() {
        let cache = LocalCache::new(2, None);
        cache.set("a", b"1", None).await.unwrap();
        cache.set("b", b"2", None).await.unwrap();
        cache.set("c", b"3", None).await.unwrap();

        assert_eq!(cache.get("a").await.unwrap(), None);
        assert_eq!(cache.get("c").await.unwrap(), Some(b"3".to_vec()));
        assert_eq!(cache.len(), 2);
    }

    #[tokio::test]
    async fn entries_expire() {
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
        ));
        let cache = LocalCache::with_clock(8, Some(Duration::from_secs(30)), clock.clone());
        cache.set("a", b"1", None).await.unwrap();
        cache.set("b", b"2", Some(Duration::from_secs(90))).await.unwrap();

        clock.advance(Duration::from_secs(31));
        assert_eq!(cache.get("a").await.unwrap(), None);
        assert_eq!(cache.get("b").await.unwrap(), Some(b"2".to_vec()));
    }
}
