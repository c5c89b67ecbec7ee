//! Distributed lock coordinator.
//!
//! A lock is one key in the shared `KvStore`, created with atomic create-if-absent and a
//! fixed lease TTL. The value is the holder's token; release is a compare-and-delete on
//! that token, so a holder whose lease expired cannot remove someone else's lock.
//! Leases are never extended: a crashed holder's lock disappears after `lease`.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, error, warn};

use crate::domain::LockToken;
use crate::error::{Result, SpindleError};
use crate::ports::{IdGenerator, KvStore};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockOptions {
    /// Prefix joined to every key as `{workspace}_{key}`.
    pub workspace: String,
    pub lease: Duration,
    pub retry_interval: Duration,
    /// Applied when `acquire` gets no explicit timeout.
    pub default_timeout: Duration,
}

impl Default for LockOptions {
    fn default() -> Self {
        Self {
            workspace: "spindle_locker".to_string(),
            lease: Duration::from_secs(60),
            retry_interval: Duration::from_millis(200),
            default_timeout: Duration::from_secs(60),
        }
    }
}

#[derive(Clone)]
pub struct LockCoordinator {
    store: Arc<dyn KvStore>,
    ids: Arc<dyn IdGenerator>,
    options: LockOptions,
}

impl LockCoordinator {
    pub fn new(store: Arc<dyn KvStore>, ids: Arc<dyn IdGenerator>, options: LockOptions) -> Self {
        Self {
            store,
            ids,
            options,
        }
    }

    pub fn options(&self) -> &LockOptions {
        &self.options
    }

    fn full_key(&self, key: &str) -> String {
        format!("{}_{}", self.options.workspace, key)
    }

    /// Poll until the lease on `key` is ours or `timeout` elapses.
    ///
    /// An empty key is replaced by a freshly generated one. Store errors during polling
    /// are logged and retried like contention.
    pub async fn acquire(&self, key: &str, timeout: Option<Duration>) -> Result<LockGuard> {
        let key = if key.is_empty() {
            self.ids.lock_token().to_string()
        } else {
            key.to_string()
        };
        let full_key = self.full_key(&key);
        let timeout = timeout.unwrap_or(self.options.default_timeout);
        let token = self.ids.lock_token();
        let started = Instant::now();

        loop {
            match self
                .store
                .set_if_absent(&full_key, token.as_str().as_bytes(), self.options.lease)
                .await
            {
                Ok(true) => {
                    debug!(key = %key, elapsed = ?started.elapsed(), "lock acquired");
                    return Ok(LockGuard {
                        store: Arc::clone(&self.store),
                        key,
                        full_key,
                        token,
                    });
                }
                Ok(false) => {}
                Err(err) => error!(key = %key, error = %err, "lock store error, retrying"),
            }

            let elapsed = started.elapsed();
            if elapsed >= timeout {
                warn!(key = %key, ?elapsed, "lock timeout");
                return Err(SpindleError::LockTimeout { key, elapsed });
            }
            let remaining = timeout - elapsed;
            tokio::time::sleep(self.options.retry_interval.min(remaining)).await;
        }
    }

    /// Run `critical` while holding `key`; the lease is released afterwards either way.
    pub async fn with_lock<T, F, Fut>(&self, key: &str, timeout: Option<Duration>, critical: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let guard = self.acquire(key, timeout).await?;
        let result = critical().await;
        if let Err(err) = guard.release().await {
            warn!(error = %err, "release after critical section failed");
        }
        result
    }

    /// Is a live lease held on `key` right now?
    pub async fn is_locked(&self, key: &str) -> Result<bool> {
        Ok(self.store.get(&self.full_key(key)).await?.is_some())
    }
}

/// A held lease. Dropping it without `release` leaves the lease to expire.
#[must_use = "a lock guard should be released; dropping it keeps the lease until it expires"]
pub struct LockGuard {
    store: Arc<dyn KvStore>,
    key: String,
    full_key: String,
    token: LockToken,
}

impl std::fmt::Debug for LockGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockGuard")
            .field("key", &self.key)
            .field("token", &self.token)
            .finish()
    }
}

impl LockGuard {
    /// The caller-visible key (generated when an empty key was requested).
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn token(&self) -> &LockToken {
        &self.token
    }

    /// Release only if this token still owns the lease.
    pub async fn release(self) -> Result<()> {
        let released = self
            .store
            .delete_if_equals(&self.full_key, self.token.as_str().as_bytes())
            .await?;
        if released {
            debug!(key = %self.key, "lock released");
            Ok(())
        } else {
            warn!(key = %self.key, "release failed: lease no longer held");
            Err(SpindleError::ReleaseFailed { key: self.key })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::impls::MemoryKvStore;
    use crate::ports::{SystemClock, UlidGenerator};

    fn coordinator(lease: Duration) -> LockCoordinator {
        LockCoordinator::new(
            Arc::new(MemoryKvStore::new()),
            Arc::new(UlidGenerator::new(SystemClock)),
            LockOptions {
                workspace: "test_locker".into(),
                lease,
                retry_interval: Duration::from_millis(10),
                default_timeout: Duration::from_millis(200),
            },
        )
    }

    #[tokio::test]
    async fn second_acquire_waits_for_release() {
        let locks = coordinator(Duration::from_secs(10));
        let first = locks.acquire("render_url_X", None).await.unwrap();
        assert!(locks.is_locked("render_url_X").await.unwrap());

        let contender = {
            let locks = locks.clone();
            tokio::spawn(async move { locks.acquire("render_url_X", Some(Duration::from_secs(2))).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!contender.is_finished());

        first.release().await.unwrap();
        let second = contender.await.unwrap().unwrap();
        second.release().await.unwrap();
        assert!(!locks.is_locked("render_url_X").await.unwrap());
    }

    #[tokio::test]
    async fn contention_times_out_with_elapsed() {
        let locks = coordinator(Duration::from_secs(10));
        let _held = locks.acquire("k", None).await.unwrap();

        let err = locks.acquire("k", Some(Duration::from_millis(100))).await.unwrap_err();
        match err {
            SpindleError::LockTimeout { key, elapsed } => {
                assert_eq!(key, "k");
                assert!(elapsed >= Duration::from_millis(100));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn expired_lease_is_reacquirable_and_fenced() {
        let locks = coordinator(Duration::from_millis(50));
        let stale = locks.acquire("k", None).await.unwrap();

        // holder "crashes"; another caller gets in after the lease
        let fresh = locks.acquire("k", Some(Duration::from_secs(1))).await.unwrap();
        assert_ne!(stale.token(), fresh.token());

        let err = stale.release().await.unwrap_err();
        assert!(matches!(err, SpindleError::ReleaseFailed { .. }));
        assert!(locks.is_locked("k").await.unwrap());
        fresh.release().await.unwrap();
    }

    #[tokio::test]
    async fn empty_key_gets_a_generated_one() {
        let locks = coordinator(Duration::from_secs(1));
        let guard = locks.acquire("", None).await.unwrap();
        assert!(guard.key().starts_with("lock-"));
        guard.release().await.unwrap();
    }

    #[tokio::test]
    async fn with_lock_releases_after_critical_section() {
        let locks = coordinator(Duration::from_secs(10));
        let out = locks
            .with_lock("job", None, || async { Ok::<_, SpindleError>(7) })
            .await
            .unwrap();
        assert_eq!(out, 7);
        assert!(!locks.is_locked("job").await.unwrap());
    }
}
