//! Bounded worker pool.
//!
//! - Concurrency ceiling: a tokio `Semaphore` with `size` permits. A unit of work holds an
//!   owned permit from acceptance until it (and its completion callback) finished.
//! - Isolation: every unit runs in its own tokio task; a panic surfaces as a `JoinError`
//!   and becomes `SpindleError::WorkPanicked`. Other units and the pool are unaffected.
//! - `wait()` is a barrier over the work accepted before the call, tracked by sequence
//!   number, so later submissions never extend it.

use std::any::Any;
use std::collections::BTreeSet;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use serde::{Deserialize, Serialize};
use tokio::sync::{OwnedSemaphorePermit, Semaphore, TryAcquireError, oneshot, watch};
use tracing::{debug, error};

use crate::error::{Result, SpindleError};

/// What `submit` does when every slot is busy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Admission {
    /// Wait for a free slot.
    #[default]
    Block,
    /// Fail fast with `PoolSaturated`.
    Reject,
}

#[derive(Default)]
struct Tracker {
    next_seq: u64,
    in_flight: BTreeSet<u64>,
}

struct Inner {
    size: usize,
    admission: Admission,
    permits: Arc<Semaphore>,
    closed: AtomicBool,
    tracker: Mutex<Tracker>,
    finished: watch::Sender<u64>,
}

impl Inner {
    fn tracker(&self) -> MutexGuard<'_, Tracker> {
        self.tracker.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn finish(&self, seq: u64) {
        self.tracker().in_flight.remove(&seq);
        self.finished.send_modify(|n| *n += 1);
    }
}

/// Marks a unit finished even when its completion callback panics.
struct InFlight {
    inner: Arc<Inner>,
    seq: u64,
    _permit: OwnedSemaphorePermit,
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.inner.finish(self.seq);
    }
}

/// Completion handle for one submitted unit of work.
pub struct WorkHandle {
    rx: oneshot::Receiver<Result<()>>,
}

impl WorkHandle {
    /// The unit's result; a panic is reported as `WorkPanicked`.
    pub async fn outcome(self) -> Result<()> {
        self.rx.await.unwrap_or(Err(SpindleError::PoolClosed))
    }
}

#[derive(Clone)]
pub struct WorkerPool {
    inner: Arc<Inner>,
}

impl WorkerPool {
    /// `size == 0` falls back to a single slot.
    pub fn new(size: usize, admission: Admission) -> Self {
        let size = size.max(1);
        let (finished, _) = watch::channel(0);
        Self {
            inner: Arc::new(Inner {
                size,
                admission,
                permits: Arc::new(Semaphore::new(size)),
                closed: AtomicBool::new(false),
                tracker: Mutex::new(Tracker::default()),
                finished,
            }),
        }
    }

    pub fn size(&self) -> usize {
        self.inner.size
    }

    pub fn admission(&self) -> Admission {
        self.inner.admission
    }

    /// Units accepted and not yet finished.
    pub fn running(&self) -> usize {
        self.inner.tracker().in_flight.len()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Accept `work` and return a handle to its outcome.
    pub async fn submit<F>(&self, work: F) -> Result<WorkHandle>
    where
        F: Future<Output = Result<()>> + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        self.submit_then(work, move |outcome| async move {
            let _ = tx.send(outcome);
        })
        .await?;
        Ok(WorkHandle { rx })
    }

    /// Accept `work`; `then` receives its outcome and runs inside the same slot,
    /// so `wait()` also covers it.
    pub async fn submit_then<F, D, DFut>(&self, work: F, then: D) -> Result<()>
    where
        F: Future<Output = Result<()>> + Send + 'static,
        D: FnOnce(Result<()>) -> DFut + Send + 'static,
        DFut: Future<Output = ()> + Send + 'static,
    {
        if self.is_closed() {
            return Err(SpindleError::PoolClosed);
        }
        let permit = self.acquire().await?;
        if self.is_closed() {
            return Err(SpindleError::PoolClosed);
        }

        let seq = {
            let mut tracker = self.inner.tracker();
            let seq = tracker.next_seq;
            tracker.next_seq += 1;
            tracker.in_flight.insert(seq);
            seq
        };
        let guard = InFlight {
            inner: Arc::clone(&self.inner),
            seq,
            _permit: permit,
        };

        tokio::spawn(async move {
            let _guard = guard;
            let outcome = match tokio::spawn(work).await {
                Ok(outcome) => outcome,
                Err(join_err) if join_err.is_panic() => {
                    let message = panic_message(join_err.into_panic());
                    error!(seq, panic = %message, "work panicked");
                    Err(SpindleError::WorkPanicked(message))
                }
                Err(join_err) => Err(SpindleError::WorkPanicked(join_err.to_string())),
            };
            then(outcome).await;
        });
        debug!(seq, "work accepted");
        Ok(())
    }

    async fn acquire(&self) -> Result<OwnedSemaphorePermit> {
        let permits = Arc::clone(&self.inner.permits);
        match self.inner.admission {
            Admission::Block => permits
                .acquire_owned()
                .await
                .map_err(|_| SpindleError::PoolClosed),
            Admission::Reject => permits.try_acquire_owned().map_err(|e| match e {
                TryAcquireError::NoPermits => SpindleError::PoolSaturated,
                TryAcquireError::Closed => SpindleError::PoolClosed,
            }),
        }
    }

    /// Block until every unit accepted before this call has finished.
    pub async fn wait(&self) {
        let mut rx = self.inner.finished.subscribe();
        let target = self.inner.tracker().next_seq;
        loop {
            let drained = self
                .inner
                .tracker()
                .in_flight
                .first()
                .is_none_or(|&oldest| oldest >= target);
            if drained {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// Stop accepting work, let accepted work drain, then close the slots.
    pub async fn release(&self) {
        self.inner.closed.store(true, Ordering::Release);
        self.wait().await;
        self.inner.permits.close();
        debug!("worker pool released");
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    async fn explode() -> Result<()> {
        panic!("boom")
    }

    #[tokio::test]
    async fn zero_size_defaults_to_one() {
        assert_eq!(WorkerPool::new(0, Admission::Block).size(), 1);
    }

    #[tokio::test]
    async fn never_exceeds_concurrency_ceiling() {
        let pool = WorkerPool::new(4, Admission::Block);
        let current = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        for _ in 0..20 {
            let current = Arc::clone(&current);
            let peak = Arc::clone(&peak);
            pool.submit(async move {
                let now = current.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(10)).await;
                current.fetch_sub(1, Ordering::SeqCst);
                Ok(())
            })
            .await
            .unwrap();
        }
        pool.wait().await;

        assert!(peak.load(Ordering::SeqCst) <= 4);
        assert_eq!(current.load(Ordering::SeqCst), 0);
        assert_eq!(pool.running(), 0);
    }

    #[tokio::test]
    async fn panics_are_isolated_and_reported() {
        let pool = WorkerPool::new(2, Admission::Block);
        let done = Arc::new(AtomicUsize::new(0));

        let bad = pool.submit(explode()).await.unwrap();
        let d = Arc::clone(&done);
        let good = pool
            .submit(async move {
                tokio::time::sleep(Duration::from_millis(20)).await;
                d.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .await
            .unwrap();

        pool.wait().await;
        assert_eq!(done.load(Ordering::SeqCst), 1);

        let err = bad.outcome().await.unwrap_err();
        assert!(matches!(err, SpindleError::WorkPanicked(ref m) if m == "boom"));
        good.outcome().await.unwrap();

        // the pool keeps working
        pool.submit(async { Ok(()) }).await.unwrap().outcome().await.unwrap();
    }

    #[tokio::test]
    async fn reject_admission_reports_saturation() {
        let pool = WorkerPool::new(1, Admission::Reject);
        let (tx, rx) = oneshot::channel::<()>();
        pool.submit(async move {
            let _ = rx.await;
            Ok(())
        })
        .await
        .unwrap();

        let err = pool.submit(async { Ok(()) }).await.err().unwrap();
        assert!(matches!(err, SpindleError::PoolSaturated));

        tx.send(()).unwrap();
        pool.wait().await;
        assert!(pool.submit(async { Ok(()) }).await.is_ok());
    }

    #[tokio::test]
    async fn wait_ignores_work_submitted_later() {
        let pool = WorkerPool::new(2, Admission::Block);
        pool.submit(async {
            tokio::time::sleep(Duration::from_millis(10)).await;
            Ok(())
        })
        .await
        .unwrap();

        let (_tx, rx) = oneshot::channel::<()>();
        let waiter = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.wait().await })
        };
        // accepted after the barrier was taken; never finishes during the test
        tokio::time::sleep(Duration::from_millis(1)).await;
        pool.submit(async move {
            let _ = rx.await;
            Ok(())
        })
        .await
        .unwrap();

        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("wait should not block on later work")
            .unwrap();
    }

    #[tokio::test]
    async fn release_rejects_new_work() {
        let pool = WorkerPool::new(1, Admission::Block);
        pool.release().await;
        let err = pool.submit(async { Ok(()) }).await.err().unwrap();
        assert!(matches!(err, SpindleError::PoolClosed));
    }

    #[tokio::test]
    async fn completion_callback_runs_inside_the_slot() {
        let pool = WorkerPool::new(1, Admission::Block);
        let seen = Arc::new(AtomicUsize::new(0));
        let s = Arc::clone(&seen);
        pool.submit_then(async { Err(SpindleError::handler("x")) }, move |outcome| async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            if outcome.is_err() {
                s.fetch_add(1, Ordering::SeqCst);
            }
        })
        .await
        .unwrap();

        pool.wait().await;
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }
}
