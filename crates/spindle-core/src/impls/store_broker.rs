//! StoreBroker - 共有 KvStore 上の Broker 実装
//!
//! broker の状態全体（`BrokerState`）を 1 つの JSON document として
//! `{namespace}:broker:state` に置く。複数プロセスの Client / Server が同じ store を
//! 見ていれば、同じ lane・同じ task を共有する。
//!
//! # 原子性
//! - 変更系は `{namespace}:broker_guard` の lease（create-if-absent + fencing token）を
//!   取ってから read-modify-write し、document が変わったときだけ書き戻す。
//! - 読み取り系は document 1 つの get で済むので lease を取らない。
//! - lease を持ったままプロセスが落ちても `guard_lease` 後には次の操作が進める。

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::warn;

use super::broker_state::BrokerState;
use crate::domain::{Lane, TaskId, TaskInfo, TaskMessage, TaskState};
use crate::error::{Result, SpindleError};
use crate::lock::{LockCoordinator, LockOptions};
use crate::ports::{Broker, Clock, IdGenerator, KvStore, LaneCounts};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreBrokerOptions {
    /// Key prefix shared by every process using the same queue.
    pub namespace: String,
    /// Upper bound on one state update; a crashed updater blocks others this long.
    pub guard_lease: Duration,
    pub guard_retry: Duration,
    /// How long an operation waits for the guard before failing.
    pub guard_timeout: Duration,
}

impl Default for StoreBrokerOptions {
    fn default() -> Self {
        Self {
            namespace: "spindle".to_string(),
            guard_lease: Duration::from_secs(10),
            guard_retry: Duration::from_millis(5),
            guard_timeout: Duration::from_secs(5),
        }
    }
}

pub struct StoreBroker {
    store: Arc<dyn KvStore>,
    guard: LockCoordinator,
    state_key: String,
    clock: Arc<dyn Clock>,
    options: StoreBrokerOptions,
}

impl StoreBroker {
    pub fn new(
        store: Arc<dyn KvStore>,
        ids: Arc<dyn IdGenerator>,
        clock: Arc<dyn Clock>,
        options: StoreBrokerOptions,
    ) -> Self {
        let guard = LockCoordinator::new(
            Arc::clone(&store),
            ids,
            LockOptions {
                workspace: format!("{}:broker", options.namespace),
                lease: options.guard_lease,
                retry_interval: options.guard_retry,
                default_timeout: options.guard_timeout,
            },
        );
        Self {
            state_key: format!("{}:broker:state", options.namespace),
            store,
            guard,
            clock,
            options,
        }
    }

    pub fn options(&self) -> &StoreBrokerOptions {
        &self.options
    }

    async fn load_raw(&self) -> Result<(Option<Vec<u8>>, BrokerState)> {
        match self.store.get(&self.state_key).await? {
            Some(bytes) => {
                let state = serde_json::from_slice(&bytes)?;
                Ok((Some(bytes), state))
            }
            None => Ok((None, BrokerState::default())),
        }
    }

    async fn read<T>(&self, op: impl FnOnce(&BrokerState) -> Result<T> + Send) -> Result<T> {
        let (_, state) = self.load_raw().await?;
        op(&state)
    }

    /// Run `op` against the latest state while holding the guard.
    ///
    /// Nothing is written when `op` fails or leaves the document unchanged.
    async fn update<T: Send>(
        &self,
        op: impl FnOnce(&mut BrokerState, DateTime<Utc>) -> Result<T> + Send,
    ) -> Result<T> {
        let guard = match self.guard.acquire("guard", None).await {
            Ok(guard) => guard,
            Err(SpindleError::LockTimeout { elapsed, .. }) => {
                return Err(SpindleError::store(format!(
                    "broker state busy for {elapsed:?}"
                )));
            }
            Err(err) => return Err(err),
        };

        let result = async {
            let (before, mut state) = self.load_raw().await?;
            let out = op(&mut state, self.clock.now())?;
            let after = serde_json::to_vec(&state)?;
            if before.as_deref() != Some(after.as_slice()) {
                self.store.set(&self.state_key, &after, None).await?;
            }
            Ok(out)
        }
        .await;

        if let Err(err) = guard.release().await {
            warn!(error = %err, "broker guard expired during update");
        }
        result
    }
}

#[async_trait]
impl Broker for StoreBroker {
    async fn enqueue(&self, msg: TaskMessage, unique_ttl: Option<Duration>) -> Result<TaskInfo> {
        self.update(|state, now| state.enqueue(msg, unique_ttl, now)).await
    }

    async fn dequeue(&self, lanes: &[Lane]) -> Result<Option<TaskMessage>> {
        self.update(|state, now| state.dequeue(lanes, now)).await
    }

    async fn complete(&self, id: &TaskId) -> Result<()> {
        self.update(|state, now| state.complete(id, now)).await
    }

    async fn requeue(&self, id: &TaskId) -> Result<()> {
        self.update(|state, _| state.requeue(id)).await
    }

    async fn retry(&self, id: &TaskId, process_at: DateTime<Utc>, error: String) -> Result<()> {
        self.update(|state, now| state.retry(id, process_at, error, now)).await
    }

    async fn archive(&self, id: &TaskId, error: String) -> Result<()> {
        self.update(|state, now| state.archive(id, error, now)).await
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<usize> {
        self.update(|state, _| Ok(state.purge_expired(now))).await
    }

    async fn task_info(&self, lane: Lane, id: &TaskId) -> Result<TaskInfo> {
        self.read(|state| state.task_info(lane, id)).await
    }

    async fn list(&self, lane: Lane, task_state: TaskState) -> Result<Vec<TaskInfo>> {
        self.read(|state| Ok(state.list(lane, task_state))).await
    }

    async fn counts(&self, lane: Lane) -> Result<LaneCounts> {
        self.read(|state| Ok(state.counts(lane))).await
    }

    async fn delete_task(&self, lane: Lane, id: &TaskId) -> Result<()> {
        self.update(|state, _| state.delete_task(lane, id)).await
    }

    async fn run_task(&self, lane: Lane, id: &TaskId) -> Result<()> {
        self.update(|state, now| state.run_task(lane, id, now)).await
    }
}
