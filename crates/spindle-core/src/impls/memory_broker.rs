//! MemoryBroker - in-memory の Broker 実装
//!
//! 状態機械は `BrokerState` にあり、ここではプロセス内の tokio Mutex で守るだけ。
//! Mutex は各メソッド内で完結し、await を跨いで保持しない。

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use super::broker_state::BrokerState;
use crate::domain::{Lane, TaskId, TaskInfo, TaskMessage, TaskState};
use crate::error::Result;
use crate::ports::{Broker, Clock, LaneCounts, SystemClock};

pub struct MemoryBroker {
    state: Mutex<BrokerState>,
    clock: Arc<dyn Clock>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            state: Mutex::new(BrokerState::default()),
            clock,
        }
    }
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn enqueue(&self, msg: TaskMessage, unique_ttl: Option<Duration>) -> Result<TaskInfo> {
        let now = self.clock.now();
        self.state.lock().await.enqueue(msg, unique_ttl, now)
    }

    async fn dequeue(&self, lanes: &[Lane]) -> Result<Option<TaskMessage>> {
        let now = self.clock.now();
        self.state.lock().await.dequeue(lanes, now)
    }

    async fn complete(&self, id: &TaskId) -> Result<()> {
        let now = self.clock.now();
        self.state.lock().await.complete(id, now)
    }

    async fn requeue(&self, id: &TaskId) -> Result<()> {
        self.state.lock().await.requeue(id)
    }

    async fn retry(&self, id: &TaskId, process_at: DateTime<Utc>, error: String) -> Result<()> {
        let now = self.clock.now();
        self.state.lock().await.retry(id, process_at, error, now)
    }

    async fn archive(&self, id: &TaskId, error: String) -> Result<()> {
        let now = self.clock.now();
        self.state.lock().await.archive(id, error, now)
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<usize> {
        Ok(self.state.lock().await.purge_expired(now))
    }

    async fn task_info(&self, lane: Lane, id: &TaskId) -> Result<TaskInfo> {
        self.state.lock().await.task_info(lane, id)
    }

    async fn list(&self, lane: Lane, task_state: TaskState) -> Result<Vec<TaskInfo>> {
        Ok(self.state.lock().await.list(lane, task_state))
    }

    async fn counts(&self, lane: Lane) -> Result<LaneCounts> {
        Ok(self.state.lock().await.counts(lane))
    }

    async fn delete_task(&self, lane: Lane, id: &TaskId) -> Result<()> {
        self.state.lock().await.delete_task(lane, id)
    }

    async fn run_task(&self, lane: Lane, id: &TaskId) -> Result<()> {
        let now = self.clock.now();
        self.state.lock().await.run_task(lane, id, now)
    }
}
