//! Broker port - task queue backend
//!
//! Broker がタスク状態の正本。Client / Server / Inspector はこの trait だけを見る。
//! 状態遷移（push / pop / retry / archive）はすべて Broker 内で atomic に行う。

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::{Lane, TaskId, TaskInfo, TaskMessage, TaskState};
use crate::error::Result;

/// Per-lane task counts by state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LaneCounts {
    pub scheduled: usize,
    pub pending: usize,
    pub active: usize,
    pub retry: usize,
    pub completed: usize,
    pub archived: usize,
}

impl LaneCounts {
    pub fn add(&mut self, state: TaskState) {
        match state {
            TaskState::Scheduled => self.scheduled += 1,
            TaskState::Pending => self.pending += 1,
            TaskState::Active => self.active += 1,
            TaskState::Retry => self.retry += 1,
            TaskState::Completed => self.completed += 1,
            TaskState::Archived => self.archived += 1,
        }
    }

    pub fn get(&self, state: TaskState) -> usize {
        match state {
            TaskState::Scheduled => self.scheduled,
            TaskState::Pending => self.pending,
            TaskState::Active => self.active,
            TaskState::Retry => self.retry,
            TaskState::Completed => self.completed,
            TaskState::Archived => self.archived,
        }
    }

    pub fn total(&self) -> usize {
        TaskState::ALL.iter().map(|&s| self.get(s)).sum()
    }
}

#[async_trait]
pub trait Broker: Send + Sync {
    /// Store a new task. The message's `state` has already been settled by the caller.
    ///
    /// Fails with `TaskIdConflict` when a live task holds the same id, and with
    /// `DuplicateTask` when `unique_ttl` is set and the message's uniqueness key is held.
    async fn enqueue(&self, msg: TaskMessage, unique_ttl: Option<Duration>) -> Result<TaskInfo>;

    /// Promote due scheduled/retry tasks, then pop the oldest pending task from the
    /// first non-empty lane in `lanes` order and mark it active.
    async fn dequeue(&self, lanes: &[Lane]) -> Result<Option<TaskMessage>>;

    async fn complete(&self, id: &TaskId) -> Result<()>;

    /// Hand an active task back to the front of its lane without spending a retry
    /// (used when the worker pool turned it away or the server is stopping).
    async fn requeue(&self, id: &TaskId) -> Result<()>;

    /// Record a failed attempt and park the task until `process_at`.
    async fn retry(&self, id: &TaskId, process_at: DateTime<Utc>, error: String) -> Result<()>;

    /// Record a final failure; the task stays inspectable for its retention.
    async fn archive(&self, id: &TaskId, error: String) -> Result<()>;

    /// Drop terminal tasks whose retention elapsed before `now`. Returns the number purged.
    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<usize>;

    async fn task_info(&self, lane: Lane, id: &TaskId) -> Result<TaskInfo>;

    async fn list(&self, lane: Lane, state: TaskState) -> Result<Vec<TaskInfo>>;

    async fn counts(&self, lane: Lane) -> Result<LaneCounts>;

    /// Delete a non-active task.
    async fn delete_task(&self, lane: Lane, id: &TaskId) -> Result<()>;

    /// Make a scheduled, retry or archived task pending right away.
    async fn run_task(&self, lane: Lane, id: &TaskId) -> Result<()>;
}
