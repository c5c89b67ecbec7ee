use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use super::{Lane, TaskId, TaskState};
use crate::error::Result;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskType(String);

impl TaskType {
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<&str> for TaskType {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// A unit of work as the producer sees it: type tag + opaque payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    task_type: TaskType,
    payload: Vec<u8>,
}

impl Task {
    pub fn new(task_type: impl Into<TaskType>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            task_type: task_type.into(),
            payload: payload.into(),
        }
    }

    /// Build a task whose payload is the JSON encoding of `value`.
    pub fn json<T: Serialize>(task_type: impl Into<TaskType>, value: &T) -> Result<Self> {
        Ok(Self::new(task_type, serde_json::to_vec(value)?))
    }

    pub fn task_type(&self) -> &TaskType {
        &self.task_type
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }
}

/// The broker's record of an enqueued task.
///
/// This is the single source of truth for task state; lane structures hold ids only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskMessage {
    pub id: TaskId,
    pub task_type: TaskType,
    pub payload: Vec<u8>,
    pub lane: Lane,
    pub state: TaskState,

    /// Retries allowed after the first attempt.
    pub max_retry: u32,

    /// Retries consumed so far.
    pub retried: u32,

    pub retention: Duration,

    /// Earliest time the task may be dequeued.
    pub process_at: DateTime<Utc>,

    pub last_error: Option<String>,
    pub last_failed_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,

    /// Purge deadline once the task reached a terminal state.
    pub retain_until: Option<DateTime<Utc>>,

    /// Uniqueness key held while the task is live (see `EnqueueOptions::unique`).
    pub unique_key: Option<String>,

    pub created_at: DateTime<Utc>,
}

impl TaskMessage {
    /// Moves to Pending or Scheduled depending on `process_at`.
    pub fn settle(&mut self, now: DateTime<Utc>) {
        self.state = if self.process_at > now {
            TaskState::Scheduled
        } else {
            TaskState::Pending
        };
    }

    pub fn mark_active(&mut self) {
        self.state = TaskState::Active;
    }

    pub fn mark_completed(&mut self, now: DateTime<Utc>) {
        self.state = TaskState::Completed;
        self.completed_at = Some(now);
        self.retain_until = Some(add_duration(now, self.retention));
    }

    /// Schedule another attempt: consumes one retry.
    pub fn mark_retry(&mut self, process_at: DateTime<Utc>, error: String, now: DateTime<Utc>) {
        self.state = TaskState::Retry;
        self.retried += 1;
        self.process_at = process_at;
        self.last_error = Some(error);
        self.last_failed_at = Some(now);
    }

    pub fn mark_archived(&mut self, error: String, now: DateTime<Utc>) {
        self.state = TaskState::Archived;
        self.last_error = Some(error);
        self.last_failed_at = Some(now);
        self.retain_until = Some(add_duration(now, self.retention));
    }

    /// Terminal and past its retention window.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.state.is_terminal() && self.retain_until.is_some_and(|until| until <= now)
    }

    pub fn info(&self) -> TaskInfo {
        TaskInfo {
            id: self.id.clone(),
            task_type: self.task_type.clone(),
            lane: self.lane,
            state: self.state,
            payload: self.payload.clone(),
            max_retry: self.max_retry,
            retry_count: self.retried,
            last_error: self.last_error.clone(),
            last_failed_at: self.last_failed_at,
            next_process_at: self.state.is_delayed().then_some(self.process_at),
            processed_at: self.completed_at,
            retention: self.retention,
        }
    }

    pub fn envelope(&self) -> TaskEnvelope {
        TaskEnvelope {
            id: self.id.clone(),
            task_type: self.task_type.clone(),
            payload: self.payload.clone(),
            lane: self.lane,
            retry_count: self.retried,
            max_retry: self.max_retry,
        }
    }
}

/// Read-only view of a task, returned by enqueue and inspection calls.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskInfo {
    pub id: TaskId,
    pub task_type: TaskType,
    pub lane: Lane,
    pub state: TaskState,
    pub payload: Vec<u8>,
    pub max_retry: u32,
    pub retry_count: u32,
    pub last_error: Option<String>,
    pub last_failed_at: Option<DateTime<Utc>>,
    pub next_process_at: Option<DateTime<Utc>>,
    pub processed_at: Option<DateTime<Utc>>,
    pub retention: Duration,
}

/// What a handler receives: the task plus its delivery context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskEnvelope {
    id: TaskId,
    task_type: TaskType,
    payload: Vec<u8>,
    lane: Lane,
    retry_count: u32,
    max_retry: u32,
}

impl TaskEnvelope {
    pub fn id(&self) -> &TaskId {
        &self.id
    }

    pub fn task_type(&self) -> &TaskType {
        &self.task_type
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn lane(&self) -> Lane {
        self.lane
    }

    /// Retries consumed before this delivery (0 on the first attempt).
    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }

    pub fn max_retry(&self) -> u32 {
        self.max_retry
    }

    /// 1-based attempt number of this delivery.
    pub fn attempt(&self) -> u32 {
        self.retry_count + 1
    }

    pub fn decode<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_slice(&self.payload)?)
    }
}

/// `at + duration`, saturating at the maximum representable time.
pub(crate) fn add_duration(at: DateTime<Utc>, duration: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(duration)
        .ok()
        .and_then(|d| at.checked_add_signed(d))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn message(now: DateTime<Utc>) -> TaskMessage {
        TaskMessage {
            id: TaskId::parse("task-1"),
            task_type: TaskType::new("send_email"),
            payload: br#"{"to":"a@b.com"}"#.to_vec(),
            lane: Lane::High,
            state: TaskState::Pending,
            max_retry: 2,
            retried: 0,
            retention: Duration::from_secs(60),
            process_at: now,
            last_error: None,
            last_failed_at: None,
            completed_at: None,
            retain_until: None,
            unique_key: None,
            created_at: now,
        }
    }

    #[test]
    fn settle_picks_scheduled_for_future_process_at() {
        let now = Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap();
        let mut msg = message(now);
        msg.process_at = now + chrono::Duration::seconds(5);
        msg.settle(now);
        assert_eq!(msg.state, TaskState::Scheduled);
        msg.settle(now + chrono::Duration::seconds(5));
        assert_eq!(msg.state, TaskState::Pending);
    }

    #[test]
    fn retry_consumes_budget_and_records_error() {
        let now = Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap();
        let mut msg = message(now);
        msg.mark_active();
        msg.mark_retry(now + chrono::Duration::seconds(2), "smtp down".into(), now);

        let info = msg.info();
        assert_eq!(info.state, TaskState::Retry);
        assert_eq!(info.retry_count, 1);
        assert_eq!(info.last_error.as_deref(), Some("smtp down"));
        assert_eq!(info.next_process_at, Some(now + chrono::Duration::seconds(2)));
    }

    #[test]
    fn terminal_tasks_expire_after_retention() {
        let now = Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap();
        let mut msg = message(now);
        msg.mark_completed(now);
        assert!(!msg.is_expired(now + chrono::Duration::seconds(59)));
        assert!(msg.is_expired(now + chrono::Duration::seconds(60)));
    }

    #[test]
    fn envelope_decodes_json_payload() {
        #[derive(Deserialize)]
        struct Email {
            to: String,
        }
        let now = Utc::now();
        let env = message(now).envelope();
        let email: Email = env.decode().unwrap();
        assert_eq!(email.to, "a@b.com");
        assert_eq!(env.attempt(), 1);
    }
}
