//! Per-enqueue options.

use std::time::Duration;

use chrono::{DateTime, Utc};

use super::{Lane, TaskId};

/// Options applied when a task is enqueued.
///
/// Unset fields fall back to the client's configured defaults
/// (lane `default`, max retry 3, retention 24h, process immediately).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnqueueOptions {
    pub lane: Option<Lane>,
    pub max_retry: Option<u32>,
    pub retention: Option<Duration>,
    pub process_at: Option<DateTime<Utc>>,
    pub process_in: Option<Duration>,
    pub task_id: Option<TaskId>,
    pub unique: Option<Duration>,
}

impl EnqueueOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lane(mut self, lane: Lane) -> Self {
        self.lane = Some(lane);
        self
    }

    pub fn max_retry(mut self, max_retry: u32) -> Self {
        self.max_retry = Some(max_retry);
        self
    }

    pub fn retention(mut self, retention: Duration) -> Self {
        self.retention = Some(retention);
        self
    }

    /// Keep the task invisible until `at`. Overrides `process_in`.
    pub fn process_at(mut self, at: DateTime<Utc>) -> Self {
        self.process_at = Some(at);
        self.process_in = None;
        self
    }

    /// Keep the task invisible for `delay` from enqueue time. Overrides `process_at`.
    pub fn process_in(mut self, delay: Duration) -> Self {
        self.process_in = Some(delay);
        self.process_at = None;
        self
    }

    /// Use a caller-supplied id; enqueueing a second live task with it fails.
    pub fn task_id(mut self, id: TaskId) -> Self {
        self.task_id = Some(id);
        self
    }

    /// Reject identical (lane, type, payload) tasks for `ttl` or until this one finishes.
    pub fn unique(mut self, ttl: Duration) -> Self {
        self.unique = Some(ttl);
        self
    }

    /// Overlay `other` on top of `self`; fields set in `other` win.
    pub fn merge(mut self, other: &EnqueueOptions) -> Self {
        if other.lane.is_some() {
            self.lane = other.lane;
        }
        if other.max_retry.is_some() {
            self.max_retry = other.max_retry;
        }
        if other.retention.is_some() {
            self.retention = other.retention;
        }
        if other.process_at.is_some() || other.process_in.is_some() {
            self.process_at = other.process_at;
            self.process_in = other.process_in;
        }
        if other.task_id.is_some() {
            self.task_id.clone_from(&other.task_id);
        }
        if other.unique.is_some() {
            self.unique = other.unique;
        }
        self
    }
}
