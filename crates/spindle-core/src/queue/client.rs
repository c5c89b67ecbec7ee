use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use tracing::{debug, error};

use crate::domain::{EnqueueOptions, Lane, Task, TaskInfo, TaskMessage, TaskState, add_duration};
use crate::error::{Result, SpindleError};
use crate::ports::{Broker, Clock, IdGenerator};
use crate::typed::TypedTask;

/// Defaults applied to options an enqueue call leaves unset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientOptions {
    pub default_lane: Lane,
    pub default_max_retry: u32,
    pub default_retention: Duration,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            default_lane: Lane::Default,
            default_max_retry: 3,
            default_retention: Duration::from_secs(24 * 60 * 60),
        }
    }
}

/// Producer side of the queue.
#[derive(Clone)]
pub struct Client {
    broker: Arc<dyn Broker>,
    ids: Arc<dyn IdGenerator>,
    clock: Arc<dyn Clock>,
    options: ClientOptions,
}

impl Client {
    pub fn new(
        broker: Arc<dyn Broker>,
        ids: Arc<dyn IdGenerator>,
        clock: Arc<dyn Clock>,
        options: ClientOptions,
    ) -> Self {
        Self {
            broker,
            ids,
            clock,
            options,
        }
    }

    pub fn options(&self) -> &ClientOptions {
        &self.options
    }

    /// Enqueue `task`. Store failures surface as `EnqueueFailed`; the client never retries.
    pub async fn enqueue(&self, task: &Task, opts: EnqueueOptions) -> Result<TaskInfo> {
        let now = self.clock.now();
        let lane = opts.lane.unwrap_or(self.options.default_lane);
        let process_at = match (opts.process_at, opts.process_in) {
            (Some(at), _) => at,
            (None, Some(delay)) => add_duration(now, delay),
            (None, None) => now,
        };

        let mut msg = TaskMessage {
            id: opts.task_id.unwrap_or_else(|| self.ids.task_id()),
            task_type: task.task_type().clone(),
            payload: task.payload().to_vec(),
            lane,
            state: TaskState::Pending,
            max_retry: opts.max_retry.unwrap_or(self.options.default_max_retry),
            retried: 0,
            retention: opts.retention.unwrap_or(self.options.default_retention),
            process_at,
            last_error: None,
            last_failed_at: None,
            completed_at: None,
            retain_until: None,
            unique_key: opts.unique.map(|_| unique_key(lane, task)),
            created_at: now,
        };
        msg.settle(now);

        match self.broker.enqueue(msg, opts.unique).await {
            Ok(info) => {
                debug!(
                    task_id = %info.id,
                    task_type = %info.task_type,
                    lane = %info.lane,
                    state = %info.state,
                    "task enqueued"
                );
                Ok(info)
            }
            Err(err @ (SpindleError::TaskIdConflict(_) | SpindleError::DuplicateTask)) => Err(err),
            Err(err) => {
                error!(task_type = %task.task_type(), error = %err, "enqueue failed");
                Err(SpindleError::EnqueueFailed(err.to_string()))
            }
        }
    }

    /// Keep the task invisible until `at`.
    pub async fn enqueue_at(&self, task: &Task, at: DateTime<Utc>, opts: EnqueueOptions) -> Result<TaskInfo> {
        self.enqueue(task, opts.process_at(at)).await
    }

    /// Keep the task invisible for `delay`.
    pub async fn enqueue_in(&self, task: &Task, delay: Duration, opts: EnqueueOptions) -> Result<TaskInfo> {
        self.enqueue(task, opts.process_in(delay)).await
    }

    /// Serialize `value` as JSON and enqueue it under `T::TYPE`.
    pub async fn enqueue_typed<T: TypedTask>(&self, value: &T, opts: EnqueueOptions) -> Result<TaskInfo> {
        let task = Task::json(T::TYPE, value)?;
        self.enqueue(&task, opts).await
    }
}

/// `{lane}:{task_type}:{sha256(payload)}`.
///
/// Every process must derive the same key for the same task, so the digest is fixed.
fn unique_key(lane: Lane, task: &Task) -> String {
    let digest = Sha256::digest(task.payload());
    format!("{lane}:{}:{}", task.task_type(), hex::encode(digest))
}
