use std::time::Duration;

use thiserror::Error;

use crate::domain::{TaskId, TaskState, TaskType};

pub type Result<T> = std::result::Result<T, SpindleError>;

/// One tier's failure inside a multi-tier cache operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TierError {
    pub tier: usize,
    pub name: String,
    pub message: String,
}

impl std::fmt::Display for TierError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "tier {} ({}): {}", self.tier, self.name, self.message)
    }
}

#[derive(Debug, Error)]
pub enum SpindleError {
    #[error("enqueue failed: {0}")]
    EnqueueFailed(String),

    #[error("task id {0} already exists")]
    TaskIdConflict(TaskId),

    #[error("duplicate task: an identical task is still held by its uniqueness lock")]
    DuplicateTask,

    #[error("task {id} is {state}")]
    InvalidTaskState { id: TaskId, state: TaskState },

    #[error("handler error: {0}")]
    Handler(String),

    /// Returned by a handler to archive the task without spending its retry budget.
    #[error("skip retry: {0}")]
    SkipRetry(String),

    #[error("handler not found for task_type={0}")]
    HandlerNotFound(TaskType),

    #[error("lock timeout for key={key} after {elapsed:?}")]
    LockTimeout { key: String, elapsed: Duration },

    #[error("release failed for key={key}: lease no longer held by this token")]
    ReleaseFailed { key: String },

    #[error("worker pool saturated")]
    PoolSaturated,

    #[error("worker pool is closed")]
    PoolClosed,

    #[error("work panicked: {0}")]
    WorkPanicked(String),

    #[error("cache tier errors: {}", join_tiers(.0))]
    CacheTiers(Vec<TierError>),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid cron spec {spec:?}: {reason}")]
    InvalidCronSpec { spec: String, reason: String },

    #[error("store error: {0}")]
    Store(String),

    #[error("codec error: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("missing task types: {0:?}. These tasks were expected but not registered.")]
    MissingTaskTypes(Vec<String>),

    #[error("invalid config {field}: {reason}")]
    Config { field: String, reason: String },
}

impl SpindleError {
    /// Convenience constructor for handler failures.
    pub fn handler(message: impl Into<String>) -> Self {
        SpindleError::Handler(message.into())
    }

    pub fn store(message: impl std::fmt::Display) -> Self {
        SpindleError::Store(message.to_string())
    }

    pub fn config(field: impl Into<String>, reason: impl Into<String>) -> Self {
        SpindleError::Config {
            field: field.into(),
            reason: reason.into(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, SpindleError::NotFound(_))
    }
}

fn join_tiers(errors: &[TierError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cache_tier_errors_are_listed_in_message() {
        let err = SpindleError::CacheTiers(vec![
            TierError {
                tier: 1,
                name: "shared".into(),
                message: "connection refused".into(),
            },
            TierError {
                tier: 2,
                name: "cold".into(),
                message: "timeout".into(),
            },
        ]);
        let msg = err.to_string();
        assert!(msg.contains("tier 1 (shared): connection refused"));
        assert!(msg.contains("tier 2 (cold): timeout"));
    }

    #[test]
    fn lock_timeout_reports_key_and_elapsed() {
        let err = SpindleError::LockTimeout {
            key: "render_url_X".into(),
            elapsed: Duration::from_secs(2),
        };
        let msg = err.to_string();
        assert!(msg.contains("render_url_X"));
        assert!(msg.contains("2s"));
    }
}
