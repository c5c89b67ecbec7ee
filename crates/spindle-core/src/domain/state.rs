//! Task state machine.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Task state.
///
/// State transitions:
/// - Scheduled -> Pending (once `process_at` passes)
/// - Pending -> Active -> Completed
/// - Pending -> Active -> Retry -> Pending (loop while retry budget remains)
/// - Pending -> Active -> Archived (retry budget exhausted, or `SkipRetry`)
///
/// Completed and Archived records are retained for the task's retention window, then purged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskState {
    /// Waiting for its `process_at` time.
    Scheduled,

    /// Ready to be dequeued.
    Pending,

    /// Handed to a worker.
    Active,

    /// Failed, waiting for its backoff to elapse.
    Retry,

    /// Handler succeeded.
    Completed,

    /// Failed permanently; kept for inspection.
    Archived,
}

impl TaskState {
    pub const ALL: [TaskState; 6] = [
        TaskState::Scheduled,
        TaskState::Pending,
        TaskState::Active,
        TaskState::Retry,
        TaskState::Completed,
        TaskState::Archived,
    ];

    /// Is this a terminal state (no further transitions)?
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskState::Completed | TaskState::Archived)
    }

    /// Waiting on a timestamp before it becomes pending.
    pub fn is_delayed(self) -> bool {
        matches!(self, TaskState::Scheduled | TaskState::Retry)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TaskState::Scheduled => "scheduled",
            TaskState::Pending => "pending",
            TaskState::Active => "active",
            TaskState::Retry => "retry",
            TaskState::Completed => "completed",
            TaskState::Archived => "archived",
        }
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_states() {
        assert!(TaskState::Completed.is_terminal());
        assert!(TaskState::Archived.is_terminal());
        assert!(!TaskState::Retry.is_terminal());
        assert!(!TaskState::Active.is_terminal());
    }

    #[test]
    fn delayed_states() {
        assert!(TaskState::Scheduled.is_delayed());
        assert!(TaskState::Retry.is_delayed());
        assert!(!TaskState::Pending.is_delayed());
    }
}
