//! Decision model: what happens to a task after an attempt.

use std::time::Duration;

use crate::backoff::BackoffPolicy;
use crate::domain::TaskMessage;
use crate::error::{Result, SpindleError};

/// The next action for a task whose attempt just finished.
#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    Complete,

    /// Park the task for `delay`, consuming one retry.
    Retry { delay: Duration, reason: String },

    /// Give up; the task is kept for inspection until its retention elapses.
    Archive { reason: String },
}

/// Decides the next action from the task state and the attempt outcome.
///
/// Deciders are pure: applying the decision to the broker is the server's job.
pub trait Decider: Send + Sync {
    fn decide(&self, task: &TaskMessage, outcome: &Result<()>) -> Decision;
}

/// Retry-budget decider with exponential backoff:
/// - success: complete
/// - `SkipRetry`: archive right away
/// - retries left (`retried < max_retry`): retry after `backoff.delay(retried)`
/// - otherwise: archive
///
/// A task with `max_retry = n` whose handler always fails is attempted `n + 1` times.
#[derive(Debug, Clone, Default)]
pub struct DefaultDecider {
    backoff: BackoffPolicy,
}

impl DefaultDecider {
    pub fn new(backoff: BackoffPolicy) -> Self {
        Self { backoff }
    }

    pub fn backoff(&self) -> &BackoffPolicy {
        &self.backoff
    }
}

impl Decider for DefaultDecider {
    fn decide(&self, task: &TaskMessage, outcome: &Result<()>) -> Decision {
        let err = match outcome {
            Ok(()) => return Decision::Complete,
            Err(err) => err,
        };
        if matches!(err, SpindleError::SkipRetry(_)) {
            return Decision::Archive {
                reason: err.to_string(),
            };
        }
        if task.retried >= task.max_retry {
            return Decision::Archive {
                reason: err.to_string(),
            };
        }
        Decision::Retry {
            delay: self.backoff.delay(task.retried),
            reason: err.to_string(),
        }
    }
}
