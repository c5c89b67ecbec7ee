use std::future::Future;

use async_trait::async_trait;

use crate::domain::TaskEnvelope;
use crate::error::Result;

/// A handler for one task type.
///
/// Takes the whole `TaskEnvelope` so the handler can decode the payload as it likes and
/// see its delivery context (attempt, lane). Returning `SpindleError::SkipRetry`
/// archives the task without spending the retry budget.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn handle(&self, task: &TaskEnvelope) -> Result<()>;
}

/// Closure adapter, see [`handler_fn`].
pub struct HandlerFn<F> {
    f: F,
}

/// Wrap an async closure as a `TaskHandler`.
///
/// ```ignore
/// registry.register("send_email", handler_fn(|task| async move {
///     let email: Email = task.decode()?;
///     mailer.send(email).await
/// }));
/// ```
pub fn handler_fn<F, Fut>(f: F) -> HandlerFn<F>
where
    F: Fn(TaskEnvelope) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    HandlerFn { f }
}

#[async_trait]
impl<F, Fut> TaskHandler for HandlerFn<F>
where
    F: Fn(TaskEnvelope) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    async fn handle(&self, task: &TaskEnvelope) -> Result<()> {
        (self.f)(task.clone()).await
    }
}
