use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use tracing::debug;

use super::TaskHandler;
use crate::domain::{TaskEnvelope, TaskType};
use crate::error::{Result, SpindleError};

/// Registry of handlers (task_type -> handler).
///
/// Registration for an existing type replaces the previous handler (last write wins),
/// so handlers can be swapped while the server runs.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: RwLock<HashMap<TaskType, Arc<dyn TaskHandler>>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<TaskType, Arc<dyn TaskHandler>>> {
        self.handlers.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<TaskType, Arc<dyn TaskHandler>>> {
        self.handlers.write().unwrap_or_else(|e| e.into_inner())
    }

    /// Returns the handler that was replaced, if any.
    pub fn register(
        &self,
        task_type: impl Into<TaskType>,
        handler: Arc<dyn TaskHandler>,
    ) -> Option<Arc<dyn TaskHandler>> {
        let task_type = task_type.into();
        debug!(task_type = %task_type, "handler registered");
        self.write().insert(task_type, handler)
    }

    pub fn unregister(&self, task_type: &TaskType) -> Option<Arc<dyn TaskHandler>> {
        self.write().remove(task_type)
    }

    pub fn get(&self, task_type: &TaskType) -> Option<Arc<dyn TaskHandler>> {
        self.read().get(task_type).cloned()
    }

    pub fn contains(&self, task_type: &TaskType) -> bool {
        self.read().contains_key(task_type)
    }

    pub fn task_types(&self) -> Vec<TaskType> {
        let mut types: Vec<TaskType> = self.read().keys().cloned().collect();
        types.sort();
        types
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }
}

/// Resolves a task to its handler and runs it.
///
/// The dynamic registry (ad-hoc handlers bound at send time) is consulted before the
/// static one. Concurrent dynamic registration for the same type is a race the caller
/// must avoid; the last registration wins.
#[derive(Clone, Default)]
pub struct Dispatcher {
    handlers: Arc<HandlerRegistry>,
    dynamic: Arc<HandlerRegistry>,
}

impl Dispatcher {
    pub fn new(handlers: Arc<HandlerRegistry>, dynamic: Arc<HandlerRegistry>) -> Self {
        Self { handlers, dynamic }
    }

    pub fn handlers(&self) -> &Arc<HandlerRegistry> {
        &self.handlers
    }

    pub fn dynamic(&self) -> &Arc<HandlerRegistry> {
        &self.dynamic
    }

    pub fn resolve(&self, task_type: &TaskType) -> Option<Arc<dyn TaskHandler>> {
        self.dynamic
            .get(task_type)
            .or_else(|| self.handlers.get(task_type))
    }

    /// Execute one envelope.
    pub async fn execute(&self, task: &TaskEnvelope) -> Result<()> {
        let task_type = task.task_type();
        let handler = self
            .resolve(task_type)
            .ok_or_else(|| SpindleError::HandlerNotFound(task_type.clone()))?;
        handler.handle(task).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Lane, TaskId, TaskMessage, TaskState};
    use crate::queue::handler_fn;
    use chrono::Utc;
    use std::time::Duration;

    fn envelope(task_type: &str) -> TaskEnvelope {
        let now = Utc::now();
        TaskMessage {
            id: TaskId::parse("task-1"),
            task_type: TaskType::new(task_type),
            payload: b"{}".to_vec(),
            lane: Lane::Default,
            state: TaskState::Active,
            max_retry: 3,
            retried: 0,
            retention: Duration::ZERO,
            process_at: now,
            last_error: None,
            last_failed_at: None,
            completed_at: None,
            retain_until: None,
            unique_key: None,
            created_at: now,
        }
        .envelope()
    }

    fn ok() -> Arc<dyn TaskHandler> {
        Arc::new(handler_fn(|_| async { Ok(()) }))
    }

    fn failing(msg: &'static str) -> Arc<dyn TaskHandler> {
        Arc::new(handler_fn(move |_| async move { Err(SpindleError::handler(msg)) }))
    }

    #[tokio::test]
    async fn executes_registered_handler() {
        let dispatcher = Dispatcher::default();
        dispatcher.handlers().register("ok", ok());
        dispatcher.execute(&envelope("ok")).await.unwrap();
    }

    #[tokio::test]
    async fn errors_when_handler_missing() {
        let dispatcher = Dispatcher::default();
        let err = dispatcher.execute(&envelope("missing")).await.unwrap_err();
        assert!(matches!(err, SpindleError::HandlerNotFound(t) if t.as_str() == "missing"));
    }

    #[tokio::test]
    async fn re_registration_replaces_handler() {
        let registry = HandlerRegistry::new();
        assert!(registry.register("t", failing("old")).is_none());
        assert!(registry.register("t", ok()).is_some());
        assert_eq!(registry.len(), 1);

        let dispatcher = Dispatcher::new(Arc::new(registry), Arc::default());
        dispatcher.execute(&envelope("t")).await.unwrap();
    }

    #[tokio::test]
    async fn dynamic_handler_shadows_static_one() {
        let dispatcher = Dispatcher::default();
        dispatcher.handlers().register("t", ok());
        dispatcher.dynamic().register("t", failing("dynamic"));

        let err = dispatcher.execute(&envelope("t")).await.unwrap_err();
        assert_eq!(err.to_string(), "handler error: dynamic");

        dispatcher.dynamic().unregister(&TaskType::new("t"));
        dispatcher.execute(&envelope("t")).await.unwrap();
    }
}
