//! Handler<T> - 型付き handler と type erasure
//!
//! `TypedHandler<T, H>` が payload を `T` に decode してから `Handler<T>` を呼ぶ。
//! これで `Arc<dyn TaskHandler>` として registry に格納できる。

use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;

use super::TypedTask;
use crate::domain::{TaskEnvelope, TaskType};
use crate::error::{Result, SpindleError};
use crate::queue::{HandlerRegistry, TaskHandler};

/// Handles one typed task. The envelope carries the delivery context (attempt, lane).
#[async_trait]
pub trait Handler<T: TypedTask>: Send + Sync {
    async fn handle(&self, task: T, envelope: &TaskEnvelope) -> Result<()>;
}

pub struct TypedHandler<T: TypedTask, H: Handler<T>> {
    handler: H,
    _marker: PhantomData<fn() -> T>,
}

impl<T: TypedTask, H: Handler<T>> TypedHandler<T, H> {
    pub fn new(handler: H) -> Self {
        Self {
            handler,
            _marker: PhantomData,
        }
    }
}

#[async_trait]
impl<T: TypedTask, H: Handler<T>> TaskHandler for TypedHandler<T, H> {
    async fn handle(&self, envelope: &TaskEnvelope) -> Result<()> {
        // a payload that does not decode never will: no point retrying it
        let task: T = envelope
            .decode()
            .map_err(|e| SpindleError::SkipRetry(format!("decode {}: {e}", T::TYPE)))?;
        self.handler.handle(task, envelope).await
    }
}

impl HandlerRegistry {
    /// Register `handler` under `T::TYPE`.
    pub fn register_typed<T: TypedTask, H: Handler<T> + 'static>(
        &self,
        handler: H,
    ) -> Option<Arc<dyn TaskHandler>> {
        self.register(TaskType::new(T::TYPE), Arc::new(TypedHandler::<T, H>::new(handler)))
    }
}
