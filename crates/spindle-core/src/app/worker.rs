use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::info;

use crate::cache::TieredCache;
use crate::config::Config;
use crate::domain::{EnqueueOptions, ScheduleId, Task, TaskInfo};
use crate::error::Result;
use crate::lock::LockCoordinator;
use crate::queue::{Client, Inspector, Server, TaskHandler};
use crate::scheduler::Scheduler;
use crate::typed::TypedTask;

/// One process's handle on the whole system: queue client and server, scheduler,
/// inspector, locks and cache. Built by [`super::AppBuilder`].
pub struct Worker {
    config: Config,
    client: Client,
    server: Server,
    scheduler: Arc<Scheduler>,
    inspector: Inspector,
    locks: LockCoordinator,
    cache: TieredCache,
}

impl Worker {
    pub(crate) fn new(
        config: Config,
        client: Client,
        server: Server,
        scheduler: Scheduler,
        inspector: Inspector,
        locks: LockCoordinator,
        cache: TieredCache,
    ) -> Self {
        Self {
            config,
            client,
            server,
            scheduler: Arc::new(scheduler),
            inspector,
            locks,
            cache,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    pub fn server(&self) -> &Server {
        &self.server
    }

    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.scheduler
    }

    pub fn inspector(&self) -> &Inspector {
        &self.inspector
    }

    pub fn locks(&self) -> &LockCoordinator {
        &self.locks
    }

    pub fn cache(&self) -> &TieredCache {
        &self.cache
    }

    pub async fn send_task(&self, task: &Task, opts: EnqueueOptions) -> Result<TaskInfo> {
        self.client.enqueue(task, opts).await
    }

    pub async fn send_task_at(&self, task: &Task, at: DateTime<Utc>, opts: EnqueueOptions) -> Result<TaskInfo> {
        self.client.enqueue_at(task, at, opts).await
    }

    pub async fn send_task_in(&self, task: &Task, delay: Duration, opts: EnqueueOptions) -> Result<TaskInfo> {
        self.client.enqueue_in(task, delay, opts).await
    }

    pub async fn send_typed<T: TypedTask>(&self, value: &T, opts: EnqueueOptions) -> Result<TaskInfo> {
        self.client.enqueue_typed(value, opts).await
    }

    /// Bind `handler` to the task's type in the dynamic registry, then enqueue it.
    ///
    /// The dynamic binding shadows any static handler for the same type and stays in
    /// place until replaced. Two callers binding the same type concurrently race; the
    /// last binding handles every queued task of that type.
    pub async fn send_dynamic_task(
        &self,
        task: &Task,
        handler: Arc<dyn TaskHandler>,
        opts: EnqueueOptions,
    ) -> Result<TaskInfo> {
        self.server
            .dispatcher()
            .dynamic()
            .register(task.task_type().clone(), handler);
        self.client.enqueue(task, opts).await
    }

    /// Enqueue `task` on every activation of the cron expression `spec`.
    pub fn schedule_task(&self, spec: &str, task: Task, opts: EnqueueOptions) -> Result<ScheduleId> {
        self.scheduler.register(spec, task, opts)
    }

    /// Start the server loops and the scheduler.
    pub async fn run(&self) -> Result<()> {
        self.server.run().await?;
        self.scheduler.run().await;
        info!(namespace = %self.config.namespace, "worker running");
        Ok(())
    }

    /// Stop the scheduler first so no new work arrives, then drain the server.
    pub async fn shutdown(&self) {
        self.scheduler.shutdown().await;
        self.server.shutdown().await;
        info!(namespace = %self.config.namespace, "worker stopped");
    }
}
