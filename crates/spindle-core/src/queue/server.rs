//! Server - dequeue → dispatch → settle
//!
//! # フロー
//! 1. `LaneSelector::order()` で lane の探索順を決める（重み付き）
//! 2. `Broker::dequeue()` で最初に見つかった pending タスクを active にして取り出す
//! 3. `WorkerPool::submit_then()` で handler を実行
//! 4. 同じ slot の中で `Decider` が結果を判定し、Broker に反映（complete / retry / archive）
//!
//! pool が満杯（Reject）または閉じている場合、取り出したタスクは `requeue` で
//! lane の先頭に戻す（retry 予算は消費しない）。

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::{Decider, Decision, DefaultDecider, Dispatcher, LaneSelector, TaskHandler};
use crate::backoff::BackoffPolicy;
use crate::domain::{LaneWeights, TaskMessage, TaskType, add_duration};
use crate::error::{Result, SpindleError};
use crate::pool::{Admission, WorkerPool};
use crate::ports::{Broker, Clock};

#[derive(Debug, Clone, PartialEq)]
pub struct ServerOptions {
    /// Worker pool size (0 falls back to 1).
    pub concurrency: usize,
    pub admission: Admission,
    pub lanes: LaneWeights,

    /// Always try lanes by descending weight instead of drawing them.
    pub strict_priority: bool,

    /// Sleep between dequeue attempts while every lane is empty.
    pub poll_interval: Duration,

    pub janitor_interval: Duration,

    /// Upper bound on waiting for in-flight work at shutdown.
    pub shutdown_timeout: Duration,

    pub retry: BackoffPolicy,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            concurrency: 10,
            admission: Admission::Block,
            lanes: LaneWeights::reference(),
            strict_priority: false,
            poll_interval: Duration::from_millis(100),
            janitor_interval: Duration::from_secs(8),
            shutdown_timeout: Duration::from_secs(8),
            retry: BackoffPolicy::default(),
        }
    }
}

struct ServerCore {
    broker: Arc<dyn Broker>,
    dispatcher: Dispatcher,
    pool: WorkerPool,
    selector: LaneSelector,
    decider: Arc<dyn Decider>,
    clock: Arc<dyn Clock>,
    options: ServerOptions,
}

struct Running {
    shutdown_tx: watch::Sender<bool>,
    joins: Vec<JoinHandle<()>>,
}

/// Consumer side of the queue.
pub struct Server {
    core: Arc<ServerCore>,
    running: Mutex<Option<Running>>,
}

impl Server {
    pub fn new(
        broker: Arc<dyn Broker>,
        dispatcher: Dispatcher,
        clock: Arc<dyn Clock>,
        options: ServerOptions,
    ) -> Self {
        let decider = Arc::new(DefaultDecider::new(options.retry));
        Self::with_decider(broker, dispatcher, clock, decider, options)
    }

    pub fn with_decider(
        broker: Arc<dyn Broker>,
        dispatcher: Dispatcher,
        clock: Arc<dyn Clock>,
        decider: Arc<dyn Decider>,
        options: ServerOptions,
    ) -> Self {
        let selector = LaneSelector::new(&options.lanes, options.strict_priority);
        Self::with_parts(broker, dispatcher, clock, decider, selector, options)
    }

    /// Full constructor; `selector` overrides the one `options.lanes` would build.
    pub fn with_parts(
        broker: Arc<dyn Broker>,
        dispatcher: Dispatcher,
        clock: Arc<dyn Clock>,
        decider: Arc<dyn Decider>,
        selector: LaneSelector,
        options: ServerOptions,
    ) -> Self {
        let core = ServerCore {
            pool: WorkerPool::new(options.concurrency, options.admission),
            selector,
            broker,
            dispatcher,
            decider,
            clock,
            options,
        };
        Self {
            core: Arc::new(core),
            running: Mutex::new(None),
        }
    }

    pub fn options(&self) -> &ServerOptions {
        &self.core.options
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.core.dispatcher
    }

    pub fn pool(&self) -> &WorkerPool {
        &self.core.pool
    }

    /// Bind `handler` to `task_type`, replacing any previous binding.
    pub fn register_handler(&self, task_type: impl Into<TaskType>, handler: Arc<dyn TaskHandler>) {
        self.core.dispatcher.handlers().register(task_type, handler);
    }

    pub async fn is_running(&self) -> bool {
        self.running.lock().await.is_some()
    }

    /// Dequeue one task and hand it to the pool.
    ///
    /// Returns `Ok(false)` when every served lane is empty.
    pub async fn process_once(&self) -> Result<bool> {
        self.core.process_once().await
    }

    /// Start the dispatch and janitor loops. Calling `run` on a running server is a no-op.
    ///
    /// There is exactly one dispatch loop, not one per lane or weight slot. Each
    /// dequeue asks `LaneSelector` for a fresh lane order, so lane weights shape which
    /// lane is tried first. Parallelism comes from the pool: the loop keeps
    /// dequeuing while the pool has room for `concurrency` handlers.
    pub async fn run(&self) -> Result<()> {
        let mut running = self.running.lock().await;
        if running.is_some() {
            warn!("server already running");
            return Ok(());
        }
        if self.core.pool.is_closed() {
            return Err(SpindleError::PoolClosed);
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let joins = vec![
            tokio::spawn(dispatch_loop(Arc::clone(&self.core), shutdown_rx.clone())),
            tokio::spawn(janitor_loop(Arc::clone(&self.core), shutdown_rx)),
        ];
        info!(
            lanes = ?self.core.selector.lanes(),
            concurrency = self.core.pool.size(),
            strict = self.core.selector.is_strict(),
            "server started"
        );
        *running = Some(Running { shutdown_tx, joins });
        Ok(())
    }

    /// Stop dequeuing and wait (bounded by `shutdown_timeout`) for in-flight tasks.
    ///
    /// Handlers are never interrupted; a task still running when the timeout passes is
    /// left active.
    pub async fn shutdown(&self) {
        let Some(running) = self.running.lock().await.take() else {
            return;
        };
        // ignore send error: loops may already be gone
        let _ = running.shutdown_tx.send(true);

        let drain = async {
            for join in running.joins {
                let _ = join.await;
            }
            self.core.pool.release().await;
        };
        if tokio::time::timeout(self.core.options.shutdown_timeout, drain)
            .await
            .is_err()
        {
            warn!(
                timeout = ?self.core.options.shutdown_timeout,
                running = self.core.pool.running(),
                "shutdown timed out with tasks in flight"
            );
        } else {
            info!("server stopped");
        }
    }
}

impl ServerCore {
    async fn process_once(self: &Arc<Self>) -> Result<bool> {
        let order = self.selector.order();
        let Some(msg) = self.broker.dequeue(&order).await? else {
            return Ok(false);
        };
        self.dispatch(msg).await?;
        Ok(true)
    }

    async fn dispatch(self: &Arc<Self>, msg: TaskMessage) -> Result<()> {
        let envelope = msg.envelope();
        debug!(
            task_id = %msg.id,
            task_type = %msg.task_type,
            lane = %msg.lane,
            attempt = envelope.attempt(),
            "task dispatched"
        );

        let dispatcher = self.dispatcher.clone();
        let core = Arc::clone(self);
        let id = msg.id.clone();
        let submitted = self
            .pool
            .submit_then(
                async move { dispatcher.execute(&envelope).await },
                move |outcome| async move { core.settle(msg, outcome).await },
            )
            .await;

        if let Err(err) = submitted {
            if let Err(requeue_err) = self.broker.requeue(&id).await {
                error!(task_id = %id, error = %requeue_err, "requeue failed");
            }
            return Err(err);
        }
        Ok(())
    }

    /// Apply the decider's verdict to the broker.
    async fn settle(&self, msg: TaskMessage, outcome: Result<()>) {
        let attempt = msg.retried + 1;
        let applied = match self.decider.decide(&msg, &outcome) {
            Decision::Complete => {
                debug!(
                    task_id = %msg.id,
                    task_type = %msg.task_type,
                    lane = %msg.lane,
                    attempt,
                    "task completed"
                );
                self.broker.complete(&msg.id).await
            }
            Decision::Retry { delay, reason } => {
                warn!(
                    task_id = %msg.id,
                    task_type = %msg.task_type,
                    lane = %msg.lane,
                    attempt,
                    delay = ?delay,
                    error = %reason,
                    "task failed, retry scheduled"
                );
                let process_at = add_duration(self.clock.now(), delay);
                self.broker.retry(&msg.id, process_at, reason).await
            }
            Decision::Archive { reason } => {
                error!(
                    task_id = %msg.id,
                    task_type = %msg.task_type,
                    lane = %msg.lane,
                    attempt,
                    error = %reason,
                    "task archived"
                );
                self.broker.archive(&msg.id, reason).await
            }
        };
        if let Err(err) = applied {
            error!(task_id = %msg.id, error = %err, "failed to record task outcome");
        }
    }
}

async fn dispatch_loop(core: Arc<ServerCore>, mut shutdown_rx: watch::Receiver<bool>) {
    loop {
        if *shutdown_rx.borrow() {
            break;
        }

        let idle = match core.process_once().await {
            Ok(dispatched) => !dispatched,
            Err(SpindleError::PoolClosed) => break,
            Err(SpindleError::PoolSaturated) => {
                debug!("pool saturated, task requeued");
                true
            }
            Err(err) => {
                error!(error = %err, "dequeue failed");
                true
            }
        };

        if idle {
            tokio::select! {
                _ = shutdown_rx.changed() => {}
                _ = tokio::time::sleep(core.options.poll_interval) => {}
            }
        }
    }
    debug!("dispatch loop stopped");
}

/// Purges terminal tasks past their retention.
async fn janitor_loop(core: Arc<ServerCore>, mut shutdown_rx: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(core.options.janitor_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => break,
            _ = ticker.tick() => {}
        }
        if *shutdown_rx.borrow() {
            break;
        }
        match core.broker.purge_expired(core.clock.now()).await {
            Ok(0) => {}
            Ok(purged) => debug!(purged, "expired tasks purged"),
            Err(err) => error!(error = %err, "janitor failed"),
        }
    }
    debug!("janitor loop stopped");
}
