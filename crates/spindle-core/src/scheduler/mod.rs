//! Scheduler - cron 式に従ってタスクを定期的に enqueue する
//!
//! # フロー
//! 1. `register()` で entry を登録（次回の発火時刻を計算）
//! 2. tick ごとに発火時刻を過ぎた entry を集める
//! 3. entry ごとに新しい TaskId でタスクを enqueue（observer が前後を観測）
//!
//! scheduler は enqueue までしか見ない。タスクの実行結果は queue の責務。

mod cron;

pub use cron::CronSpec;

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::domain::{EnqueueOptions, ScheduleId, Task, TaskInfo};
use crate::error::{Result, SpindleError};
use crate::ports::{Clock, IdGenerator};
use crate::queue::Client;

/// Observes scheduler enqueues. Both hooks run on the scheduler task, so keep them cheap.
pub trait EnqueueObserver: Send + Sync {
    fn before_enqueue(&self, _schedule: &ScheduleId, _task: &Task, _opts: &EnqueueOptions) {}

    fn after_enqueue(&self, _schedule: &ScheduleId, _result: &Result<TaskInfo>) {}
}

/// Logs every scheduler enqueue at debug level.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingObserver;

impl EnqueueObserver for TracingObserver {
    fn before_enqueue(&self, schedule: &ScheduleId, task: &Task, _opts: &EnqueueOptions) {
        debug!(schedule_id = %schedule, task_type = %task.task_type(), "scheduler enqueueing");
    }

    fn after_enqueue(&self, schedule: &ScheduleId, result: &Result<TaskInfo>) {
        match result {
            Ok(info) => debug!(
                schedule_id = %schedule,
                task_id = %info.id,
                task_type = %info.task_type,
                state = %info.state,
                "scheduler enqueued"
            ),
            Err(err) => error!(schedule_id = %schedule, error = %err, "scheduler enqueue failed"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchedulerOptions {
    /// How often entries are evaluated.
    pub tick: Duration,
}

impl Default for SchedulerOptions {
    fn default() -> Self {
        Self {
            tick: Duration::from_secs(1),
        }
    }
}

/// A registered periodic task.
#[derive(Debug, Clone)]
pub struct ScheduleEntry {
    pub id: ScheduleId,
    pub spec: CronSpec,
    pub task: Task,
    pub options: EnqueueOptions,
    pub next: DateTime<Utc>,
    pub prev: Option<DateTime<Utc>>,
}

struct Running {
    shutdown_tx: watch::Sender<bool>,
    join: JoinHandle<()>,
}

pub struct Scheduler {
    client: Client,
    ids: Arc<dyn IdGenerator>,
    clock: Arc<dyn Clock>,
    options: SchedulerOptions,
    entries: Mutex<BTreeMap<ScheduleId, ScheduleEntry>>,
    observers: RwLock<Vec<Arc<dyn EnqueueObserver>>>,
    running: tokio::sync::Mutex<Option<Running>>,
}

impl Scheduler {
    pub fn new(
        client: Client,
        ids: Arc<dyn IdGenerator>,
        clock: Arc<dyn Clock>,
        options: SchedulerOptions,
    ) -> Self {
        Self {
            client,
            ids,
            clock,
            options,
            entries: Mutex::new(BTreeMap::new()),
            observers: RwLock::new(vec![Arc::new(TracingObserver)]),
            running: tokio::sync::Mutex::new(None),
        }
    }

    fn entries_lock(&self) -> MutexGuard<'_, BTreeMap<ScheduleId, ScheduleEntry>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn options(&self) -> &SchedulerOptions {
        &self.options
    }

    pub fn add_observer(&self, observer: Arc<dyn EnqueueObserver>) {
        self.observers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(observer);
    }

    /// Register `task` to be enqueued on every activation of `spec`.
    pub fn register(&self, spec: &str, task: Task, opts: EnqueueOptions) -> Result<ScheduleId> {
        self.register_with_id(self.ids.schedule_id(), spec, task, opts)
    }

    /// Register under a caller-chosen id; an existing entry with that id is replaced.
    pub fn register_with_id(
        &self,
        id: ScheduleId,
        spec: &str,
        task: Task,
        opts: EnqueueOptions,
    ) -> Result<ScheduleId> {
        let spec = CronSpec::parse(spec)?;
        let next = spec
            .next_after(self.clock.now())
            .ok_or_else(|| SpindleError::InvalidCronSpec {
                spec: spec.to_string(),
                reason: "expression never fires".into(),
            })?;

        info!(schedule_id = %id, spec = %spec, task_type = %task.task_type(), %next, "schedule registered");
        let entry = ScheduleEntry {
            id: id.clone(),
            spec,
            task,
            // every activation gets a fresh task id
            options: EnqueueOptions {
                task_id: None,
                ..opts
            },
            next,
            prev: None,
        };
        self.entries_lock().insert(id.clone(), entry);
        Ok(id)
    }

    pub fn unregister(&self, id: &ScheduleId) -> Result<()> {
        match self.entries_lock().remove(id) {
            Some(_) => {
                info!(schedule_id = %id, "schedule unregistered");
                Ok(())
            }
            None => Err(SpindleError::NotFound(format!("schedule {id}"))),
        }
    }

    /// Snapshot of the registered entries, ordered by id.
    pub fn entries(&self) -> Vec<ScheduleEntry> {
        self.entries_lock().values().cloned().collect()
    }

    /// Enqueue every entry due at `now`. Returns the number of successful enqueues.
    pub async fn tick(&self, now: DateTime<Utc>) -> usize {
        let due: Vec<(ScheduleId, Task, EnqueueOptions)> = {
            let mut entries = self.entries_lock();
            let mut due = Vec::new();
            let mut finished = Vec::new();
            for entry in entries.values_mut().filter(|e| e.next <= now) {
                due.push((entry.id.clone(), entry.task.clone(), entry.options.clone()));
                entry.prev = Some(now);
                match entry.spec.next_after(now) {
                    Some(next) => entry.next = next,
                    None => finished.push(entry.id.clone()),
                }
            }
            for id in finished {
                warn!(schedule_id = %id, "schedule has no further activations, removing");
                entries.remove(&id);
            }
            due
        };

        let observers: Vec<Arc<dyn EnqueueObserver>> = self
            .observers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone();

        let mut enqueued = 0;
        for (id, task, opts) in due {
            for observer in &observers {
                observer.before_enqueue(&id, &task, &opts);
            }
            let result = self.client.enqueue(&task, opts).await;
            for observer in &observers {
                observer.after_enqueue(&id, &result);
            }
            if result.is_ok() {
                enqueued += 1;
            }
        }
        enqueued
    }

    /// Start the tick loop. Calling `run` on a running scheduler is a no-op.
    pub async fn run(self: &Arc<Self>) {
        let mut running = self.running.lock().await;
        if running.is_some() {
            return;
        }
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let scheduler = Arc::clone(self);
        let join = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(scheduler.options.tick);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => break,
                    _ = ticker.tick() => {}
                }
                if *shutdown_rx.borrow() {
                    break;
                }
                scheduler.tick(scheduler.clock.now()).await;
            }
            debug!("scheduler loop stopped");
        });
        info!(entries = self.entries_lock().len(), "scheduler started");
        *running = Some(Running { shutdown_tx, join });
    }

    pub async fn shutdown(&self) {
        let Some(running) = self.running.lock().await.take() else {
            return;
        };
        let _ = running.shutdown_tx.send(true);
        let _ = running.join.await;
        info!("scheduler stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Lane, TaskState};
    use crate::impls::MemoryBroker;
    use crate::ports::{Broker, ManualClock, UlidGenerator};
    use crate::queue::ClientOptions;
    use chrono::TimeZone;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Fixture {
        clock: Arc<ManualClock>,
        broker: Arc<MemoryBroker>,
        scheduler: Scheduler,
    }

    fn fixture() -> Fixture {
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 30).unwrap(),
        ));
        let broker = Arc::new(MemoryBroker::with_clock(clock.clone()));
        let ids: Arc<dyn IdGenerator> = Arc::new(UlidGenerator::new(clock.clone()));
        let client = Client::new(broker.clone(), Arc::clone(&ids), clock.clone(), ClientOptions::default());
        let scheduler = Scheduler::new(client, ids, clock.clone(), SchedulerOptions::default());
        Fixture {
            clock,
            broker,
            scheduler,
        }
    }

    #[derive(Default)]
    struct Counting {
        before: AtomicUsize,
        after_ok: AtomicUsize,
    }

    impl EnqueueObserver for Counting {
        fn before_enqueue(&self, _: &ScheduleId, _: &Task, _: &EnqueueOptions) {
            self.before.fetch_add(1, Ordering::SeqCst);
        }

        fn after_enqueue(&self, _: &ScheduleId, result: &Result<TaskInfo>) {
            if result.is_ok() {
                self.after_ok.fetch_add(1, Ordering::SeqCst);
            }
        }
    }

    #[tokio::test]
    async fn due_entries_enqueue_fresh_tasks() {
        let f = fixture();
        let observer = Arc::new(Counting::default());
        f.scheduler.add_observer(observer.clone());
        f.scheduler
            .register(
                "* * * * *",
                Task::new("report", vec![]),
                EnqueueOptions::new().lane(Lane::Low).task_id(crate::domain::TaskId::parse("fixed")),
            )
            .unwrap();

        assert_eq!(f.scheduler.tick(f.clock.now()).await, 0);

        f.clock.advance(Duration::from_secs(30));
        assert_eq!(f.scheduler.tick(f.clock.now()).await, 1);
        f.clock.advance(Duration::from_secs(60));
        assert_eq!(f.scheduler.tick(f.clock.now()).await, 1);

        let pending = f.broker.list(Lane::Low, TaskState::Pending).await.unwrap();
        assert_eq!(pending.len(), 2);
        assert_ne!(pending[0].id, pending[1].id);
        assert_eq!(observer.before.load(Ordering::SeqCst), 2);
        assert_eq!(observer.after_ok.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn re_registering_an_id_replaces_the_entry() {
        let f = fixture();
        let id = ScheduleId::parse("nightly");
        f.scheduler
            .register_with_id(id.clone(), "@daily", Task::new("a", vec![]), EnqueueOptions::new())
            .unwrap();
        f.scheduler
            .register_with_id(id.clone(), "@hourly", Task::new("b", vec![]), EnqueueOptions::new())
            .unwrap();

        let entries = f.scheduler.entries();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].spec.as_str(), "@hourly");
        assert_eq!(entries[0].task.task_type().as_str(), "b");
        assert_eq!(entries[0].next, Utc.with_ymd_and_hms(2024, 1, 1, 1, 0, 0).unwrap());

        f.scheduler.unregister(&id).unwrap();
        assert!(f.scheduler.entries().is_empty());
        assert!(f.scheduler.unregister(&id).unwrap_err().is_not_found());
    }

    #[test]
    fn invalid_spec_is_rejected() {
        let f = fixture();
        let err = f
            .scheduler
            .register("61 * * * *", Task::new("a", vec![]), EnqueueOptions::new())
            .unwrap_err();
        assert!(matches!(err, SpindleError::InvalidCronSpec { .. }));

        let err = f
            .scheduler
            .register("0 0 30 2 *", Task::new("a", vec![]), EnqueueOptions::new())
            .unwrap_err();
        assert!(matches!(err, SpindleError::InvalidCronSpec { ref reason, .. } if reason.contains("never")));
    }

    #[tokio::test]
    async fn run_loop_fires_every_entries() {
        let clock: Arc<dyn Clock> = Arc::new(crate::ports::SystemClock);
        let broker = Arc::new(MemoryBroker::new());
        let ids: Arc<dyn IdGenerator> = Arc::new(UlidGenerator::new(Arc::clone(&clock)));
        let client = Client::new(broker.clone(), Arc::clone(&ids), Arc::clone(&clock), ClientOptions::default());
        let scheduler = Arc::new(Scheduler::new(
            client,
            ids,
            clock,
            SchedulerOptions {
                tick: Duration::from_millis(20),
            },
        ));
        scheduler
            .register("@every 50ms", Task::new("ping", vec![]), EnqueueOptions::new())
            .unwrap();

        scheduler.run().await;
        tokio::time::sleep(Duration::from_millis(400)).await;
        scheduler.shutdown().await;

        let counts = broker.counts(Lane::Default).await.unwrap();
        assert!(counts.pending >= 2, "only {} enqueued", counts.pending);
    }
}
