//! AppBuilder - アプリケーションの構築とワイヤリング
//!
//! # Fail-fast 設計
//! - `expect_tasks()` で期待される task_type を宣言
//! - `build()` 時に「期待集合 ⊆ 登録済み集合」をチェック
//! - 不足があれば `SpindleError::MissingTaskTypes` を返す
//! - config の検証もここで行う（起動後に壊れた設定で動かない）

use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use super::Worker;
use crate::cache::{CacheTier, LocalCache, SharedCache, TieredCache};
use crate::config::Config;
use crate::domain::TaskType;
use crate::error::{Result, SpindleError};
use crate::impls::{MemoryBroker, MemoryKvStore, StoreBroker};
use crate::lock::LockCoordinator;
use crate::ports::{Broker, Clock, IdGenerator, KvStore, SystemClock, UlidGenerator};
use crate::queue::{Client, Dispatcher, HandlerRegistry, Inspector, Server, TaskHandler};
use crate::scheduler::Scheduler;
use crate::typed::{Handler, TypedTask};

/// ```ignore
/// let worker = AppBuilder::new(config)
///     .register::<SendEmail, _>(SendEmailHandler)
///     .expect_tasks(&["send_email"])
///     .build()?;
/// worker.run().await?;
/// ```
///
/// Without `with_broker` / `with_store` the worker runs on in-memory backends.
/// A store given to `with_store` (or `with_redis`) also carries the queue, so every
/// worker built over the same store shares lanes and tasks. `with_broker` overrides that.
pub struct AppBuilder {
    config: Config,
    clock: Arc<dyn Clock>,
    broker: Option<Arc<dyn Broker>>,
    store: Option<Arc<dyn KvStore>>,
    handlers: HandlerRegistry,
    expected_tasks: Option<Vec<String>>,
}

impl AppBuilder {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            clock: Arc::new(SystemClock),
            broker: None,
            store: None,
            handlers: HandlerRegistry::new(),
            expected_tasks: None,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_broker(mut self, broker: Arc<dyn Broker>) -> Self {
        self.broker = Some(broker);
        self
    }

    /// Shared store for the queue, locks and the shared cache tier.
    pub fn with_store(mut self, store: Arc<dyn KvStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Connect the shared store to the first configured address.
    #[cfg(feature = "redis")]
    pub async fn with_redis(self) -> Result<Self> {
        let addresses = &self.config.store.addresses;
        let Some(address) = addresses.first() else {
            return Err(SpindleError::config("store.addresses", "at least one address is required"));
        };
        if addresses.len() > 1 {
            tracing::warn!(
                count = addresses.len(),
                using = %address,
                "cluster addresses configured; connecting to the first node only"
            );
        }
        let store = crate::impls::RedisKvStore::connect(address).await?;
        Ok(self.with_store(Arc::new(store)))
    }

    /// Register a typed handler under `T::TYPE` (last registration wins).
    pub fn register<T: TypedTask, H: Handler<T> + 'static>(self, handler: H) -> Self {
        self.handlers.register_typed::<T, H>(handler);
        self
    }

    pub fn register_handler(self, task_type: impl Into<TaskType>, handler: Arc<dyn TaskHandler>) -> Self {
        self.handlers.register(task_type, handler);
        self
    }

    pub fn expect_tasks(mut self, task_types: &[&str]) -> Self {
        self.expected_tasks = Some(task_types.iter().map(|t| t.to_string()).collect());
        self
    }

    /// Validate and wire every component.
    pub fn build(self) -> Result<Worker> {
        self.config.validate()?;

        if let Some(expected) = &self.expected_tasks {
            let missing: Vec<String> = expected
                .iter()
                .filter(|t| !self.handlers.contains(&TaskType::new(t.as_str())))
                .cloned()
                .collect();
            if !missing.is_empty() {
                return Err(SpindleError::MissingTaskTypes(missing));
            }
        }

        let clock = self.clock;
        let config = self.config;
        let ids: Arc<dyn IdGenerator> = Arc::new(UlidGenerator::new(Arc::clone(&clock)));
        let shared_store = self.store.is_some();
        let store: Arc<dyn KvStore> = match self.store {
            Some(store) => store,
            None => Arc::new(MemoryKvStore::with_clock(Arc::clone(&clock))),
        };
        let broker: Arc<dyn Broker> = match self.broker {
            Some(broker) => broker,
            None if shared_store => Arc::new(StoreBroker::new(
                Arc::clone(&store),
                Arc::clone(&ids),
                Arc::clone(&clock),
                config.store_broker_options(),
            )),
            None => Arc::new(MemoryBroker::with_clock(Arc::clone(&clock))),
        };

        let client = Client::new(
            Arc::clone(&broker),
            Arc::clone(&ids),
            Arc::clone(&clock),
            config.client_options(),
        );
        let dispatcher = Dispatcher::new(Arc::new(self.handlers), Arc::new(HandlerRegistry::new()));
        let server = Server::new(
            Arc::clone(&broker),
            dispatcher,
            Arc::clone(&clock),
            config.server_options(),
        );
        let scheduler = Scheduler::new(
            client.clone(),
            Arc::clone(&ids),
            Arc::clone(&clock),
            config.scheduler_options(),
        );
        let inspector = Inspector::new(broker, config.lane_weights());
        let locks = LockCoordinator::new(Arc::clone(&store), ids, config.lock_options());
        let tiers: Vec<Arc<dyn CacheTier>> = vec![
            Arc::new(LocalCache::with_clock(
                config.cache.local_capacity,
                Some(Duration::from_secs(config.cache.local_ttl_secs)),
                Arc::clone(&clock),
            )),
            Arc::new(SharedCache::new(
                store,
                config.cache_prefix(),
                Some(Duration::from_secs(config.cache.shared_ttl_secs)),
            )),
        ];
        let cache = TieredCache::new(tiers);

        info!(
            namespace = %config.namespace,
            shared_queue = shared_store,
            handlers = server.dispatcher().handlers().len(),
            "worker built"
        );
        Ok(Worker::new(config, client, server, scheduler, inspector, locks, cache))
    }
}

impl Default for AppBuilder {
    fn default() -> Self {
        Self::new(Config::default())
    }
}
