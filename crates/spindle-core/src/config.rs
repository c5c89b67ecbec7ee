//! Configuration.
//!
//! Precedence: `SPINDLE_*` env > TOML file > defaults. Validation runs last.

use std::collections::{BTreeMap, HashMap};
use std::hash::BuildHasher;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::backoff::BackoffPolicy;
use crate::domain::{Lane, LaneWeights};
use crate::error::{Result, SpindleError};
use crate::impls::StoreBrokerOptions;
use crate::lock::LockOptions;
use crate::pool::Admission;
use crate::queue::{ClientOptions, ServerOptions};
use crate::scheduler::SchedulerOptions;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub namespace: String,
    pub store: StoreConfig,
    pub queue: QueueConfig,
    pub lock: LockConfig,
    pub scheduler: SchedulerConfig,
    pub cache: CacheConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StoreConfig {
    /// One address is a single node; more than one is a cluster seed list.
    pub addresses: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct QueueConfig {
    pub concurrency: usize,
    pub admission: Admission,
    pub poll_interval_ms: u64,
    pub strict_priority: bool,
    pub lanes: BTreeMap<Lane, u32>,
    /// Weight for lanes missing from `lanes`.
    pub baseline_weight: u32,
    pub default_max_retry: u32,
    pub default_retention_secs: u64,
    pub retry_base_ms: u64,
    pub retry_max_ms: u64,
    pub janitor_interval_secs: u64,
    pub shutdown_timeout_secs: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LockConfig {
    pub workspace: String,
    pub lease_secs: u64,
    pub retry_interval_ms: u64,
    pub default_timeout_secs: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SchedulerConfig {
    pub tick_secs: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CacheConfig {
    pub local_capacity: usize,
    pub local_ttl_secs: u64,
    pub shared_ttl_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            namespace: "spindle".to_string(),
            store: StoreConfig::default(),
            queue: QueueConfig::default(),
            lock: LockConfig::default(),
            scheduler: SchedulerConfig::default(),
            cache: CacheConfig::default(),
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            addresses: vec!["redis://127.0.0.1:6379".to_string()],
        }
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        let reference = LaneWeights::reference();
        Self {
            concurrency: 10,
            admission: Admission::Block,
            poll_interval_ms: 100,
            strict_priority: false,
            lanes: reference.explicit().clone(),
            baseline_weight: reference.baseline(),
            default_max_retry: 3,
            default_retention_secs: 24 * 60 * 60,
            retry_base_ms: 2_000,
            retry_max_ms: 600_000,
            janitor_interval_secs: 8,
            shutdown_timeout_secs: 8,
        }
    }
}

impl Default for LockConfig {
    fn default() -> Self {
        let options = LockOptions::default();
        Self {
            workspace: options.workspace,
            lease_secs: options.lease.as_secs(),
            retry_interval_ms: options.retry_interval.as_millis() as u64,
            default_timeout_secs: options.default_timeout.as_secs(),
        }
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self { tick_secs: 1 }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            local_capacity: 10_000,
            local_ttl_secs: 60,
            shared_ttl_secs: 600,
        }
    }
}

impl Config {
    /// Defaults overlaid with `toml` (if any) and `env`, then validated.
    pub fn load_from_str<S: BuildHasher>(toml: Option<&str>, env: &HashMap<String, String, S>) -> Result<Self> {
        let mut config = match toml {
            Some(toml) => toml::from_str(toml).map_err(|e| SpindleError::config("config_file", e.to_string()))?,
            None => Config::default(),
        };
        config.apply_env(env)?;
        config.validate()?;
        Ok(config)
    }

    /// Like `load_from_str`, reading the file when it exists.
    pub fn load<S: BuildHasher>(path: Option<&Path>, env: &HashMap<String, String, S>) -> Result<Self> {
        let contents = match path {
            Some(path) if path.exists() => Some(
                std::fs::read_to_string(path)
                    .map_err(|e| SpindleError::config("config_file", format!("{}: {e}", path.display())))?,
            ),
            Some(path) => {
                warn!(path = %path.display(), "config file not found, using defaults");
                None
            }
            None => None,
        };
        Self::load_from_str(contents.as_deref(), env)
    }

    /// Load with the process environment.
    pub fn from_env(path: Option<&Path>) -> Result<Self> {
        let env: HashMap<String, String> = std::env::vars().collect();
        Self::load(path, &env)
    }

    fn apply_env<S: BuildHasher>(&mut self, env: &HashMap<String, String, S>) -> Result<()> {
        if let Some(value) = env.get("SPINDLE_NAMESPACE") {
            self.namespace = value.trim().to_string();
        }
        if let Some(value) = env.get("SPINDLE_STORE_ADDRESSES") {
            self.store.addresses = parse_csv(value);
        }
        if let Some(value) = env.get("SPINDLE_QUEUE_CONCURRENCY") {
            self.queue.concurrency = parse_num(value, "queue.concurrency")?;
        }
        if let Some(value) = env.get("SPINDLE_QUEUE_ADMISSION") {
            self.queue.admission = match value.trim().to_ascii_lowercase().as_str() {
                "block" => Admission::Block,
                "reject" => Admission::Reject,
                _ => return Err(SpindleError::config("queue.admission", "expected block|reject")),
            };
        }
        if let Some(value) = env.get("SPINDLE_QUEUE_POLL_INTERVAL_MS") {
            self.queue.poll_interval_ms = parse_num(value, "queue.poll_interval_ms")?;
        }
        if let Some(value) = env.get("SPINDLE_QUEUE_STRICT_PRIORITY") {
            self.queue.strict_priority = parse_bool(value, "queue.strict_priority")?;
        }
        if let Some(value) = env.get("SPINDLE_QUEUE_LANES") {
            self.queue.lanes = LaneWeights::parse_list(value, self.queue.baseline_weight)?
                .explicit()
                .clone();
        }
        if let Some(value) = env.get("SPINDLE_QUEUE_DEFAULT_MAX_RETRY") {
            self.queue.default_max_retry = parse_num(value, "queue.default_max_retry")?;
        }
        if let Some(value) = env.get("SPINDLE_QUEUE_DEFAULT_RETENTION_SECS") {
            self.queue.default_retention_secs = parse_num(value, "queue.default_retention_secs")?;
        }
        if let Some(value) = env.get("SPINDLE_LOCK_WORKSPACE") {
            self.lock.workspace = value.trim().to_string();
        }
        if let Some(value) = env.get("SPINDLE_LOCK_LEASE_SECS") {
            self.lock.lease_secs = parse_num(value, "lock.lease_secs")?;
        }
        if let Some(value) = env.get("SPINDLE_LOCK_DEFAULT_TIMEOUT_SECS") {
            self.lock.default_timeout_secs = parse_num(value, "lock.default_timeout_secs")?;
        }
        if let Some(value) = env.get("SPINDLE_SCHEDULER_TICK_SECS") {
            self.scheduler.tick_secs = parse_num(value, "scheduler.tick_secs")?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.namespace.trim().is_empty() {
            return Err(SpindleError::config("namespace", "must not be empty"));
        }
        if self.store.addresses.is_empty() {
            return Err(SpindleError::config("store.addresses", "at least one address is required"));
        }
        if self.queue.concurrency == 0 {
            return Err(SpindleError::config("queue.concurrency", "must be positive"));
        }
        if self.queue.poll_interval_ms == 0 {
            return Err(SpindleError::config("queue.poll_interval_ms", "must be positive"));
        }
        if let Some((lane, _)) = self.queue.lanes.iter().find(|&(_, &w)| w == 0) {
            return Err(SpindleError::config(
                "queue.lanes",
                format!("weight for {lane} must be positive"),
            ));
        }
        if self.lane_weights().served().is_empty() {
            return Err(SpindleError::config("queue.lanes", "no lane has a positive weight"));
        }
        if let Some((higher, lower)) = self.lane_weights().inversion() {
            return Err(SpindleError::config(
                "queue.lanes",
                format!("{lower} outweighs the higher-priority lane {higher}"),
            ));
        }
        if self.queue.retry_base_ms == 0 || self.queue.retry_max_ms < self.queue.retry_base_ms {
            return Err(SpindleError::config(
                "queue.retry_base_ms",
                "expected 0 < retry_base_ms <= retry_max_ms",
            ));
        }
        if self.queue.janitor_interval_secs == 0 {
            return Err(SpindleError::config("queue.janitor_interval_secs", "must be positive"));
        }
        if self.lock.workspace.trim().is_empty() {
            return Err(SpindleError::config("lock.workspace", "must not be empty"));
        }
        if self.lock.lease_secs == 0 {
            return Err(SpindleError::config("lock.lease_secs", "must be positive"));
        }
        if self.lock.retry_interval_ms == 0 {
            return Err(SpindleError::config("lock.retry_interval_ms", "must be positive"));
        }
        if self.scheduler.tick_secs == 0 {
            return Err(SpindleError::config("scheduler.tick_secs", "must be positive"));
        }
        if self.cache.local_capacity == 0 {
            return Err(SpindleError::config("cache.local_capacity", "must be positive"));
        }
        Ok(())
    }

    pub fn lane_weights(&self) -> LaneWeights {
        LaneWeights::new(self.queue.lanes.clone(), self.queue.baseline_weight)
    }

    pub fn client_options(&self) -> ClientOptions {
        ClientOptions {
            default_lane: Lane::Default,
            default_max_retry: self.queue.default_max_retry,
            default_retention: Duration::from_secs(self.queue.default_retention_secs),
        }
    }

    pub fn server_options(&self) -> ServerOptions {
        ServerOptions {
            concurrency: self.queue.concurrency,
            admission: self.queue.admission,
            lanes: self.lane_weights(),
            strict_priority: self.queue.strict_priority,
            poll_interval: Duration::from_millis(self.queue.poll_interval_ms),
            janitor_interval: Duration::from_secs(self.queue.janitor_interval_secs),
            shutdown_timeout: Duration::from_secs(self.queue.shutdown_timeout_secs),
            retry: BackoffPolicy::exponential(
                Duration::from_millis(self.queue.retry_base_ms),
                Duration::from_millis(self.queue.retry_max_ms),
            ),
        }
    }

    pub fn lock_options(&self) -> LockOptions {
        LockOptions {
            workspace: self.lock.workspace.clone(),
            lease: Duration::from_secs(self.lock.lease_secs),
            retry_interval: Duration::from_millis(self.lock.retry_interval_ms),
            default_timeout: Duration::from_secs(self.lock.default_timeout_secs),
        }
    }

    pub fn scheduler_options(&self) -> SchedulerOptions {
        SchedulerOptions {
            tick: Duration::from_secs(self.scheduler.tick_secs),
        }
    }

    /// Queue placement when the worker runs over a shared store.
    pub fn store_broker_options(&self) -> StoreBrokerOptions {
        StoreBrokerOptions {
            namespace: self.namespace.clone(),
            ..StoreBrokerOptions::default()
        }
    }

    /// Key prefix for the shared cache tier.
    pub fn cache_prefix(&self) -> String {
        format!("{}:cache:", self.namespace)
    }
}

fn parse_csv(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .map(str::to_string)
        .collect()
}

fn parse_bool(value: &str, field: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(SpindleError::config(field, format!("expected boolean, got {value:?}"))),
    }
}

fn parse_num<T: std::str::FromStr>(value: &str, field: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| SpindleError::config(field, format!("expected unsigned integer, got {value:?}")))
}
