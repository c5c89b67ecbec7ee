//! Impls - ports の実装
//!
//! # 含まれる実装
//! - **MemoryKvStore**: 単一プロセス用の KvStore（テスト・デモ用）
//! - **MemoryBroker**: in-memory の task queue backend（プロセス内で完結）
//! - **StoreBroker**: 共有 KvStore 上の task queue backend（複数プロセスで共有）
//! - **RedisKvStore**: Redis を使う共有 store（`redis` feature）

mod broker_state;
pub mod memory_broker;
pub mod memory_kv;
#[cfg(feature = "redis")]
pub mod redis_kv;
pub mod store_broker;

pub use self::memory_broker::MemoryBroker;
pub use self::memory_kv::MemoryKvStore;
#[cfg(feature = "redis")]
pub use self::redis_kv::RedisKvStore;
pub use self::store_broker::{StoreBroker, StoreBrokerOptions};
