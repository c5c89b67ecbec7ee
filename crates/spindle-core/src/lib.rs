//! spindle-core
//!
//! Distributed task scheduling and coordination building blocks.
//!
//! # モジュール構成
//! - **domain**: ドメインモデル（ids, lane, state, task, options）
//! - **ports**: 抽象化レイヤー（Broker, KvStore, Clock, IdGenerator）
//! - **impls**: 実装（MemoryBroker, MemoryKvStore, RedisKvStore）
//! - **queue**: Client / Server / Inspector（重み付き lane、retry / archive）
//! - **scheduler**: cron 式による定期 enqueue
//! - **pool**: 上限付き worker pool（panic 隔離）
//! - **lock**: 分散ロック（lease + fencing token）
//! - **backoff**: 指数バックオフ付き再試行
//! - **cache**: 多段キャッシュ
//! - **typed**: 型付き Task API（TypedTask, Handler<T>）
//! - **app**: AppBuilder / Worker
//! - **config**, **observability**, **error**

pub mod app;
pub mod backoff;
pub mod cache;
pub mod config;
pub mod domain;
pub mod error;
pub mod impls;
pub mod lock;
pub mod observability;
pub mod pool;
pub mod ports;
pub mod queue;
pub mod scheduler;
pub mod typed;

pub use app::{AppBuilder, Worker};
pub use config::Config;
pub use error::{Result, SpindleError};
