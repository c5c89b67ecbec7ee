//! Task queue: producer (`Client`), consumer (`Server`) and monitoring (`Inspector`).
//!
//! タスクの状態は `ports::Broker` が持つ。このモジュールは
//! - lane の選択（`LaneSelector`）
//! - handler の解決（`Dispatcher`）
//! - 実行結果の判定（`Decider`）
//! を組み合わせて Broker を駆動する。

mod client;
mod decision;
mod handler;
mod inspector;
mod lanes;
mod registry;
mod server;

pub use client::{Client, ClientOptions};
pub use decision::{Decider, Decision, DefaultDecider};
pub use handler::{HandlerFn, TaskHandler, handler_fn};
pub use inspector::Inspector;
pub use lanes::LaneSelector;
pub use registry::{Dispatcher, HandlerRegistry};
pub use server::{Server, ServerOptions};
