//! Typed - 型付き Task API
//!
//! task_type の typo を型で排除し、Handler との対応付けを静的に保証する。
//!
//! # 二層構造
//! - **表層（Typed）**: `TypedTask` trait, `Handler<T>` trait - 型安全
//! - **内部（Dyn）**: `queue::TaskHandler` - object-safe, type erasure

pub mod handler;
pub mod task;

pub use self::handler::{Handler, TypedHandler};
pub use self::task::TypedTask;
