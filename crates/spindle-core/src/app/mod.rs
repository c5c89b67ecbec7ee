//! App - アプリケーション層
//!
//! ports と各コンポーネントを組み合わせて 1 プロセス分のランタイムを作る。
//!
//! # 主要コンポーネント
//! - **AppBuilder**: 設定の検証、handler の登録、ワイヤリング
//! - **Worker**: Client / Server / Scheduler / Inspector / LockCoordinator / TieredCache の束

pub mod builder;
pub mod worker;

pub use self::builder::AppBuilder;
pub use self::worker::Worker;
