//! Ports - 抽象化レイヤー
//!
//! 外部システム（Redis などの coordination store）への境界を trait で定義し、
//! 実装の詳細を隠蔽します。
//!
//! # 設計原則
//! - Broker が task 状態の正本（source of truth）
//! - KvStore は lock と shared cache が使う atomic な key-value 操作
//! - Clock / IdGenerator はテストで差し替えられるように抽象化

pub mod broker;
pub mod clock;
pub mod id_generator;
pub mod kv_store;

pub use self::broker::{Broker, LaneCounts};
pub use self::clock::{Clock, ManualClock, SystemClock};
pub use self::id_generator::{IdGenerator, UlidGenerator};
pub use self::kv_store::KvStore;
