//! Domain identifiers (strongly-typed IDs).
//!
//! ## Phantom Type パターン
//! `Id<T>` で共通実装を提供しつつ、`T` はコンパイル時のみ使うマーカー型。
//! `TaskId` と `ScheduleId` と `LockToken` は混同できない。
//!
//! 生成される ID は `{prefix}{ULID}`（時刻でソート可能、分散生成可能）。
//! Task ID は呼び出し側が任意の文字列を指定することもできる（例: `start_42`）。

use serde::{Deserialize, Serialize};
use std::fmt;
use std::marker::PhantomData;
use ulid::Ulid;

/// IdMarker は各 ID 型のマーカー trait
pub trait IdMarker: Send + Sync + 'static {
    /// Prefix used for generated ids (e.g. "task-").
    fn prefix() -> &'static str;
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Id<T: IdMarker> {
    value: String,
    #[serde(skip)]
    _marker: PhantomData<T>,
}

impl<T: IdMarker> Id<T> {
    /// Build a prefixed id from a ULID.
    pub fn from_ulid(ulid: Ulid) -> Self {
        Self::parse(format!("{}{}", T::prefix(), ulid))
    }

    /// Wrap an externally supplied id verbatim.
    pub fn parse(value: impl Into<String>) -> Self {
        Self {
            value: value.into(),
            _marker: PhantomData,
        }
    }

    pub fn as_str(&self) -> &str {
        &self.value
    }

    /// Was this id produced by a generator (as opposed to caller supplied)?
    pub fn is_generated(&self) -> bool {
        self.value
            .strip_prefix(T::prefix())
            .is_some_and(|rest| Ulid::from_string(rest).is_ok())
    }
}

impl<T: IdMarker> From<Ulid> for Id<T> {
    fn from(ulid: Ulid) -> Self {
        Self::from_ulid(ulid)
    }
}

impl<T: IdMarker> fmt::Display for Id<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.value)
    }
}

// ========================================
// マーカー型の定義
// ========================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Task {}

impl IdMarker for Task {
    fn prefix() -> &'static str {
        "task-"
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Schedule {}

impl IdMarker for Schedule {
    fn prefix() -> &'static str {
        "schedule-"
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Lock {}

impl IdMarker for Lock {
    fn prefix() -> &'static str {
        "lock-"
    }
}

/// Identifier of an enqueued task instance.
pub type TaskId = Id<Task>;

/// Identifier of a cron scheduler entry.
pub type ScheduleId = Id<Schedule>;

/// Owner token of a lock lease (used for fencing on release).
pub type LockToken = Id<Lock>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_ids_carry_their_prefix() {
        let task = TaskId::from_ulid(Ulid::new());
        let schedule = ScheduleId::from_ulid(Ulid::new());
        let token = LockToken::from_ulid(Ulid::new());

        assert!(task.to_string().starts_with("task-"));
        assert!(schedule.to_string().starts_with("schedule-"));
        assert!(token.to_string().starts_with("lock-"));
        assert!(task.is_generated());

        // let _: TaskId = token; // <- does not compile
    }

    #[test]
    fn caller_supplied_ids_are_kept_verbatim() {
        let id = TaskId::parse("start_42");
        assert_eq!(id.as_str(), "start_42");
        assert!(!id.is_generated());
    }

    #[test]
    fn ulid_ids_are_sortable() {
        let id1 = TaskId::from_ulid(Ulid::new());
        std::thread::sleep(std::time::Duration::from_millis(2));
        let id2 = TaskId::from_ulid(Ulid::new());
        assert!(id1 < id2);
    }

    #[test]
    fn ids_serialize_as_plain_strings() {
        let id = TaskId::parse("task-abc");
        let s = serde_json::to_string(&id).unwrap();
        assert_eq!(s, "\"task-abc\"");
        let back: TaskId = serde_json::from_str(&s).unwrap();
        assert_eq!(back, id);
    }
}
