//! IdGenerator port - ID 生成の抽象化
//!
//! # 実装
//! - **UlidGenerator**: ULID ベース（本番用）

use ulid::Ulid;

use crate::domain::{LockToken, ScheduleId, TaskId};
use crate::ports::Clock;

/// IdGenerator は分散システムで使える ID を生成
///
/// # Thread Safety
/// - `Send + Sync` を要求（複数の dequeue loop / lock 呼び出しから使う）
pub trait IdGenerator: Send + Sync {
    fn task_id(&self) -> TaskId;

    fn schedule_id(&self) -> ScheduleId;

    /// Owner token for a lock lease, and the key used when a caller passes an empty key.
    fn lock_token(&self) -> LockToken;
}

/// UlidGenerator は ULID ベースの ID 生成器
///
/// タイムスタンプ部分は Clock から取るので、ManualClock を使えば
/// テストでも時刻部分は決定的になる。
pub struct UlidGenerator<C> {
    clock: C,
}

impl<C: Clock> UlidGenerator<C> {
    pub fn new(clock: C) -> Self {
        Self { clock }
    }

    fn next(&self) -> Ulid {
        let timestamp_ms = self.clock.now().timestamp_millis().max(0) as u64;
        Ulid::from_parts(timestamp_ms, rand::random())
    }
}

impl<C: Clock> IdGenerator for UlidGenerator<C> {
    fn task_id(&self) -> TaskId {
        TaskId::from(self.next())
    }

    fn schedule_id(&self) -> ScheduleId {
        ScheduleId::from(self.next())
    }

    fn lock_token(&self) -> LockToken {
        LockToken::from(self.next())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ports::{ManualClock, SystemClock};
    use chrono::{TimeZone, Utc};

    #[test]
    fn ulid_generator_generates_unique_ids() {
        let id_gen = UlidGenerator::new(SystemClock);

        let id1 = id_gen.task_id();
        let id2 = id_gen.task_id();
        let id3 = id_gen.task_id();

        assert_ne!(id1, id2);
        assert_ne!(id2, id3);
        assert_ne!(id1, id3);
    }

    #[test]
    fn manual_clock_pins_the_timestamp_part() {
        let fixed_time = Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap();
        let id_gen = UlidGenerator::new(ManualClock::new(fixed_time));

        let id1 = id_gen.lock_token();
        let id2 = id_gen.lock_token();

        // ランダム部分があるので ID は異なる
        assert_ne!(id1, id2);

        // timestamp 部分は同じ
        let ts = |id: &LockToken| {
            let raw = id.as_str().trim_start_matches("lock-");
            Ulid::from_string(raw).unwrap().timestamp_ms()
        };
        assert_eq!(ts(&id1), ts(&id2));
        assert_eq!(ts(&id1), fixed_time.timestamp_millis() as u64);
    }

    #[test]
    fn different_id_types_are_generated() {
        let id_gen = UlidGenerator::new(SystemClock);

        assert!(id_gen.task_id().to_string().starts_with("task-"));
        assert!(id_gen.schedule_id().to_string().starts_with("schedule-"));
        assert!(id_gen.lock_token().to_string().starts_with("lock-"));
    }
}
