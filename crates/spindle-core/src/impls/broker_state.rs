//! BrokerState - Broker の状態機械
//!
//! # 構造
//! - `records`: TaskMessage の正本（TaskId -> TaskMessage）
//! - `pending`: lane ごとの ready キュー（TaskId のみ, FIFO）
//! - `delayed`: scheduled / retry 待ちの min-heap（process_at が早い順）
//! - `unique`: uniqueness key -> (保持している TaskId, 期限)
//!
//! `pending` と `delayed` は ID しか持たないので、delete / run_task の後に古い
//! エントリが残ることがある。取り出し時に record の状態と照合して捨てる。
//!
//! map はすべて BTreeMap なので、同じ状態は常に同じ JSON になる。
//! 時刻は引数で受け取る。保管場所（プロセス内 Mutex / 共有 store）は呼び出し側が決める。

use std::cmp::Ordering;
use std::collections::{BTreeMap, BinaryHeap, VecDeque};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::{Lane, TaskId, TaskInfo, TaskMessage, TaskState, add_duration};
use crate::error::{Result, SpindleError};
use crate::ports::LaneCounts;

/// Delayed task entry.
///
/// Reverse ordering so BinaryHeap acts as a min-heap (earliest first, then FIFO by seq).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct Delayed {
    process_at: DateTime<Utc>,
    seq: u64,
    task_id: TaskId,
}

impl PartialOrd for Delayed {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Delayed {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .process_at
            .cmp(&self.process_at)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub(crate) struct BrokerState {
    records: BTreeMap<TaskId, TaskMessage>,
    pending: BTreeMap<Lane, VecDeque<TaskId>>,
    delayed: BinaryHeap<Delayed>,
    unique: BTreeMap<String, (TaskId, DateTime<Utc>)>,
    seq: u64,
}

impl BrokerState {
    fn push_pending(&mut self, lane: Lane, id: TaskId) {
        self.pending.entry(lane).or_default().push_back(id);
    }

    fn push_delayed(&mut self, process_at: DateTime<Utc>, task_id: TaskId) {
        self.seq += 1;
        self.delayed.push(Delayed {
            process_at,
            seq: self.seq,
            task_id,
        });
    }

    /// Move scheduled / retry tasks whose time has come into their lane.
    fn promote_due(&mut self, now: DateTime<Utc>) {
        while let Some(entry) = self.delayed.peek() {
            if entry.process_at > now {
                break; // heap is sorted, so we can stop
            }
            let Some(entry) = self.delayed.pop() else {
                break;
            };
            if let Some(record) = self.records.get_mut(&entry.task_id)
                && record.state.is_delayed()
                && record.process_at == entry.process_at
            {
                record.state = TaskState::Pending;
                let lane = record.lane;
                self.push_pending(lane, entry.task_id);
            }
        }
    }

    fn pop_pending(&mut self, lane: Lane) -> Option<TaskId> {
        let queue = self.pending.get_mut(&lane)?;
        while let Some(id) = queue.pop_front() {
            if self
                .records
                .get(&id)
                .is_some_and(|r| r.state == TaskState::Pending && r.lane == lane)
            {
                return Some(id);
            }
        }
        None
    }

    fn record_mut(&mut self, id: &TaskId) -> Result<&mut TaskMessage> {
        self.records
            .get_mut(id)
            .ok_or_else(|| SpindleError::NotFound(format!("task {id}")))
    }

    fn record_in_lane(&self, lane: Lane, id: &TaskId) -> Result<&TaskMessage> {
        self.records
            .get(id)
            .filter(|r| r.lane == lane)
            .ok_or_else(|| SpindleError::NotFound(format!("task {id} in lane {lane}")))
    }

    fn release_unique(&mut self, msg_id: &TaskId, key: Option<&str>) {
        if let Some(key) = key
            && self.unique.get(key).is_some_and(|(holder, _)| holder == msg_id)
        {
            self.unique.remove(key);
        }
    }

    pub(crate) fn enqueue(
        &mut self,
        msg: TaskMessage,
        unique_ttl: Option<Duration>,
        now: DateTime<Utc>,
    ) -> Result<TaskInfo> {
        if let Some(existing) = self.records.get(&msg.id)
            && !existing.state.is_terminal()
        {
            return Err(SpindleError::TaskIdConflict(msg.id));
        }

        if let (Some(ttl), Some(key)) = (unique_ttl, msg.unique_key.as_deref()) {
            if self.unique.get(key).is_some_and(|(_, until)| *until > now) {
                return Err(SpindleError::DuplicateTask);
            }
            self.unique
                .insert(key.to_string(), (msg.id.clone(), add_duration(now, ttl)));
        }

        let info = msg.info();
        let (id, lane, process_at, task_state) = (msg.id.clone(), msg.lane, msg.process_at, msg.state);
        self.records.insert(id.clone(), msg);
        match task_state {
            TaskState::Pending => self.push_pending(lane, id),
            _ => self.push_delayed(process_at, id),
        }
        Ok(info)
    }

    pub(crate) fn dequeue(&mut self, lanes: &[Lane], now: DateTime<Utc>) -> Result<Option<TaskMessage>> {
        self.promote_due(now);
        for &lane in lanes {
            if let Some(id) = self.pop_pending(lane) {
                let record = self.record_mut(&id)?;
                record.mark_active();
                return Ok(Some(record.clone()));
            }
        }
        Ok(None)
    }

    pub(crate) fn complete(&mut self, id: &TaskId, now: DateTime<Utc>) -> Result<()> {
        let record = self.record_mut(id)?;
        record.mark_completed(now);
        let (key, keep) = (record.unique_key.clone(), !record.retention.is_zero());
        self.release_unique(id, key.as_deref());
        if !keep {
            self.records.remove(id);
        }
        Ok(())
    }

    pub(crate) fn requeue(&mut self, id: &TaskId) -> Result<()> {
        let record = self.record_mut(id)?;
        if record.state != TaskState::Active {
            return Err(SpindleError::InvalidTaskState {
                id: id.clone(),
                state: record.state,
            });
        }
        record.state = TaskState::Pending;
        let lane = record.lane;
        self.pending.entry(lane).or_default().push_front(id.clone());
        Ok(())
    }

    pub(crate) fn retry(
        &mut self,
        id: &TaskId,
        process_at: DateTime<Utc>,
        error: String,
        now: DateTime<Utc>,
    ) -> Result<()> {
        self.record_mut(id)?.mark_retry(process_at, error, now);
        self.push_delayed(process_at, id.clone());
        Ok(())
    }

    pub(crate) fn archive(&mut self, id: &TaskId, error: String, now: DateTime<Utc>) -> Result<()> {
        let record = self.record_mut(id)?;
        record.mark_archived(error, now);
        let key = record.unique_key.clone();
        self.release_unique(id, key.as_deref());
        Ok(())
    }

    pub(crate) fn purge_expired(&mut self, now: DateTime<Utc>) -> usize {
        let before = self.records.len();
        self.records.retain(|_, r| !r.is_expired(now));
        self.unique.retain(|_, (_, until)| *until > now);
        before - self.records.len()
    }

    pub(crate) fn task_info(&self, lane: Lane, id: &TaskId) -> Result<TaskInfo> {
        Ok(self.record_in_lane(lane, id)?.info())
    }

    pub(crate) fn list(&self, lane: Lane, task_state: TaskState) -> Vec<TaskInfo> {
        let mut records: Vec<&TaskMessage> = self
            .records
            .values()
            .filter(|r| r.lane == lane && r.state == task_state)
            .collect();
        records.sort_by(|a, b| {
            a.process_at
                .cmp(&b.process_at)
                .then_with(|| a.created_at.cmp(&b.created_at))
        });
        records.into_iter().map(TaskMessage::info).collect()
    }

    pub(crate) fn counts(&self, lane: Lane) -> LaneCounts {
        let mut counts = LaneCounts::default();
        for record in self.records.values().filter(|r| r.lane == lane) {
            counts.add(record.state);
        }
        counts
    }

    pub(crate) fn delete_task(&mut self, lane: Lane, id: &TaskId) -> Result<()> {
        let record = self.record_in_lane(lane, id)?;
        if record.state == TaskState::Active {
            return Err(SpindleError::InvalidTaskState {
                id: id.clone(),
                state: record.state,
            });
        }
        let key = record.unique_key.clone();
        self.release_unique(id, key.as_deref());
        self.records.remove(id);
        Ok(())
    }

    pub(crate) fn run_task(&mut self, lane: Lane, id: &TaskId, now: DateTime<Utc>) -> Result<()> {
        match self.record_in_lane(lane, id)?.state {
            TaskState::Pending => Ok(()),
            TaskState::Scheduled | TaskState::Retry | TaskState::Archived => {
                let record = self.record_mut(id)?;
                record.state = TaskState::Pending;
                record.process_at = now;
                record.retain_until = None;
                self.push_pending(lane, id.clone());
                Ok(())
            }
            other => Err(SpindleError::InvalidTaskState {
                id: id.clone(),
                state: other,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::TaskType;
    use chrono::TimeZone;

    #[test]
    fn state_survives_a_json_round_trip_mid_flight() {
        let now = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let mut state = BrokerState::default();
        for (id, lane, delay) in [("a", Lane::High, 0), ("b", Lane::Low, 0), ("later", Lane::High, 30)] {
            let mut msg = TaskMessage {
                id: TaskId::parse(id),
                task_type: TaskType::new("send_email"),
                payload: b"{}".to_vec(),
                lane,
                state: TaskState::Pending,
                max_retry: 3,
                retried: 0,
                retention: Duration::from_secs(60),
                process_at: now + chrono::Duration::seconds(delay),
                last_error: None,
                last_failed_at: None,
                completed_at: None,
                retain_until: None,
                unique_key: Some(format!("{lane}:send_email:{id}")),
                created_at: now,
            };
            msg.settle(now);
            state.enqueue(msg, Some(Duration::from_secs(300)), now).unwrap();
        }
        let active = state.dequeue(&[Lane::High], now).unwrap().unwrap();

        let bytes = serde_json::to_vec(&state).unwrap();
        let mut restored: BrokerState = serde_json::from_slice(&bytes).unwrap();

        assert_eq!(restored.counts(Lane::High), state.counts(Lane::High));
        restored.complete(&active.id, now).unwrap();
        let next = restored.dequeue(&[Lane::High, Lane::Low], now).unwrap().unwrap();
        assert_eq!(next.id.as_str(), "b");

        let later = now + chrono::Duration::seconds(30);
        let promoted = restored.dequeue(&[Lane::High], later).unwrap().unwrap();
        assert_eq!(promoted.id.as_str(), "later");
    }
}
