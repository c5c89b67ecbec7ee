use std::sync::Arc;

use tracing::info;

use crate::domain::{Lane, LaneWeights, TaskId, TaskInfo, TaskState};
use crate::error::Result;
use crate::ports::{Broker, LaneCounts};

/// Read-mostly view over the queue for monitoring and manual intervention.
#[derive(Clone)]
pub struct Inspector {
    broker: Arc<dyn Broker>,
    lanes: LaneWeights,
}

impl Inspector {
    pub fn new(broker: Arc<dyn Broker>, lanes: LaneWeights) -> Self {
        Self { broker, lanes }
    }

    /// Served lanes, in priority order.
    pub fn lanes(&self) -> Vec<Lane> {
        self.lanes.served().into_iter().map(|(lane, _)| lane).collect()
    }

    pub fn weights(&self) -> &LaneWeights {
        &self.lanes
    }

    pub async fn lane_counts(&self, lane: Lane) -> Result<LaneCounts> {
        self.broker.counts(lane).await
    }

    pub async fn list_tasks(&self, lane: Lane, state: TaskState) -> Result<Vec<TaskInfo>> {
        self.broker.list(lane, state).await
    }

    pub async fn task_info(&self, lane: Lane, id: &TaskId) -> Result<TaskInfo> {
        self.broker.task_info(lane, id).await
    }

    /// Remove a task that is not currently active.
    pub async fn delete_task(&self, lane: Lane, id: &TaskId) -> Result<()> {
        self.broker.delete_task(lane, id).await?;
        info!(task_id = %id, lane = %lane, "task deleted");
        Ok(())
    }

    /// Make a scheduled, retry or archived task pending right away.
    pub async fn run_task(&self, lane: Lane, id: &TaskId) -> Result<()> {
        self.broker.run_task(lane, id).await?;
        info!(task_id = %id, lane = %lane, "task moved to pending");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{EnqueueOptions, Task};
    use crate::error::SpindleError;
    use crate::impls::MemoryBroker;
    use crate::ports::{SystemClock, UlidGenerator};
    use crate::queue::{Client, ClientOptions};
    use std::time::Duration;

    fn setup() -> (Client, Inspector) {
        let broker = Arc::new(MemoryBroker::new());
        let client = Client::new(
            broker.clone(),
            Arc::new(UlidGenerator::new(SystemClock)),
            Arc::new(SystemClock),
            ClientOptions::default(),
        );
        (client, Inspector::new(broker, LaneWeights::reference()))
    }

    #[tokio::test]
    async fn counts_and_lists_by_state() {
        let (client, inspector) = setup();
        let task = Task::new("report", vec![]);
        client.enqueue(&task, EnqueueOptions::new()).await.unwrap();
        client
            .enqueue_in(&task, Duration::from_secs(3600), EnqueueOptions::new())
            .await
            .unwrap();

        let counts = inspector.lane_counts(Lane::Default).await.unwrap();
        assert_eq!(counts.pending, 1);
        assert_eq!(counts.scheduled, 1);
        assert_eq!(counts.total(), 2);

        let scheduled = inspector
            .list_tasks(Lane::Default, TaskState::Scheduled)
            .await
            .unwrap();
        assert_eq!(scheduled.len(), 1);
        assert!(scheduled[0].next_process_at.is_some());
    }

    #[tokio::test]
    async fn run_task_makes_scheduled_task_pending() {
        let (client, inspector) = setup();
        let info = client
            .enqueue_in(&Task::new("report", vec![]), Duration::from_secs(3600), EnqueueOptions::new())
            .await
            .unwrap();

        inspector.run_task(Lane::Default, &info.id).await.unwrap();
        let info = inspector.task_info(Lane::Default, &info.id).await.unwrap();
        assert_eq!(info.state, TaskState::Pending);
    }

    #[tokio::test]
    async fn deleted_task_is_not_found() {
        let (client, inspector) = setup();
        let info = client
            .enqueue(&Task::new("report", vec![]), EnqueueOptions::new())
            .await
            .unwrap();
        inspector.delete_task(Lane::Default, &info.id).await.unwrap();

        let err = inspector.task_info(Lane::Default, &info.id).await.unwrap_err();
        assert!(err.is_not_found());
        let err = inspector.task_info(Lane::Low, &TaskId::parse("nope")).await.unwrap_err();
        assert!(matches!(err, SpindleError::NotFound(_)));
    }

    #[test]
    fn lanes_follow_priority_order() {
        let (_, inspector) = setup();
        assert_eq!(inspector.lanes(), Lane::ALL.to_vec());
    }
}
