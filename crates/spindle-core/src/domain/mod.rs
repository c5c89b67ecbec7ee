//! Domain model (ids, lanes, tasks, state, options).

pub mod ids;
pub mod lane;
pub mod options;
pub mod state;
pub mod task;

pub use ids::{LockToken, ScheduleId, TaskId};
pub use lane::{Lane, LaneWeights};
pub use options::EnqueueOptions;
pub use state::TaskState;
pub use task::{Task, TaskEnvelope, TaskInfo, TaskMessage, TaskType};

pub(crate) use task::add_duration;
