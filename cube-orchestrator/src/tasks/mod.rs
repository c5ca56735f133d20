//! Task Scheduler
//!
//! Asynchronous task execution for the engine. A task is a named handler
//! that receives a [`ServiceContext`](crate::context::ServiceContext) and
//! typed [`TaskArgs`]. Every task is declared once in the [`TaskRegistry`]
//! table with its queue, retry settings and failure policy.
//!
//! - `main1`: job submission
//! - `main2`: status checks, cancellation and remote cleanup
//! - `periodic`: the sweepers fired by the [`beat`]

pub mod beat;
pub mod handlers;
pub mod queue;
pub mod registry;
pub mod worker;

pub use beat::{BeatEntry, spawn_beat};
pub use queue::{LocalTaskQueue, QueueError, TaskQueue};
pub use registry::{FailurePolicy, RetrySettings, TaskRegistry, TaskSpec};
pub use worker::{TaskOutcome, WorkerPool, execute};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::repository::StoreError;
use crate::service::status::StatusError;

// =============================================================================
// Task Names
// =============================================================================

pub const RUN_PLUGIN_INSTANCE: &str = "run_plugin_instance";
pub const CHECK_PLUGIN_INSTANCE_EXEC_STATUS: &str = "check_plugin_instance_exec_status";
pub const CANCEL_PLUGIN_INSTANCE: &str = "cancel_plugin_instance";
pub const DELETE_PLUGIN_INSTANCE_JOB_FROM_REMOTE: &str = "delete_plugin_instance_job_from_remote";
pub const SCHEDULE_WAITING_PLUGIN_INSTANCES: &str = "schedule_waiting_plugin_instances";
pub const CHECK_STARTED_PLUGIN_INSTANCES_EXEC_STATUS: &str =
    "check_started_plugin_instances_exec_status";
pub const CANCEL_WAITING_PLUGIN_INSTANCES: &str = "cancel_waiting_plugin_instances";
pub const CANCEL_PLUGIN_INSTANCES_STUCK_IN_LOCK: &str = "cancel_plugin_instances_stuck_in_lock";
pub const DELETE_PLUGIN_INSTANCES_JOBS_FROM_REMOTE: &str =
    "delete_plugin_instances_jobs_from_remote";

// =============================================================================
// Queue Names
// =============================================================================

pub const MAIN1_QUEUE: &str = "main1";
pub const MAIN2_QUEUE: &str = "main2";
pub const PERIODIC_QUEUE: &str = "periodic";

pub const QUEUES: [&str; 3] = [MAIN1_QUEUE, MAIN2_QUEUE, PERIODIC_QUEUE];

/// Arguments carried by a task message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TaskArgs {
    None,
    Instance {
        instance_id: Uuid,
    },
    /// The compute resource is recorded at enqueue time, since the instance
    /// row may already be gone when the task runs
    RemoteJob {
        instance_id: Uuid,
        compute_resource: String,
    },
}

impl TaskArgs {
    pub fn instance(instance_id: Uuid) -> Self {
        TaskArgs::Instance { instance_id }
    }

    pub fn instance_id(&self) -> Option<Uuid> {
        match self {
            TaskArgs::None => None,
            TaskArgs::Instance { instance_id } | TaskArgs::RemoteJob { instance_id, .. } => {
                Some(*instance_id)
            }
        }
    }
}

/// A task invocation waiting in a queue
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskMessage {
    pub id: Uuid,
    pub name: String,
    pub args: TaskArgs,
    /// Zero for the first delivery
    pub attempt: u32,
}

impl TaskMessage {
    pub fn new(name: impl Into<String>, args: TaskArgs) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            args,
            attempt: 0,
        }
    }

    /// Same invocation, one attempt later
    pub fn next_attempt(&self) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: self.name.clone(),
            args: self.args.clone(),
            attempt: self.attempt + 1,
        }
    }
}

/// Errors returned by task handlers
#[derive(Debug, Error)]
pub enum TaskError {
    #[error("plugin instance {0} not found")]
    InstanceNotFound(Uuid),

    #[error("request rejected: {0}")]
    Rejected(String),

    #[error(transparent)]
    Status(StatusError),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("compute error: {0}")]
    Compute(#[from] cube_compute::ClientError),

    #[error("queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("task {task} got unexpected arguments {args:?}")]
    InvalidArgs { task: &'static str, args: TaskArgs },
}

impl TaskError {
    /// Errors that complete the task without retry
    pub fn is_noop(&self) -> bool {
        matches!(self, TaskError::InstanceNotFound(_) | TaskError::Rejected(_))
    }
}

impl From<StatusError> for TaskError {
    fn from(err: StatusError) -> Self {
        match err {
            StatusError::NotFound(id) => TaskError::InstanceNotFound(id),
            StatusError::InvalidState(msg) => TaskError::Rejected(msg),
            other => TaskError::Status(other),
        }
    }
}
