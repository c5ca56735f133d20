//! Workflow domain types

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::plugin_instance::InstanceStatus;

/// Record of one pipeline instantiation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Workflow {
    pub id: Uuid,
    pub title: String,
    pub pipeline_id: Uuid,
    pub owner: String,
    /// Instance the pipeline was grafted onto
    pub previous_instance_id: Uuid,
    /// Instances created by the instantiation, in breadth-first order
    pub instance_ids: Vec<Uuid>,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

/// Number of a workflow's plugin instances in each status
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowJobCounts {
    pub created: usize,
    pub waiting: usize,
    pub scheduled: usize,
    pub started: usize,
    pub registering_files: usize,
    pub finished_successfully: usize,
    pub finished_with_error: usize,
    pub cancelled: usize,
}

impl WorkflowJobCounts {
    pub fn add(&mut self, status: InstanceStatus) {
        let slot = match status {
            InstanceStatus::Created => &mut self.created,
            InstanceStatus::Waiting => &mut self.waiting,
            InstanceStatus::Scheduled => &mut self.scheduled,
            InstanceStatus::Started => &mut self.started,
            InstanceStatus::RegisteringFiles => &mut self.registering_files,
            InstanceStatus::FinishedSuccessfully => &mut self.finished_successfully,
            InstanceStatus::FinishedWithError => &mut self.finished_with_error,
            InstanceStatus::Cancelled => &mut self.cancelled,
        };
        *slot += 1;
    }

    pub fn total(&self) -> usize {
        self.created
            + self.waiting
            + self.scheduled
            + self.started
            + self.registering_files
            + self.finished_successfully
            + self.finished_with_error
            + self.cancelled
    }
}

impl FromIterator<InstanceStatus> for WorkflowJobCounts {
    fn from_iter<I: IntoIterator<Item = InstanceStatus>>(iter: I) -> Self {
        let mut counts = WorkflowJobCounts::default();
        for status in iter {
            counts.add(status);
        }
        counts
    }
}
