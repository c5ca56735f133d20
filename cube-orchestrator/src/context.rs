//! Shared service context
//!
//! Everything a service operation or task handler needs: the store, the
//! storage backend, the compute resources and the task queue.

use std::sync::Arc;
use std::time::Duration;

use cube_compute::ComputeRegistry;
use cube_core::domain::plugin_instance::job_id;
use cube_storage::StorageBackend;
use uuid::Uuid;

use crate::repository::Store;
use crate::service::permissions::{PathPermissions, UserScopedPermissions};
use crate::tasks::{QueueError, TaskArgs, TaskMessage, TaskQueue, TaskRegistry};

/// Engine-wide tunables
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineSettings {
    /// Prefix of every job id sent to a compute resource
    pub job_id_prefix: String,
    /// Age after which a held lock is considered abandoned
    pub stuck_lock_cutoff: Duration,
    /// How long a finished job is kept on its compute resource
    pub remote_job_retention: Duration,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            job_id_prefix: "chris-jid-".to_string(),
            stuck_lock_cutoff: Duration::from_secs(4 * 60 * 60),
            remote_job_retention: Duration::from_secs(60 * 60),
        }
    }
}

#[derive(Clone)]
pub struct ServiceContext {
    pub store: Arc<dyn Store>,
    pub storage: Arc<dyn StorageBackend>,
    pub compute: Arc<ComputeRegistry>,
    pub queue: Arc<dyn TaskQueue>,
    pub registry: Arc<TaskRegistry>,
    pub permissions: Arc<dyn PathPermissions>,
    pub settings: Arc<EngineSettings>,
}

impl ServiceContext {
    pub fn new(
        store: Arc<dyn Store>,
        storage: Arc<dyn StorageBackend>,
        compute: Arc<ComputeRegistry>,
        queue: Arc<dyn TaskQueue>,
        registry: Arc<TaskRegistry>,
    ) -> Self {
        Self {
            store,
            storage,
            compute,
            queue,
            registry,
            permissions: Arc::new(UserScopedPermissions),
            settings: Arc::new(EngineSettings::default()),
        }
    }

    pub fn with_settings(mut self, settings: EngineSettings) -> Self {
        self.settings = Arc::new(settings);
        self
    }

    pub fn with_permissions(mut self, permissions: Arc<dyn PathPermissions>) -> Self {
        self.permissions = permissions;
        self
    }

    /// Queue a task on the queue its registry entry names
    pub async fn enqueue(&self, task: &str, args: TaskArgs) -> Result<(), QueueError> {
        let queue = self
            .registry
            .queue_for(task)
            .ok_or_else(|| QueueError::UnknownTask(task.to_string()))?;
        self.queue.push(queue, TaskMessage::new(task, args)).await
    }

    pub fn job_id(&self, instance_id: Uuid) -> String {
        job_id(&self.settings.job_id_prefix, instance_id)
    }
}
