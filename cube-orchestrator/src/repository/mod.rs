//! Repository Module
//!
//! Data access layer for the orchestrator.
//! Each repository file handles database operations for a specific domain
//! entity; [`PgStore`] bundles them behind the [`Store`] trait consumed by the
//! services, and [`MemoryStore`] provides the same contract in memory.

pub mod feed;
pub mod lock;
pub mod memory;
pub mod pipeline;
pub mod plugin;
pub mod plugin_instance;
pub mod postgres;
pub mod workflow;

// Re-export for convenience
pub use feed as feed_repository;
pub use lock as lock_repository;
pub use memory::MemoryStore;
pub use pipeline as pipeline_repository;
pub use plugin as plugin_repository;
pub use plugin_instance as plugin_instance_repository;
pub use postgres::PgStore;
pub use workflow as workflow_repository;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use cube_core::domain::feed::Feed;
use cube_core::domain::pipeline::{Pipeline, Piping};
use cube_core::domain::plugin::Plugin;
use cube_core::domain::plugin_instance::{
    InstanceStatus, ParameterInstance, PluginInstance, PluginInstanceLock, RemoteJobState,
};
use cube_core::domain::workflow::Workflow;
use thiserror::Error;
use uuid::Uuid;

/// Result type alias for store operations
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Errors raised by a store implementation
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("corrupt row: {0}")]
    Corrupt(String),

    #[error("constraint violation: {0}")]
    Conflict(String),
}

/// A plugin instance and its resolved parameters, ready to be persisted
#[derive(Debug, Clone, PartialEq)]
pub struct NewInstance {
    pub instance: PluginInstance,
    pub parameters: Vec<ParameterInstance>,
}

/// Persistence contract of the execution engine
///
/// Every status write is a conditional single-row update that reports whether
/// it took effect, so concurrent tasks acting on the same instance converge.
#[async_trait]
pub trait Store: Send + Sync {
    // -------------------------------------------------------------------------
    // Catalogue (read-only for the engine)
    // -------------------------------------------------------------------------

    async fn get_plugin(&self, id: Uuid) -> StoreResult<Option<Plugin>>;

    async fn get_pipeline(&self, id: Uuid) -> StoreResult<Option<Pipeline>>;

    async fn list_pipings(&self, pipeline_id: Uuid) -> StoreResult<Vec<Piping>>;

    async fn get_feed(&self, id: Uuid) -> StoreResult<Option<Feed>>;

    // -------------------------------------------------------------------------
    // Plugin instances
    // -------------------------------------------------------------------------

    async fn get_instance(&self, id: Uuid) -> StoreResult<Option<PluginInstance>>;

    async fn get_instances(&self, ids: &[Uuid]) -> StoreResult<Vec<PluginInstance>>;

    /// Instances in the given status, oldest first
    async fn list_instances_by_status(
        &self,
        status: InstanceStatus,
    ) -> StoreResult<Vec<PluginInstance>>;

    /// Instances whose `previous` is the given instance
    async fn list_children(&self, previous_id: Uuid) -> StoreResult<Vec<PluginInstance>>;

    async fn get_parameters(&self, instance_id: Uuid) -> StoreResult<Vec<ParameterInstance>>;

    /// Persist a single instance outside of any workflow
    async fn create_instance(&self, new: NewInstance) -> StoreResult<()>;

    /// Move an instance to `to` if its current status is one of `from`.
    /// Entering a terminal status stamps `end_date`.
    async fn transition(
        &self,
        id: Uuid,
        from: &[InstanceStatus],
        to: InstanceStatus,
    ) -> StoreResult<bool>;

    /// `scheduled` → `started`, recording the submission
    async fn mark_started(&self, id: Uuid, summary: &serde_json::Value) -> StoreResult<bool>;

    async fn update_summary(&self, id: Uuid, summary: &serde_json::Value) -> StoreResult<()>;

    /// Move any non-terminal instance to `cancelled` together with the
    /// failure detail, in one statement
    async fn force_cancel(
        &self,
        id: Uuid,
        error_code: &str,
        error_detail: &str,
    ) -> StoreResult<bool>;

    async fn set_remote_job_state(&self, id: Uuid, state: RemoteJobState) -> StoreResult<()>;

    /// Terminal instances with a submitted remote job that ended before `finished_before`
    async fn list_remote_cleanup_candidates(
        &self,
        finished_before: DateTime<Utc>,
    ) -> StoreResult<Vec<PluginInstance>>;

    /// Delete instances together with their parameters, locks and files
    async fn delete_instances(&self, ids: &[Uuid]) -> StoreResult<u64>;

    // -------------------------------------------------------------------------
    // Workflows
    // -------------------------------------------------------------------------

    /// Persist a workflow and all of its instances atomically.
    ///
    /// Instances must be given parents first.
    async fn create_workflow(
        &self,
        workflow: &Workflow,
        instances: Vec<NewInstance>,
    ) -> StoreResult<()>;

    async fn get_workflow(&self, id: Uuid) -> StoreResult<Option<Workflow>>;

    /// Delete a workflow and the given instances atomically
    async fn delete_workflow(&self, id: Uuid, instance_ids: &[Uuid]) -> StoreResult<bool>;

    // -------------------------------------------------------------------------
    // Locks
    // -------------------------------------------------------------------------

    /// Create the instance's lock; `false` if it is already held
    async fn acquire_lock(&self, instance_id: Uuid) -> StoreResult<bool>;

    async fn release_lock(&self, instance_id: Uuid) -> StoreResult<()>;

    async fn list_locks_older_than(
        &self,
        cutoff: DateTime<Utc>,
    ) -> StoreResult<Vec<PluginInstanceLock>>;

    // -------------------------------------------------------------------------
    // Output files
    // -------------------------------------------------------------------------

    /// Register output files; already registered paths are skipped.
    /// Returns the number of new registrations.
    async fn register_files(&self, instance_id: Uuid, paths: &[String]) -> StoreResult<usize>;

    async fn list_files(&self, instance_id: Uuid) -> StoreResult<Vec<String>>;
}
