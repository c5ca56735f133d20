//! Postgres-backed [`Store`]

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use cube_core::domain::feed::Feed;
use cube_core::domain::pipeline::{Pipeline, Piping};
use cube_core::domain::plugin::Plugin;
use cube_core::domain::plugin_instance::{
    InstanceStatus, ParameterInstance, PluginInstance, PluginInstanceLock, RemoteJobState,
};
use cube_core::domain::workflow::Workflow;
use sqlx::PgPool;
use uuid::Uuid;

use super::{
    NewInstance, Store, StoreResult, feed_repository, lock_repository, pipeline_repository,
    plugin_instance_repository, plugin_repository, workflow_repository,
};

/// Store delegating to the repository functions over a connection pool
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl Store for PgStore {
    async fn get_plugin(&self, id: Uuid) -> StoreResult<Option<Plugin>> {
        plugin_repository::find_by_id(&self.pool, id).await
    }

    async fn get_pipeline(&self, id: Uuid) -> StoreResult<Option<Pipeline>> {
        pipeline_repository::find_by_id(&self.pool, id).await
    }

    async fn list_pipings(&self, pipeline_id: Uuid) -> StoreResult<Vec<Piping>> {
        pipeline_repository::find_pipings(&self.pool, pipeline_id).await
    }

    async fn get_feed(&self, id: Uuid) -> StoreResult<Option<Feed>> {
        feed_repository::find_by_id(&self.pool, id).await
    }

    async fn get_instance(&self, id: Uuid) -> StoreResult<Option<PluginInstance>> {
        plugin_instance_repository::find_by_id(&self.pool, id).await
    }

    async fn get_instances(&self, ids: &[Uuid]) -> StoreResult<Vec<PluginInstance>> {
        plugin_instance_repository::find_by_ids(&self.pool, ids).await
    }

    async fn list_instances_by_status(
        &self,
        status: InstanceStatus,
    ) -> StoreResult<Vec<PluginInstance>> {
        plugin_instance_repository::find_by_status(&self.pool, status).await
    }

    async fn list_children(&self, previous_id: Uuid) -> StoreResult<Vec<PluginInstance>> {
        plugin_instance_repository::find_children(&self.pool, previous_id).await
    }

    async fn get_parameters(&self, instance_id: Uuid) -> StoreResult<Vec<ParameterInstance>> {
        plugin_instance_repository::find_parameters(&self.pool, instance_id).await
    }

    async fn create_instance(&self, new: NewInstance) -> StoreResult<()> {
        plugin_instance_repository::create(&self.pool, &new).await
    }

    async fn transition(
        &self,
        id: Uuid,
        from: &[InstanceStatus],
        to: InstanceStatus,
    ) -> StoreResult<bool> {
        plugin_instance_repository::update_status_if(&self.pool, id, from, to).await
    }

    async fn mark_started(&self, id: Uuid, summary: &serde_json::Value) -> StoreResult<bool> {
        plugin_instance_repository::update_status_to_started(&self.pool, id, summary).await
    }

    async fn update_summary(&self, id: Uuid, summary: &serde_json::Value) -> StoreResult<()> {
        plugin_instance_repository::update_summary(&self.pool, id, summary).await
    }

    async fn force_cancel(
        &self,
        id: Uuid,
        error_code: &str,
        error_detail: &str,
    ) -> StoreResult<bool> {
        plugin_instance_repository::force_cancel(&self.pool, id, error_code, error_detail).await
    }

    async fn set_remote_job_state(&self, id: Uuid, state: RemoteJobState) -> StoreResult<()> {
        plugin_instance_repository::update_remote_job(&self.pool, id, state).await
    }

    async fn list_remote_cleanup_candidates(
        &self,
        finished_before: DateTime<Utc>,
    ) -> StoreResult<Vec<PluginInstance>> {
        plugin_instance_repository::find_remote_cleanup_candidates(&self.pool, finished_before)
            .await
    }

    async fn delete_instances(&self, ids: &[Uuid]) -> StoreResult<u64> {
        let mut conn = self.pool.acquire().await?;
        plugin_instance_repository::delete_many(&mut conn, ids).await
    }

    async fn create_workflow(
        &self,
        workflow: &Workflow,
        instances: Vec<NewInstance>,
    ) -> StoreResult<()> {
        workflow_repository::create(&self.pool, workflow, &instances).await
    }

    async fn get_workflow(&self, id: Uuid) -> StoreResult<Option<Workflow>> {
        workflow_repository::find_by_id(&self.pool, id).await
    }

    async fn delete_workflow(&self, id: Uuid, instance_ids: &[Uuid]) -> StoreResult<bool> {
        workflow_repository::delete(&self.pool, id, instance_ids).await
    }

    async fn acquire_lock(&self, instance_id: Uuid) -> StoreResult<bool> {
        lock_repository::acquire(&self.pool, instance_id).await
    }

    async fn release_lock(&self, instance_id: Uuid) -> StoreResult<()> {
        lock_repository::release(&self.pool, instance_id).await
    }

    async fn list_locks_older_than(
        &self,
        cutoff: DateTime<Utc>,
    ) -> StoreResult<Vec<PluginInstanceLock>> {
        lock_repository::find_older_than(&self.pool, cutoff).await
    }

    async fn register_files(&self, instance_id: Uuid, paths: &[String]) -> StoreResult<usize> {
        lock_repository::register_files(&self.pool, instance_id, paths).await
    }

    async fn list_files(&self, instance_id: Uuid) -> StoreResult<Vec<String>> {
        lock_repository::find_files(&self.pool, instance_id).await
    }
}
