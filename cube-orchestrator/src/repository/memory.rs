//! In-memory [`Store`]
//!
//! Mirrors the Postgres constraints the engine relies on: primary keys,
//! the `previous` foreign key with cascading deletes, and one lock row per
//! instance. Used by tests and single-process development setups.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use cube_core::domain::feed::Feed;
use cube_core::domain::pipeline::{Pipeline, Piping};
use cube_core::domain::plugin::Plugin;
use cube_core::domain::plugin_instance::{
    InstanceStatus, ParameterInstance, PluginInstance, PluginInstanceLock, RemoteJobState,
};
use cube_core::domain::workflow::Workflow;
use uuid::Uuid;

use super::{NewInstance, Store, StoreError, StoreResult};

#[derive(Default)]
struct MemoryState {
    plugins: HashMap<Uuid, Plugin>,
    pipelines: HashMap<Uuid, Pipeline>,
    pipings: Vec<Piping>,
    feeds: HashMap<Uuid, Feed>,
    /// Insertion ordered
    instances: Vec<PluginInstance>,
    parameters: HashMap<Uuid, Vec<ParameterInstance>>,
    workflows: HashMap<Uuid, Workflow>,
    locks: HashMap<Uuid, DateTime<Utc>>,
    files: HashMap<Uuid, BTreeSet<String>>,
}

impl MemoryState {
    fn instance(&self, id: Uuid) -> Option<&PluginInstance> {
        self.instances.iter().find(|i| i.id == id)
    }

    fn instance_mut(&mut self, id: Uuid) -> Option<&mut PluginInstance> {
        self.instances.iter_mut().find(|i| i.id == id)
    }

    fn check_insert(&self, new: &NewInstance, pending: &HashSet<Uuid>) -> StoreResult<()> {
        let inst = &new.instance;
        if self.instance(inst.id).is_some() || pending.contains(&inst.id) {
            return Err(StoreError::Conflict(format!(
                "plugin instance {} already exists",
                inst.id
            )));
        }
        if let Some(previous_id) = inst.previous_id {
            if self.instance(previous_id).is_none() && !pending.contains(&previous_id) {
                return Err(StoreError::Conflict(format!(
                    "previous instance {} of {} does not exist",
                    previous_id, inst.id
                )));
            }
        }
        Ok(())
    }

    fn insert(&mut self, new: NewInstance) {
        let id = new.instance.id;
        self.parameters.insert(id, new.parameters);
        self.instances.push(new.instance);
    }

    /// Delete instances and, like the foreign key cascade, every descendant.
    /// Returns the number of requested ids that existed.
    fn delete(&mut self, ids: &[Uuid]) -> u64 {
        let requested = ids.iter().filter(|id| self.instance(**id).is_some()).count() as u64;

        let mut doomed: HashSet<Uuid> = ids.iter().copied().collect();
        loop {
            let before = doomed.len();
            for inst in &self.instances {
                if inst.previous_id.is_some_and(|p| doomed.contains(&p)) {
                    doomed.insert(inst.id);
                }
            }
            if doomed.len() == before {
                break;
            }
        }

        self.instances.retain(|i| !doomed.contains(&i.id));
        for id in &doomed {
            self.parameters.remove(id);
            self.locks.remove(id);
            self.files.remove(id);
        }
        requested
    }
}

/// Store keeping every table in process memory
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // =============================================================================
    // Seeding
    // =============================================================================

    pub fn insert_plugin(&self, plugin: Plugin) {
        self.state().plugins.insert(plugin.id, plugin);
    }

    pub fn insert_pipeline(&self, pipeline: Pipeline) {
        self.state().pipelines.insert(pipeline.id, pipeline);
    }

    pub fn insert_piping(&self, piping: Piping) {
        self.state().pipings.push(piping);
    }

    pub fn insert_feed(&self, feed: Feed) {
        self.state().feeds.insert(feed.id, feed);
    }

    /// Create a lock with an explicit start date
    pub fn insert_lock_at(&self, instance_id: Uuid, start_date: DateTime<Utc>) {
        self.state().locks.insert(instance_id, start_date);
    }

    pub fn set_end_date(&self, instance_id: Uuid, end_date: DateTime<Utc>) {
        if let Some(inst) = self.state().instance_mut(instance_id) {
            inst.end_date = Some(end_date);
        }
    }

    pub fn instance_count(&self) -> usize {
        self.state().instances.len()
    }

    pub fn workflow_count(&self) -> usize {
        self.state().workflows.len()
    }

    pub fn lock_count(&self) -> usize {
        self.state().locks.len()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn get_plugin(&self, id: Uuid) -> StoreResult<Option<Plugin>> {
        Ok(self.state().plugins.get(&id).cloned())
    }

    async fn get_pipeline(&self, id: Uuid) -> StoreResult<Option<Pipeline>> {
        Ok(self.state().pipelines.get(&id).cloned())
    }

    async fn list_pipings(&self, pipeline_id: Uuid) -> StoreResult<Vec<Piping>> {
        let mut pipings: Vec<Piping> = self
            .state()
            .pipings
            .iter()
            .filter(|p| p.pipeline_id == pipeline_id)
            .cloned()
            .collect();
        pipings.sort_by(|a, b| a.title.cmp(&b.title));
        Ok(pipings)
    }

    async fn get_feed(&self, id: Uuid) -> StoreResult<Option<Feed>> {
        Ok(self.state().feeds.get(&id).cloned())
    }

    async fn get_instance(&self, id: Uuid) -> StoreResult<Option<PluginInstance>> {
        Ok(self.state().instance(id).cloned())
    }

    async fn get_instances(&self, ids: &[Uuid]) -> StoreResult<Vec<PluginInstance>> {
        Ok(self
            .state()
            .instances
            .iter()
            .filter(|i| ids.contains(&i.id))
            .cloned()
            .collect())
    }

    async fn list_instances_by_status(
        &self,
        status: InstanceStatus,
    ) -> StoreResult<Vec<PluginInstance>> {
        Ok(self
            .state()
            .instances
            .iter()
            .filter(|i| i.status == status)
            .cloned()
            .collect())
    }

    async fn list_children(&self, previous_id: Uuid) -> StoreResult<Vec<PluginInstance>> {
        Ok(self
            .state()
            .instances
            .iter()
            .filter(|i| i.previous_id == Some(previous_id))
            .cloned()
            .collect())
    }

    async fn get_parameters(&self, instance_id: Uuid) -> StoreResult<Vec<ParameterInstance>> {
        let mut params = self
            .state()
            .parameters
            .get(&instance_id)
            .cloned()
            .unwrap_or_default();
        params.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(params)
    }

    async fn create_instance(&self, new: NewInstance) -> StoreResult<()> {
        let mut state = self.state();
        state.check_insert(&new, &HashSet::new())?;
        state.insert(new);
        Ok(())
    }

    async fn transition(
        &self,
        id: Uuid,
        from: &[InstanceStatus],
        to: InstanceStatus,
    ) -> StoreResult<bool> {
        let mut state = self.state();
        let Some(inst) = state.instance_mut(id) else {
            return Ok(false);
        };
        if !from.contains(&inst.status) {
            return Ok(false);
        }
        inst.status = to;
        if to.is_terminal() {
            inst.end_date = Some(Utc::now());
        }
        Ok(true)
    }

    async fn mark_started(&self, id: Uuid, summary: &serde_json::Value) -> StoreResult<bool> {
        let mut state = self.state();
        let Some(inst) = state.instance_mut(id) else {
            return Ok(false);
        };
        if inst.status != InstanceStatus::Scheduled {
            return Ok(false);
        }
        inst.status = InstanceStatus::Started;
        inst.start_date = Some(Utc::now());
        inst.summary = summary.clone();
        inst.remote_job = RemoteJobState::Submitted;
        Ok(true)
    }

    async fn update_summary(&self, id: Uuid, summary: &serde_json::Value) -> StoreResult<()> {
        if let Some(inst) = self.state().instance_mut(id) {
            inst.summary = summary.clone();
        }
        Ok(())
    }

    async fn force_cancel(
        &self,
        id: Uuid,
        error_code: &str,
        error_detail: &str,
    ) -> StoreResult<bool> {
        let mut state = self.state();
        let Some(inst) = state.instance_mut(id) else {
            return Ok(false);
        };
        if inst.status.is_terminal() {
            return Ok(false);
        }
        inst.status = InstanceStatus::Cancelled;
        inst.end_date = Some(Utc::now());
        inst.error_code = Some(error_code.to_string());
        inst.error_detail = Some(error_detail.to_string());
        Ok(true)
    }

    async fn set_remote_job_state(&self, id: Uuid, remote: RemoteJobState) -> StoreResult<()> {
        if let Some(inst) = self.state().instance_mut(id) {
            inst.remote_job = remote;
        }
        Ok(())
    }

    async fn list_remote_cleanup_candidates(
        &self,
        finished_before: DateTime<Utc>,
    ) -> StoreResult<Vec<PluginInstance>> {
        let mut candidates: Vec<PluginInstance> = self
            .state()
            .instances
            .iter()
            .filter(|i| {
                i.remote_job == RemoteJobState::Submitted
                    && i.status.is_terminal()
                    && i.end_date.is_some_and(|end| end < finished_before)
            })
            .cloned()
            .collect();
        candidates.sort_by_key(|i| i.end_date);
        Ok(candidates)
    }

    async fn delete_instances(&self, ids: &[Uuid]) -> StoreResult<u64> {
        Ok(self.state().delete(ids))
    }

    async fn create_workflow(
        &self,
        workflow: &Workflow,
        instances: Vec<NewInstance>,
    ) -> StoreResult<()> {
        let mut state = self.state();
        if state.workflows.contains_key(&workflow.id) {
            return Err(StoreError::Conflict(format!(
                "workflow {} already exists",
                workflow.id
            )));
        }

        // Validate the whole batch before writing anything
        let mut pending = HashSet::new();
        for new in &instances {
            state.check_insert(new, &pending)?;
            pending.insert(new.instance.id);
        }

        state.workflows.insert(workflow.id, workflow.clone());
        for new in instances {
            state.insert(new);
        }
        Ok(())
    }

    async fn get_workflow(&self, id: Uuid) -> StoreResult<Option<Workflow>> {
        Ok(self.state().workflows.get(&id).cloned())
    }

    async fn delete_workflow(&self, id: Uuid, instance_ids: &[Uuid]) -> StoreResult<bool> {
        let mut state = self.state();
        state.delete(instance_ids);
        Ok(state.workflows.remove(&id).is_some())
    }

    async fn acquire_lock(&self, instance_id: Uuid) -> StoreResult<bool> {
        let mut state = self.state();
        if state.locks.contains_key(&instance_id) {
            return Ok(false);
        }
        state.locks.insert(instance_id, Utc::now());
        Ok(true)
    }

    async fn release_lock(&self, instance_id: Uuid) -> StoreResult<()> {
        self.state().locks.remove(&instance_id);
        Ok(())
    }

    async fn list_locks_older_than(
        &self,
        cutoff: DateTime<Utc>,
    ) -> StoreResult<Vec<PluginInstanceLock>> {
        let mut locks: Vec<PluginInstanceLock> = self
            .state()
            .locks
            .iter()
            .filter(|(_, start)| **start < cutoff)
            .map(|(id, start)| PluginInstanceLock {
                instance_id: *id,
                start_date: *start,
            })
            .collect();
        locks.sort_by_key(|l| l.start_date);
        Ok(locks)
    }

    async fn register_files(&self, instance_id: Uuid, paths: &[String]) -> StoreResult<usize> {
        let mut state = self.state();
        let files = state.files.entry(instance_id).or_default();
        Ok(paths.iter().filter(|p| files.insert((*p).clone())).count())
    }

    async fn list_files(&self, instance_id: Uuid) -> StoreResult<Vec<String>> {
        Ok(self
            .state()
            .files
            .get(&instance_id)
            .map(|files| files.iter().cloned().collect())
            .unwrap_or_default())
    }
}
