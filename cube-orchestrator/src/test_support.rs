//! Fixtures shared by the orchestrator's unit tests

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Utc;
use cube_compute::{ClientError, ComputeClient, ComputeRegistry};
use cube_core::domain::feed::Feed;
use cube_core::domain::parameter::{ParameterKind, ParameterValue};
use cube_core::domain::pipeline::{Pipeline, Piping, PipingDefault};
use cube_core::domain::plugin::{ParameterAction, Plugin, PluginParameter, PluginType};
use cube_core::domain::plugin_instance::{
    FILTER_PARAM, InstanceStatus, PLUGIN_INSTANCES_PARAM, ParameterInstance, PluginInstance,
    RemoteJobState,
};
use cube_core::dto::compute::{JobDescriptor, JobRef, JobStatusReport, RemotePhase};
use cube_storage::FilesystemStorage;
use tempfile::TempDir;
use uuid::Uuid;

use crate::context::ServiceContext;
use crate::repository::{MemoryStore, NewInstance, Store};
use crate::service::workflow::child_output_path;
use crate::tasks::{LocalTaskQueue, RetrySettings, TaskRegistry, execute};

pub const USER: &str = "jane";

pub fn plugin(name: &str, plugin_type: PluginType) -> Plugin {
    Plugin {
        id: Uuid::new_v4(),
        name: name.to_string(),
        version: "1.0.0".to_string(),
        plugin_type,
        dock_image: format!("fnndsc/{}", name),
        selfpath: "/usr/local/bin".to_string(),
        selfexec: name.trim_start_matches("pl-").to_string(),
        execshell: String::new(),
        min_cpu_limit: 1000,
        max_cpu_limit: 2000,
        min_memory_limit: 200,
        max_memory_limit: 400,
        min_number_of_workers: 1,
        max_number_of_workers: 1,
        min_gpu_limit: 0,
        max_gpu_limit: 0,
        parameters: vec![],
        compute_resources: vec!["host".to_string()],
    }
}

pub fn plugin_param(name: &str, kind: ParameterKind, default: Option<ParameterValue>) -> PluginParameter {
    PluginParameter {
        id: Uuid::new_v4(),
        name: name.to_string(),
        flag: format!("--{}", name),
        kind,
        action: ParameterAction::Store,
        optional: false,
        default,
        help: String::new(),
    }
}

// =============================================================================
// Fake compute resource
// =============================================================================

/// Scripted compute resource counting the calls it receives
#[derive(Default)]
pub struct FakeComputeClient {
    submits: AtomicU32,
    polls: AtomicU32,
    cancels: AtomicU32,
    deletes: AtomicU32,
    phase: Mutex<Option<RemotePhase>>,
    last_job: Mutex<Option<JobDescriptor>>,
    fail_submit: AtomicBool,
    fail_poll: AtomicBool,
    fail_cancel: AtomicBool,
    delete_not_found: AtomicBool,
    poll_not_found: AtomicBool,
    /// Jobs whose submission was refused, unknown to later polls
    rejected: Mutex<HashSet<String>>,
}

impl FakeComputeClient {
    pub fn set_phase(&self, phase: RemotePhase) {
        *self.phase.lock().unwrap() = Some(phase);
    }

    pub fn fail_submit(&self) {
        self.fail_submit.store(true, Ordering::SeqCst);
    }

    pub fn fail_poll(&self) {
        self.fail_poll.store(true, Ordering::SeqCst);
    }

    /// Answer polls as if the compute resource never saw the job
    pub fn fail_poll_not_found(&self) {
        self.poll_not_found.store(true, Ordering::SeqCst);
    }

    pub fn fail_cancel(&self) {
        self.fail_cancel.store(true, Ordering::SeqCst);
    }

    pub fn fail_delete_not_found(&self) {
        self.delete_not_found.store(true, Ordering::SeqCst);
    }

    pub fn submit_calls(&self) -> u32 {
        self.submits.load(Ordering::SeqCst)
    }

    pub fn poll_calls(&self) -> u32 {
        self.polls.load(Ordering::SeqCst)
    }

    pub fn cancel_calls(&self) -> u32 {
        self.cancels.load(Ordering::SeqCst)
    }

    pub fn delete_calls(&self) -> u32 {
        self.deletes.load(Ordering::SeqCst)
    }

    pub fn last_job(&self) -> Option<JobDescriptor> {
        self.last_job.lock().unwrap().clone()
    }
}

#[async_trait]
impl ComputeClient for FakeComputeClient {
    async fn submit(&self, job: &JobDescriptor) -> cube_compute::Result<JobRef> {
        self.submits.fetch_add(1, Ordering::SeqCst);
        if self.fail_submit.load(Ordering::SeqCst) {
            self.rejected.lock().unwrap().insert(job.jid.clone());
            return Err(ClientError::api_error(503, "pfcon unavailable"));
        }
        self.rejected.lock().unwrap().remove(&job.jid);
        *self.last_job.lock().unwrap() = Some(job.clone());
        Ok(JobRef { jid: job.jid.clone() })
    }

    async fn poll(&self, jid: &str) -> cube_compute::Result<JobStatusReport> {
        self.polls.fetch_add(1, Ordering::SeqCst);
        if self.fail_poll.load(Ordering::SeqCst) {
            return Err(ClientError::api_error(502, "bad gateway"));
        }
        if self.poll_not_found.load(Ordering::SeqCst) || self.rejected.lock().unwrap().contains(jid) {
            return Err(ClientError::JobNotFound(jid.to_string()));
        }
        let status = self.phase.lock().unwrap().unwrap_or(RemotePhase::Started);
        Ok(JobStatusReport {
            jid: jid.to_string(),
            status,
            message: String::new(),
            logs: "running".to_string(),
        })
    }

    async fn cancel(&self, _jid: &str) -> cube_compute::Result<()> {
        self.cancels.fetch_add(1, Ordering::SeqCst);
        if self.fail_cancel.load(Ordering::SeqCst) {
            return Err(ClientError::api_error(500, "cancel failed"));
        }
        Ok(())
    }

    async fn delete(&self, jid: &str) -> cube_compute::Result<()> {
        self.deletes.fetch_add(1, Ordering::SeqCst);
        if self.delete_not_found.load(Ordering::SeqCst) {
            return Err(ClientError::JobNotFound(jid.to_string()));
        }
        Ok(())
    }
}

// =============================================================================
// Test environment
// =============================================================================

/// A service context over an in-memory store, local queues, filesystem
/// storage in a temporary directory and one fake compute resource `host`.
/// Tasks are not retried.
pub struct TestEnv {
    pub ctx: ServiceContext,
    pub store: Arc<MemoryStore>,
    pub queue: Arc<LocalTaskQueue>,
    pub compute: Arc<FakeComputeClient>,
    _dir: TempDir,
}

impl TestEnv {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryStore::new());
        let queue = Arc::new(LocalTaskQueue::standard());
        let compute = Arc::new(FakeComputeClient::default());
        let registry = ComputeRegistry::new().with("host", compute.clone());

        let ctx = ServiceContext::new(
            store.clone(),
            Arc::new(FilesystemStorage::new(dir.path())),
            Arc::new(registry),
            queue.clone(),
            Arc::new(TaskRegistry::standard(RetrySettings::none())),
        );

        Self {
            ctx,
            store,
            queue,
            compute,
            _dir: dir,
        }
    }

    /// Execute queued messages until the queue is drained
    pub async fn run_pending(&self, queue: &str) {
        while let Some(message) = self.queue.pop(queue) {
            execute(&self.ctx, message).await;
        }
    }

    pub async fn status_of(&self, id: Uuid) -> InstanceStatus {
        self.store.get_instance(id).await.unwrap().unwrap().status
    }

    pub fn add_plugin(&self, plugin: Plugin) -> Plugin {
        self.store.insert_plugin(plugin.clone());
        plugin
    }

    pub fn pipeline(&self, name: &str, owner: &str, locked: bool) -> Pipeline {
        let pipeline = Pipeline {
            id: Uuid::new_v4(),
            name: name.to_string(),
            owner: owner.to_string(),
            locked,
            description: String::new(),
            created_at: Utc::now(),
        };
        self.store.insert_pipeline(pipeline.clone());
        pipeline
    }

    pub fn piping(&self, pipeline: &Pipeline, plugin: &Plugin, previous: Option<&Piping>, title: &str) -> Piping {
        self.piping_with(pipeline, plugin, previous, title, vec![])
    }

    pub fn piping_with(
        &self,
        pipeline: &Pipeline,
        plugin: &Plugin,
        previous: Option<&Piping>,
        title: &str,
        defaults: Vec<PipingDefault>,
    ) -> Piping {
        let piping = Piping {
            id: Uuid::new_v4(),
            pipeline_id: pipeline.id,
            plugin_id: plugin.id,
            previous_id: previous.map(|p| p.id),
            title: title.to_string(),
            defaults,
        };
        self.store.insert_piping(piping.clone());
        piping
    }

    /// Root instance of a new feed owned by [`USER`]
    pub async fn fs_instance(&self, status: InstanceStatus) -> PluginInstance {
        let feed = Feed {
            id: Uuid::new_v4(),
            name: "feed".to_string(),
            creator: USER.to_string(),
            owners: vec![USER.to_string()],
            created_at: Utc::now(),
        };
        self.store.insert_feed(feed.clone());
        let plg = self.add_plugin(plugin("pl-dircopy", PluginType::Fs));

        let id = Uuid::new_v4();
        let output_path = format!("{}/{}_{}/data", feed.storage_prefix(), plg.name, id);
        self.insert_instance(id, &plg, None, feed.id, output_path, status, vec![])
            .await
    }

    pub async fn ds_instance(&self, previous: &PluginInstance, status: InstanceStatus) -> PluginInstance {
        let plg = self.add_plugin(plugin("pl-simpledsapp", PluginType::Ds));
        let id = Uuid::new_v4();
        let output_path = child_output_path(&previous.output_path, &plg.name, id);
        self.insert_instance(id, &plg, Some(previous), previous.feed_id, output_path, status, vec![])
            .await
    }

    /// `ts` instance below `previous` reading from `parents`
    pub async fn ts_instance(
        &self,
        previous: &PluginInstance,
        parents: &[&PluginInstance],
        filter: &str,
        status: InstanceStatus,
    ) -> (PluginInstance, Plugin) {
        let mut plg = plugin("pl-topologicalcopy", PluginType::Ts);
        plg.parameters = vec![
            plugin_param(PLUGIN_INSTANCES_PARAM, ParameterKind::String, None),
            plugin_param(FILTER_PARAM, ParameterKind::String, None),
        ];
        let plg = self.add_plugin(plg);

        let listed: Vec<String> = parents.iter().map(|p| p.id.to_string()).collect();
        let params = vec![
            ParameterInstance {
                plugin_param_id: plg.parameters[0].id,
                name: PLUGIN_INSTANCES_PARAM.to_string(),
                value: ParameterValue::String(listed.join(",")),
            },
            ParameterInstance {
                plugin_param_id: plg.parameters[1].id,
                name: FILTER_PARAM.to_string(),
                value: ParameterValue::String(filter.to_string()),
            },
        ];

        let id = Uuid::new_v4();
        let output_path = child_output_path(&previous.output_path, &plg.name, id);
        let inst = self
            .insert_instance(id, &plg, Some(previous), previous.feed_id, output_path, status, params)
            .await;
        (inst, plg)
    }

    #[allow(clippy::too_many_arguments)]
    async fn insert_instance(
        &self,
        id: Uuid,
        plugin: &Plugin,
        previous: Option<&PluginInstance>,
        feed_id: Uuid,
        output_path: String,
        status: InstanceStatus,
        parameters: Vec<ParameterInstance>,
    ) -> PluginInstance {
        let now = Utc::now();
        let submitted = matches!(
            status,
            InstanceStatus::Started
                | InstanceStatus::RegisteringFiles
                | InstanceStatus::FinishedSuccessfully
                | InstanceStatus::FinishedWithError
        );
        let instance = PluginInstance {
            id,
            title: plugin.name.clone(),
            owner: USER.to_string(),
            plugin_id: plugin.id,
            plugin_name: plugin.name.clone(),
            previous_id: previous.map(|p| p.id),
            feed_id,
            workflow_id: None,
            compute_resource: "host".to_string(),
            status,
            cpu_limit: plugin.min_cpu_limit,
            memory_limit: plugin.min_memory_limit,
            number_of_workers: plugin.min_number_of_workers,
            gpu_limit: plugin.min_gpu_limit,
            output_path,
            summary: serde_json::json!({}),
            error_code: None,
            error_detail: None,
            remote_job: if submitted {
                RemoteJobState::Submitted
            } else {
                RemoteJobState::None
            },
            created_at: now,
            start_date: submitted.then_some(now),
            end_date: status.is_terminal().then_some(now),
        };
        self.store
            .create_instance(NewInstance {
                instance: instance.clone(),
                parameters,
            })
            .await
            .unwrap();
        instance
    }
}
