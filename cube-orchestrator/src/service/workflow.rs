//! Workflow Service
//!
//! Instantiates a pipeline on top of an existing plugin instance. The whole
//! tree is validated and built in memory first, then persisted in one
//! transaction; `run` tasks are only queued after the commit.

use std::collections::{HashMap, HashSet};

use chrono::Utc;
use cube_core::dag::{PipingTree, TreeError};
use cube_core::domain::parameter::ParameterValue;
use cube_core::domain::pipeline::Piping;
use cube_core::domain::plugin::{Plugin, PluginType};
use cube_core::domain::plugin_instance::{
    InstanceStatus, PLUGIN_INSTANCES_PARAM, ParameterInstance, PluginInstance, RemoteJobState,
};
use cube_core::domain::workflow::{Workflow, WorkflowJobCounts};
use cube_core::dto::workflow::{CreateWorkflow, NodeOverride};
use cube_storage::StorageError;
use serde_json::json;
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

use super::parameters;
use super::plugin_instance::collect_descendants;
use super::status::{self, decide_admission};
use crate::context::ServiceContext;
use crate::repository::{NewInstance, StoreError};
use crate::tasks::{QueueError, RUN_PLUGIN_INSTANCE, TaskArgs};

#[derive(Debug, Error)]
pub enum WorkflowError {
    #[error("{field}: {message}")]
    Validation { field: &'static str, message: String },

    #[error("pipeline {0} not found")]
    PipelineNotFound(Uuid),

    #[error("workflow {0} not found")]
    WorkflowNotFound(Uuid),

    #[error("plugin {0} not found")]
    PluginNotFound(Uuid),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("invalid pipeline: {0}")]
    Tree(#[from] TreeError),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("queue error: {0}")]
    Queue(#[from] QueueError),
}

impl WorkflowError {
    pub fn validation(field: &'static str, message: impl Into<String>) -> Self {
        Self::Validation {
            field,
            message: message.into(),
        }
    }
}

const PREVIOUS_FIELD: &str = "previous_plugin_inst_id";
const NODES_FIELD: &str = "nodes_info";

// =============================================================================
// Instantiation
// =============================================================================

/// Create a workflow and one plugin instance per piping of the pipeline.
///
/// Nothing is persisted unless every node validates.
pub async fn instantiate(
    ctx: &ServiceContext,
    user: &str,
    req: CreateWorkflow,
) -> Result<Workflow, WorkflowError> {
    let previous = ctx
        .store
        .get_instance(req.previous_plugin_inst_id)
        .await?
        .ok_or_else(|| {
            WorkflowError::validation(
                PREVIOUS_FIELD,
                format!(
                    "Couldn't find any 'previous' plugin instance with id {}.",
                    req.previous_plugin_inst_id
                ),
            )
        })?;
    let feed = ctx.store.get_feed(previous.feed_id).await?;
    if !feed.is_some_and(|f| f.is_owned_by(user)) {
        return Err(WorkflowError::validation(
            PREVIOUS_FIELD,
            format!(
                "User is not an owner of feed for previous instance with id {}.",
                previous.id
            ),
        ));
    }

    let pipeline = ctx
        .store
        .get_pipeline(req.pipeline_id)
        .await?
        .ok_or(WorkflowError::PipelineNotFound(req.pipeline_id))?;
    if !pipeline.is_accessible_by(user) {
        return Err(WorkflowError::PermissionDenied(format!(
            "pipeline {} is locked",
            pipeline.id
        )));
    }

    let tree = PipingTree::build(ctx.store.list_pipings(pipeline.id).await?)?;
    let overrides = index_overrides(&tree, &req.nodes_info)?;

    // Instance ids are assigned up front so `ts` nodes can reference them
    let instance_ids: HashMap<Uuid, Uuid> = tree.bfs().map(|p| (p.id, Uuid::new_v4())).collect();

    let workflow_id = Uuid::new_v4();
    let mut plugins: HashMap<Uuid, Plugin> = HashMap::new();
    let mut titles: HashSet<String> = HashSet::new();
    let mut outputs: HashMap<Uuid, String> = HashMap::new();
    let mut batch = Vec::with_capacity(tree.len());

    // First pass: build every node, so `ts` nodes may list pipings that
    // come later in the walk
    for piping in tree.bfs() {
        let node = overrides.get(&piping.id).copied();

        if !plugins.contains_key(&piping.plugin_id) {
            let plugin = ctx
                .store
                .get_plugin(piping.plugin_id)
                .await?
                .ok_or(WorkflowError::PluginNotFound(piping.plugin_id))?;
            plugins.insert(plugin.id, plugin);
        }
        let plugin = &plugins[&piping.plugin_id];
        if plugin.plugin_type == PluginType::Fs {
            return Err(WorkflowError::validation(
                NODES_FIELD,
                format!(
                    "Piping with id {} uses fs plugin {}, which can not run inside a workflow",
                    piping.id, plugin.name
                ),
            ));
        }

        let title = node
            .and_then(|n| n.title.clone())
            .unwrap_or_else(|| piping.title.clone());
        if !titles.insert(title.clone()) {
            return Err(WorkflowError::validation(
                NODES_FIELD,
                format!("Workflow tree can not contain duplicated title: {}", title),
            ));
        }

        let compute_resource = pick_compute_resource(ctx, plugin, piping, node)?;

        let given = node.map_or(&[][..], |n| n.plugin_parameter_defaults.as_slice());
        let mut params = parameters::resolve(ctx, user, plugin, piping, given).await?;
        if plugin.plugin_type == PluginType::Ts {
            remap_plugin_instances(&mut params, piping, &instance_ids)?;
        }

        let id = instance_ids[&piping.id];
        let parent_id = piping
            .previous_id
            .map_or(previous.id, |pid| instance_ids[&pid]);
        let parent_output = outputs
            .get(&parent_id)
            .map_or(previous.output_path.as_str(), String::as_str);
        let output_path = child_output_path(parent_output, &plugin.name, id);
        outputs.insert(id, output_path.clone());

        let instance = PluginInstance {
            id,
            title,
            owner: user.to_string(),
            plugin_id: plugin.id,
            plugin_name: plugin.name.clone(),
            previous_id: Some(parent_id),
            feed_id: previous.feed_id,
            workflow_id: Some(workflow_id),
            compute_resource,
            status: InstanceStatus::Created,
            cpu_limit: plugin.min_cpu_limit,
            memory_limit: plugin.min_memory_limit,
            number_of_workers: plugin.min_number_of_workers,
            gpu_limit: plugin.min_gpu_limit,
            output_path,
            summary: json!({}),
            error_code: None,
            error_detail: None,
            remote_job: RemoteJobState::None,
            created_at: Utc::now(),
            start_date: None,
            end_date: None,
        };
        batch.push(NewInstance {
            instance,
            parameters: params,
        });
    }

    // Second pass: admit in breadth-first order. A node not admitted yet
    // still counts as `created`.
    let mut planned: HashMap<Uuid, InstanceStatus> = batch
        .iter()
        .map(|n| (n.instance.id, InstanceStatus::Created))
        .collect();
    planned.insert(previous.id, previous.status);
    for new in &mut batch {
        let is_ts = plugins[&new.instance.plugin_id].plugin_type == PluginType::Ts;
        let status = plan_status(ctx, is_ts, &new.parameters, &new.instance, &planned).await?;
        new.instance.status = status;
        if status == InstanceStatus::Cancelled {
            new.instance.end_date = Some(new.instance.created_at);
        }
        planned.insert(new.instance.id, status);
    }

    let workflow = Workflow {
        id: workflow_id,
        title: req.title.unwrap_or_else(|| pipeline.name.clone()),
        pipeline_id: pipeline.id,
        owner: user.to_string(),
        previous_instance_id: previous.id,
        instance_ids: batch.iter().map(|n| n.instance.id).collect(),
        created_at: Utc::now(),
    };
    let scheduled: Vec<Uuid> = batch
        .iter()
        .filter(|n| n.instance.status == InstanceStatus::Scheduled)
        .map(|n| n.instance.id)
        .collect();

    ctx.store.create_workflow(&workflow, batch).await?;
    info!(
        "Created workflow {} with {} plugin instance(s) from pipeline {}",
        workflow.id,
        workflow.instance_ids.len(),
        pipeline.id
    );

    for id in scheduled {
        if let Err(e) = ctx.enqueue(RUN_PLUGIN_INSTANCE, TaskArgs::instance(id)).await {
            // The waiting sweep will admit it again
            warn!("Failed to queue run of plugin instance {}: {}", id, e);
            ctx.store
                .transition(id, &[InstanceStatus::Scheduled], InstanceStatus::Waiting)
                .await?;
        }
    }

    Ok(workflow)
}

/// Index the caller's node overrides by piping, rejecting unknown pipings
fn index_overrides<'a>(
    tree: &PipingTree,
    nodes: &'a [NodeOverride],
) -> Result<HashMap<Uuid, &'a NodeOverride>, WorkflowError> {
    let mut by_piping = HashMap::with_capacity(nodes.len());
    for node in nodes {
        if !tree.contains(node.piping_id) {
            return Err(WorkflowError::validation(
                NODES_FIELD,
                format!("Piping with id {} is not part of the pipeline", node.piping_id),
            ));
        }
        if by_piping.insert(node.piping_id, node).is_some() {
            return Err(WorkflowError::validation(
                NODES_FIELD,
                format!("Piping with id {} is given more than once", node.piping_id),
            ));
        }
    }
    Ok(by_piping)
}

fn pick_compute_resource(
    ctx: &ServiceContext,
    plugin: &Plugin,
    piping: &Piping,
    node: Option<&NodeOverride>,
) -> Result<String, WorkflowError> {
    if let Some(name) = node.and_then(|n| n.compute_resource_name.as_deref()) {
        if !plugin.supports_compute_resource(name) || !ctx.compute.contains(name) {
            return Err(WorkflowError::validation(
                NODES_FIELD,
                format!(
                    "Plugin for piping with id {} has not been registered with a compute resource named {}",
                    piping.id, name
                ),
            ));
        }
        return Ok(name.to_string());
    }

    plugin
        .default_compute_resource()
        .map(String::from)
        .ok_or_else(|| {
            WorkflowError::validation(
                NODES_FIELD,
                format!(
                    "Plugin {} for piping with id {} is not registered with any compute resource",
                    plugin.name, piping.id
                ),
            )
        })
}

/// Rewrite the piping ids listed in a `ts` node's `plugininstances`
/// parameter into the ids of the instances created for those pipings
fn remap_plugin_instances(
    params: &mut [ParameterInstance],
    piping: &Piping,
    instance_ids: &HashMap<Uuid, Uuid>,
) -> Result<(), WorkflowError> {
    let Some(param) = params.iter_mut().find(|p| p.name == PLUGIN_INSTANCES_PARAM) else {
        return Ok(());
    };
    let Some(listed) = param.value.as_str() else {
        return Ok(());
    };

    let mut remapped = Vec::new();
    for entry in listed.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        let target = Uuid::parse_str(entry)
            .ok()
            .and_then(|piping_id| instance_ids.get(&piping_id));
        let Some(target) = target else {
            return Err(WorkflowError::validation(
                NODES_FIELD,
                format!(
                    "Parameter '{}' of piping with id {} references {}, which is not a piping of the pipeline",
                    PLUGIN_INSTANCES_PARAM, piping.id, entry
                ),
            ));
        };
        remapped.push(target.to_string());
    }
    param.value = ParameterValue::String(remapped.join(","));
    Ok(())
}

/// Admission of a node computed from the planned status of its parents
async fn plan_status(
    ctx: &ServiceContext,
    is_ts: bool,
    params: &[ParameterInstance],
    instance: &PluginInstance,
    planned: &HashMap<Uuid, InstanceStatus>,
) -> Result<InstanceStatus, WorkflowError> {
    let listed: Vec<Uuid> = if is_ts {
        params
            .iter()
            .find(|p| p.name == PLUGIN_INSTANCES_PARAM)
            .and_then(|p| p.value.as_str())
            .map(|s| s.split(',').filter_map(|e| Uuid::parse_str(e.trim()).ok()).collect())
            .unwrap_or_default()
    } else {
        Vec::new()
    };
    let ids = if listed.is_empty() {
        instance.previous_id.into_iter().collect()
    } else {
        listed
    };

    let mut parents = Vec::with_capacity(ids.len());
    for id in ids {
        let status = match planned.get(&id) {
            Some(status) => *status,
            None => ctx
                .store
                .get_instance(id)
                .await?
                .map_or(InstanceStatus::Cancelled, |i| i.status),
        };
        parents.push(status);
    }

    Ok(decide_admission(&parents).status())
}

/// Output path of a new instance below its parent's
pub fn child_output_path(parent_output: &str, plugin_name: &str, id: Uuid) -> String {
    let parent = parent_output.trim_end_matches('/');
    let base = parent.strip_suffix("/data").unwrap_or(parent);
    format!("{}/{}_{}/data", base, plugin_name, id)
}

// =============================================================================
// Queries and Deletion
// =============================================================================

pub async fn workflow_status_counts(
    ctx: &ServiceContext,
    id: Uuid,
) -> Result<WorkflowJobCounts, WorkflowError> {
    let workflow = ctx
        .store
        .get_workflow(id)
        .await?
        .ok_or(WorkflowError::WorkflowNotFound(id))?;
    let instances = ctx.store.get_instances(&workflow.instance_ids).await?;
    Ok(instances.into_iter().map(|i| i.status).collect())
}

/// Delete a workflow together with the instances it created that the user
/// owns, and their descendants
pub async fn delete_workflow(ctx: &ServiceContext, user: &str, id: Uuid) -> Result<(), WorkflowError> {
    let workflow = ctx
        .store
        .get_workflow(id)
        .await?
        .ok_or(WorkflowError::WorkflowNotFound(id))?;
    if workflow.owner != user {
        return Err(WorkflowError::PermissionDenied(format!(
            "user {} does not own workflow {}",
            user, id
        )));
    }

    let mut doomed: Vec<PluginInstance> = Vec::new();
    let owned = ctx.store.get_instances(&workflow.instance_ids).await?;
    for inst in owned.iter().filter(|i| i.owner == user) {
        if doomed.iter().any(|d| d.id == inst.id) {
            continue;
        }
        for desc in collect_descendants(ctx, inst.id).await? {
            if !doomed.iter().any(|d| d.id == desc.id) {
                doomed.push(desc);
            }
        }
    }

    for inst in doomed.iter().filter(|i| i.remote_job == RemoteJobState::Submitted) {
        status::schedule_remote_deletion(ctx, inst).await;
    }

    let ids: Vec<Uuid> = doomed.iter().map(|i| i.id).collect();
    ctx.store.delete_workflow(id, &ids).await?;
    info!(
        "Deleted workflow {} and {} plugin instance(s)",
        id,
        ids.len()
    );
    Ok(())
}
