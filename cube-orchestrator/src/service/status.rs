//! Plugin Instance Status Service
//!
//! The lifecycle of a single plugin instance:
//!
//! ```text
//! created → {waiting | scheduled} → started → registeringFiles → {finishedSuccessfully | finishedWithError}
//! ```
//!
//! with `cancelled` reachable from every non-terminal status. Every write is
//! a conditional update on the current status, so racing tasks converge.

use cube_compute::ClientError;
use cube_core::domain::plugin::PluginType;
use cube_core::domain::plugin_instance::{
    InstanceStatus, PLUGIN_INSTANCES_PARAM, PluginInstance, parse_instance_ids,
};
use cube_core::dto::compute::{JobStatusReport, RemotePhase};
use cube_storage::StorageError;
use serde_json::json;
use thiserror::Error;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::error_code;
use super::execution;
use crate::context::ServiceContext;
use crate::repository::StoreError;
use crate::tasks::{
    DELETE_PLUGIN_INSTANCE_JOB_FROM_REMOTE, QueueError, RUN_PLUGIN_INSTANCE, TaskArgs,
};

/// Number of trailing log characters kept in the job status summary
const SUMMARY_LOG_CHARS: usize = 3000;

#[derive(Debug, Error)]
pub enum StatusError {
    #[error("plugin instance {0} not found")]
    NotFound(Uuid),

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("plugin {0} not found")]
    PluginNotFound(Uuid),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("compute error: {0}")]
    Compute(#[from] ClientError),

    #[error("queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("invalid file filter: {0}")]
    Filter(#[from] regex::Error),
}

// =============================================================================
// Admission
// =============================================================================

/// Outcome of admitting an instance given the status of its parents
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Schedule,
    Wait,
    Cancel,
}

impl Admission {
    pub fn status(&self) -> InstanceStatus {
        match self {
            Admission::Schedule => InstanceStatus::Scheduled,
            Admission::Wait => InstanceStatus::Waiting,
            Admission::Cancel => InstanceStatus::Cancelled,
        }
    }
}

/// A failed parent dominates; any unfinished parent means wait.
/// No parents at all means the instance can run.
pub fn decide_admission(parents: &[InstanceStatus]) -> Admission {
    if parents.iter().any(InstanceStatus::is_failed) {
        Admission::Cancel
    } else if parents.iter().any(|s| !s.is_terminal()) {
        Admission::Wait
    } else {
        Admission::Schedule
    }
}

/// Admit a `created` or `waiting` instance: schedule it, keep it waiting or
/// cancel it depending on its parents. Returns the resulting status.
pub async fn admit(ctx: &ServiceContext, id: Uuid) -> Result<InstanceStatus, StatusError> {
    let inst = get_instance(ctx, id).await?;
    if !matches!(inst.status, InstanceStatus::Created | InstanceStatus::Waiting) {
        debug!("Plugin instance {} already admitted ({})", id, inst.status);
        return Ok(inst.status);
    }

    let parents = parent_statuses(ctx, &inst).await?;
    let admission = decide_admission(&parents);

    match admission {
        Admission::Schedule => {
            let from = [InstanceStatus::Created, InstanceStatus::Waiting];
            if ctx.store.transition(id, &from, InstanceStatus::Scheduled).await? {
                info!("Plugin instance {} scheduled", id);
                if let Err(e) = ctx.enqueue(RUN_PLUGIN_INSTANCE, TaskArgs::instance(id)).await {
                    // Back to waiting so the next sweep admits it again
                    ctx.store
                        .transition(id, &[InstanceStatus::Scheduled], InstanceStatus::Waiting)
                        .await?;
                    return Err(e.into());
                }
            }
        }
        Admission::Wait => {
            if ctx
                .store
                .transition(id, &[InstanceStatus::Created], InstanceStatus::Waiting)
                .await?
            {
                info!("Plugin instance {} waiting for its parents", id);
            }
        }
        Admission::Cancel => {
            let from = [InstanceStatus::Created, InstanceStatus::Waiting];
            if ctx.store.transition(id, &from, InstanceStatus::Cancelled).await? {
                info!("Plugin instance {} cancelled: a parent did not finish successfully", id);
            }
        }
    }

    current_status(ctx, id).await
}

/// Statuses of the instances `inst` depends on. A `ts` instance depends on
/// every instance listed in its `plugininstances` parameter; any other
/// instance on its `previous`. Missing parents count as cancelled.
pub async fn parent_statuses(
    ctx: &ServiceContext,
    inst: &PluginInstance,
) -> Result<Vec<InstanceStatus>, StatusError> {
    let mut parent_ids = Vec::new();

    let plugin = ctx
        .store
        .get_plugin(inst.plugin_id)
        .await?
        .ok_or(StatusError::PluginNotFound(inst.plugin_id))?;
    if plugin.plugin_type == PluginType::Ts {
        let params = ctx.store.get_parameters(inst.id).await?;
        let listed = params
            .iter()
            .find(|p| p.name == PLUGIN_INSTANCES_PARAM)
            .and_then(|p| p.value.as_str());
        if let Some(listed) = listed {
            match parse_instance_ids(listed) {
                Ok(ids) => parent_ids = ids,
                Err(bad) => {
                    warn!("Plugin instance {} lists an invalid parent id {}", inst.id, bad);
                    return Ok(vec![InstanceStatus::Cancelled]);
                }
            }
        }
    }
    if parent_ids.is_empty() {
        parent_ids.extend(inst.previous_id);
    }
    if parent_ids.is_empty() {
        return Ok(Vec::new());
    }

    let found = ctx.store.get_instances(&parent_ids).await?;
    Ok(parent_ids
        .iter()
        .map(|pid| {
            found
                .iter()
                .find(|p| p.id == *pid)
                .map_or(InstanceStatus::Cancelled, |p| p.status)
        })
        .collect())
}

// =============================================================================
// Cancellation
// =============================================================================

/// Cancel a `started` instance. Cancelling a cancelled instance is a no-op;
/// every other status is rejected.
pub async fn cancel(ctx: &ServiceContext, id: Uuid) -> Result<InstanceStatus, StatusError> {
    let inst = get_instance(ctx, id).await?;

    match inst.status {
        InstanceStatus::Cancelled => Ok(InstanceStatus::Cancelled),
        InstanceStatus::Started => {
            let jid = ctx.job_id(id);
            let remote = match ctx.compute.get(&inst.compute_resource) {
                Ok(client) => client.cancel(&jid).await,
                Err(e) => Err(e),
            };
            if let Err(e) = remote {
                warn!(
                    "[{},{}]: Error cancelling job at compute resource {}, detail: {}",
                    error_code::CANCEL_FAILED,
                    jid,
                    inst.compute_resource,
                    e
                );
                schedule_remote_deletion(ctx, &inst).await;
            }

            if ctx
                .store
                .transition(id, &InstanceStatus::NON_TERMINAL, InstanceStatus::Cancelled)
                .await?
            {
                info!("Plugin instance {} cancelled", id);
            }
            current_status(ctx, id).await
        }
        other => Err(StatusError::InvalidState(format!(
            "plugin instance {} can not be cancelled in status {}",
            id, other
        ))),
    }
}

// =============================================================================
// Status Check
// =============================================================================

/// Poll the compute resource for a `started` instance and advance its status.
/// A failed poll leaves the instance unchanged.
pub async fn check_status(ctx: &ServiceContext, id: Uuid) -> Result<InstanceStatus, StatusError> {
    let inst = get_instance(ctx, id).await?;
    if inst.status != InstanceStatus::Started {
        return Ok(inst.status);
    }

    let jid = ctx.job_id(id);
    let client = ctx.compute.get(&inst.compute_resource)?;
    let report = match client.poll(&jid).await {
        Ok(report) => report,
        Err(e) => {
            warn!(
                "[{},{}]: Error getting job status at compute resource {}, detail: {}",
                error_code::CHECK_FAILED,
                jid,
                inst.compute_resource,
                e
            );
            return Ok(inst.status);
        }
    };

    debug!("Job {} remote status = {:?}", jid, report.status);
    ctx.store
        .update_summary(id, &job_status_summary(Some(&report)))
        .await?;

    match report.status {
        RemotePhase::NotStarted | RemotePhase::Started => Ok(InstanceStatus::Started),
        RemotePhase::FinishedSuccessfully => complete(ctx, &inst).await,
        RemotePhase::FinishedWithError => {
            if ctx
                .store
                .transition(id, &[InstanceStatus::Started], InstanceStatus::FinishedWithError)
                .await?
            {
                info!("Plugin instance {} finished with error", id);
            }
            current_status(ctx, id).await
        }
        RemotePhase::Undefined => {
            error!(
                "[{},{}]: Got undefined status from remote",
                error_code::UNDEFINED_PHASE,
                jid
            );
            fail_instance(ctx, id, error_code::UNDEFINED_PHASE, "undefined remote job status")
                .await?;
            current_status(ctx, id).await
        }
    }
}

/// Register the outputs of a remotely finished instance inside its lock
async fn complete(ctx: &ServiceContext, inst: &PluginInstance) -> Result<InstanceStatus, StatusError> {
    let id = inst.id;
    if !ctx.store.acquire_lock(id).await? {
        debug!("Plugin instance {} is already registering files", id);
        return current_status(ctx, id).await;
    }

    let result = register_and_finish(ctx, inst).await;
    ctx.store.release_lock(id).await?;
    result?;

    current_status(ctx, id).await
}

async fn register_and_finish(ctx: &ServiceContext, inst: &PluginInstance) -> Result<(), StatusError> {
    let id = inst.id;
    if !ctx
        .store
        .transition(id, &[InstanceStatus::Started], InstanceStatus::RegisteringFiles)
        .await?
    {
        return Ok(());
    }
    info!("Registering output files of plugin instance {}", id);

    match execution::register_output_files(ctx, inst).await {
        Ok(count) => {
            if ctx
                .store
                .transition(
                    id,
                    &[InstanceStatus::RegisteringFiles],
                    InstanceStatus::FinishedSuccessfully,
                )
                .await?
            {
                info!(
                    "Plugin instance {} finished successfully ({} file(s) registered)",
                    id, count
                );
            }
        }
        Err(e) => {
            error!(
                "[{},{}]: Error registering output files, detail: {}",
                error_code::REGISTRATION_FAILED,
                ctx.job_id(id),
                e
            );
            fail_instance(ctx, id, error_code::REGISTRATION_FAILED, &e.to_string()).await?;
        }
    }
    Ok(())
}

// =============================================================================
// Failure Handling
// =============================================================================

/// Force a non-terminal instance to `cancelled`, recording why, and queue the
/// removal of its remote job. Returns whether the instance was cancelled.
pub async fn fail_instance(
    ctx: &ServiceContext,
    id: Uuid,
    code: &str,
    detail: &str,
) -> Result<bool, StatusError> {
    let Some(inst) = ctx.store.get_instance(id).await? else {
        return Ok(false);
    };
    if inst.status.is_terminal() {
        return Ok(false);
    }

    schedule_remote_deletion(ctx, &inst).await;

    let cancelled = ctx.store.force_cancel(id, code, detail).await?;
    if cancelled {
        warn!(
            "[{},{}]: Plugin instance {} cancelled, detail: {}",
            code,
            ctx.job_id(id),
            id,
            detail
        );
    }
    Ok(cancelled)
}

/// Queue a best-effort deletion of the instance's remote job
pub async fn schedule_remote_deletion(ctx: &ServiceContext, inst: &PluginInstance) {
    let args = TaskArgs::RemoteJob {
        instance_id: inst.id,
        compute_resource: inst.compute_resource.clone(),
    };
    if let Err(e) = ctx.enqueue(DELETE_PLUGIN_INSTANCE_JOB_FROM_REMOTE, args).await {
        error!(
            "Failed to queue remote deletion of job {}: {}",
            ctx.job_id(inst.id),
            e
        );
    }
}

// =============================================================================
// Helper Functions
// =============================================================================

async fn get_instance(ctx: &ServiceContext, id: Uuid) -> Result<PluginInstance, StatusError> {
    ctx.store
        .get_instance(id)
        .await?
        .ok_or(StatusError::NotFound(id))
}

async fn current_status(ctx: &ServiceContext, id: Uuid) -> Result<InstanceStatus, StatusError> {
    get_instance(ctx, id).await.map(|inst| inst.status)
}

/// Summary of the last job status reported by the compute resource
pub fn job_status_summary(report: Option<&JobStatusReport>) -> serde_json::Value {
    let (returned, job_status, job_logs) = match report {
        Some(report) => (
            report.status.is_finished() || report.status == RemotePhase::Undefined,
            serde_json::to_value(report.status).unwrap_or_default(),
            tail(&report.logs, SUMMARY_LOG_CHARS),
        ),
        None => (false, json!(""), String::new()),
    };

    json!({
        "pushPath": { "status": true },
        "pullPath": { "status": returned },
        "compute": {
            "submit": { "status": true },
            "return": {
                "status": returned,
                "job_status": job_status,
                "job_logs": job_logs,
            },
        },
    })
}

fn tail(s: &str, max_chars: usize) -> String {
    let count = s.chars().count();
    s.chars().skip(count.saturating_sub(max_chars)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tasks::{MAIN1_QUEUE, MAIN2_QUEUE};
    use crate::repository::Store;
    use crate::test_support::TestEnv;

    #[test]
    fn test_decide_admission() {
        use InstanceStatus::*;

        assert_eq!(decide_admission(&[]), Admission::Schedule);
        assert_eq!(decide_admission(&[FinishedSuccessfully]), Admission::Schedule);
        assert_eq!(decide_admission(&[Started]), Admission::Wait);
        assert_eq!(decide_admission(&[RegisteringFiles]), Admission::Wait);
        assert_eq!(decide_admission(&[FinishedWithError]), Admission::Cancel);
        assert_eq!(decide_admission(&[Cancelled]), Admission::Cancel);
        // A failed parent wins over an unfinished one
        assert_eq!(decide_admission(&[Waiting, Cancelled]), Admission::Cancel);
        assert_eq!(decide_admission(&[FinishedSuccessfully, Scheduled]), Admission::Wait);
    }

    #[tokio::test]
    async fn test_admit_without_previous_schedules_once() {
        let env = TestEnv::new();
        let fs = env.fs_instance(InstanceStatus::Created).await;

        assert_eq!(admit(&env.ctx, fs.id).await.unwrap(), InstanceStatus::Scheduled);

        let queued = env.queue.pending(MAIN1_QUEUE);
        assert_eq!(queued.len(), 1);
        assert_eq!(queued[0].name, RUN_PLUGIN_INSTANCE);
        assert_eq!(queued[0].args, TaskArgs::instance(fs.id));

        // A second admission finds it already scheduled
        assert_eq!(admit(&env.ctx, fs.id).await.unwrap(), InstanceStatus::Scheduled);
        assert_eq!(env.queue.len(MAIN1_QUEUE), 1);
    }

    #[tokio::test]
    async fn test_admit_after_failed_previous_cancels() {
        let env = TestEnv::new();
        let parent = env.fs_instance(InstanceStatus::FinishedWithError).await;
        let child = env.ds_instance(&parent, InstanceStatus::Created).await;

        assert_eq!(admit(&env.ctx, child.id).await.unwrap(), InstanceStatus::Cancelled);
        assert!(env.queue.is_empty());
    }

    #[tokio::test]
    async fn test_admit_waits_for_running_previous() {
        let env = TestEnv::new();
        let parent = env.fs_instance(InstanceStatus::Started).await;
        let child = env.ds_instance(&parent, InstanceStatus::Created).await;

        assert_eq!(admit(&env.ctx, child.id).await.unwrap(), InstanceStatus::Waiting);
        assert!(env.queue.is_empty());
    }

    #[tokio::test]
    async fn test_admit_ts_waits_for_every_parent() {
        let env = TestEnv::new();
        let a = env.fs_instance(InstanceStatus::FinishedSuccessfully).await;
        let b = env.ds_instance(&a, InstanceStatus::Started).await;
        let (ts, _) = env.ts_instance(&a, &[&a, &b], "", InstanceStatus::Created).await;

        assert_eq!(admit(&env.ctx, ts.id).await.unwrap(), InstanceStatus::Waiting);

        env.store
            .transition(b.id, &[InstanceStatus::Started], InstanceStatus::FinishedSuccessfully)
            .await
            .unwrap();
        assert_eq!(admit(&env.ctx, ts.id).await.unwrap(), InstanceStatus::Scheduled);
    }

    #[tokio::test]
    async fn test_admit_ts_cancelled_by_any_failed_parent() {
        let env = TestEnv::new();
        let a = env.fs_instance(InstanceStatus::FinishedSuccessfully).await;
        let b = env.ds_instance(&a, InstanceStatus::FinishedWithError).await;
        let c = env.ds_instance(&a, InstanceStatus::Started).await;
        let (ts, _) = env
            .ts_instance(&a, &[&a, &b, &c], "", InstanceStatus::Created)
            .await;

        assert_eq!(admit(&env.ctx, ts.id).await.unwrap(), InstanceStatus::Cancelled);
    }

    #[tokio::test]
    async fn test_admit_unknown_instance() {
        let env = TestEnv::new();
        let missing = Uuid::new_v4();
        assert!(matches!(
            admit(&env.ctx, missing).await,
            Err(StatusError::NotFound(id)) if id == missing
        ));
    }

    #[tokio::test]
    async fn test_double_cancel_calls_remote_once() {
        let env = TestEnv::new();
        let inst = env.fs_instance(InstanceStatus::Started).await;

        assert_eq!(cancel(&env.ctx, inst.id).await.unwrap(), InstanceStatus::Cancelled);
        assert_eq!(cancel(&env.ctx, inst.id).await.unwrap(), InstanceStatus::Cancelled);
        assert_eq!(env.compute.cancel_calls(), 1);
        assert!(env.queue.is_empty());
    }

    #[tokio::test]
    async fn test_cancel_survives_remote_failure() {
        let env = TestEnv::new();
        env.compute.fail_cancel();
        let inst = env.fs_instance(InstanceStatus::Started).await;

        assert_eq!(cancel(&env.ctx, inst.id).await.unwrap(), InstanceStatus::Cancelled);

        let queued = env.queue.pending(MAIN2_QUEUE);
        assert_eq!(queued.len(), 1);
        assert_eq!(queued[0].name, DELETE_PLUGIN_INSTANCE_JOB_FROM_REMOTE);
    }

    #[tokio::test]
    async fn test_cancel_rejected_outside_started() {
        let env = TestEnv::new();
        let inst = env.fs_instance(InstanceStatus::Scheduled).await;

        assert!(matches!(
            cancel(&env.ctx, inst.id).await,
            Err(StatusError::InvalidState(_))
        ));
        assert_eq!(env.status_of(inst.id).await, InstanceStatus::Scheduled);
    }

    #[tokio::test]
    async fn test_check_status_registers_output() {
        let env = TestEnv::new();
        let inst = env.fs_instance(InstanceStatus::Started).await;
        env.ctx
            .storage
            .upload(&format!("{}/out.txt", inst.output_path), b"out".to_vec())
            .await
            .unwrap();
        env.compute.set_phase(RemotePhase::FinishedSuccessfully);

        assert_eq!(
            check_status(&env.ctx, inst.id).await.unwrap(),
            InstanceStatus::FinishedSuccessfully
        );

        let stored = env.store.get_instance(inst.id).await.unwrap().unwrap();
        assert!(stored.end_date.is_some());
        assert_eq!(stored.summary["compute"]["return"]["status"], json!(true));
        assert_eq!(
            env.store.list_files(inst.id).await.unwrap(),
            vec![format!("{}/out.txt", inst.output_path)]
        );
        assert_eq!(env.store.lock_count(), 0);
    }

    #[tokio::test]
    async fn test_check_status_skips_when_locked() {
        let env = TestEnv::new();
        let inst = env.fs_instance(InstanceStatus::Started).await;
        env.compute.set_phase(RemotePhase::FinishedSuccessfully);
        env.store.acquire_lock(inst.id).await.unwrap();

        assert_eq!(check_status(&env.ctx, inst.id).await.unwrap(), InstanceStatus::Started);
        assert_eq!(env.store.lock_count(), 1);
    }

    #[tokio::test]
    async fn test_check_status_poll_failure_leaves_instance() {
        let env = TestEnv::new();
        let inst = env.fs_instance(InstanceStatus::Started).await;
        env.compute.fail_poll();

        assert_eq!(check_status(&env.ctx, inst.id).await.unwrap(), InstanceStatus::Started);
        assert_eq!(env.compute.poll_calls(), 1);
        assert!(env.queue.is_empty());
    }

    #[tokio::test]
    async fn test_check_status_finished_with_error() {
        let env = TestEnv::new();
        let inst = env.fs_instance(InstanceStatus::Started).await;
        env.compute.set_phase(RemotePhase::FinishedWithError);

        assert_eq!(
            check_status(&env.ctx, inst.id).await.unwrap(),
            InstanceStatus::FinishedWithError
        );
    }

    #[tokio::test]
    async fn test_check_status_undefined_phase() {
        let env = TestEnv::new();
        let inst = env.fs_instance(InstanceStatus::Started).await;
        env.compute.set_phase(RemotePhase::Undefined);

        assert_eq!(check_status(&env.ctx, inst.id).await.unwrap(), InstanceStatus::Cancelled);
        let stored = env.store.get_instance(inst.id).await.unwrap().unwrap();
        assert_eq!(stored.error_code.as_deref(), Some("CODE10"));
        assert_eq!(env.queue.pending(MAIN2_QUEUE)[0].name, DELETE_PLUGIN_INSTANCE_JOB_FROM_REMOTE);
    }

    #[tokio::test]
    async fn test_fail_instance_is_idempotent() {
        let env = TestEnv::new();
        let inst = env.fs_instance(InstanceStatus::Started).await;

        assert!(fail_instance(&env.ctx, inst.id, "CODE02", "poll failed").await.unwrap());
        assert!(!fail_instance(&env.ctx, inst.id, "CODE02", "poll failed").await.unwrap());

        let stored = env.store.get_instance(inst.id).await.unwrap().unwrap();
        assert_eq!(stored.status, InstanceStatus::Cancelled);
        assert_eq!(stored.error_code.as_deref(), Some("CODE02"));
        assert_eq!(env.queue.len(MAIN2_QUEUE), 1);
        assert_eq!(env.queue.pending(MAIN2_QUEUE)[0].name, DELETE_PLUGIN_INSTANCE_JOB_FROM_REMOTE);
    }

    #[test]
    fn test_summary_truncates_logs() {
        let report = JobStatusReport {
            jid: "chris-jid-1".to_string(),
            status: RemotePhase::Started,
            message: String::new(),
            logs: "x".repeat(SUMMARY_LOG_CHARS + 10),
        };
        let summary = job_status_summary(Some(&report));
        let logs = summary["compute"]["return"]["job_logs"].as_str().unwrap();
        assert_eq!(logs.len(), SUMMARY_LOG_CHARS);
        assert_eq!(summary["compute"]["return"]["job_status"], json!("started"));
        assert_eq!(summary["compute"]["return"]["status"], json!(false));
    }
}
