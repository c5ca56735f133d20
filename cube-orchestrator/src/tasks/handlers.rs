//! Task handlers
//!
//! Per-instance tasks delegate to the status and execution services. The
//! periodic sweepers re-scan the store and are safe to run concurrently with
//! the per-instance tasks, since every write they trigger is conditional.

use std::time::Duration;

use chrono::{DateTime, Utc};
use cube_core::domain::plugin_instance::{InstanceStatus, RemoteJobState};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::{
    CANCEL_PLUGIN_INSTANCE, CHECK_PLUGIN_INSTANCE_EXEC_STATUS,
    DELETE_PLUGIN_INSTANCE_JOB_FROM_REMOTE, DELETE_PLUGIN_INSTANCES_JOBS_FROM_REMOTE,
    RUN_PLUGIN_INSTANCE, TaskArgs, TaskError,
};
use crate::context::ServiceContext;
use crate::service::{error_code, execution, status};

fn instance_arg(task: &'static str, args: TaskArgs) -> Result<Uuid, TaskError> {
    match args {
        TaskArgs::Instance { instance_id } => Ok(instance_id),
        args => Err(TaskError::InvalidArgs { task, args }),
    }
}

/// Instant `age` ago
fn age_cutoff(age: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(age)
        .ok()
        .and_then(|age| Utc::now().checked_sub_signed(age))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

// =============================================================================
// Per-instance Tasks
// =============================================================================

pub async fn run_plugin_instance(ctx: ServiceContext, args: TaskArgs) -> Result<(), TaskError> {
    let id = instance_arg(RUN_PLUGIN_INSTANCE, args)?;
    execution::run(&ctx, id).await?;
    Ok(())
}

pub async fn check_plugin_instance_exec_status(
    ctx: ServiceContext,
    args: TaskArgs,
) -> Result<(), TaskError> {
    let id = instance_arg(CHECK_PLUGIN_INSTANCE_EXEC_STATUS, args)?;
    status::check_status(&ctx, id).await?;
    Ok(())
}

pub async fn cancel_plugin_instance(ctx: ServiceContext, args: TaskArgs) -> Result<(), TaskError> {
    let id = instance_arg(CANCEL_PLUGIN_INSTANCE, args)?;
    status::cancel(&ctx, id).await?;
    Ok(())
}

/// Remove a job from its compute resource. A job the compute resource no
/// longer knows counts as removed.
pub async fn delete_plugin_instance_job_from_remote(
    ctx: ServiceContext,
    args: TaskArgs,
) -> Result<(), TaskError> {
    let (instance_id, compute_resource) = match args {
        TaskArgs::RemoteJob {
            instance_id,
            compute_resource,
        } => (instance_id, compute_resource),
        args => {
            return Err(TaskError::InvalidArgs {
                task: DELETE_PLUGIN_INSTANCE_JOB_FROM_REMOTE,
                args,
            });
        }
    };

    let jid = ctx.job_id(instance_id);
    let client = ctx.compute.get(&compute_resource)?;
    match client.delete(&jid).await {
        Ok(()) => info!("Deleted job {} from compute resource {}", jid, compute_resource),
        Err(e) if e.is_not_found() => {
            debug!("Job {} already gone from compute resource {}", jid, compute_resource)
        }
        Err(e) => return Err(e.into()),
    }

    // The instance row may have been deleted in the meantime
    ctx.store
        .set_remote_job_state(instance_id, RemoteJobState::Deleted)
        .await?;
    Ok(())
}

// =============================================================================
// Startup Recovery
// =============================================================================

/// Queue a run for every `scheduled` instance.
///
/// Queues live in memory, so run tasks pending at shutdown are lost. Call
/// this before any worker starts: a run task already in flight could
/// otherwise submit the same job twice.
pub async fn requeue_scheduled_plugin_instances(ctx: &ServiceContext) -> Result<usize, TaskError> {
    let scheduled = ctx
        .store
        .list_instances_by_status(InstanceStatus::Scheduled)
        .await?;
    for inst in &scheduled {
        ctx.enqueue(RUN_PLUGIN_INSTANCE, TaskArgs::instance(inst.id))
            .await?;
    }
    Ok(scheduled.len())
}

// =============================================================================
// Periodic Sweepers
// =============================================================================

/// Re-admit every waiting instance
pub async fn schedule_waiting_plugin_instances(
    ctx: ServiceContext,
    _args: TaskArgs,
) -> Result<(), TaskError> {
    let waiting = ctx
        .store
        .list_instances_by_status(InstanceStatus::Waiting)
        .await?;
    if waiting.is_empty() {
        return Ok(());
    }
    debug!("Admitting {} waiting plugin instance(s)", waiting.len());

    let mut scheduled = 0;
    for inst in waiting {
        match status::admit(&ctx, inst.id).await {
            Ok(InstanceStatus::Scheduled) => scheduled += 1,
            Ok(_) => {}
            Err(e) => error!("Failed to admit plugin instance {}: {}", inst.id, e),
        }
    }
    if scheduled > 0 {
        info!("Scheduled {} waiting plugin instance(s)", scheduled);
    }
    Ok(())
}

/// Queue a status check for every started instance
pub async fn check_started_plugin_instances_exec_status(
    ctx: ServiceContext,
    _args: TaskArgs,
) -> Result<(), TaskError> {
    let started = ctx
        .store
        .list_instances_by_status(InstanceStatus::Started)
        .await?;
    for inst in &started {
        ctx.enqueue(CHECK_PLUGIN_INSTANCE_EXEC_STATUS, TaskArgs::instance(inst.id))
            .await?;
    }
    if !started.is_empty() {
        debug!("Queued status checks for {} started plugin instance(s)", started.len());
    }
    Ok(())
}

/// Cancel waiting instances that depend on a failed instance, including
/// any of the parents listed by a `ts` instance.
///
/// Each pass moves the failure one level down the tree.
pub async fn cancel_waiting_plugin_instances(
    ctx: ServiceContext,
    _args: TaskArgs,
) -> Result<(), TaskError> {
    let waiting = ctx
        .store
        .list_instances_by_status(InstanceStatus::Waiting)
        .await?;

    // Decide on a snapshot so a cancellation made in this pass does not
    // cascade further before the next one
    let mut doomed = Vec::new();
    for inst in &waiting {
        match status::parent_statuses(&ctx, inst).await {
            Ok(parents) if parents.iter().any(InstanceStatus::is_failed) => doomed.push(inst.id),
            Ok(_) => {}
            Err(e) => error!("Failed to read parents of plugin instance {}: {}", inst.id, e),
        }
    }

    let mut cancelled = 0;
    for id in doomed {
        if ctx
            .store
            .transition(id, &[InstanceStatus::Waiting], InstanceStatus::Cancelled)
            .await?
        {
            cancelled += 1;
        }
    }
    if cancelled > 0 {
        info!("Cancelled {} waiting plugin instance(s) after a failed parent", cancelled);
    }
    Ok(())
}

/// Cancel instances whose lock outlived the cutoff, then drop the lock
pub async fn cancel_plugin_instances_stuck_in_lock(
    ctx: ServiceContext,
    _args: TaskArgs,
) -> Result<(), TaskError> {
    let stuck = ctx
        .store
        .list_locks_older_than(age_cutoff(ctx.settings.stuck_lock_cutoff))
        .await?;

    for lock in stuck {
        warn!(
            "[{},{}]: Plugin instance {} stuck in lock since {}",
            error_code::STUCK_IN_LOCK,
            ctx.job_id(lock.instance_id),
            lock.instance_id,
            lock.start_date
        );
        if let Err(e) = status::fail_instance(
            &ctx,
            lock.instance_id,
            error_code::STUCK_IN_LOCK,
            "stuck in lock",
        )
        .await
        {
            error!("Failed to cancel plugin instance {}: {}", lock.instance_id, e);
            continue;
        }
        ctx.store.release_lock(lock.instance_id).await?;
    }
    Ok(())
}

/// Queue the remote deletion of finished jobs past the retention window
pub async fn delete_plugin_instances_jobs_from_remote(
    ctx: ServiceContext,
    _args: TaskArgs,
) -> Result<(), TaskError> {
    let candidates = ctx
        .store
        .list_remote_cleanup_candidates(age_cutoff(ctx.settings.remote_job_retention))
        .await?;
    if candidates.is_empty() {
        return Ok(());
    }

    for inst in &candidates {
        let args = TaskArgs::RemoteJob {
            instance_id: inst.id,
            compute_resource: inst.compute_resource.clone(),
        };
        ctx.enqueue(DELETE_PLUGIN_INSTANCE_JOB_FROM_REMOTE, args).await?;
    }
    info!(
        "{}: queued {} remote job deletion(s)",
        DELETE_PLUGIN_INSTANCES_JOBS_FROM_REMOTE,
        candidates.len()
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tasks::{MAIN1_QUEUE, MAIN2_QUEUE, TaskMessage, TaskOutcome, execute};
    use crate::repository::Store;
    use crate::test_support::TestEnv;
    use cube_core::dto::compute::RemotePhase;

    #[tokio::test]
    async fn test_waiting_child_scheduled_after_parent_finishes() {
        let env = TestEnv::new();
        let parent = env.fs_instance(InstanceStatus::Started).await;
        let child = env.ds_instance(&parent, InstanceStatus::Waiting).await;

        schedule_waiting_plugin_instances(env.ctx.clone(), TaskArgs::None).await.unwrap();
        assert_eq!(env.status_of(child.id).await, InstanceStatus::Waiting);

        env.store
            .transition(parent.id, &[InstanceStatus::Started], InstanceStatus::FinishedSuccessfully)
            .await
            .unwrap();
        schedule_waiting_plugin_instances(env.ctx.clone(), TaskArgs::None).await.unwrap();

        assert_eq!(env.status_of(child.id).await, InstanceStatus::Scheduled);
        assert_eq!(env.queue.pending(MAIN1_QUEUE)[0].args, TaskArgs::instance(child.id));
    }

    #[tokio::test]
    async fn test_cancel_waiting_moves_one_level_per_pass() {
        let env = TestEnv::new();
        let root = env.fs_instance(InstanceStatus::FinishedWithError).await;
        let child = env.ds_instance(&root, InstanceStatus::Waiting).await;
        let grandchild = env.ds_instance(&child, InstanceStatus::Waiting).await;

        cancel_waiting_plugin_instances(env.ctx.clone(), TaskArgs::None).await.unwrap();
        assert_eq!(env.status_of(child.id).await, InstanceStatus::Cancelled);
        assert_eq!(env.status_of(grandchild.id).await, InstanceStatus::Waiting);

        cancel_waiting_plugin_instances(env.ctx.clone(), TaskArgs::None).await.unwrap();
        assert_eq!(env.status_of(grandchild.id).await, InstanceStatus::Cancelled);
    }

    #[tokio::test]
    async fn test_cancel_waiting_follows_ts_parents() {
        let env = TestEnv::new();
        let root = env.fs_instance(InstanceStatus::FinishedSuccessfully).await;
        let ok = env.ds_instance(&root, InstanceStatus::Started).await;
        let broken = env.ds_instance(&root, InstanceStatus::FinishedWithError).await;
        let (join, _) = env
            .ts_instance(&root, &[&ok, &broken], "", InstanceStatus::Waiting)
            .await;
        let (pending_join, _) = env
            .ts_instance(&root, &[&ok], "", InstanceStatus::Waiting)
            .await;

        cancel_waiting_plugin_instances(env.ctx.clone(), TaskArgs::None).await.unwrap();

        assert_eq!(env.status_of(join.id).await, InstanceStatus::Cancelled);
        assert_eq!(env.status_of(pending_join.id).await, InstanceStatus::Waiting);
        assert!(env.queue.is_empty());
    }

    #[tokio::test]
    async fn test_requeue_scheduled_after_restart() {
        let env = TestEnv::new();
        let inst = env.fs_instance(InstanceStatus::Scheduled).await;
        env.fs_instance(InstanceStatus::Waiting).await;
        env.fs_instance(InstanceStatus::Started).await;

        // Nothing in the queues still refers to the scheduled instance
        assert!(env.queue.is_empty());

        let requeued = requeue_scheduled_plugin_instances(&env.ctx).await.unwrap();
        assert_eq!(requeued, 1);
        let queued = env.queue.pending(MAIN1_QUEUE);
        assert_eq!(queued.len(), 1);
        assert_eq!(queued[0].name, RUN_PLUGIN_INSTANCE);
        assert_eq!(queued[0].args, TaskArgs::instance(inst.id));

        env.run_pending(MAIN1_QUEUE).await;
        assert_eq!(env.status_of(inst.id).await, InstanceStatus::Started);
        assert_eq!(env.compute.submit_calls(), 1);
    }

    #[tokio::test]
    async fn test_check_started_queues_checks() {
        let env = TestEnv::new();
        let a = env.fs_instance(InstanceStatus::Started).await;
        env.fs_instance(InstanceStatus::Waiting).await;

        check_started_plugin_instances_exec_status(env.ctx.clone(), TaskArgs::None)
            .await
            .unwrap();

        let queued = env.queue.pending(MAIN2_QUEUE);
        assert_eq!(queued.len(), 1);
        assert_eq!(queued[0].name, CHECK_PLUGIN_INSTANCE_EXEC_STATUS);
        assert_eq!(queued[0].args, TaskArgs::instance(a.id));
    }

    #[tokio::test]
    async fn test_stuck_lock_is_cancelled_and_released() {
        let env = TestEnv::new();
        let inst = env.fs_instance(InstanceStatus::RegisteringFiles).await;
        env.store
            .insert_lock_at(inst.id, Utc::now() - chrono::Duration::hours(5));
        let fresh = env.fs_instance(InstanceStatus::RegisteringFiles).await;
        env.store.acquire_lock(fresh.id).await.unwrap();

        cancel_plugin_instances_stuck_in_lock(env.ctx.clone(), TaskArgs::None)
            .await
            .unwrap();

        let stored = env.store.get_instance(inst.id).await.unwrap().unwrap();
        assert_eq!(stored.status, InstanceStatus::Cancelled);
        assert_eq!(stored.error_code.as_deref(), Some("CODE12"));
        assert_eq!(env.status_of(fresh.id).await, InstanceStatus::RegisteringFiles);
        assert_eq!(env.store.lock_count(), 1);
    }

    #[tokio::test]
    async fn test_remote_cleanup_marks_deleted() {
        let env = TestEnv::new();
        let old = env.fs_instance(InstanceStatus::FinishedSuccessfully).await;
        env.store
            .set_end_date(old.id, Utc::now() - chrono::Duration::hours(2));
        let recent = env.fs_instance(InstanceStatus::FinishedSuccessfully).await;

        delete_plugin_instances_jobs_from_remote(env.ctx.clone(), TaskArgs::None)
            .await
            .unwrap();
        let queued = env.queue.pending(MAIN2_QUEUE);
        assert_eq!(queued.len(), 1);
        assert_eq!(queued[0].args.instance_id(), Some(old.id));

        env.run_pending(MAIN2_QUEUE).await;
        assert_eq!(env.compute.delete_calls(), 1);
        let stored = env.store.get_instance(old.id).await.unwrap().unwrap();
        assert_eq!(stored.remote_job, RemoteJobState::Deleted);
        let untouched = env.store.get_instance(recent.id).await.unwrap().unwrap();
        assert_eq!(untouched.remote_job, RemoteJobState::Submitted);

        // Nothing left to collect
        delete_plugin_instances_jobs_from_remote(env.ctx.clone(), TaskArgs::None)
            .await
            .unwrap();
        assert!(env.queue.is_empty());
    }

    #[tokio::test]
    async fn test_remote_delete_of_missing_job_succeeds() {
        let env = TestEnv::new();
        env.compute.fail_delete_not_found();
        let args = TaskArgs::RemoteJob {
            instance_id: Uuid::new_v4(),
            compute_resource: "host".to_string(),
        };

        delete_plugin_instance_job_from_remote(env.ctx.clone(), args)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_wrong_args_rejected() {
        let env = TestEnv::new();
        let err = run_plugin_instance(env.ctx.clone(), TaskArgs::None).await.unwrap_err();
        assert!(matches!(err, TaskError::InvalidArgs { task: RUN_PLUGIN_INSTANCE, .. }));
    }

    #[tokio::test]
    async fn test_failed_run_cancels_instance() {
        let env = TestEnv::new();
        env.compute.fail_submit();
        let inst = env.fs_instance(InstanceStatus::Scheduled).await;

        let outcome = execute(
            &env.ctx,
            TaskMessage::new(RUN_PLUGIN_INSTANCE, TaskArgs::instance(inst.id)),
        )
        .await;
        assert_eq!(outcome, TaskOutcome::Failed);

        let stored = env.store.get_instance(inst.id).await.unwrap().unwrap();
        assert_eq!(stored.status, InstanceStatus::Cancelled);
        assert_eq!(stored.error_code.as_deref(), Some("CODE01"));
        let queued = env.queue.pending(MAIN2_QUEUE);
        assert_eq!(queued.len(), 1);
        assert_eq!(queued[0].name, DELETE_PLUGIN_INSTANCE_JOB_FROM_REMOTE);

        // A late duplicate delivery changes nothing
        let outcome = execute(
            &env.ctx,
            TaskMessage::new(RUN_PLUGIN_INSTANCE, TaskArgs::instance(inst.id)),
        )
        .await;
        assert_eq!(outcome, TaskOutcome::Completed);
        assert_eq!(env.status_of(inst.id).await, InstanceStatus::Cancelled);
        assert_eq!(env.queue.len(MAIN2_QUEUE), 1);
    }

    #[tokio::test]
    async fn test_full_lifecycle_through_queues() {
        let env = TestEnv::new();
        let inst = env.fs_instance(InstanceStatus::Created).await;
        env.ctx
            .storage
            .upload(&format!("{}/result.json", inst.output_path), b"{}".to_vec())
            .await
            .unwrap();

        status::admit(&env.ctx, inst.id).await.unwrap();
        env.run_pending(MAIN1_QUEUE).await;
        assert_eq!(env.status_of(inst.id).await, InstanceStatus::Started);

        env.compute.set_phase(RemotePhase::FinishedSuccessfully);
        check_started_plugin_instances_exec_status(env.ctx.clone(), TaskArgs::None)
            .await
            .unwrap();
        env.run_pending(MAIN2_QUEUE).await;

        assert_eq!(env.status_of(inst.id).await, InstanceStatus::FinishedSuccessfully);
        assert_eq!(env.store.list_files(inst.id).await.unwrap().len(), 1);
    }
}
