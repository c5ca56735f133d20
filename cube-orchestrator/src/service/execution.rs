//! Job submission and output registration
//!
//! Turns a scheduled plugin instance into a [`JobDescriptor`] for its
//! compute resource, and registers the files a finished job left in storage.

use cube_core::domain::parameter::{ParameterKind, ParameterValue};
use cube_core::domain::plugin::{ParameterAction, Plugin, PluginType};
use cube_core::domain::plugin_instance::{
    FILTER_PARAM, InstanceStatus, PLUGIN_INSTANCES_PARAM, ParameterInstance, PluginInstance,
    RemoteJobState, parse_instance_ids,
};
use cube_core::dto::compute::JobDescriptor;
use cube_storage::{is_under, rebase};
use regex::Regex;
use tracing::{error, info, warn};
use uuid::Uuid;

use super::status::{self, StatusError};
use crate::context::ServiceContext;

/// Placeholder input directory handed to plugins that read no input
pub const EMPTY_INPUT_DIR: &str = "data/squashEmptyDir";
const EMPTY_INPUT_FILE: &str = "squashEmptyDir.txt";
const EMPTY_INPUT_MESSAGE: &str = "Empty input dir.";

// =============================================================================
// Submission
// =============================================================================

/// Submit the job of a `scheduled` instance and mark it `started`.
/// Instances in any other status are left alone.
pub async fn run(ctx: &ServiceContext, id: Uuid) -> Result<InstanceStatus, StatusError> {
    let inst = ctx
        .store
        .get_instance(id)
        .await?
        .ok_or(StatusError::NotFound(id))?;
    if inst.status != InstanceStatus::Scheduled {
        info!("Plugin instance {} is {}, not submitting", id, inst.status);
        return Ok(inst.status);
    }

    let plugin = ctx
        .store
        .get_plugin(inst.plugin_id)
        .await?
        .ok_or(StatusError::PluginNotFound(inst.plugin_id))?;
    let params = ctx.store.get_parameters(id).await?;

    let job = build_job_descriptor(ctx, &inst, &plugin, &params).await?;
    let client = ctx.compute.get(&inst.compute_resource)?;

    // A submission recorded earlier means a previous attempt may have been
    // accepted before its status write failed
    let accepted = inst.remote_job == RemoteJobState::Submitted
        && match client.poll(&job.jid).await {
            Ok(_) => true,
            Err(e) if e.is_not_found() => false,
            Err(e) => return Err(e.into()),
        };
    if accepted {
        info!(
            "Job {} already accepted by compute resource {}, not resubmitting",
            job.jid, inst.compute_resource
        );
    } else {
        ctx.store
            .set_remote_job_state(id, RemoteJobState::Submitted)
            .await?;
        info!(
            "Submitting job {} to compute resource {}",
            job.jid, inst.compute_resource
        );
        client.submit(&job).await?;
    }

    if ctx
        .store
        .mark_started(id, &status::job_status_summary(None))
        .await?
    {
        info!("Successfully submitted job {}", job.jid);
        Ok(InstanceStatus::Started)
    } else {
        // Cancelled while the submission was in flight
        warn!(
            "Plugin instance {} changed status during submission of job {}",
            id, job.jid
        );
        status::schedule_remote_deletion(ctx, &inst).await;
        let current = ctx
            .store
            .get_instance(id)
            .await?
            .map_or(InstanceStatus::Cancelled, |i| i.status);
        Ok(current)
    }
}

/// Assemble everything the compute resource needs to run the instance
pub async fn build_job_descriptor(
    ctx: &ServiceContext,
    inst: &PluginInstance,
    plugin: &Plugin,
    params: &[ParameterInstance],
) -> Result<JobDescriptor, StatusError> {
    let mut input_dirs = Vec::new();
    match plugin.plugin_type {
        PluginType::Ds => {
            let previous = match inst.previous_id {
                Some(pid) => ctx.store.get_instance(pid).await?,
                None => None,
            };
            let previous = previous.ok_or_else(|| {
                StatusError::InvalidState(format!(
                    "ds plugin instance {} has no previous instance",
                    inst.id
                ))
            })?;
            input_dirs.push(previous.output_path);
        }
        PluginType::Fs | PluginType::Ts => {
            input_dirs.push(empty_input_dir(ctx, inst.id).await);
        }
    }

    let mut unextpath_flags = Vec::new();
    let mut path_flags = Vec::new();
    for p in params {
        let Some(decl) = plugin.parameter(&p.name) else {
            continue;
        };
        match decl.kind {
            ParameterKind::Path => {
                path_flags.push(decl.flag.clone());
                input_dirs.extend(p.value.paths().into_iter().map(String::from));
            }
            ParameterKind::Unextpath => unextpath_flags.push(decl.flag.clone()),
            _ => {}
        }
    }
    unextpath_flags.extend(path_flags);

    Ok(JobDescriptor {
        jid: ctx.job_id(inst.id),
        args: cmd_args(plugin, params),
        args_path_flags: unextpath_flags.join(","),
        auid: inst.owner.clone(),
        number_of_workers: inst.number_of_workers,
        cpu_limit: inst.cpu_limit,
        memory_limit: inst.memory_limit,
        gpu_limit: inst.gpu_limit,
        image: plugin.dock_image.clone(),
        entrypoint: plugin.entrypoint(),
        plugin_type: plugin.plugin_type,
        input_dirs,
        output_dir: inst.output_path.clone(),
    })
}

/// Command line arguments of the plugin app
pub fn cmd_args(plugin: &Plugin, params: &[ParameterInstance]) -> Vec<String> {
    let mut args = vec!["--saveinputmeta".to_string(), "--saveoutputmeta".to_string()];

    for p in params {
        let Some(decl) = plugin.parameter(&p.name) else {
            continue;
        };
        match decl.action {
            ParameterAction::Store => {
                args.push(decl.flag.clone());
                match &p.value {
                    ParameterValue::String(s) if s.is_empty() => args.push("''".to_string()),
                    value => args.push(value.to_cli_string()),
                }
            }
            ParameterAction::StoreTrue => {
                if p.value.as_bool() == Some(true) {
                    args.push(decl.flag.clone());
                }
            }
            ParameterAction::StoreFalse => {
                if p.value.as_bool() == Some(false) {
                    args.push(decl.flag.clone());
                }
            }
        }
    }

    args
}

/// Make sure the placeholder input directory holds its marker file.
/// Upload failures are only logged; the directory is returned regardless.
async fn empty_input_dir(ctx: &ServiceContext, id: Uuid) -> String {
    let marker = format!("{}/{}", EMPTY_INPUT_DIR, EMPTY_INPUT_FILE);
    let result = match ctx.storage.obj_exists(&marker).await {
        Ok(true) => Ok(()),
        Ok(false) => {
            ctx.storage
                .upload(&marker, EMPTY_INPUT_MESSAGE.as_bytes().to_vec())
                .await
        }
        Err(e) => Err(e),
    };
    if let Err(e) = result {
        error!(
            "[CODE07,{}]: Error while uploading file {} to storage, detail: {}",
            ctx.job_id(id),
            marker,
            e
        );
    }
    EMPTY_INPUT_DIR.to_string()
}

// =============================================================================
// Output Registration
// =============================================================================

/// Register every file under the instance's output path, after copying in the
/// objects its `unextpath` parameters and `ts` parents point at.
/// Returns the number of newly registered files.
pub async fn register_output_files(
    ctx: &ServiceContext,
    inst: &PluginInstance,
) -> Result<usize, StatusError> {
    let jid = ctx.job_id(inst.id);
    let output = inst.output_path.trim_end_matches('/');
    let params = ctx.store.get_parameters(inst.id).await?;
    let plugin = ctx
        .store
        .get_plugin(inst.plugin_id)
        .await?
        .ok_or(StatusError::PluginNotFound(inst.plugin_id))?;

    let mut files = ctx.storage.ls(output).await?;

    for p in params.iter().filter(|p| p.value.kind() == ParameterKind::Unextpath) {
        for path in p.value.paths() {
            let path = path.trim_end_matches('/');
            let objects = match ctx.storage.ls(path).await {
                Ok(objects) => objects,
                Err(e) => {
                    error!(
                        "[CODE06,{}]: Error while listing storage files in {}, detail: {}",
                        jid, path, e
                    );
                    continue;
                }
            };
            for obj in objects {
                let target = unextpath_target(&obj, path, output);
                copy_object(ctx, &jid, &obj, &target, &mut files).await;
            }
        }
    }

    if plugin.plugin_type == PluginType::Ts {
        for (parent_out, filter) in ts_inputs(ctx, inst, &params).await? {
            let objects = match ctx.storage.ls(&parent_out).await {
                Ok(objects) => objects,
                Err(e) => {
                    error!(
                        "[CODE06,{}]: Error while listing storage files in {}, detail: {}",
                        jid, parent_out, e
                    );
                    continue;
                }
            };
            for obj in objects {
                if filter.as_ref().is_some_and(|re| !re.is_match(&obj)) {
                    continue;
                }
                let target = rebase(&obj, &parent_out, output);
                copy_object(ctx, &jid, &obj, &target, &mut files).await;
            }
        }
    }

    files.sort();
    files.dedup();
    let registered = ctx.store.register_files(inst.id, &files).await?;
    info!("Registered {} output file(s) of job {}", registered, jid);
    Ok(registered)
}

/// Where an object passed through an `unextpath` parameter lands in the output
fn unextpath_target(obj: &str, path: &str, output: &str) -> String {
    let target = rebase(obj, path, output);
    if target != output && is_under(&target, output) {
        return target;
    }
    let name = obj.rsplit('/').next().unwrap_or(obj);
    format!("{}/{}", output, name)
}

/// Output path of each `ts` parent paired with its optional file filter
async fn ts_inputs(
    ctx: &ServiceContext,
    inst: &PluginInstance,
    params: &[ParameterInstance],
) -> Result<Vec<(String, Option<Regex>)>, StatusError> {
    let value_of = |name: &str| {
        params
            .iter()
            .find(|p| p.name == name)
            .and_then(|p| p.value.as_str())
            .unwrap_or_default()
    };

    let parent_ids = parse_instance_ids(value_of(PLUGIN_INSTANCES_PARAM)).map_err(|bad| {
        StatusError::InvalidState(format!(
            "plugin instance {} lists an invalid parent id {}",
            inst.id, bad
        ))
    })?;
    let filters: Vec<&str> = value_of(FILTER_PARAM).split(',').collect();

    let mut inputs = Vec::with_capacity(parent_ids.len());
    for (i, parent_id) in parent_ids.into_iter().enumerate() {
        let Some(parent) = ctx.store.get_instance(parent_id).await? else {
            error!(
                "[CODE05,{}]: Couldn't find plugin instance {} while processing the inputs of plugin instance {}",
                ctx.job_id(inst.id),
                parent_id,
                inst.id
            );
            continue;
        };
        let filter = match filters.get(i).map(|f| f.trim()) {
            Some(f) if !f.is_empty() => Some(Regex::new(f)?),
            _ => None,
        };
        inputs.push((parent.output_path.trim_end_matches('/').to_string(), filter));
    }
    Ok(inputs)
}

async fn copy_object(ctx: &ServiceContext, jid: &str, src: &str, dst: &str, files: &mut Vec<String>) {
    match ctx.storage.copy(src, dst).await {
        Ok(()) => files.push(dst.to_string()),
        Err(e) => error!(
            "[CODE09,{}]: Error while copying file from {} to {} in storage, detail: {}",
            jid, src, dst, e
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::Store;
    use crate::test_support::{TestEnv, plugin, plugin_param};

    fn param(plugin: &Plugin, name: &str, value: ParameterValue) -> ParameterInstance {
        ParameterInstance {
            plugin_param_id: plugin.parameter(name).unwrap().id,
            name: name.to_string(),
            value,
        }
    }

    #[test]
    fn test_cmd_args() {
        let mut plg = plugin("pl-simpledsapp", PluginType::Ds);
        let mut verbose = plugin_param("verbose", ParameterKind::Boolean, None);
        verbose.action = ParameterAction::StoreTrue;
        let mut quiet = plugin_param("noisy", ParameterKind::Boolean, None);
        quiet.action = ParameterAction::StoreFalse;
        plg.parameters = vec![
            plugin_param("prefix", ParameterKind::String, None),
            plugin_param("sleep", ParameterKind::Integer, None),
            verbose,
            quiet,
        ];

        let args = cmd_args(
            &plg,
            &[
                param(&plg, "prefix", ParameterValue::String(String::new())),
                param(&plg, "sleep", ParameterValue::Integer(3)),
                param(&plg, "verbose", ParameterValue::Boolean(true)),
                param(&plg, "noisy", ParameterValue::Boolean(true)),
            ],
        );
        assert_eq!(
            args,
            vec![
                "--saveinputmeta",
                "--saveoutputmeta",
                "--prefix",
                "''",
                "--sleep",
                "3",
                "--verbose"
            ]
        );
    }

    #[test]
    fn test_unextpath_target() {
        let out = "home/jane/feeds/feed_1/pl-x_1/data";
        assert_eq!(
            unextpath_target("home/jane/uploads/a/b.txt", "home/jane/uploads", out),
            format!("{}/a/b.txt", out)
        );
        assert_eq!(
            unextpath_target("home/jane/uploads/b.txt", "home/jane/uploads/b.txt", out),
            format!("{}/b.txt", out)
        );
    }

    #[tokio::test]
    async fn test_run_submits_and_starts() {
        let env = TestEnv::new();
        let parent = env.fs_instance(InstanceStatus::FinishedSuccessfully).await;
        let child = env.ds_instance(&parent, InstanceStatus::Scheduled).await;

        assert_eq!(run(&env.ctx, child.id).await.unwrap(), InstanceStatus::Started);
        assert_eq!(env.compute.submit_calls(), 1);

        let job = env.compute.last_job().unwrap();
        assert_eq!(job.jid, env.ctx.job_id(child.id));
        assert_eq!(job.input_dirs, vec![parent.output_path.clone()]);
        assert_eq!(job.output_dir, child.output_path);
        assert_eq!(job.args[..2], ["--saveinputmeta", "--saveoutputmeta"]);

        let stored = env.store.get_instance(child.id).await.unwrap().unwrap();
        assert_eq!(stored.remote_job, RemoteJobState::Submitted);
        assert!(stored.start_date.is_some());
        assert_eq!(stored.summary["pushPath"]["status"], serde_json::json!(true));

        // A repeated delivery does not submit again
        assert_eq!(run(&env.ctx, child.id).await.unwrap(), InstanceStatus::Started);
        assert_eq!(env.compute.submit_calls(), 1);
    }

    #[tokio::test]
    async fn test_retried_run_does_not_resubmit_accepted_job() {
        let env = TestEnv::new();
        let inst = env.fs_instance(InstanceStatus::Scheduled).await;
        // An earlier attempt got the job accepted but never marked it started
        env.store
            .set_remote_job_state(inst.id, RemoteJobState::Submitted)
            .await
            .unwrap();

        assert_eq!(run(&env.ctx, inst.id).await.unwrap(), InstanceStatus::Started);
        assert_eq!(env.compute.poll_calls(), 1);
        assert_eq!(env.compute.submit_calls(), 0);
    }

    #[tokio::test]
    async fn test_retried_run_submits_job_unknown_to_remote() {
        let env = TestEnv::new();
        env.compute.fail_poll_not_found();
        let inst = env.fs_instance(InstanceStatus::Scheduled).await;
        env.store
            .set_remote_job_state(inst.id, RemoteJobState::Submitted)
            .await
            .unwrap();

        assert_eq!(run(&env.ctx, inst.id).await.unwrap(), InstanceStatus::Started);
        assert_eq!(env.compute.submit_calls(), 1);
    }

    #[tokio::test]
    async fn test_first_run_records_submission_before_submitting() {
        let env = TestEnv::new();
        env.compute.fail_submit();
        let inst = env.fs_instance(InstanceStatus::Scheduled).await;

        assert!(run(&env.ctx, inst.id).await.is_err());
        assert_eq!(env.compute.poll_calls(), 0);
        let stored = env.store.get_instance(inst.id).await.unwrap().unwrap();
        assert_eq!(stored.status, InstanceStatus::Scheduled);
        assert_eq!(stored.remote_job, RemoteJobState::Submitted);
    }

    #[tokio::test]
    async fn test_run_fs_uses_empty_input_dir() {
        let env = TestEnv::new();
        let inst = env.fs_instance(InstanceStatus::Scheduled).await;

        run(&env.ctx, inst.id).await.unwrap();

        let job = env.compute.last_job().unwrap();
        assert_eq!(job.input_dirs, vec![EMPTY_INPUT_DIR.to_string()]);
        let marker = env
            .ctx
            .storage
            .download("data/squashEmptyDir/squashEmptyDir.txt")
            .await
            .unwrap();
        assert_eq!(marker, b"Empty input dir.");
    }

    #[tokio::test]
    async fn test_run_propagates_submit_failure() {
        let env = TestEnv::new();
        env.compute.fail_submit();
        let inst = env.fs_instance(InstanceStatus::Scheduled).await;

        assert!(matches!(
            run(&env.ctx, inst.id).await,
            Err(StatusError::Compute(_))
        ));
        assert_eq!(env.status_of(inst.id).await, InstanceStatus::Scheduled);
    }

    #[tokio::test]
    async fn test_run_after_cancel_is_noop() {
        let env = TestEnv::new();
        let inst = env.fs_instance(InstanceStatus::Cancelled).await;

        assert_eq!(run(&env.ctx, inst.id).await.unwrap(), InstanceStatus::Cancelled);
        assert_eq!(env.compute.submit_calls(), 0);
    }

    #[tokio::test]
    async fn test_register_ts_outputs_with_filter() {
        let env = TestEnv::new();
        let a = env.fs_instance(InstanceStatus::FinishedSuccessfully).await;
        let b = env.fs_instance(InstanceStatus::FinishedSuccessfully).await;
        for (inst, name) in [(&a, "scan.dcm"), (&a, "notes.txt"), (&b, "other.dcm")] {
            env.ctx
                .storage
                .upload(&format!("{}/{}", inst.output_path, name), b"x".to_vec())
                .await
                .unwrap();
        }

        let (ts, _) = env
            .ts_instance(&a, &[&a, &b], &format!("{},", r"\.dcm$"), InstanceStatus::Started)
            .await;

        let count = register_output_files(&env.ctx, &ts).await.unwrap();
        assert_eq!(count, 2);

        let files = env.store.list_files(ts.id).await.unwrap();
        assert!(files.contains(&format!("{}/scan.dcm", ts.output_path)));
        assert!(files.contains(&format!("{}/other.dcm", ts.output_path)));
        assert!(!files.contains(&format!("{}/notes.txt", ts.output_path)));
    }
}
