//! Task registry
//!
//! One table entry per task: name, queue, retry settings, failure policy
//! and handler.

use std::collections::HashMap;
use std::time::Duration;

use futures::FutureExt;
use futures::future::BoxFuture;

use super::{
    CANCEL_PLUGIN_INSTANCE, CANCEL_PLUGIN_INSTANCES_STUCK_IN_LOCK,
    CANCEL_WAITING_PLUGIN_INSTANCES, CHECK_PLUGIN_INSTANCE_EXEC_STATUS,
    CHECK_STARTED_PLUGIN_INSTANCES_EXEC_STATUS, DELETE_PLUGIN_INSTANCE_JOB_FROM_REMOTE,
    DELETE_PLUGIN_INSTANCES_JOBS_FROM_REMOTE, MAIN1_QUEUE, MAIN2_QUEUE, PERIODIC_QUEUE,
    RUN_PLUGIN_INSTANCE, SCHEDULE_WAITING_PLUGIN_INSTANCES, TaskArgs, TaskError, handlers,
};
use crate::context::ServiceContext;
use crate::service::error_code;

pub type TaskFuture = BoxFuture<'static, Result<(), TaskError>>;

pub type TaskHandler = fn(ServiceContext, TaskArgs) -> TaskFuture;

/// How often a failing task is retried, and how long to wait in between
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetrySettings {
    pub max_retries: u32,
    pub delay: Duration,
}

impl RetrySettings {
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            delay: Duration::ZERO,
        }
    }
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_retries: 3,
            delay: Duration::from_secs(5),
        }
    }
}

/// What happens once a task has exhausted its retries
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailurePolicy {
    /// Force the instance named in the arguments to `cancelled`
    CancelInstance { error_code: &'static str },
    Ignore,
}

#[derive(Clone)]
pub struct TaskSpec {
    pub name: &'static str,
    pub queue: &'static str,
    pub retry: RetrySettings,
    pub on_failure: FailurePolicy,
    pub handler: TaskHandler,
}

impl std::fmt::Debug for TaskSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskSpec")
            .field("name", &self.name)
            .field("queue", &self.queue)
            .field("retry", &self.retry)
            .field("on_failure", &self.on_failure)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Default)]
pub struct TaskRegistry {
    specs: HashMap<&'static str, TaskSpec>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, spec: TaskSpec) {
        self.specs.insert(spec.name, spec);
    }

    pub fn get(&self, name: &str) -> Option<&TaskSpec> {
        self.specs.get(name)
    }

    pub fn queue_for(&self, name: &str) -> Option<&'static str> {
        self.specs.get(name).map(|spec| spec.queue)
    }

    pub fn names(&self) -> Vec<&'static str> {
        let mut names: Vec<&'static str> = self.specs.keys().copied().collect();
        names.sort_unstable();
        names
    }

    /// Every task of the engine. `retry` applies to the per-instance tasks;
    /// sweepers are never retried since the next beat repeats them.
    pub fn standard(retry: RetrySettings) -> Self {
        let mut registry = Self::new();

        registry.register(TaskSpec {
            name: RUN_PLUGIN_INSTANCE,
            queue: MAIN1_QUEUE,
            retry,
            on_failure: FailurePolicy::CancelInstance {
                error_code: error_code::RUN_FAILED,
            },
            handler: |ctx, args| handlers::run_plugin_instance(ctx, args).boxed(),
        });
        registry.register(TaskSpec {
            name: CHECK_PLUGIN_INSTANCE_EXEC_STATUS,
            queue: MAIN2_QUEUE,
            retry,
            on_failure: FailurePolicy::CancelInstance {
                error_code: error_code::CHECK_FAILED,
            },
            handler: |ctx, args| handlers::check_plugin_instance_exec_status(ctx, args).boxed(),
        });
        registry.register(TaskSpec {
            name: CANCEL_PLUGIN_INSTANCE,
            queue: MAIN2_QUEUE,
            retry,
            on_failure: FailurePolicy::CancelInstance {
                error_code: error_code::CANCEL_FAILED,
            },
            handler: |ctx, args| handlers::cancel_plugin_instance(ctx, args).boxed(),
        });
        registry.register(TaskSpec {
            name: DELETE_PLUGIN_INSTANCE_JOB_FROM_REMOTE,
            queue: MAIN2_QUEUE,
            retry,
            on_failure: FailurePolicy::Ignore,
            handler: |ctx, args| handlers::delete_plugin_instance_job_from_remote(ctx, args).boxed(),
        });

        let sweepers: [(&'static str, TaskHandler); 5] = [
            (SCHEDULE_WAITING_PLUGIN_INSTANCES, |ctx, args| {
                handlers::schedule_waiting_plugin_instances(ctx, args).boxed()
            }),
            (CHECK_STARTED_PLUGIN_INSTANCES_EXEC_STATUS, |ctx, args| {
                handlers::check_started_plugin_instances_exec_status(ctx, args).boxed()
            }),
            (CANCEL_WAITING_PLUGIN_INSTANCES, |ctx, args| {
                handlers::cancel_waiting_plugin_instances(ctx, args).boxed()
            }),
            (CANCEL_PLUGIN_INSTANCES_STUCK_IN_LOCK, |ctx, args| {
                handlers::cancel_plugin_instances_stuck_in_lock(ctx, args).boxed()
            }),
            (DELETE_PLUGIN_INSTANCES_JOBS_FROM_REMOTE, |ctx, args| {
                handlers::delete_plugin_instances_jobs_from_remote(ctx, args).boxed()
            }),
        ];
        for (name, handler) in sweepers {
            registry.register(TaskSpec {
                name,
                queue: PERIODIC_QUEUE,
                retry: RetrySettings::none(),
                on_failure: FailurePolicy::Ignore,
                handler,
            });
        }

        registry
    }
}
