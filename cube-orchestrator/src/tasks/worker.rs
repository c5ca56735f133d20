//! Worker pool
//!
//! Pulls messages off one queue and runs them with bounded parallelism.

use std::sync::Arc;

use tokio::sync::{Semaphore, watch};
use tracing::{debug, error, info, warn};

use super::registry::FailurePolicy;
use super::{LocalTaskQueue, TaskMessage};
use crate::context::ServiceContext;
use crate::service::status;

/// Result of running one task message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskOutcome {
    Completed,
    /// Re-enqueued for another attempt
    Retried,
    /// Retries exhausted; the failure policy was applied
    Failed,
    /// No task with that name is registered
    Unknown,
}

/// Run a single task message to completion
pub async fn execute(ctx: &ServiceContext, message: TaskMessage) -> TaskOutcome {
    let Some(spec) = ctx.registry.get(&message.name).cloned() else {
        error!("Dropping message {} for unknown task {}", message.id, message.name);
        return TaskOutcome::Unknown;
    };

    debug!(
        "Running {} (attempt {}) with {:?}",
        spec.name, message.attempt, message.args
    );

    let err = match (spec.handler)(ctx.clone(), message.args.clone()).await {
        Ok(()) => return TaskOutcome::Completed,
        Err(e) if e.is_noop() => {
            debug!("{} finished without effect: {}", spec.name, e);
            return TaskOutcome::Completed;
        }
        Err(e) => e,
    };

    if message.attempt < spec.retry.max_retries {
        warn!(
            "{} failed (attempt {}/{}), retrying in {:?}: {}",
            spec.name,
            message.attempt + 1,
            spec.retry.max_retries + 1,
            spec.retry.delay,
            err
        );
        let retry = message.next_attempt();
        let queue = Arc::clone(&ctx.queue);
        let delay = spec.retry.delay;
        if delay.is_zero() {
            if let Err(e) = queue.push(spec.queue, retry).await {
                error!("Failed to re-enqueue {}: {}", spec.name, e);
            }
        } else {
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                if let Err(e) = queue.push(spec.queue, retry).await {
                    error!("Failed to re-enqueue {}: {}", spec.name, e);
                }
            });
        }
        return TaskOutcome::Retried;
    }

    error!(
        "{} failed after {} attempt(s): {}",
        spec.name,
        message.attempt + 1,
        err
    );

    if let FailurePolicy::CancelInstance { error_code } = spec.on_failure {
        match message.args.instance_id() {
            Some(instance_id) => {
                let detail = format!("{} failed: {}", spec.name, err);
                if let Err(e) = status::fail_instance(ctx, instance_id, error_code, &detail).await
                {
                    error!(
                        "Failed to cancel plugin instance {} after {}: {}",
                        instance_id, spec.name, e
                    );
                }
            }
            None => warn!("{} failed without an instance to cancel", spec.name),
        }
    }

    TaskOutcome::Failed
}

/// Bounded set of workers consuming one queue
pub struct WorkerPool {
    ctx: ServiceContext,
    queue: Arc<LocalTaskQueue>,
    queue_name: &'static str,
    semaphore: Arc<Semaphore>,
}

impl WorkerPool {
    pub fn new(
        ctx: ServiceContext,
        queue: Arc<LocalTaskQueue>,
        queue_name: &'static str,
        concurrency: usize,
    ) -> Self {
        Self {
            ctx,
            queue,
            queue_name,
            semaphore: Arc::new(Semaphore::new(concurrency.max(1))),
        }
    }

    /// Consume the queue until shutdown is signalled
    pub async fn run(self, mut shutdown_rx: watch::Receiver<bool>) {
        info!(
            "Worker pool for {} started ({} workers)",
            self.queue_name,
            self.semaphore.available_permits()
        );

        loop {
            if *shutdown_rx.borrow() {
                break;
            }

            // Wait for a free worker before taking a message off the queue
            let permit = tokio::select! {
                changed = shutdown_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    continue;
                }
                permit = Arc::clone(&self.semaphore).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            let message = tokio::select! {
                changed = shutdown_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    continue;
                }
                message = self.queue.next(self.queue_name) => match message {
                    Some(message) => message,
                    None => break,
                },
            };

            let ctx = self.ctx.clone();
            tokio::spawn(async move {
                execute(&ctx, message).await;
                // Permit is released when dropped
                drop(permit);
            });
        }

        info!("Worker pool for {} shutting down", self.queue_name);
    }

    pub fn spawn(self, shutdown_rx: watch::Receiver<bool>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(self.run(shutdown_rx))
    }
}
