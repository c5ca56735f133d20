//! Periodic task beat
//!
//! Enqueues each sweeper at its own fixed interval.

use std::time::Duration;

use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info};

use super::TaskArgs;
use crate::context::ServiceContext;

/// One periodic task and how often it fires
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BeatEntry {
    pub task: &'static str,
    pub interval: Duration,
}

impl BeatEntry {
    pub fn new(task: &'static str, interval: Duration) -> Self {
        Self { task, interval }
    }
}

async fn run_entry(ctx: ServiceContext, entry: BeatEntry, mut shutdown_rx: watch::Receiver<bool>) {
    let mut interval = tokio::time::interval(entry.interval);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick completes immediately
    interval.tick().await;

    loop {
        tokio::select! {
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    break;
                }
            }
            _ = interval.tick() => {
                debug!("Beat firing {}", entry.task);
                if let Err(e) = ctx.enqueue(entry.task, TaskArgs::None).await {
                    error!("Failed to enqueue periodic task {}: {}", entry.task, e);
                }
            }
        }
    }
}

/// Spawn the beat. Returns its handle and the sender that stops it.
pub fn spawn_beat(
    ctx: ServiceContext,
    entries: Vec<BeatEntry>,
) -> (tokio::task::JoinHandle<()>, watch::Sender<bool>) {
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let handle = tokio::spawn(async move {
        info!("Beat started with {} periodic task(s)", entries.len());
        let tasks: Vec<_> = entries
            .into_iter()
            .map(|entry| tokio::spawn(run_entry(ctx.clone(), entry, shutdown_rx.clone())))
            .collect();
        for task in tasks {
            if let Err(e) = task.await {
                error!("Beat entry panicked: {}", e);
            }
        }
        info!("Beat shutting down");
    });

    (handle, shutdown_tx)
}
