use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use cube_orchestrator::config::Config;
use cube_orchestrator::context::ServiceContext;
use cube_orchestrator::db;
use cube_orchestrator::repository::PgStore;
use cube_orchestrator::tasks::{
    LocalTaskQueue, MAIN1_QUEUE, MAIN2_QUEUE, PERIODIC_QUEUE, TaskRegistry, WorkerPool, handlers,
    spawn_beat,
};
use cube_storage::connect_storage;

#[tokio::main]
async fn main() -> Result<()> {
    // A missing .env file is fine
    let _ = dotenvy::dotenv();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "cube_orchestrator=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting Cube Orchestrator...");

    let config = Config::load()?;
    info!(
        "Loaded configuration: {} compute resource(s), job id prefix {}",
        config.compute_resources.len(),
        config.job_id_prefix
    );

    info!("Connecting to database...");
    let pool = db::create_pool(&config.database_url)
        .await
        .context("Failed to create database pool")?;
    db::run_migrations(&pool)
        .await
        .context("Failed to run database migrations")?;

    let storage = connect_storage(&config.storage)
        .await
        .context("Failed to set up storage backend")?;
    storage
        .check_connection()
        .await
        .context("Storage backend is not reachable")?;

    let queue = Arc::new(LocalTaskQueue::standard());
    let ctx = ServiceContext::new(
        Arc::new(PgStore::new(pool)),
        storage,
        Arc::new(config.compute_registry()),
        queue.clone(),
        Arc::new(TaskRegistry::standard(config.task_retry())),
    )
    .with_settings(config.engine_settings());

    // Queued tasks do not survive a restart
    let requeued = handlers::requeue_scheduled_plugin_instances(&ctx)
        .await
        .context("Failed to requeue scheduled plugin instances")?;
    if requeued > 0 {
        info!("Requeued {} scheduled plugin instance(s)", requeued);
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let workers = [
        (MAIN1_QUEUE, config.main1_concurrency),
        (MAIN2_QUEUE, config.main2_concurrency),
        (PERIODIC_QUEUE, config.periodic_concurrency),
    ]
    .into_iter()
    .map(|(name, concurrency)| {
        WorkerPool::new(ctx.clone(), queue.clone(), name, concurrency).spawn(shutdown_rx.clone())
    })
    .collect::<Vec<_>>();

    let (beat, beat_tx) = spawn_beat(ctx.clone(), config.beat_schedule());

    info!("Orchestrator initialized successfully");

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    info!("Shutdown signal received");

    let _ = beat_tx.send(true);
    let _ = shutdown_tx.send(true);
    if let Err(e) = beat.await {
        warn!("Beat task ended abnormally: {}", e);
    }
    for worker in workers {
        if let Err(e) = worker.await {
            warn!("Worker pool ended abnormally: {}", e);
        }
    }

    info!("Cube Orchestrator stopped");
    Ok(())
}
