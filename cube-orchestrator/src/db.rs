use sqlx::{PgPool, postgres::PgPoolOptions};
use std::time::Duration;

pub async fn create_pool(database_url: &str) -> Result<PgPool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(10)
        .acquire_timeout(Duration::from_secs(5))
        .connect(database_url)
        .await
}

pub async fn run_migrations(pool: &PgPool) -> Result<(), sqlx::Error> {
    // Catalogue tables, written by the administrative import
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS feeds (
            id UUID PRIMARY KEY,
            name VARCHAR(200) NOT NULL DEFAULT '',
            creator VARCHAR(32) NOT NULL,
            owners TEXT[] NOT NULL DEFAULT '{}',
            created_at TIMESTAMPTZ NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS plugins (
            id UUID PRIMARY KEY,
            name VARCHAR(100) NOT NULL,
            version VARCHAR(10) NOT NULL,
            plugin_type VARCHAR(4) NOT NULL,
            dock_image VARCHAR(500) NOT NULL,
            selfpath VARCHAR(512) NOT NULL DEFAULT '',
            selfexec VARCHAR(512) NOT NULL,
            execshell VARCHAR(50) NOT NULL DEFAULT '',
            min_cpu_limit INTEGER NOT NULL DEFAULT 1000,
            max_cpu_limit INTEGER NOT NULL DEFAULT 2147483647,
            min_memory_limit INTEGER NOT NULL DEFAULT 200,
            max_memory_limit INTEGER NOT NULL DEFAULT 2147483647,
            min_number_of_workers INTEGER NOT NULL DEFAULT 1,
            max_number_of_workers INTEGER NOT NULL DEFAULT 1,
            min_gpu_limit INTEGER NOT NULL DEFAULT 0,
            max_gpu_limit INTEGER NOT NULL DEFAULT 0,
            parameters JSONB NOT NULL DEFAULT '[]',
            compute_resources TEXT[] NOT NULL DEFAULT '{}',
            UNIQUE (name, version)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS pipelines (
            id UUID PRIMARY KEY,
            name VARCHAR(100) NOT NULL UNIQUE,
            owner VARCHAR(32) NOT NULL,
            locked BOOLEAN NOT NULL DEFAULT TRUE,
            description TEXT NOT NULL DEFAULT '',
            created_at TIMESTAMPTZ NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS pipings (
            id UUID PRIMARY KEY,
            pipeline_id UUID NOT NULL REFERENCES pipelines(id) ON DELETE CASCADE,
            plugin_id UUID NOT NULL REFERENCES plugins(id),
            previous_id UUID REFERENCES pipings(id) ON DELETE CASCADE,
            title VARCHAR(100) NOT NULL,
            defaults JSONB NOT NULL DEFAULT '[]',
            UNIQUE (pipeline_id, title)
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Execution tables
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS workflows (
            id UUID PRIMARY KEY,
            title VARCHAR(100) NOT NULL DEFAULT '',
            pipeline_id UUID NOT NULL REFERENCES pipelines(id),
            owner VARCHAR(32) NOT NULL,
            previous_instance_id UUID NOT NULL,
            instance_ids UUID[] NOT NULL DEFAULT '{}',
            created_at TIMESTAMPTZ NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS plugin_instances (
            id UUID PRIMARY KEY,
            title VARCHAR(100) NOT NULL DEFAULT '',
            owner VARCHAR(32) NOT NULL,
            plugin_id UUID NOT NULL REFERENCES plugins(id),
            plugin_name VARCHAR(100) NOT NULL,
            previous_id UUID REFERENCES plugin_instances(id) ON DELETE CASCADE,
            feed_id UUID NOT NULL REFERENCES feeds(id) ON DELETE CASCADE,
            workflow_id UUID REFERENCES workflows(id) ON DELETE SET NULL,
            compute_resource VARCHAR(100) NOT NULL,
            status VARCHAR(30) NOT NULL,
            cpu_limit INTEGER NOT NULL,
            memory_limit INTEGER NOT NULL,
            number_of_workers INTEGER NOT NULL,
            gpu_limit INTEGER NOT NULL,
            output_path TEXT NOT NULL,
            summary JSONB NOT NULL DEFAULT '{}',
            error_code VARCHAR(7),
            error_detail TEXT,
            remote_job VARCHAR(10) NOT NULL DEFAULT 'none',
            created_at TIMESTAMPTZ NOT NULL,
            start_date TIMESTAMPTZ,
            end_date TIMESTAMPTZ
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS plugin_instance_parameters (
            instance_id UUID NOT NULL REFERENCES plugin_instances(id) ON DELETE CASCADE,
            plugin_param_id UUID NOT NULL,
            name VARCHAR(50) NOT NULL,
            param_type VARCHAR(10) NOT NULL,
            value JSONB NOT NULL,
            PRIMARY KEY (instance_id, plugin_param_id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS plugin_instance_locks (
            instance_id UUID PRIMARY KEY REFERENCES plugin_instances(id) ON DELETE CASCADE,
            start_date TIMESTAMPTZ NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS plugin_instance_files (
            id SERIAL PRIMARY KEY,
            instance_id UUID NOT NULL REFERENCES plugin_instances(id) ON DELETE CASCADE,
            path TEXT NOT NULL,
            created_at TIMESTAMPTZ NOT NULL,
            UNIQUE (instance_id, path)
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Create indexes for the sweeper queries
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_plugin_instances_status ON plugin_instances(status, created_at)",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_plugin_instances_previous_id ON plugin_instances(previous_id)",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_plugin_instances_remote_job ON plugin_instances(remote_job, end_date)",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_plugin_instance_locks_start_date ON plugin_instance_locks(start_date)",
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_pipings_pipeline_id ON pipings(pipeline_id)")
        .execute(pool)
        .await?;

    tracing::info!("Database migrations completed successfully");
    Ok(())
}
