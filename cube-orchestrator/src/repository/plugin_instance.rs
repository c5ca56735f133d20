//! Plugin Instance Repository
//!
//! Handles all database operations related to plugin instances and their
//! resolved parameters.

use chrono::{DateTime, Utc};
use cube_core::domain::parameter::ParameterValue;
use cube_core::domain::plugin_instance::{
    InstanceStatus, ParameterInstance, PluginInstance, RemoteJobState,
};
use sqlx::{PgConnection, PgPool};
use uuid::Uuid;

use super::{NewInstance, StoreError, StoreResult};

const INSTANCE_COLUMNS: &str = r#"
    id, title, owner, plugin_id, plugin_name, previous_id, feed_id, workflow_id,
    compute_resource, status, cpu_limit, memory_limit, number_of_workers, gpu_limit,
    output_path, summary, error_code, error_detail, remote_job, created_at,
    start_date, end_date
"#;

/// Insert an instance and its parameters on an open connection
pub async fn insert(conn: &mut PgConnection, new: &NewInstance) -> StoreResult<()> {
    let inst = &new.instance;

    sqlx::query(
        r#"
        INSERT INTO plugin_instances (
            id, title, owner, plugin_id, plugin_name, previous_id, feed_id, workflow_id,
            compute_resource, status, cpu_limit, memory_limit, number_of_workers, gpu_limit,
            output_path, summary, error_code, error_detail, remote_job, created_at,
            start_date, end_date
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16,
                $17, $18, $19, $20, $21, $22)
        "#,
    )
    .bind(inst.id)
    .bind(&inst.title)
    .bind(&inst.owner)
    .bind(inst.plugin_id)
    .bind(&inst.plugin_name)
    .bind(inst.previous_id)
    .bind(inst.feed_id)
    .bind(inst.workflow_id)
    .bind(&inst.compute_resource)
    .bind(inst.status.as_str())
    .bind(inst.cpu_limit)
    .bind(inst.memory_limit)
    .bind(inst.number_of_workers)
    .bind(inst.gpu_limit)
    .bind(&inst.output_path)
    .bind(&inst.summary)
    .bind(&inst.error_code)
    .bind(&inst.error_detail)
    .bind(inst.remote_job.as_str())
    .bind(inst.created_at)
    .bind(inst.start_date)
    .bind(inst.end_date)
    .execute(&mut *conn)
    .await?;

    for param in &new.parameters {
        sqlx::query(
            r#"
            INSERT INTO plugin_instance_parameters (instance_id, plugin_param_id, name, param_type, value)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(inst.id)
        .bind(param.plugin_param_id)
        .bind(&param.name)
        .bind(param.value.kind().as_str())
        .bind(serde_json::to_value(&param.value)?)
        .execute(&mut *conn)
        .await?;
    }

    Ok(())
}

/// Insert a standalone instance in its own transaction
pub async fn create(pool: &PgPool, new: &NewInstance) -> StoreResult<()> {
    let mut tx = pool.begin().await?;
    insert(&mut tx, new).await?;
    tx.commit().await?;
    Ok(())
}

/// Find an instance by ID
pub async fn find_by_id(pool: &PgPool, id: Uuid) -> StoreResult<Option<PluginInstance>> {
    let row = sqlx::query_as::<_, PluginInstanceRow>(&format!(
        "SELECT {} FROM plugin_instances WHERE id = $1",
        INSTANCE_COLUMNS
    ))
    .bind(id)
    .fetch_optional(pool)
    .await?;

    row.map(PluginInstance::try_from).transpose()
}

/// Find several instances by ID
pub async fn find_by_ids(pool: &PgPool, ids: &[Uuid]) -> StoreResult<Vec<PluginInstance>> {
    let rows = sqlx::query_as::<_, PluginInstanceRow>(&format!(
        "SELECT {} FROM plugin_instances WHERE id = ANY($1) ORDER BY created_at ASC",
        INSTANCE_COLUMNS
    ))
    .bind(ids)
    .fetch_all(pool)
    .await?;

    rows.into_iter().map(PluginInstance::try_from).collect()
}

/// Find instances by status
pub async fn find_by_status(
    pool: &PgPool,
    status: InstanceStatus,
) -> StoreResult<Vec<PluginInstance>> {
    let rows = sqlx::query_as::<_, PluginInstanceRow>(&format!(
        "SELECT {} FROM plugin_instances WHERE status = $1 ORDER BY created_at ASC",
        INSTANCE_COLUMNS
    ))
    .bind(status.as_str())
    .fetch_all(pool)
    .await?;

    rows.into_iter().map(PluginInstance::try_from).collect()
}

/// Find the direct descendants of an instance
pub async fn find_children(pool: &PgPool, previous_id: Uuid) -> StoreResult<Vec<PluginInstance>> {
    let rows = sqlx::query_as::<_, PluginInstanceRow>(&format!(
        "SELECT {} FROM plugin_instances WHERE previous_id = $1 ORDER BY created_at ASC",
        INSTANCE_COLUMNS
    ))
    .bind(previous_id)
    .fetch_all(pool)
    .await?;

    rows.into_iter().map(PluginInstance::try_from).collect()
}

/// Find the resolved parameters of an instance
pub async fn find_parameters(
    pool: &PgPool,
    instance_id: Uuid,
) -> StoreResult<Vec<ParameterInstance>> {
    let rows = sqlx::query_as::<_, ParameterRow>(
        r#"
        SELECT plugin_param_id, name, value
        FROM plugin_instance_parameters
        WHERE instance_id = $1
        ORDER BY name ASC
        "#,
    )
    .bind(instance_id)
    .fetch_all(pool)
    .await?;

    rows.into_iter().map(ParameterInstance::try_from).collect()
}

/// Conditionally update the status of an instance
pub async fn update_status_if(
    pool: &PgPool,
    id: Uuid,
    from: &[InstanceStatus],
    to: InstanceStatus,
) -> StoreResult<bool> {
    let from = status_names(from);
    let end_date = to.is_terminal().then(Utc::now);

    let result = sqlx::query(
        r#"
        UPDATE plugin_instances
        SET status = $1, end_date = COALESCE($2, end_date)
        WHERE id = $3 AND status = ANY($4)
        "#,
    )
    .bind(to.as_str())
    .bind(end_date)
    .bind(id)
    .bind(&from)
    .execute(pool)
    .await?;

    Ok(result.rows_affected() > 0)
}

/// Update status to started after a successful submission
pub async fn update_status_to_started(
    pool: &PgPool,
    id: Uuid,
    summary: &serde_json::Value,
) -> StoreResult<bool> {
    let result = sqlx::query(
        r#"
        UPDATE plugin_instances
        SET status = $1, start_date = $2, summary = $3, remote_job = $4
        WHERE id = $5 AND status = $6
        "#,
    )
    .bind(InstanceStatus::Started.as_str())
    .bind(Utc::now())
    .bind(summary)
    .bind(RemoteJobState::Submitted.as_str())
    .bind(id)
    .bind(InstanceStatus::Scheduled.as_str())
    .execute(pool)
    .await?;

    Ok(result.rows_affected() > 0)
}

/// Update the job status summary
pub async fn update_summary(
    pool: &PgPool,
    id: Uuid,
    summary: &serde_json::Value,
) -> StoreResult<()> {
    sqlx::query("UPDATE plugin_instances SET summary = $1 WHERE id = $2")
        .bind(summary)
        .bind(id)
        .execute(pool)
        .await?;

    Ok(())
}

/// Cancel a non-terminal instance and record why, in one statement
pub async fn force_cancel(
    pool: &PgPool,
    id: Uuid,
    error_code: &str,
    error_detail: &str,
) -> StoreResult<bool> {
    let non_terminal = status_names(&InstanceStatus::NON_TERMINAL);

    let result = sqlx::query(
        r#"
        UPDATE plugin_instances
        SET status = $1, end_date = $2, error_code = $3, error_detail = $4
        WHERE id = $5 AND status = ANY($6)
        "#,
    )
    .bind(InstanceStatus::Cancelled.as_str())
    .bind(Utc::now())
    .bind(error_code)
    .bind(error_detail)
    .bind(id)
    .bind(&non_terminal)
    .execute(pool)
    .await?;

    Ok(result.rows_affected() > 0)
}

/// Update the remote job state
pub async fn update_remote_job(pool: &PgPool, id: Uuid, state: RemoteJobState) -> StoreResult<()> {
    sqlx::query("UPDATE plugin_instances SET remote_job = $1 WHERE id = $2")
        .bind(state.as_str())
        .bind(id)
        .execute(pool)
        .await?;

    Ok(())
}

/// Find terminal instances whose remote job is still held by the compute resource
pub async fn find_remote_cleanup_candidates(
    pool: &PgPool,
    finished_before: DateTime<Utc>,
) -> StoreResult<Vec<PluginInstance>> {
    let terminal = status_names(&[
        InstanceStatus::FinishedSuccessfully,
        InstanceStatus::FinishedWithError,
        InstanceStatus::Cancelled,
    ]);

    let rows = sqlx::query_as::<_, PluginInstanceRow>(&format!(
        r#"
        SELECT {} FROM plugin_instances
        WHERE remote_job = $1 AND status = ANY($2) AND end_date < $3
        ORDER BY end_date ASC
        "#,
        INSTANCE_COLUMNS
    ))
    .bind(RemoteJobState::Submitted.as_str())
    .bind(&terminal)
    .bind(finished_before)
    .fetch_all(pool)
    .await?;

    rows.into_iter().map(PluginInstance::try_from).collect()
}

/// Delete instances on an open connection; dependents cascade
pub async fn delete_many(conn: &mut PgConnection, ids: &[Uuid]) -> StoreResult<u64> {
    let result = sqlx::query("DELETE FROM plugin_instances WHERE id = ANY($1)")
        .bind(ids)
        .execute(&mut *conn)
        .await?;

    Ok(result.rows_affected())
}

// =============================================================================
// Helper Functions
// =============================================================================

fn status_names(statuses: &[InstanceStatus]) -> Vec<String> {
    statuses.iter().map(|s| s.as_str().to_string()).collect()
}

// =============================================================================
// Database Row Types
// =============================================================================

#[derive(sqlx::FromRow)]
struct PluginInstanceRow {
    id: Uuid,
    title: String,
    owner: String,
    plugin_id: Uuid,
    plugin_name: String,
    previous_id: Option<Uuid>,
    feed_id: Uuid,
    workflow_id: Option<Uuid>,
    compute_resource: String,
    status: String,
    cpu_limit: i32,
    memory_limit: i32,
    number_of_workers: i32,
    gpu_limit: i32,
    output_path: String,
    summary: serde_json::Value,
    error_code: Option<String>,
    error_detail: Option<String>,
    remote_job: String,
    created_at: DateTime<Utc>,
    start_date: Option<DateTime<Utc>>,
    end_date: Option<DateTime<Utc>>,
}

impl TryFrom<PluginInstanceRow> for PluginInstance {
    type Error = StoreError;

    fn try_from(row: PluginInstanceRow) -> Result<Self, Self::Error> {
        let status = row.status.parse().map_err(StoreError::Corrupt)?;
        let remote_job = row.remote_job.parse().map_err(StoreError::Corrupt)?;

        Ok(PluginInstance {
            id: row.id,
            title: row.title,
            owner: row.owner,
            plugin_id: row.plugin_id,
            plugin_name: row.plugin_name,
            previous_id: row.previous_id,
            feed_id: row.feed_id,
            workflow_id: row.workflow_id,
            compute_resource: row.compute_resource,
            status,
            cpu_limit: row.cpu_limit,
            memory_limit: row.memory_limit,
            number_of_workers: row.number_of_workers,
            gpu_limit: row.gpu_limit,
            output_path: row.output_path,
            summary: row.summary,
            error_code: row.error_code,
            error_detail: row.error_detail,
            remote_job,
            created_at: row.created_at,
            start_date: row.start_date,
            end_date: row.end_date,
        })
    }
}

#[derive(sqlx::FromRow)]
struct ParameterRow {
    plugin_param_id: Uuid,
    name: String,
    value: serde_json::Value,
}

impl TryFrom<ParameterRow> for ParameterInstance {
    type Error = StoreError;

    fn try_from(row: ParameterRow) -> Result<Self, Self::Error> {
        let value: ParameterValue = serde_json::from_value(row.value)?;
        Ok(ParameterInstance {
            plugin_param_id: row.plugin_param_id,
            name: row.name,
            value,
        })
    }
}
