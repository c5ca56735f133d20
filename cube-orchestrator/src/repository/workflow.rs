//! Workflow Repository
//!
//! A workflow and the instances it created are written and removed together.

use cube_core::domain::workflow::Workflow;
use sqlx::PgPool;
use uuid::Uuid;

use super::{NewInstance, StoreResult, plugin_instance};

/// Create a workflow together with all of its instances in one transaction
pub async fn create(pool: &PgPool, workflow: &Workflow, instances: &[NewInstance]) -> StoreResult<()> {
    let mut tx = pool.begin().await?;

    sqlx::query(
        r#"
        INSERT INTO workflows (id, title, pipeline_id, owner, previous_instance_id, instance_ids, created_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7)
        "#,
    )
    .bind(workflow.id)
    .bind(&workflow.title)
    .bind(workflow.pipeline_id)
    .bind(&workflow.owner)
    .bind(workflow.previous_instance_id)
    .bind(&workflow.instance_ids)
    .bind(workflow.created_at)
    .execute(&mut *tx)
    .await?;

    for new in instances {
        plugin_instance::insert(&mut tx, new).await?;
    }

    tx.commit().await?;
    Ok(())
}

/// Find a workflow by ID
pub async fn find_by_id(pool: &PgPool, id: Uuid) -> StoreResult<Option<Workflow>> {
    let row = sqlx::query_as::<_, WorkflowRow>(
        r#"
        SELECT id, title, pipeline_id, owner, previous_instance_id, instance_ids, created_at
        FROM workflows
        WHERE id = $1
        "#,
    )
    .bind(id)
    .fetch_optional(pool)
    .await?;

    Ok(row.map(Into::into))
}

/// Delete a workflow and the given instances in one transaction
pub async fn delete(pool: &PgPool, id: Uuid, instance_ids: &[Uuid]) -> StoreResult<bool> {
    let mut tx = pool.begin().await?;

    plugin_instance::delete_many(&mut tx, instance_ids).await?;
    let result = sqlx::query("DELETE FROM workflows WHERE id = $1")
        .bind(id)
        .execute(&mut *tx)
        .await?;

    tx.commit().await?;
    Ok(result.rows_affected() > 0)
}

// =============================================================================
// Database Row Types
// =============================================================================

#[derive(sqlx::FromRow)]
struct WorkflowRow {
    id: Uuid,
    title: String,
    pipeline_id: Uuid,
    owner: String,
    previous_instance_id: Uuid,
    instance_ids: Vec<Uuid>,
    created_at: chrono::DateTime<chrono::Utc>,
}

impl From<WorkflowRow> for Workflow {
    fn from(row: WorkflowRow) -> Self {
        Workflow {
            id: row.id,
            title: row.title,
            pipeline_id: row.pipeline_id,
            owner: row.owner,
            previous_instance_id: row.previous_instance_id,
            instance_ids: row.instance_ids,
            created_at: row.created_at,
        }
    }
}
