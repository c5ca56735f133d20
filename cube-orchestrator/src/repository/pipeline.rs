//! Pipeline Repository
//!
//! Read access to pipelines and their pipings.

use cube_core::domain::pipeline::{Pipeline, Piping, PipingDefault};
use sqlx::PgPool;
use uuid::Uuid;

use super::StoreResult;

/// Find a pipeline by ID
pub async fn find_by_id(pool: &PgPool, id: Uuid) -> StoreResult<Option<Pipeline>> {
    let row = sqlx::query_as::<_, PipelineRow>(
        r#"
        SELECT id, name, owner, locked, description, created_at
        FROM pipelines
        WHERE id = $1
        "#,
    )
    .bind(id)
    .fetch_optional(pool)
    .await?;

    Ok(row.map(Into::into))
}

/// Find the pipings of a pipeline
pub async fn find_pipings(pool: &PgPool, pipeline_id: Uuid) -> StoreResult<Vec<Piping>> {
    let rows = sqlx::query_as::<_, PipingRow>(
        r#"
        SELECT id, pipeline_id, plugin_id, previous_id, title, defaults
        FROM pipings
        WHERE pipeline_id = $1
        ORDER BY title ASC
        "#,
    )
    .bind(pipeline_id)
    .fetch_all(pool)
    .await?;

    let mut pipings = Vec::with_capacity(rows.len());
    for row in rows {
        let defaults: Vec<PipingDefault> = serde_json::from_value(row.defaults)?;
        pipings.push(Piping {
            id: row.id,
            pipeline_id: row.pipeline_id,
            plugin_id: row.plugin_id,
            previous_id: row.previous_id,
            title: row.title,
            defaults,
        });
    }
    Ok(pipings)
}

// =============================================================================
// Database Row Types
// =============================================================================

#[derive(sqlx::FromRow)]
struct PipelineRow {
    id: Uuid,
    name: String,
    owner: String,
    locked: bool,
    description: String,
    created_at: chrono::DateTime<chrono::Utc>,
}

impl From<PipelineRow> for Pipeline {
    fn from(row: PipelineRow) -> Self {
        Pipeline {
            id: row.id,
            name: row.name,
            owner: row.owner,
            locked: row.locked,
            description: row.description,
            created_at: row.created_at,
        }
    }
}

#[derive(sqlx::FromRow)]
struct PipingRow {
    id: Uuid,
    pipeline_id: Uuid,
    plugin_id: Uuid,
    previous_id: Option<Uuid>,
    title: String,
    defaults: serde_json::Value,
}
