//! Lock Repository
//!
//! Advisory per-instance locks and the output files registered under them.

use chrono::{DateTime, Utc};
use cube_core::domain::plugin_instance::PluginInstanceLock;
use sqlx::PgPool;
use uuid::Uuid;

use super::StoreResult;

/// Create the lock of an instance; returns `false` if it already exists
pub async fn acquire(pool: &PgPool, instance_id: Uuid) -> StoreResult<bool> {
    let result = sqlx::query(
        r#"
        INSERT INTO plugin_instance_locks (instance_id, start_date)
        VALUES ($1, $2)
        ON CONFLICT (instance_id) DO NOTHING
        "#,
    )
    .bind(instance_id)
    .bind(Utc::now())
    .execute(pool)
    .await?;

    Ok(result.rows_affected() > 0)
}

/// Delete the lock of an instance
pub async fn release(pool: &PgPool, instance_id: Uuid) -> StoreResult<()> {
    sqlx::query("DELETE FROM plugin_instance_locks WHERE instance_id = $1")
        .bind(instance_id)
        .execute(pool)
        .await?;

    Ok(())
}

/// Find locks taken before the cutoff
pub async fn find_older_than(
    pool: &PgPool,
    cutoff: DateTime<Utc>,
) -> StoreResult<Vec<PluginInstanceLock>> {
    let rows = sqlx::query_as::<_, LockRow>(
        r#"
        SELECT instance_id, start_date
        FROM plugin_instance_locks
        WHERE start_date < $1
        ORDER BY start_date ASC
        "#,
    )
    .bind(cutoff)
    .fetch_all(pool)
    .await?;

    Ok(rows.into_iter().map(Into::into).collect())
}

/// Register output files of an instance, skipping known paths
pub async fn register_files(pool: &PgPool, instance_id: Uuid, paths: &[String]) -> StoreResult<usize> {
    let result = sqlx::query(
        r#"
        INSERT INTO plugin_instance_files (instance_id, path, created_at)
        SELECT $1, path, $2 FROM UNNEST($3::TEXT[]) AS t(path)
        ON CONFLICT (instance_id, path) DO NOTHING
        "#,
    )
    .bind(instance_id)
    .bind(Utc::now())
    .bind(paths)
    .execute(pool)
    .await?;

    Ok(result.rows_affected() as usize)
}

/// List the registered output files of an instance
pub async fn find_files(pool: &PgPool, instance_id: Uuid) -> StoreResult<Vec<String>> {
    let paths = sqlx::query_scalar::<_, String>(
        "SELECT path FROM plugin_instance_files WHERE instance_id = $1 ORDER BY path ASC",
    )
    .bind(instance_id)
    .fetch_all(pool)
    .await?;

    Ok(paths)
}

// =============================================================================
// Database Row Types
// =============================================================================

#[derive(sqlx::FromRow)]
struct LockRow {
    instance_id: Uuid,
    start_date: DateTime<Utc>,
}

impl From<LockRow> for PluginInstanceLock {
    fn from(row: LockRow) -> Self {
        PluginInstanceLock {
            instance_id: row.instance_id,
            start_date: row.start_date,
        }
    }
}
