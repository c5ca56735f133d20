//! Plugin Repository
//!
//! Plugins are registered by an administrative import step; the engine only
//! reads them.

use cube_core::domain::plugin::{Plugin, PluginParameter};
use sqlx::PgPool;
use uuid::Uuid;

use super::{StoreError, StoreResult};

/// Find a plugin by ID
pub async fn find_by_id(pool: &PgPool, id: Uuid) -> StoreResult<Option<Plugin>> {
    let row = sqlx::query_as::<_, PluginRow>(
        r#"
        SELECT id, name, version, plugin_type, dock_image, selfpath, selfexec, execshell,
               min_cpu_limit, max_cpu_limit, min_memory_limit, max_memory_limit,
               min_number_of_workers, max_number_of_workers, min_gpu_limit, max_gpu_limit,
               parameters, compute_resources
        FROM plugins
        WHERE id = $1
        "#,
    )
    .bind(id)
    .fetch_optional(pool)
    .await?;

    row.map(Plugin::try_from).transpose()
}

// =============================================================================
// Database Row Types
// =============================================================================

#[derive(sqlx::FromRow)]
struct PluginRow {
    id: Uuid,
    name: String,
    version: String,
    plugin_type: String,
    dock_image: String,
    selfpath: String,
    selfexec: String,
    execshell: String,
    min_cpu_limit: i32,
    max_cpu_limit: i32,
    min_memory_limit: i32,
    max_memory_limit: i32,
    min_number_of_workers: i32,
    max_number_of_workers: i32,
    min_gpu_limit: i32,
    max_gpu_limit: i32,
    parameters: serde_json::Value,
    compute_resources: Vec<String>,
}

impl TryFrom<PluginRow> for Plugin {
    type Error = StoreError;

    fn try_from(row: PluginRow) -> Result<Self, Self::Error> {
        let plugin_type = row.plugin_type.parse().map_err(StoreError::Corrupt)?;
        let parameters: Vec<PluginParameter> = serde_json::from_value(row.parameters)?;

        Ok(Plugin {
            id: row.id,
            name: row.name,
            version: row.version,
            plugin_type,
            dock_image: row.dock_image,
            selfpath: row.selfpath,
            selfexec: row.selfexec,
            execshell: row.execshell,
            min_cpu_limit: row.min_cpu_limit,
            max_cpu_limit: row.max_cpu_limit,
            min_memory_limit: row.min_memory_limit,
            max_memory_limit: row.max_memory_limit,
            min_number_of_workers: row.min_number_of_workers,
            max_number_of_workers: row.max_number_of_workers,
            min_gpu_limit: row.min_gpu_limit,
            max_gpu_limit: row.max_gpu_limit,
            parameters,
            compute_resources: row.compute_resources,
        })
    }
}
