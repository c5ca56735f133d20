//! Feed Repository

use cube_core::domain::feed::Feed;
use sqlx::PgPool;
use uuid::Uuid;

use super::StoreResult;

/// Find a feed by ID
pub async fn find_by_id(pool: &PgPool, id: Uuid) -> StoreResult<Option<Feed>> {
    let row = sqlx::query_as::<_, FeedRow>(
        r#"
        SELECT id, name, creator, owners, created_at
        FROM feeds
        WHERE id = $1
        "#,
    )
    .bind(id)
    .fetch_optional(pool)
    .await?;

    Ok(row.map(Into::into))
}

// =============================================================================
// Database Row Types
// =============================================================================

#[derive(sqlx::FromRow)]
struct FeedRow {
    id: Uuid,
    name: String,
    creator: String,
    owners: Vec<String>,
    created_at: chrono::DateTime<chrono::Utc>,
}

impl From<FeedRow> for Feed {
    fn from(row: FeedRow) -> Self {
        Feed {
            id: row.id,
            name: row.name,
            creator: row.creator,
            owners: row.owners,
            created_at: row.created_at,
        }
    }
}
