//! Plugin Instance Service
//!
//! Deletion of plugin instances together with the subtree below them.

use std::collections::{HashSet, VecDeque};

use cube_core::domain::plugin_instance::{PluginInstance, RemoteJobState};
use tracing::info;
use uuid::Uuid;

use super::status::{self, StatusError};
use crate::context::ServiceContext;
use crate::repository::StoreError;

/// The instance followed by every instance below it, breadth-first
pub async fn collect_descendants(
    ctx: &ServiceContext,
    root_id: Uuid,
) -> Result<Vec<PluginInstance>, StoreError> {
    let Some(root) = ctx.store.get_instance(root_id).await? else {
        return Ok(Vec::new());
    };

    let mut seen = HashSet::from([root.id]);
    let mut queue = VecDeque::from([root.id]);
    let mut found = vec![root];
    while let Some(id) = queue.pop_front() {
        for child in ctx.store.list_children(id).await? {
            if seen.insert(child.id) {
                queue.push_back(child.id);
                found.push(child);
            }
        }
    }
    Ok(found)
}

/// Delete an instance and its descendants, queueing the removal of every
/// remote job they left behind. Returns the number of deleted instances.
pub async fn delete_plugin_instance(
    ctx: &ServiceContext,
    user: &str,
    id: Uuid,
) -> Result<usize, StatusError> {
    let inst = ctx
        .store
        .get_instance(id)
        .await?
        .ok_or(StatusError::NotFound(id))?;
    if inst.owner != user {
        return Err(StatusError::PermissionDenied(format!(
            "user {} does not own plugin instance {}",
            user, id
        )));
    }

    let doomed = collect_descendants(ctx, id).await?;
    for d in doomed.iter().filter(|d| d.remote_job == RemoteJobState::Submitted) {
        status::schedule_remote_deletion(ctx, d).await;
    }

    ctx.store.delete_instances(&[id]).await?;
    info!(
        "Deleted plugin instance {} and {} descendant(s)",
        id,
        doomed.len() - 1
    );
    Ok(doomed.len())
}
