//! Storage path permissions
//!
//! Path-typed parameter values must lie inside the requesting user's
//! permission scope.

use async_trait::async_trait;

/// Decides which storage paths a user may pass to a plugin
#[async_trait]
pub trait PathPermissions: Send + Sync {
    async fn can_access(&self, user: &str, path: &str) -> bool;
}

/// Top-level folders every user may read
const SHARED_ROOTS: [&str; 4] = ["SHARED", "PUBLIC", "SERVICES", "PIPELINES"];

/// Grants a user their own home folder and the shared top-level folders
#[derive(Debug, Clone, Copy, Default)]
pub struct UserScopedPermissions;

#[async_trait]
impl PathPermissions for UserScopedPermissions {
    async fn can_access(&self, user: &str, path: &str) -> bool {
        let mut parts = path.split('/').filter(|p| !p.is_empty());
        match (parts.next(), parts.next()) {
            (Some("home"), Some(owner)) => owner == user,
            (Some(root), _) => SHARED_ROOTS.contains(&root),
            (None, _) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_user_scope() {
        let perms = UserScopedPermissions;

        assert!(perms.can_access("jane", "home/jane/uploads/brain.nii").await);
        assert!(perms.can_access("jane", "/home/jane/feeds/feed_3").await);
        assert!(perms.can_access("jane", "SHARED/atlas").await);
        assert!(perms.can_access("jane", "PUBLIC").await);

        assert!(!perms.can_access("jane", "home/john/uploads").await);
        assert!(!perms.can_access("jane", "home").await);
        assert!(!perms.can_access("jane", "").await);
        assert!(!perms.can_access("jane", "etc/passwd").await);
    }
}
