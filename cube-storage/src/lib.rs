//! Cube Storage
//!
//! Uniform object-storage interface used by the execution engine to read
//! plugin inputs and register plugin outputs.
//!
//! Objects are path-addressed byte blobs. Paths are `/`-separated strings with
//! no leading slash. Two backends are provided:
//! - [`FilesystemStorage`]: a directory tree on local disk
//! - [`SwiftStorage`]: an OpenStack Swift container reached over HTTP
//!
//! The backend is chosen once at startup from a typed [`StorageConfig`].
//!
//! # Example
//!
//! ```no_run
//! use cube_storage::{StorageBackend, StorageConfig, connect_storage};
//!
//! # async fn example() -> cube_storage::Result<()> {
//! let storage = connect_storage(&StorageConfig::Filesystem {
//!     root: "/var/lib/cube/media".into(),
//! })
//! .await?;
//!
//! storage.upload("home/jane/uploads/notes.txt", b"hello".to_vec()).await?;
//! assert!(storage.obj_exists("home/jane/uploads/notes.txt").await?);
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
mod filesystem;
pub mod retry;
mod swift;

pub use config::{StorageConfig, SwiftConfig, connect_storage};
pub use error::{Result, StorageError};
pub use filesystem::FilesystemStorage;
pub use retry::RetryPolicy;
pub use swift::SwiftStorage;

use async_trait::async_trait;

/// Object storage operations shared by every backend
///
/// The path-scoped composites (`copy_path`, `move_path`, `delete_path`) have
/// default implementations built from `ls` and the single-object primitives.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Short backend name used in logs
    fn name(&self) -> &'static str;

    /// List every object stored at `prefix` or below it
    async fn ls(&self, prefix: &str) -> Result<Vec<String>>;

    /// Whether any object is stored at `prefix` or below it
    async fn path_exists(&self, prefix: &str) -> Result<bool>;

    /// Whether an object is stored exactly at `path`
    async fn obj_exists(&self, path: &str) -> Result<bool>;

    async fn upload(&self, path: &str, contents: Vec<u8>) -> Result<()>;

    async fn download(&self, path: &str) -> Result<Vec<u8>>;

    /// Copy a single object
    async fn copy(&self, src: &str, dst: &str) -> Result<()>;

    /// Delete a single object
    async fn delete(&self, path: &str) -> Result<()>;

    /// Copy every object under `src` to the same relative location under `dst`
    async fn copy_path(&self, src: &str, dst: &str) -> Result<()> {
        let objects = self.ls(src).await?;
        if objects.is_empty() {
            return Err(StorageError::NotFound(src.to_string()));
        }
        for obj in &objects {
            self.copy(obj, &rebase(obj, src, dst)).await?;
        }
        Ok(())
    }

    /// Move every object under `src` to the same relative location under `dst`
    async fn move_path(&self, src: &str, dst: &str) -> Result<()> {
        self.copy_path(src, dst).await?;
        self.delete_path(src).await
    }

    /// Delete every object under `path`
    async fn delete_path(&self, path: &str) -> Result<()> {
        let objects = self.ls(path).await?;
        if objects.is_empty() {
            return Err(StorageError::NotFound(path.to_string()));
        }
        for obj in &objects {
            self.delete(obj).await?;
        }
        Ok(())
    }

    /// Check that the backend is reachable
    async fn check_connection(&self) -> Result<()> {
        self.path_exists("").await.map(|_| ())
    }
}

/// Normalize a storage path: no surrounding slashes, no empty components
pub fn normalize_path(path: &str) -> String {
    path.split('/')
        .filter(|part| !part.is_empty())
        .collect::<Vec<_>>()
        .join("/")
}

/// Whether `obj` is `prefix` itself or lies below it
pub fn is_under(obj: &str, prefix: &str) -> bool {
    let prefix = prefix.trim_matches('/');
    prefix.is_empty()
        || obj == prefix
        || obj
            .strip_prefix(prefix)
            .is_some_and(|rest| rest.starts_with('/'))
}

/// Map `obj`, located under `src`, to the same relative location under `dst`
pub fn rebase(obj: &str, src: &str, dst: &str) -> String {
    let src = src.trim_matches('/');
    let dst = dst.trim_matches('/');
    let rest = obj.strip_prefix(src).unwrap_or(obj).trim_start_matches('/');
    match (dst.is_empty(), rest.is_empty()) {
        (_, true) => dst.to_string(),
        (true, false) => rest.to_string(),
        (false, false) => format!("{}/{}", dst, rest),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_path() {
        assert_eq!(normalize_path("/home//jane/uploads/"), "home/jane/uploads");
        assert_eq!(normalize_path("/"), "");
    }

    #[test]
    fn test_is_under_respects_component_boundaries() {
        assert!(is_under("home/jane/feeds/feed_1/x.txt", "home/jane/feeds/feed_1"));
        assert!(is_under("home/jane/feeds/feed_1", "home/jane/feeds/feed_1/"));
        assert!(!is_under("home/jane/feeds/feed_10/x.txt", "home/jane/feeds/feed_1"));
        assert!(is_under("anything", ""));
    }

    #[test]
    fn test_rebase() {
        assert_eq!(rebase("a/b/c.txt", "a/b", "x/y"), "x/y/c.txt");
        assert_eq!(rebase("a/b", "a/b", "x"), "x");
        assert_eq!(rebase("a/b/c/d.txt", "a/", ""), "b/c/d.txt");
    }
}
