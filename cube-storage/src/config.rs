//! Typed storage configuration and backend factory

use serde::Deserialize;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

use crate::error::{Result, StorageError};
use crate::{FilesystemStorage, StorageBackend, SwiftStorage};

/// Credentials and container of a Swift object store
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct SwiftConfig {
    /// Version 1 authentication endpoint (e.g. "http://swift:8080/auth/v1.0")
    pub auth_url: String,
    pub username: String,
    pub key: String,
    pub container_name: String,
}

/// Storage backend selection
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "backend", rename_all = "lowercase")]
pub enum StorageConfig {
    /// Objects are files below `root`
    Filesystem { root: PathBuf },
    /// Objects live in a Swift container
    Swift(SwiftConfig),
}

impl StorageConfig {
    pub fn validate(&self) -> Result<()> {
        match self {
            StorageConfig::Filesystem { root } => {
                if root.as_os_str().is_empty() {
                    return Err(StorageError::Config(
                        "filesystem root cannot be empty".to_string(),
                    ));
                }
            }
            StorageConfig::Swift(swift) => {
                if !swift.auth_url.starts_with("http://") && !swift.auth_url.starts_with("https://")
                {
                    return Err(StorageError::Config(
                        "swift auth_url must start with http:// or https://".to_string(),
                    ));
                }
                if swift.container_name.is_empty() {
                    return Err(StorageError::Config(
                        "swift container_name cannot be empty".to_string(),
                    ));
                }
            }
        }
        Ok(())
    }
}

/// Build the configured backend.
///
/// Called once at startup; the returned handle is shared by every component
/// that touches storage.
pub async fn connect_storage(config: &StorageConfig) -> Result<Arc<dyn StorageBackend>> {
    config.validate()?;

    let storage: Arc<dyn StorageBackend> = match config {
        StorageConfig::Filesystem { root } => {
            tokio::fs::create_dir_all(root).await?;
            Arc::new(FilesystemStorage::new(root.clone()))
        }
        StorageConfig::Swift(swift) => Arc::new(SwiftStorage::new(swift.clone())),
    };

    info!("Using {} storage backend", storage.name());
    Ok(storage)
}
