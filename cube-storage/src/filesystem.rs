//! Local filesystem backend
//!
//! Objects are regular files below a root directory. Directories only exist
//! while they hold objects: deletes prune the parents they leave empty.

use async_trait::async_trait;
use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};
use tokio::fs;
use tracing::debug;

use crate::error::{Result, StorageError};
use crate::{StorageBackend, normalize_path, rebase};

/// Storage backend rooted at a local directory
#[derive(Debug, Clone)]
pub struct FilesystemStorage {
    root: PathBuf,
}

impl FilesystemStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Map an object key onto a location below the root
    fn resolve(&self, key: &str) -> Result<PathBuf> {
        let key = normalize_path(key);
        let relative = Path::new(&key);
        if relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_)))
        {
            return Err(StorageError::InvalidKey(key));
        }
        Ok(self.root.join(relative))
    }

    fn key_for(&self, path: &Path) -> Option<String> {
        let relative = path.strip_prefix(&self.root).ok()?;
        let parts: Vec<_> = relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy().into_owned())
            .collect();
        Some(parts.join("/"))
    }

    async fn ensure_parent(path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        Ok(())
    }

    /// Remove the directories left empty above `path`, up to the root
    async fn prune_empty_parents(&self, path: &Path) -> Result<()> {
        let mut dir = path.parent();
        while let Some(current) = dir {
            if current == self.root || !current.starts_with(&self.root) {
                break;
            }
            match fs::remove_dir(current).await {
                Ok(()) => dir = current.parent(),
                Err(e) if e.kind() == ErrorKind::NotFound => dir = current.parent(),
                // Not empty (or not removable): nothing above can be empty either
                Err(_) => break,
            }
        }
        Ok(())
    }
}

#[async_trait]
impl StorageBackend for FilesystemStorage {
    fn name(&self) -> &'static str {
        "filesystem"
    }

    async fn ls(&self, prefix: &str) -> Result<Vec<String>> {
        let start = self.resolve(prefix)?;
        let metadata = match fs::metadata(&start).await {
            Ok(m) => m,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        if metadata.is_file() {
            return Ok(vec![normalize_path(prefix)]);
        }

        let mut objects = Vec::new();
        let mut pending = vec![start];
        while let Some(dir) = pending.pop() {
            let mut entries = fs::read_dir(&dir).await?;
            while let Some(entry) = entries.next_entry().await? {
                let file_type = entry.file_type().await?;
                let path = entry.path();
                if file_type.is_dir() {
                    pending.push(path);
                } else if let Some(key) = self.key_for(&path) {
                    objects.push(key);
                }
            }
        }
        objects.sort();
        Ok(objects)
    }

    async fn path_exists(&self, prefix: &str) -> Result<bool> {
        let start = self.resolve(prefix)?;
        let metadata = match fs::metadata(&start).await {
            Ok(m) => m,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(e.into()),
        };
        if metadata.is_file() {
            return Ok(true);
        }

        // A directory counts only if some object lives below it
        let mut pending = vec![start];
        while let Some(dir) = pending.pop() {
            let mut entries = fs::read_dir(&dir).await?;
            while let Some(entry) = entries.next_entry().await? {
                if entry.file_type().await?.is_dir() {
                    pending.push(entry.path());
                } else {
                    return Ok(true);
                }
            }
        }
        Ok(false)
    }

    async fn obj_exists(&self, path: &str) -> Result<bool> {
        let path = self.resolve(path)?;
        match fs::metadata(path).await {
            Ok(m) => Ok(m.is_file()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn upload(&self, path: &str, contents: Vec<u8>) -> Result<()> {
        let target = self.resolve(path)?;
        Self::ensure_parent(&target).await?;
        fs::write(&target, contents).await?;
        debug!("Stored {} ({})", path, target.display());
        Ok(())
    }

    async fn download(&self, path: &str) -> Result<Vec<u8>> {
        let source = self.resolve(path)?;
        fs::read(&source).await.map_err(|e| match e.kind() {
            ErrorKind::NotFound => StorageError::NotFound(path.to_string()),
            _ => e.into(),
        })
    }

    async fn copy(&self, src: &str, dst: &str) -> Result<()> {
        let source = self.resolve(src)?;
        let target = self.resolve(dst)?;
        let is_file = match fs::metadata(&source).await {
            Ok(m) => m.is_file(),
            Err(e) if e.kind() == ErrorKind::NotFound => false,
            Err(e) => return Err(e.into()),
        };
        if !is_file {
            return Err(StorageError::NotFound(src.to_string()));
        }
        if source == target {
            return Ok(());
        }

        // A real copy: the target must not share its contents with the source
        Self::ensure_parent(&target).await?;
        fs::copy(&source, &target).await?;
        Ok(())
    }

    async fn delete(&self, path: &str) -> Result<()> {
        let target = self.resolve(path)?;
        fs::remove_file(&target).await.map_err(|e| match e.kind() {
            ErrorKind::NotFound => StorageError::NotFound(path.to_string()),
            _ => e.into(),
        })?;
        self.prune_empty_parents(&target).await
    }

    async fn move_path(&self, src: &str, dst: &str) -> Result<()> {
        let source = self.resolve(src)?;
        if !fs::try_exists(&source).await? {
            return Err(StorageError::NotFound(src.to_string()));
        }
        let target = self.resolve(dst)?;
        if source == target {
            return Ok(());
        }
        Self::ensure_parent(&target).await?;

        if fs::rename(&source, &target).await.is_ok() {
            self.prune_empty_parents(&source).await?;
        } else {
            // Target already populated or on another device: merge object by object
            for obj in self.ls(src).await? {
                self.copy(&obj, &rebase(&obj, src, dst)).await?;
            }
            self.delete_path(src).await?;
        }
        Ok(())
    }

    async fn delete_path(&self, path: &str) -> Result<()> {
        let target = self.resolve(path)?;
        let metadata = match fs::metadata(&target).await {
            Ok(m) => m,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(StorageError::NotFound(path.to_string()));
            }
            Err(e) => return Err(e.into()),
        };

        if metadata.is_dir() {
            fs::remove_dir_all(&target).await?;
        } else {
            fs::remove_file(&target).await?;
        }
        self.prune_empty_parents(&target).await
    }

    async fn check_connection(&self) -> Result<()> {
        fs::create_dir_all(&self.root).await?;
        Ok(())
    }
}
