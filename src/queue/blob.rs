//! Blob storage boundary for export artifacts.

use std::path::{Path, PathBuf};

use async_trait::async_trait;

use crate::domain::{CoreError, Result};

#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn put(&self, path: &str, bytes: &[u8]) -> Result<()>;

    async fn exists(&self, path: &str) -> Result<bool>;

    async fn delete(&self, path: &str) -> Result<bool>;

    /// Delete every blob under the prefix; returns the count removed.
    async fn delete_prefix(&self, prefix: &str) -> Result<usize>;
}

/// Filesystem-backed store rooted at a configured directory.
pub struct FsBlobStore {
    root: PathBuf,
}

impl FsBlobStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn resolve(&self, path: &str) -> Result<PathBuf> {
        // Reject traversal; blob paths are always relative keys.
        if path.split('/').any(|segment| segment == "..") || Path::new(path).is_absolute() {
            return Err(CoreError::Config(format!("invalid blob path: {path}")));
        }
        Ok(self.root.join(path))
    }
}

#[async_trait]
impl BlobStore for FsBlobStore {
    async fn put(&self, path: &str, bytes: &[u8]) -> Result<()> {
        let full = self.resolve(path)?;
        if let Some(parent) = full.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(full, bytes).await?;
        Ok(())
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        let full = self.resolve(path)?;
        Ok(tokio::fs::try_exists(full).await?)
    }

    async fn delete(&self, path: &str) -> Result<bool> {
        let full = self.resolve(path)?;
        match tokio::fs::remove_file(full).await {
            Ok(()) => Ok(true),
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(error) => Err(error.into()),
        }
    }

    async fn delete_prefix(&self, prefix: &str) -> Result<usize> {
        let full = self.resolve(prefix)?;
        if !tokio::fs::try_exists(&full).await? {
            return Ok(0);
        }
        let mut deleted = 0usize;
        let mut stack = vec![full.clone()];
        while let Some(dir) = stack.pop() {
            let mut entries = tokio::fs::read_dir(&dir).await?;
            while let Some(entry) = entries.next_entry().await? {
                let path = entry.path();
                if entry.file_type().await?.is_dir() {
                    stack.push(path);
                } else {
                    tokio::fs::remove_file(path).await?;
                    deleted += 1;
                }
            }
        }
        tokio::fs::remove_dir_all(full).await.ok();
        Ok(deleted)
    }
}
