//! File System Access Implementation using Tokio

use async_trait::async_trait;
use bridge_traits::{error::Result, storage::FileSystemAccess};
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::debug;

/// Tokio-based file system implementation
///
/// The cache directory defaults to the platform cache dir
/// (`~/.cache/media-cache` on Linux). Free space comes from `statvfs` /
/// `GetDiskFreeSpaceEx` through `fs2`.
pub struct TokioFileSystem {
    cache_dir: PathBuf,
}

impl TokioFileSystem {
    pub fn new() -> Self {
        let cache_dir = dirs::cache_dir()
            .unwrap_or_else(std::env::temp_dir)
            .join("media-cache");

        Self { cache_dir }
    }

    pub fn with_cache_directory(cache_dir: PathBuf) -> Self {
        Self { cache_dir }
    }

    /// Nearest existing ancestor, since `fs2` needs a real path to stat.
    fn existing_ancestor(path: &Path) -> &Path {
        let mut current = path;
        while !current.exists() {
            match current.parent() {
                Some(parent) => current = parent,
                None => break,
            }
        }
        current
    }
}

impl Default for TokioFileSystem {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl FileSystemAccess for TokioFileSystem {
    async fn get_cache_directory(&self) -> Result<PathBuf> {
        if !self.cache_dir.exists() {
            fs::create_dir_all(&self.cache_dir).await?;
            debug!(path = ?self.cache_dir, "Created cache directory");
        }
        Ok(self.cache_dir.clone())
    }

    async fn create_dir_all(&self, path: &Path) -> Result<()> {
        fs::create_dir_all(path).await?;
        Ok(())
    }

    async fn available_space(&self, path: &Path) -> Result<u64> {
        let target = Self::existing_ancestor(path).to_path_buf();
        let bytes = tokio::task::spawn_blocking(move || fs2::available_space(&target))
            .await
            .map_err(|e| bridge_traits::BridgeError::OperationFailed(e.to_string()))??;
        Ok(bytes)
    }

    async fn total_space(&self, path: &Path) -> Result<u64> {
        let target = Self::existing_ancestor(path).to_path_buf();
        let bytes = tokio::task::spawn_blocking(move || fs2::total_space(&target))
            .await
            .map_err(|e| bridge_traits::BridgeError::OperationFailed(e.to_string()))??;
        Ok(bytes)
    }
}
