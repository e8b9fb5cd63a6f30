//! Storage Abstractions
//!
//! The cache performs its own file I/O inside a directory it owns; the host
//! only tells it where that directory lives and how much room is left.

use async_trait::async_trait;
use std::path::{Path, PathBuf};

use crate::error::Result;

/// File system access trait
///
/// # Example
///
/// ```ignore
/// use bridge_traits::storage::FileSystemAccess;
///
/// async fn media_dir(fs: &dyn FileSystemAccess) -> Result<PathBuf> {
///     let dir = fs.get_cache_directory().await?.join("media");
///     fs.create_dir_all(&dir).await?;
///     Ok(dir)
/// }
/// ```
#[async_trait]
pub trait FileSystemAccess: Send + Sync {
    /// Get the application's cache directory
    ///
    /// This directory is suitable for files the system may purge when
    /// storage is low.
    async fn get_cache_directory(&self) -> Result<PathBuf>;

    /// Create a directory and all parent directories if they don't exist
    async fn create_dir_all(&self, path: &Path) -> Result<()>;

    /// Bytes available to this process on the volume holding `path`
    async fn available_space(&self, path: &Path) -> Result<u64>;

    /// Total capacity of the volume holding `path`
    async fn total_space(&self, path: &Path) -> Result<u64>;
}
