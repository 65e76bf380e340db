//! Backend trait for filesystem operations

use super::error::StorageError;
use async_trait::async_trait;
use bytes::Bytes;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

/// A regular file found while walking a cache tree
#[derive(Debug, Clone)]
pub struct FileEntry {
    pub path: PathBuf,
    pub size: u64,
    pub modified: SystemTime,
    /// None when the filesystem does not track access times
    pub accessed: Option<SystemTime>,
}

/// Abstraction over filesystem operations used by every on-disk component
#[async_trait]
pub trait DiskBackend: Send + Sync {
    /// Read entire file contents
    async fn read_file(&self, path: &Path) -> Result<Bytes, StorageError>;

    /// Write file contents atomically (unique temp file + rename).
    /// Readers observe either the old contents or the new, never a partial file.
    async fn write_file_atomic(&self, path: &Path, data: Bytes) -> Result<(), StorageError>;

    /// Delete a file. Missing files are not an error.
    async fn delete_file(&self, path: &Path) -> Result<(), StorageError>;

    /// Size of a file in bytes
    async fn file_size(&self, path: &Path) -> Result<u64, StorageError>;

    /// True if `path` exists and is a regular file
    async fn is_file(&self, path: &Path) -> bool;

    /// Recursively list regular files under `root`, skipping in-flight temp files.
    /// A missing root yields an empty list.
    async fn walk_files(&self, root: &Path) -> Result<Vec<FileEntry>, StorageError>;
}
