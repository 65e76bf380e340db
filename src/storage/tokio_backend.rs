//! Tokio-based filesystem backend

use super::backend::{DiskBackend, FileEntry};
use super::error::StorageError;
use super::TEMP_SUFFIX;
use async_trait::async_trait;
use bytes::Bytes;
use std::path::{Path, PathBuf};

/// Portable filesystem backend using tokio::fs
#[derive(Debug, Default, Clone)]
pub struct TokioFsBackend;

impl TokioFsBackend {
    pub fn new() -> Self {
        Self
    }
}

/// Temp path next to `path`, unique per writer so concurrent writers never share one
fn temp_path_for(path: &Path) -> Result<PathBuf, StorageError> {
    let parent = path
        .parent()
        .ok_or_else(|| StorageError::NoParent(path.display().to_string()))?;
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    Ok(parent.join(format!(
        ".{}.{}{}",
        name,
        uuid::Uuid::new_v4().simple(),
        TEMP_SUFFIX
    )))
}

#[async_trait]
impl DiskBackend for TokioFsBackend {
    async fn read_file(&self, path: &Path) -> Result<Bytes, StorageError> {
        let data = tokio::fs::read(path).await?;
        Ok(Bytes::from(data))
    }

    async fn write_file_atomic(&self, path: &Path, data: Bytes) -> Result<(), StorageError> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let temp_path = temp_path_for(path)?;
        if let Err(e) = tokio::fs::write(&temp_path, &data).await {
            let _ = tokio::fs::remove_file(&temp_path).await;
            return Err(e.into());
        }

        if let Err(e) = tokio::fs::rename(&temp_path, path).await {
            let _ = tokio::fs::remove_file(&temp_path).await;
            return Err(e.into());
        }

        Ok(())
    }

    async fn delete_file(&self, path: &Path) -> Result<(), StorageError> {
        match tokio::fs::remove_file(path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn file_size(&self, path: &Path) -> Result<u64, StorageError> {
        let metadata = tokio::fs::metadata(path).await?;
        Ok(metadata.len())
    }

    async fn is_file(&self, path: &Path) -> bool {
        tokio::fs::metadata(path)
            .await
            .map(|m| m.is_file())
            .unwrap_or(false)
    }

    async fn walk_files(&self, root: &Path) -> Result<Vec<FileEntry>, StorageError> {
        let mut files = Vec::new();
        let mut pending = vec![root.to_path_buf()];

        while let Some(dir) = pending.pop() {
            let mut entries = match tokio::fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };

            while let Some(entry) = entries.next_entry().await? {
                let file_type = entry.file_type().await?;
                let path = entry.path();
                if file_type.is_dir() {
                    pending.push(path);
                    continue;
                }
                if !file_type.is_file() {
                    continue;
                }
                if path
                    .file_name()
                    .map(|n| n.to_string_lossy().ends_with(TEMP_SUFFIX))
                    .unwrap_or(false)
                {
                    continue;
                }
                // Raced with a delete; skip it
                let metadata = match entry.metadata().await {
                    Ok(m) => m,
                    Err(_) => continue,
                };
                files.push(FileEntry {
                    path,
                    size: metadata.len(),
                    modified: metadata.modified()?,
                    accessed: metadata.accessed().ok(),
                });
            }
        }

        Ok(files)
    }
}
