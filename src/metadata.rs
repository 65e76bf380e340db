//! Checksum metadata store
//!
//! One JSON record per cached artifact, stored as `<metadata-root>/<id>.json`
//! where `id` is the SHA-256 of the artifact path. A record ties the artifact
//! to a fingerprint of the source it was built from; the artifact is valid
//! only while that fingerprint still matches the source.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::UNIX_EPOCH;

use crate::storage::{DiskBackend, StorageError};

/// Persisted record for one cached artifact
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetadataRecord {
    /// SHA-256 hex of the artifact path; also the filename stem
    pub id: String,
    /// Resolved source location (local path or URL), for diagnostics
    pub path: String,
    /// Fingerprint of the source the artifact was built from
    pub checksum: String,
}

/// How local source fingerprints are computed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChecksumMode {
    /// Hash of the full file content. Exact, reads the whole file.
    #[default]
    Content,
    /// Hash of size and modification time. Cheap, misses same-size edits
    /// that keep the mtime.
    SizeMtime,
}

/// SHA-256 hex digest
pub fn sha256_hex(data: impl AsRef<[u8]>) -> String {
    hex::encode(Sha256::digest(data.as_ref()))
}

/// Record id for an artifact path
pub fn artifact_id(artifact_path: &Path) -> String {
    sha256_hex(artifact_path.to_string_lossy().as_bytes())
}

/// Fingerprint of a local source file
pub async fn local_checksum(path: &Path, mode: ChecksumMode) -> std::io::Result<String> {
    match mode {
        ChecksumMode::Content => {
            let data = tokio::fs::read(path).await?;
            Ok(sha256_hex(&data))
        }
        ChecksumMode::SizeMtime => {
            let meta = tokio::fs::metadata(path).await?;
            let mtime_nanos = meta
                .modified()?
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_nanos())
                .unwrap_or(0);
            Ok(sha256_hex(format!("{}:{}", meta.len(), mtime_nanos)))
        }
    }
}

/// Fingerprint of a remote source from its validators alone
pub fn remote_checksum(etag: Option<&str>, last_modified: Option<&str>) -> String {
    sha256_hex(format!(
        "{}|{}",
        etag.unwrap_or_default(),
        last_modified.unwrap_or_default()
    ))
}

/// Directory of metadata records
#[derive(Clone)]
pub struct MetadataStore {
    root: PathBuf,
    backend: Arc<dyn DiskBackend>,
}

impl MetadataStore {
    pub fn new(root: impl Into<PathBuf>, backend: Arc<dyn DiskBackend>) -> Self {
        Self {
            root: root.into(),
            backend,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn record_path(&self, id: &str) -> PathBuf {
        self.root.join(format!("{}.json", id))
    }

    /// Record for `id`. Missing and unreadable records both read as absent.
    pub async fn lookup(&self, id: &str) -> Option<MetadataRecord> {
        let path = self.record_path(id);
        let data = match self.backend.read_file(&path).await {
            Ok(data) => data,
            Err(e) if e.is_not_found() => return None,
            Err(e) => {
                tracing::warn!(id = %id, error = %e, "Failed to read metadata record");
                return None;
            }
        };

        match serde_json::from_slice::<MetadataRecord>(&data) {
            Ok(record) => Some(record),
            Err(e) => {
                tracing::warn!(id = %id, error = %e, "Ignoring corrupt metadata record");
                None
            }
        }
    }

    /// Persist a record, replacing any previous one atomically
    pub async fn put(&self, record: &MetadataRecord) -> Result<(), StorageError> {
        let json = serde_json::to_vec(record)?;
        self.backend
            .write_file_atomic(&self.record_path(&record.id), Bytes::from(json))
            .await?;
        tracing::debug!(id = %record.id, path = %record.path, "Stored metadata record");
        Ok(())
    }

    pub async fn delete(&self, id: &str) -> Result<(), StorageError> {
        self.backend.delete_file(&self.record_path(id)).await
    }

    /// Whether the record still describes a source with this checksum
    pub fn is_fresh(&self, record: &MetadataRecord, current_checksum: &str) -> bool {
        record.checksum == current_checksum
    }
}
