//! Cache eviction scheduler
//!
//! Keeps the exhaust, metadata and remote-raw trees under a byte budget by
//! deleting the oldest artifacts and raw copies first. The source image root
//! is never touched.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use crate::locks::ConversionLocks;
use crate::metadata::{artifact_id, MetadataStore};
use crate::storage::{DiskBackend, FileEntry};

/// Which timestamp decides "oldest"
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvictionOrder {
    /// Last access, falling back to mtime where atime is not tracked
    #[default]
    AccessTime,
    ModifiedTime,
}

impl EvictionOrder {
    fn timestamp(&self, entry: &FileEntry) -> SystemTime {
        match self {
            EvictionOrder::AccessTime => entry.accessed.unwrap_or(entry.modified),
            EvictionOrder::ModifiedTime => entry.modified,
        }
    }
}

/// Outcome of one eviction pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EvictionReport {
    pub bytes_before: u64,
    pub bytes_after: u64,
    pub files_deleted: usize,
    pub skipped_locked: usize,
    pub failures: usize,
}

enum Candidate {
    Artifact { entry: FileEntry, id: String },
    RemoteRaw { entry: FileEntry },
}

impl Candidate {
    fn entry(&self) -> &FileEntry {
        match self {
            Candidate::Artifact { entry, .. } | Candidate::RemoteRaw { entry } => entry,
        }
    }
}

pub struct EvictionScheduler {
    exhaust_root: PathBuf,
    remote_raw_root: PathBuf,
    metadata: MetadataStore,
    backend: Arc<dyn DiskBackend>,
    locks: Arc<ConversionLocks>,
    max_bytes: u64,
    order: EvictionOrder,
}

impl EvictionScheduler {
    pub fn new(
        exhaust_root: impl Into<PathBuf>,
        remote_raw_root: impl Into<PathBuf>,
        metadata: MetadataStore,
        backend: Arc<dyn DiskBackend>,
        locks: Arc<ConversionLocks>,
        max_bytes: u64,
        order: EvictionOrder,
    ) -> Self {
        Self {
            exhaust_root: exhaust_root.into(),
            remote_raw_root: remote_raw_root.into(),
            metadata,
            backend,
            locks,
            max_bytes,
            order,
        }
    }

    async fn walk(&self, root: &Path) -> Vec<FileEntry> {
        match self.backend.walk_files(root).await {
            Ok(files) => files,
            Err(e) => {
                tracing::warn!(root = %root.display(), error = %e, "Failed to walk cache tree");
                Vec::new()
            }
        }
    }

    /// One pass: delete oldest-first until the trees fit the budget
    pub async fn run_once(&self) -> EvictionReport {
        let started = Instant::now();
        let artifacts = self.walk(&self.exhaust_root).await;
        let records = self.walk(self.metadata.root()).await;
        let raw_files = self.walk(&self.remote_raw_root).await;

        let record_sizes: HashMap<PathBuf, u64> =
            records.iter().map(|e| (e.path.clone(), e.size)).collect();
        let sidecar_sizes: HashMap<PathBuf, u64> = raw_files
            .iter()
            .filter(|e| is_sidecar(&e.path))
            .map(|e| (e.path.clone(), e.size))
            .collect();

        let mut total: u64 = artifacts
            .iter()
            .chain(records.iter())
            .chain(raw_files.iter())
            .map(|e| e.size)
            .sum();
        let mut report = EvictionReport {
            bytes_before: total,
            ..Default::default()
        };

        if total <= self.max_bytes {
            report.bytes_after = total;
            return report;
        }

        let mut candidates: Vec<Candidate> = artifacts
            .into_iter()
            .filter_map(|entry| {
                let rel = entry.path.strip_prefix(&self.exhaust_root).ok()?;
                let id = artifact_id(rel);
                Some(Candidate::Artifact { entry, id })
            })
            .chain(
                raw_files
                    .into_iter()
                    .filter(|e| !is_sidecar(&e.path))
                    .map(|entry| Candidate::RemoteRaw { entry }),
            )
            .collect();
        candidates.sort_by_key(|c| self.order.timestamp(c.entry()));

        for candidate in candidates {
            if total <= self.max_bytes {
                break;
            }
            match candidate {
                Candidate::Artifact { entry, id } => {
                    if self.locks.is_locked(&id) {
                        report.skipped_locked += 1;
                        continue;
                    }
                    if let Err(e) = self.backend.delete_file(&entry.path).await {
                        tracing::warn!(path = %entry.path.display(), error = %e, "Failed to evict artifact");
                        report.failures += 1;
                        continue;
                    }
                    total = total.saturating_sub(entry.size);
                    report.files_deleted += 1;

                    let record_path = self.metadata.record_path(&id);
                    match self.metadata.delete(&id).await {
                        Ok(()) => {
                            let freed = record_sizes.get(&record_path).copied().unwrap_or(0);
                            total = total.saturating_sub(freed);
                        }
                        Err(e) => {
                            tracing::warn!(id = %id, error = %e, "Failed to delete metadata record");
                            report.failures += 1;
                        }
                    }
                    tracing::debug!(path = %entry.path.display(), size_bytes = entry.size, "Evicted artifact");
                }
                Candidate::RemoteRaw { entry } => {
                    if let Err(e) = self.backend.delete_file(&entry.path).await {
                        tracing::warn!(path = %entry.path.display(), error = %e, "Failed to evict remote copy");
                        report.failures += 1;
                        continue;
                    }
                    total = total.saturating_sub(entry.size);
                    report.files_deleted += 1;

                    let sidecar = sidecar_for(&entry.path);
                    if self.backend.delete_file(&sidecar).await.is_ok() {
                        let freed = sidecar_sizes.get(&sidecar).copied().unwrap_or(0);
                        total = total.saturating_sub(freed);
                    }
                    tracing::debug!(path = %entry.path.display(), size_bytes = entry.size, "Evicted remote copy");
                }
            }
        }

        report.bytes_after = total;
        tracing::info!(
            bytes_before = report.bytes_before,
            bytes_after = report.bytes_after,
            budget_bytes = self.max_bytes,
            files_deleted = report.files_deleted,
            skipped_locked = report.skipped_locked,
            failures = report.failures,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Eviction pass complete"
        );
        report
    }

    /// Run a pass every `interval` until the task is aborted
    pub fn spawn(self: Arc<Self>, interval: Duration) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                self.run_once().await;
            }
        })
    }
}

fn is_sidecar(path: &Path) -> bool {
    path.extension().map(|e| e == "json").unwrap_or(false)
}

fn sidecar_for(raw_path: &Path) -> PathBuf {
    let mut name = raw_path.as_os_str().to_owned();
    name.push(".json");
    PathBuf::from(name)
}
