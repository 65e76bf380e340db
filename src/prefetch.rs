//! Prefetch engine
//!
//! Walks the image root once and converts every eligible file into every
//! enabled format, through the same service path live requests take. A
//! bounded number of conversions run at a time; failures are counted and
//! skipped.

use futures::stream::{self, StreamExt};
use serde::Serialize;
use std::path::{Component, Path, PathBuf};
use std::time::Instant;

use crate::service::{ArtifactStatus, ImageService};
use crate::transcoder::OutputFormat;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PrefetchReport {
    pub files_scanned: u64,
    pub files_converted: u64,
    /// Conversions skipped because a fresh artifact already existed
    pub files_cached: u64,
    pub failures: u64,
    pub bytes_written: u64,
    pub duration_ms: u64,
}

pub struct PrefetchEngine {
    service: ImageService,
    formats: Vec<OutputFormat>,
    jobs: usize,
}

impl PrefetchEngine {
    pub fn new(service: ImageService, jobs: usize) -> Self {
        let formats = service.options().toggles.enabled_formats();
        Self {
            service,
            formats,
            jobs: jobs.max(1),
        }
    }

    /// Run once over the whole image root
    pub async fn run(&self) -> PrefetchReport {
        let started = Instant::now();
        let root = self.service.resolver().image_root().to_path_buf();
        let mut report = PrefetchReport::default();

        let files = match self.service.backend().walk_files(&root).await {
            Ok(files) => files,
            Err(e) => {
                tracing::error!(root = %root.display(), error = %e, "Prefetch could not walk image root");
                return report;
            }
        };

        let mut work = Vec::new();
        for file in files {
            let ext = file
                .path
                .extension()
                .map(|e| e.to_string_lossy().to_ascii_lowercase())
                .unwrap_or_default();
            if !self.service.resolver().is_allowed_extension(&ext) {
                continue;
            }
            let Some(request_path) = request_path_for(&root, &file.path) else {
                continue;
            };
            report.files_scanned += 1;
            for format in &self.formats {
                work.push((request_path.clone(), *format));
            }
        }

        tracing::info!(
            root = %root.display(),
            files = report.files_scanned,
            conversions = work.len(),
            jobs = self.jobs,
            "Prefetch started"
        );

        let results: Vec<_> = stream::iter(work)
            .map(|(path, format)| {
                let service = self.service.clone();
                async move {
                    let result = service.prefetch(&path, format).await;
                    (path, format, result)
                }
            })
            .buffer_unordered(self.jobs)
            .collect()
            .await;

        for (path, format, result) in results {
            match result {
                Ok(ArtifactStatus::Converted { size, .. }) => {
                    report.files_converted += 1;
                    report.bytes_written += size;
                }
                Ok(ArtifactStatus::Cached(_)) => report.files_cached += 1,
                Ok(ArtifactStatus::Passthrough) => {}
                Err(e) => {
                    tracing::warn!(path = %path, format = %format, error = %e, "Prefetch conversion failed");
                    report.failures += 1;
                }
            }
        }

        report.duration_ms = started.elapsed().as_millis() as u64;
        tracing::info!(
            files_scanned = report.files_scanned,
            files_converted = report.files_converted,
            files_cached = report.files_cached,
            failures = report.failures,
            bytes_written = report.bytes_written,
            duration_ms = report.duration_ms,
            "Prefetch complete"
        );
        report
    }
}

/// `/`-separated request path for a file under `root`
fn request_path_for(root: &Path, file: &Path) -> Option<String> {
    let rel: PathBuf = file.strip_prefix(root).ok()?.to_path_buf();
    let mut out = String::new();
    for component in rel.components() {
        match component {
            Component::Normal(part) => {
                out.push('/');
                out.push_str(&urlencoding::encode(&part.to_string_lossy()));
            }
            _ => return None,
        }
    }
    (!out.is_empty()).then_some(out)
}
