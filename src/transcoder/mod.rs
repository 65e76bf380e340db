//! Transcoder
//!
//! Runs one source image through a [`Transform`] and writes the result into
//! the cache tree:
//!
//! ```text
//! read source → transform on the blocking pool (bounded by a timeout) → atomic write
//! ```
//!
//! On any failure nothing is written, so the cache directory never holds a
//! partial artifact. The [`Transform`] seam keeps encoders swappable; tests
//! plug in fakes that count invocations.

pub mod encoder;
pub mod error;
pub mod params;
pub mod pipeline;

pub use encoder::{EncoderFactory, EncoderQuality, ImageEncoder};
pub use error::TranscodeError;
pub use params::{content_type_for_extension, CropStrategy, ExtraParams, OutputFormat};
pub use pipeline::ImagePipeline;

use bytes::Bytes;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::storage::DiskBackend;

/// Everything an encoder needs to know about one conversion
#[derive(Debug, Clone)]
pub struct TranscodeJob {
    pub format: OutputFormat,
    /// Lower-cased source extension, used when magic bytes are inconclusive
    pub source_type: String,
    /// 1-100
    pub quality: u8,
    pub strip_metadata: bool,
    pub extra: Option<ExtraParams>,
    pub crop: CropStrategy,
}

/// Narrow encoder seam: source bytes in, encoded bytes out.
///
/// Called on the blocking thread pool.
pub trait Transform: Send + Sync {
    fn transform(&self, source: &[u8], job: &TranscodeJob) -> Result<Vec<u8>, TranscodeError>;
}

/// A finished artifact on disk
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Artifact {
    pub path: PathBuf,
    pub size: u64,
}

/// Reads sources, runs the transform and persists artifacts atomically
#[derive(Clone)]
pub struct Transcoder {
    transform: Arc<dyn Transform>,
    backend: Arc<dyn DiskBackend>,
    timeout: Duration,
}

impl Transcoder {
    pub fn new(
        transform: Arc<dyn Transform>,
        backend: Arc<dyn DiskBackend>,
        timeout: Duration,
    ) -> Self {
        Self {
            transform,
            backend,
            timeout,
        }
    }

    /// Transcode `source` into `dest`
    pub async fn transcode(
        &self,
        source: &Path,
        dest: &Path,
        job: &TranscodeJob,
    ) -> Result<Artifact, TranscodeError> {
        let started = Instant::now();
        let data = self.backend.read_file(source).await?;

        let encoded = self.run_transform(data, job.clone()).await?;
        let size = encoded.len() as u64;

        self.backend
            .write_file_atomic(dest, Bytes::from(encoded))
            .await?;

        tracing::info!(
            source = %source.display(),
            dest = %dest.display(),
            format = %job.format,
            size_bytes = size,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Transcoded image"
        );

        Ok(Artifact {
            path: dest.to_path_buf(),
            size,
        })
    }

    async fn run_transform(&self, data: Bytes, job: TranscodeJob) -> Result<Vec<u8>, TranscodeError> {
        let transform = Arc::clone(&self.transform);
        let handle = tokio::task::spawn_blocking(move || transform.transform(&data, &job));

        // A hung encoder keeps its blocking thread, but its output is dropped
        match tokio::time::timeout(self.timeout, handle).await {
            Ok(Ok(result)) => result,
            Ok(Err(join_err)) => Err(TranscodeError::encode_failed(
                "unknown",
                format!("encoder task panicked: {}", join_err),
            )),
            Err(_) => Err(TranscodeError::ProcessingTimeout {
                timeout_ms: self.timeout.as_millis() as u64,
            }),
        }
    }
}
