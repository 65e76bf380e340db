//! Request orchestration
//!
//! `convert` ties the components together for one request:
//!
//! ```text
//! resolve → source checksum → negotiate → metadata freshness
//!     hit  → serve artifact
//!     miss → conversion lock → transcode → metadata put → serve artifact
//! ```
//!
//! Conversions run in a detached task so a client hanging up never aborts a
//! conversion other waiters are counting on.

use bytes::Bytes;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crate::config::Config;
use crate::constants::LOCK_POLL_INTERVAL_MS;
use crate::error::ConvertError;
use crate::locks::{Clock, ConversionLocks, SystemClock};
use crate::metadata::{
    artifact_id, local_checksum, sha256_hex, ChecksumMode, MetadataRecord, MetadataStore,
};
use crate::negotiation::{self, FormatToggles};
use crate::remote::RemoteFetcher;
use crate::resolver::{ResolvedRequest, Resolver, SourceRef};
use crate::storage::{DiskBackend, TokioFsBackend};
use crate::transcoder::{
    content_type_for_extension, CropStrategy, ExtraParams, ImagePipeline, OutputFormat,
    TranscodeJob, Transcoder, Transform,
};

/// What the front-end hands over for one request
#[derive(Debug, Clone, Default)]
pub struct ConvertRequest {
    /// Raw request path, still percent-encoded
    pub path: String,
    pub query: HashMap<String, String>,
    pub accept: Option<String>,
    pub user_agent: Option<String>,
    /// `scheme://host[:port]` the client addressed, for host-scoped image maps
    pub origin: Option<String>,
}

/// Bytes to send back
#[derive(Debug, Clone)]
pub struct ConvertResponse {
    pub body: Bytes,
    pub content_type: String,
    /// Opaque validator; the front-end sends it as a weak ETag
    pub etag: String,
    pub served_format: OutputFormat,
}

/// Result of making sure an artifact exists
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArtifactStatus {
    /// Already cached and fresh
    Cached(PathBuf),
    /// Produced by this call
    Converted { path: PathBuf, size: u64 },
    /// The transcoder declined this source; serve it unconverted
    Passthrough,
}

/// Request-path settings taken from [`Config`]
#[derive(Debug, Clone)]
pub struct ServiceOptions {
    pub exhaust_root: PathBuf,
    pub quality: u8,
    pub strip_metadata: bool,
    pub enable_extra_params: bool,
    pub crop: CropStrategy,
    pub checksum_mode: ChecksumMode,
    pub toggles: FormatToggles,
    pub lock_wait_timeout: Duration,
    pub lock_poll: Duration,
}

impl ServiceOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            exhaust_root: config.exhaust_path.clone(),
            quality: config.quality,
            strip_metadata: config.strip_metadata,
            enable_extra_params: config.enable_extra_params,
            crop: config.extra_params_crop_interesting,
            checksum_mode: config.checksum_mode,
            toggles: config.format_toggles(),
            lock_wait_timeout: config.lock_wait_timeout(),
            lock_poll: Duration::from_millis(LOCK_POLL_INTERVAL_MS),
        }
    }
}

/// A source available on local disk, with its current fingerprint
#[derive(Debug, Clone)]
struct MaterializedSource {
    path: PathBuf,
    checksum: String,
}

/// Shared by every request; cheap to clone
#[derive(Clone)]
pub struct ImageService {
    inner: Arc<Inner>,
}

struct Inner {
    options: ServiceOptions,
    resolver: Resolver,
    metadata: MetadataStore,
    locks: Arc<ConversionLocks>,
    transcoder: Transcoder,
    remote: RemoteFetcher,
    backend: Arc<dyn DiskBackend>,
}

impl ImageService {
    /// Production wiring: image pipeline encoders, wall clock
    pub fn from_config(config: &Config) -> Result<Self, ConvertError> {
        let transform: Arc<dyn Transform> = Arc::new(ImagePipeline::new(
            config.jxl_encoder.clone(),
            config.encode_timeout(),
        ));
        Self::with_parts(config, transform, Arc::new(SystemClock))
    }

    /// Wiring with an explicit encoder and lock clock
    pub fn with_parts(
        config: &Config,
        transform: Arc<dyn Transform>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, ConvertError> {
        Self::with_backend(config, transform, clock, Arc::new(TokioFsBackend::new()))
    }

    pub fn with_backend(
        config: &Config,
        transform: Arc<dyn Transform>,
        clock: Arc<dyn Clock>,
        backend: Arc<dyn DiskBackend>,
    ) -> Result<Self, ConvertError> {
        let resolver = Resolver::new(
            config.image_path.clone(),
            &config.img_map,
            config.proxy.clone(),
            &config.allowed_types,
        );
        let metadata = MetadataStore::new(config.metadata_path.clone(), backend.clone());
        let locks = Arc::new(ConversionLocks::new(config.lock_ttl(), clock));
        let transcoder = Transcoder::new(transform, backend.clone(), config.encode_timeout());
        let remote = RemoteFetcher::new(
            config.remote_raw_path.clone(),
            backend.clone(),
            config.cache_ttl(),
            config.remote_timeout(),
        )?;

        Ok(Self {
            inner: Arc::new(Inner {
                options: ServiceOptions::from_config(config),
                resolver,
                metadata,
                locks,
                transcoder,
                remote,
                backend,
            }),
        })
    }

    pub fn locks(&self) -> Arc<ConversionLocks> {
        Arc::clone(&self.inner.locks)
    }

    pub fn metadata(&self) -> MetadataStore {
        self.inner.metadata.clone()
    }

    pub fn backend(&self) -> Arc<dyn DiskBackend> {
        Arc::clone(&self.inner.backend)
    }

    pub fn resolver(&self) -> &Resolver {
        &self.inner.resolver
    }

    pub fn options(&self) -> &ServiceOptions {
        &self.inner.options
    }

    pub fn healthz(&self) -> &'static str {
        "OK"
    }

    /// Serve one request in the best format the client takes
    pub async fn convert(&self, request: &ConvertRequest) -> Result<ConvertResponse, ConvertError> {
        let inner = &self.inner;
        let resolved = inner
            .resolver
            .resolve_for_host(&request.path, request.origin.as_deref())?;
        let extra = if inner.options.enable_extra_params {
            ExtraParams::from_query(&request.query)
        } else {
            ExtraParams::default()
        };

        let source = inner.materialize(&resolved).await?;

        let supported = negotiation::negotiate(
            request.accept.as_deref(),
            request.user_agent.as_deref(),
            &inner.options.toggles,
        );
        let format = negotiation::select_format(&supported, &resolved.extension);

        let untouched = format == OutputFormat::Original
            && (extra.is_empty() || !negotiation::is_transcodable(&resolved.extension));
        if untouched {
            return inner.serve_source(&resolved, &source).await;
        }

        let status = self.ensure(&resolved, format, extra, &source).await?;
        let artifact = match status {
            ArtifactStatus::Cached(path) | ArtifactStatus::Converted { path, .. } => path,
            ArtifactStatus::Passthrough => return inner.serve_source(&resolved, &source).await,
        };

        let body = match inner.backend.read_file(&artifact).await {
            Ok(body) => body,
            // Evicted between the freshness check and the read
            Err(e) if e.is_not_found() => {
                tracing::debug!(
                    path = %resolved.request_path,
                    format = %format,
                    "Artifact vanished before read, converting again"
                );
                match self.ensure(&resolved, format, extra, &source).await? {
                    ArtifactStatus::Cached(path) | ArtifactStatus::Converted { path, .. } => {
                        inner.backend.read_file(&path).await?
                    }
                    ArtifactStatus::Passthrough => {
                        return inner.serve_source(&resolved, &source).await
                    }
                }
            }
            Err(e) => return Err(e.into()),
        };
        let content_type = format
            .content_type()
            .unwrap_or_else(|| content_type_for_extension(&resolved.extension));
        Ok(ConvertResponse {
            body,
            content_type: content_type.to_string(),
            etag: etag_for(&source.checksum, format, &extra),
            served_format: format,
        })
    }

    /// Produce one artifact ahead of time, on the same path live requests use
    pub async fn prefetch(
        &self,
        request_path: &str,
        format: OutputFormat,
    ) -> Result<ArtifactStatus, ConvertError> {
        let resolved = self.inner.resolver.resolve(request_path)?;
        if !negotiation::is_transcodable(&resolved.extension) {
            return Ok(ArtifactStatus::Passthrough);
        }
        let source = self.inner.materialize(&resolved).await?;
        self.ensure(&resolved, format, ExtraParams::default(), &source)
            .await
    }

    /// Cached artifact if fresh, otherwise convert in a detached task
    async fn ensure(
        &self,
        resolved: &ResolvedRequest,
        format: OutputFormat,
        extra: ExtraParams,
        source: &MaterializedSource,
    ) -> Result<ArtifactStatus, ConvertError> {
        let key = resolved.cache_key(format, extra);
        let id = key.id();
        let artifact = self.inner.options.exhaust_root.join(key.relative_path());

        if self.inner.is_fresh(&id, &artifact, &source.checksum).await {
            tracing::debug!(path = %resolved.request_path, format = %format, "Cache hit");
            return Ok(ArtifactStatus::Cached(artifact));
        }

        let job = TranscodeJob {
            format,
            source_type: resolved.extension.clone(),
            quality: self.inner.options.quality,
            strip_metadata: self.inner.options.strip_metadata,
            extra: (!extra.is_empty()).then_some(extra),
            crop: self.inner.options.crop,
        };
        let conversion = Conversion {
            id,
            artifact,
            source: source.clone(),
            source_display: resolved.source_display(),
            job,
        };

        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move { inner.convert_locked(conversion).await })
            .await
            .map_err(|e| ConvertError::Encode(format!("conversion task failed: {}", e)))?
    }
}

/// Everything a detached conversion needs, owned
struct Conversion {
    id: String,
    artifact: PathBuf,
    source: MaterializedSource,
    source_display: String,
    job: TranscodeJob,
}

impl Inner {
    async fn materialize(&self, resolved: &ResolvedRequest) -> Result<MaterializedSource, ConvertError> {
        let result = match &resolved.source {
            SourceRef::Local(path) => self.materialize_local(resolved, path).await,
            SourceRef::Remote(url) => self.remote.fetch(url).await.map(|object| MaterializedSource {
                path: object.raw_path,
                checksum: object.checksum,
            }),
        };

        if let Err(ConvertError::SourceNotFound(_) | ConvertError::OriginNotFound(_)) = &result {
            self.purge(resolved).await;
        }
        result
    }

    async fn materialize_local(
        &self,
        resolved: &ResolvedRequest,
        path: &Path,
    ) -> Result<MaterializedSource, ConvertError> {
        if !self.backend.is_file(path).await {
            return Err(ConvertError::SourceNotFound(resolved.request_path.clone()));
        }
        let checksum = local_checksum(path, self.options.checksum_mode)
            .await
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::NotFound => {
                    ConvertError::SourceNotFound(resolved.request_path.clone())
                }
                _ => ConvertError::Io(e),
            })?;
        Ok(MaterializedSource {
            path: path.to_path_buf(),
            checksum,
        })
    }

    /// Delete every artifact and record derived from a source that is gone:
    /// the plain artifact and every resized variant, in every format.
    async fn purge(&self, resolved: &ResolvedRequest) {
        let root = &self.options.exhaust_root;
        let mut removed = 0usize;

        for format in OutputFormat::PREFERENCE {
            let plain = root.join(
                resolved
                    .cache_key(format, ExtraParams::default())
                    .relative_path(),
            );
            let (Some(dir), Some(plain_name)) = (plain.parent(), plain.file_name()) else {
                continue;
            };
            let base = resolved
                .request_path
                .rsplit('/')
                .next()
                .unwrap_or_default();
            let variant_prefix = format!("{}._", base);

            let entries = match self.backend.walk_files(dir).await {
                Ok(entries) => entries,
                Err(e) => {
                    tracing::warn!(dir = %dir.display(), error = %e, "Failed to list artifacts for purge");
                    continue;
                }
            };
            for entry in entries {
                if entry.path.parent() != Some(dir) {
                    continue;
                }
                let Some(name) = entry.path.file_name() else {
                    continue;
                };
                let is_derived = name == plain_name
                    || name.to_string_lossy().starts_with(&variant_prefix);
                if !is_derived {
                    continue;
                }

                if let Err(e) = self.backend.delete_file(&entry.path).await {
                    tracing::warn!(path = %entry.path.display(), error = %e, "Failed to delete stale artifact");
                    continue;
                }
                if let Ok(relative) = entry.path.strip_prefix(root) {
                    if let Err(e) = self.metadata.delete(&artifact_id(relative)).await {
                        tracing::warn!(path = %entry.path.display(), error = %e, "Failed to delete stale record");
                    }
                }
                removed += 1;
            }
        }

        if removed > 0 {
            tracing::info!(
                path = %resolved.request_path,
                removed,
                "Source gone, purged cached artifacts"
            );
        }
    }

    async fn is_fresh(&self, id: &str, artifact: &Path, checksum: &str) -> bool {
        match self.metadata.lookup(id).await {
            Some(record) => {
                self.metadata.is_fresh(&record, checksum) && self.backend.is_file(artifact).await
            }
            None => false,
        }
    }

    async fn serve_source(
        &self,
        resolved: &ResolvedRequest,
        source: &MaterializedSource,
    ) -> Result<ConvertResponse, ConvertError> {
        let body = self.backend.read_file(&source.path).await?;
        Ok(ConvertResponse {
            body,
            content_type: content_type_for_extension(&resolved.extension).to_string(),
            etag: etag_for(&source.checksum, OutputFormat::Original, &ExtraParams::default()),
            served_format: OutputFormat::Original,
        })
    }

    /// Convert under the lock for `conversion.id`.
    ///
    /// Followers wait for the owner and re-check freshness. A follower whose
    /// wait times out, or whose owner failed, converts on its own.
    async fn convert_locked(&self, conversion: Conversion) -> Result<ArtifactStatus, ConvertError> {
        let id = conversion.id.as_str();

        if let Some(guard) = self.locks.try_acquire(id) {
            let status = self.run_owned(&conversion).await;
            drop(guard);
            return status;
        }

        match self
            .locks
            .wait_for_release(id, self.options.lock_wait_timeout, self.options.lock_poll)
            .await
        {
            Ok(()) => {
                if self
                    .is_fresh(id, &conversion.artifact, &conversion.source.checksum)
                    .await
                {
                    return Ok(ArtifactStatus::Cached(conversion.artifact));
                }
                match self.locks.try_acquire(id) {
                    Some(guard) => {
                        let status = self.run_owned(&conversion).await;
                        drop(guard);
                        status
                    }
                    None => self.run(&conversion).await,
                }
            }
            Err(e) => {
                tracing::warn!(id = %id, error = %e, "Converting without lock");
                self.run(&conversion).await
            }
        }
    }

    /// Owner path: re-check, since a previous owner may have just finished
    async fn run_owned(&self, conversion: &Conversion) -> Result<ArtifactStatus, ConvertError> {
        if self
            .is_fresh(&conversion.id, &conversion.artifact, &conversion.source.checksum)
            .await
        {
            return Ok(ArtifactStatus::Cached(conversion.artifact.clone()));
        }
        self.run(conversion).await
    }

    async fn run(&self, conversion: &Conversion) -> Result<ArtifactStatus, ConvertError> {
        let artifact = match self
            .transcoder
            .transcode(&conversion.source.path, &conversion.artifact, &conversion.job)
            .await
        {
            Ok(artifact) => artifact,
            Err(e) if e.is_passthrough() => {
                tracing::debug!(
                    source = %conversion.source_display,
                    reason = %e,
                    "Serving source unconverted"
                );
                return Ok(ArtifactStatus::Passthrough);
            }
            Err(e) => {
                tracing::error!(
                    source = %conversion.source_display,
                    format = %conversion.job.format,
                    error = %e,
                    "Conversion failed"
                );
                return Err(e.into());
            }
        };

        self.metadata
            .put(&MetadataRecord {
                id: conversion.id.clone(),
                path: conversion.source_display.clone(),
                checksum: conversion.source.checksum.clone(),
            })
            .await?;

        Ok(ArtifactStatus::Converted {
            path: artifact.path,
            size: artifact.size,
        })
    }
}

/// Validator for a served representation
fn etag_for(checksum: &str, format: OutputFormat, extra: &ExtraParams) -> String {
    let digest = sha256_hex(format!("{}:{}:{}", checksum, format, extra.cache_suffix()));
    digest[..32].to_string()
}
