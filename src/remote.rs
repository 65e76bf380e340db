//! Remote origin fetcher
//!
//! Keeps a raw copy of each remote source under
//! `<remote-raw-root>/<sha256(url)>` with a JSON sidecar holding the origin's
//! validators. Copies are revalidated with a conditional GET, and not at all
//! while inside the configured TTL, so a freshness check never re-downloads
//! an unchanged body. Concurrent fetches of one URL share a single origin
//! request.

use bytes::Bytes;
use parking_lot::Mutex;
use reqwest::header::{ETAG, IF_MODIFIED_SINCE, IF_NONE_MATCH, LAST_MODIFIED};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use crate::constants::LOCK_POLL_INTERVAL_MS;
use crate::error::ConvertError;
use crate::locks::{ConversionLocks, SystemClock};
use crate::metadata::{remote_checksum, sha256_hex};
use crate::storage::DiskBackend;

/// Sidecar describing a raw copy
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteRawRecord {
    pub url: String,
    pub etag: Option<String>,
    pub last_modified: Option<String>,
    pub checksum: String,
    /// Unix seconds of the last full download
    pub fetched_at: u64,
}

/// A remote source available on local disk
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteObject {
    pub raw_path: PathBuf,
    pub checksum: String,
}

pub struct RemoteFetcher {
    client: reqwest::Client,
    root: PathBuf,
    backend: Arc<dyn DiskBackend>,
    cache_ttl: Duration,
    request_timeout: Duration,
    revalidated_at: Mutex<HashMap<String, Instant>>,
    /// One origin request per URL at a time, keyed by the raw copy's name
    inflight: Arc<ConversionLocks>,
}

impl RemoteFetcher {
    pub fn new(
        root: impl Into<PathBuf>,
        backend: Arc<dyn DiskBackend>,
        cache_ttl: Duration,
        request_timeout: Duration,
    ) -> Result<Self, ConvertError> {
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| ConvertError::Config(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self {
            client,
            root: root.into(),
            backend,
            cache_ttl,
            request_timeout,
            revalidated_at: Mutex::new(HashMap::new()),
            inflight: Arc::new(ConversionLocks::new(
                request_timeout * 2,
                Arc::new(SystemClock),
            )),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Where the raw copy of `url` lives
    pub fn raw_path(&self, url: &str) -> PathBuf {
        self.root.join(sha256_hex(url.as_bytes()))
    }

    fn sidecar_path(raw_path: &Path) -> PathBuf {
        let mut name = raw_path.as_os_str().to_owned();
        name.push(".json");
        PathBuf::from(name)
    }

    /// Make a current copy of `url` available locally
    pub async fn fetch(&self, url: &str) -> Result<RemoteObject, ConvertError> {
        let raw_path = self.raw_path(url);
        let sidecar = Self::sidecar_path(&raw_path);
        if let Some(object) = self.trusted_copy(url, &raw_path, &sidecar).await {
            return Ok(object);
        }

        let key = sha256_hex(url.as_bytes());
        if let Some(guard) = self.inflight.try_acquire(&key) {
            let result = self.fetch_from_origin(url, raw_path, &sidecar).await;
            drop(guard);
            return result;
        }

        // Another request is already talking to the origin for this URL
        let waited = self
            .inflight
            .wait_for_release(
                &key,
                self.request_timeout,
                Duration::from_millis(LOCK_POLL_INTERVAL_MS),
            )
            .await;
        if waited.is_ok() {
            if let Some(object) = self.trusted_copy(url, &raw_path, &sidecar).await {
                return Ok(object);
            }
        }
        let _guard = self.inflight.try_acquire(&key);
        self.fetch_from_origin(url, raw_path, &sidecar).await
    }

    /// The local copy, if one exists and is inside the TTL window
    async fn trusted_copy(
        &self,
        url: &str,
        raw_path: &Path,
        sidecar: &Path,
    ) -> Option<RemoteObject> {
        if !self.within_ttl(url) {
            return None;
        }
        let record = self.load_record(raw_path, sidecar).await?;
        tracing::debug!(url = %url, "Remote copy within TTL, skipping revalidation");
        Some(RemoteObject {
            raw_path: raw_path.to_path_buf(),
            checksum: record.checksum,
        })
    }

    async fn fetch_from_origin(
        &self,
        url: &str,
        raw_path: PathBuf,
        sidecar: &Path,
    ) -> Result<RemoteObject, ConvertError> {
        let cached = self.load_record(&raw_path, sidecar).await;

        let mut request = self.client.get(url);
        if let Some(record) = &cached {
            if let Some(etag) = &record.etag {
                request = request.header(IF_NONE_MATCH, etag.as_str());
            }
            if let Some(last_modified) = &record.last_modified {
                request = request.header(IF_MODIFIED_SINCE, last_modified.as_str());
            }
        }

        let response = request.send().await.map_err(|e| {
            tracing::warn!(url = %url, error = %e, "Origin request failed");
            ConvertError::OriginUnreachable(format!("{}: {}", url, e))
        })?;

        let status = response.status();
        match (status, cached) {
            (StatusCode::NOT_MODIFIED, Some(record)) => {
                tracing::debug!(url = %url, "Origin reports not modified");
                self.mark_revalidated(url);
                Ok(RemoteObject {
                    raw_path,
                    checksum: record.checksum,
                })
            }
            (StatusCode::NOT_FOUND | StatusCode::GONE, cached) => {
                if cached.is_some() {
                    tracing::info!(url = %url, "Origin dropped source, removing local copy");
                    self.revalidated_at.lock().remove(url);
                    self.backend.delete_file(&raw_path).await?;
                    self.backend.delete_file(sidecar).await?;
                }
                Err(ConvertError::OriginNotFound(url.to_string()))
            }
            (s, _) if s.is_success() => {
                let etag = header_value(&response, ETAG);
                let last_modified = header_value(&response, LAST_MODIFIED);
                let body = response.bytes().await.map_err(|e| {
                    ConvertError::OriginUnreachable(format!("{}: {}", url, e))
                })?;

                let checksum = if etag.is_none() && last_modified.is_none() {
                    sha256_hex(&body)
                } else {
                    remote_checksum(etag.as_deref(), last_modified.as_deref())
                };
                let size = body.len();

                self.backend.write_file_atomic(&raw_path, body).await?;
                let record = RemoteRawRecord {
                    url: url.to_string(),
                    etag,
                    last_modified,
                    checksum: checksum.clone(),
                    fetched_at: unix_now(),
                };
                let json = serde_json::to_vec(&record).map_err(|e| {
                    ConvertError::Io(std::io::Error::new(std::io::ErrorKind::Other, e))
                })?;
                self.backend
                    .write_file_atomic(sidecar, Bytes::from(json))
                    .await?;
                self.mark_revalidated(url);

                tracing::info!(url = %url, size_bytes = size, "Fetched remote source");
                Ok(RemoteObject { raw_path, checksum })
            }
            (s, _) => {
                tracing::warn!(url = %url, status = s.as_u16(), "Origin returned an error status");
                Err(ConvertError::OriginUnreachable(format!(
                    "{}: status {}",
                    url, s
                )))
            }
        }
    }

    async fn load_record(&self, raw_path: &Path, sidecar: &Path) -> Option<RemoteRawRecord> {
        if !self.backend.is_file(raw_path).await {
            return None;
        }
        let data = self.backend.read_file(sidecar).await.ok()?;
        match serde_json::from_slice(&data) {
            Ok(record) => Some(record),
            Err(e) => {
                tracing::warn!(path = %sidecar.display(), error = %e, "Ignoring corrupt remote sidecar");
                None
            }
        }
    }

    fn within_ttl(&self, url: &str) -> bool {
        if self.cache_ttl.is_zero() {
            return false;
        }
        self.revalidated_at
            .lock()
            .get(url)
            .map(|at| at.elapsed() < self.cache_ttl)
            .unwrap_or(false)
    }

    /// Record a successful revalidation and forget entries past the TTL
    fn mark_revalidated(&self, url: &str) {
        if self.cache_ttl.is_zero() {
            return;
        }
        let ttl = self.cache_ttl;
        let mut revalidated = self.revalidated_at.lock();
        revalidated.insert(url.to_string(), Instant::now());
        revalidated.retain(|_, at| at.elapsed() < ttl);
    }
}

fn header_value(
    response: &reqwest::Response,
    name: reqwest::header::HeaderName,
) -> Option<String> {
    response
        .headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
