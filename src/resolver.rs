//! Path resolution
//!
//! Maps a request path to its source (local file, image-map target or proxied
//! origin URL) and to the deterministic artifact location in the cache tree.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::constants::LOCAL_HOST_ALIAS;
use crate::error::ConvertError;
use crate::metadata::sha256_hex;
use crate::transcoder::{ExtraParams, OutputFormat};

/// Where a source image comes from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceRef {
    Local(PathBuf),
    Remote(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum MapTarget {
    Local(PathBuf),
    Remote(String),
}

#[derive(Debug, Clone)]
struct MapEntry {
    /// Path prefix, or `scheme://host[:port]` plus optional path
    prefix: String,
    host_scoped: bool,
    target: MapTarget,
}

/// Identity of one cached artifact
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    /// Normalized request path, always `/`-prefixed
    pub request_path: String,
    pub host_alias: String,
    pub format: OutputFormat,
    pub extra: ExtraParams,
    /// Lower-cased source extension
    pub source_ext: String,
}

impl CacheKey {
    /// Artifact location relative to the exhaust root:
    /// `<format>/<host>/<path>[._<extra>].<ext>`
    pub fn relative_path(&self) -> PathBuf {
        let mut name = self.request_path.trim_start_matches('/').to_string();
        if !self.extra.is_empty() {
            name.push_str("._");
            name.push_str(&self.extra.cache_suffix());
        }
        match self.format.extension() {
            Some(ext) => {
                name.push('.');
                name.push_str(ext);
            }
            // Resized originals keep the source extension
            None if !self.extra.is_empty() => {
                name.push('.');
                name.push_str(&self.source_ext);
            }
            None => {}
        }

        PathBuf::from(self.format.as_str())
            .join(&self.host_alias)
            .join(name)
    }

    /// Stable id: SHA-256 hex of the relative artifact path. Used as the
    /// metadata record name and the conversion lock key.
    pub fn id(&self) -> String {
        crate::metadata::artifact_id(&self.relative_path())
    }
}

/// Result of resolving one request path
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedRequest {
    pub request_path: String,
    pub source: SourceRef,
    pub host_alias: String,
    pub extension: String,
}

impl ResolvedRequest {
    pub fn cache_key(&self, format: OutputFormat, extra: ExtraParams) -> CacheKey {
        CacheKey {
            request_path: self.request_path.clone(),
            host_alias: self.host_alias.clone(),
            format,
            extra,
            source_ext: self.extension.clone(),
        }
    }

    pub fn artifact_path(
        &self,
        exhaust_root: &Path,
        format: OutputFormat,
        extra: ExtraParams,
    ) -> PathBuf {
        exhaust_root.join(self.cache_key(format, extra).relative_path())
    }

    /// Source location as recorded in metadata
    pub fn source_display(&self) -> String {
        match &self.source {
            SourceRef::Local(path) => path.display().to_string(),
            SourceRef::Remote(url) => url.clone(),
        }
    }
}

pub struct Resolver {
    image_root: PathBuf,
    /// Host-scoped entries first, then longest prefix first
    img_map: Vec<MapEntry>,
    proxy: Option<String>,
    allowed_types: Vec<String>,
}

impl Resolver {
    /// `img_map` must already be validated; see `config::parse_img_map`
    pub fn new(
        image_root: impl Into<PathBuf>,
        img_map: &BTreeMap<String, String>,
        proxy: Option<String>,
        allowed_types: &[String],
    ) -> Self {
        let mut entries: Vec<MapEntry> = img_map
            .iter()
            .map(|(prefix, target)| {
                let target = if target.starts_with('/') {
                    MapTarget::Local(PathBuf::from(target))
                } else {
                    MapTarget::Remote(target.trim_end_matches('/').to_string())
                };
                let host_scoped = !prefix.starts_with('/');
                let prefix = if host_scoped {
                    normalize_host_key(prefix)
                } else {
                    prefix.trim_end_matches('/').to_string()
                };
                MapEntry {
                    prefix,
                    host_scoped,
                    target,
                }
            })
            .collect();
        entries.sort_by(|a, b| {
            b.host_scoped
                .cmp(&a.host_scoped)
                .then_with(|| b.prefix.len().cmp(&a.prefix.len()))
        });

        Self {
            image_root: image_root.into(),
            img_map: entries,
            proxy: proxy.map(|p| p.trim_end_matches('/').to_string()),
            allowed_types: allowed_types.iter().map(|t| t.to_ascii_lowercase()).collect(),
        }
    }

    pub fn image_root(&self) -> &Path {
        &self.image_root
    }

    pub fn is_allowed_extension(&self, ext: &str) -> bool {
        let ext = ext.to_ascii_lowercase();
        self.allowed_types.iter().any(|t| t == "*" || *t == ext)
    }

    pub fn resolve(&self, raw_path: &str) -> Result<ResolvedRequest, ConvertError> {
        self.resolve_for_host(raw_path, None)
    }

    /// Resolve a request that arrived for `origin` (`scheme://host[:port]`).
    /// Host-scoped image map entries only apply when the origin is known.
    pub fn resolve_for_host(
        &self,
        raw_path: &str,
        origin: Option<&str>,
    ) -> Result<ResolvedRequest, ConvertError> {
        let request_path = normalize_request_path(raw_path)?;

        let extension = Path::new(&request_path)
            .extension()
            .map(|e| e.to_string_lossy().to_ascii_lowercase())
            .unwrap_or_default();
        if !self.is_allowed_extension(&extension) {
            return Err(ConvertError::unsupported_extension(extension));
        }

        let origin = origin.map(normalize_host_key);
        let (source, scoped_origin) = self.source_for(&request_path, origin.as_deref());
        let host_alias = match (&source, scoped_origin) {
            (_, Some(origin)) => host_alias_for(origin),
            (SourceRef::Local(_), None) => LOCAL_HOST_ALIAS.to_string(),
            (SourceRef::Remote(url), None) => host_alias_for(url),
        };

        Ok(ResolvedRequest {
            request_path,
            source,
            host_alias,
            extension,
        })
    }

    /// Source for `request_path`, plus the origin when a host-scoped entry matched
    fn source_for<'o>(
        &self,
        request_path: &str,
        origin: Option<&'o str>,
    ) -> (SourceRef, Option<&'o str>) {
        let with_host = origin.map(|o| format!("{}{}", o, request_path));

        for entry in &self.img_map {
            let candidate = if entry.host_scoped {
                match &with_host {
                    Some(full) => full.as_str(),
                    None => continue,
                }
            } else {
                request_path
            };
            let Some(rest) = strip_segment_prefix(candidate, &entry.prefix) else {
                continue;
            };
            let source = match &entry.target {
                MapTarget::Remote(base) => SourceRef::Remote(format!("{}{}", base, rest)),
                MapTarget::Local(root) => {
                    SourceRef::Local(root.join(rest.trim_start_matches('/')))
                }
            };
            return (source, origin.filter(|_| entry.host_scoped));
        }

        let source = match &self.proxy {
            Some(base) => SourceRef::Remote(format!("{}{}", base, request_path)),
            None => SourceRef::Local(
                self.image_root
                    .join(request_path.trim_start_matches('/')),
            ),
        };
        (source, None)
    }
}

/// Lower-case the `scheme://host[:port]` part and drop trailing slashes
fn normalize_host_key(key: &str) -> String {
    let key = key.trim_end_matches('/');
    let authority_start = key.find("://").map(|i| i + 3).unwrap_or(0);
    let path_start = key[authority_start..]
        .find('/')
        .map(|i| authority_start + i)
        .unwrap_or(key.len());
    format!("{}{}", key[..path_start].to_ascii_lowercase(), &key[path_start..])
}

/// Remainder of `path` after `prefix`, if the prefix ends on a segment boundary
fn strip_segment_prefix<'a>(path: &'a str, prefix: &str) -> Option<&'a str> {
    let rest = path.strip_prefix(prefix)?;
    if rest.is_empty() || rest.starts_with('/') || prefix.is_empty() {
        Some(rest)
    } else {
        None
    }
}

/// Cache directory name for a remote URL: its host, or a hash when unparseable
fn host_alias_for(url: &str) -> String {
    match reqwest::Url::parse(url) {
        Ok(parsed) => match (parsed.host_str(), parsed.port()) {
            (Some(host), Some(port)) => format!("{}_{}", host, port),
            (Some(host), None) => host.to_string(),
            (None, _) => sha256_hex(url.as_bytes()),
        },
        Err(_) => sha256_hex(url.as_bytes()),
    }
}

/// Percent-decode and lexically clean a request path.
///
/// `.` segments and empty segments are dropped, `..` pops one segment; a `..`
/// above the root, a NUL byte or a backslash makes the path invalid.
pub fn normalize_request_path(raw_path: &str) -> Result<String, ConvertError> {
    if !raw_path.starts_with('/') {
        return Err(ConvertError::invalid_path(raw_path));
    }

    let decoded =
        urlencoding::decode(raw_path).map_err(|_| ConvertError::invalid_path(raw_path))?;
    if decoded.contains('\0') || decoded.contains('\\') {
        return Err(ConvertError::invalid_path(raw_path));
    }

    let mut segments: Vec<&str> = Vec::new();
    for segment in decoded.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                if segments.pop().is_none() {
                    return Err(ConvertError::invalid_path(raw_path));
                }
            }
            s => segments.push(s),
        }
    }

    if segments.is_empty() {
        return Err(ConvertError::invalid_path(raw_path));
    }
    Ok(format!("/{}", segments.join("/")))
}
