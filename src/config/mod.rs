// Configuration module
//
// Loaded once at startup from a YAML (or JSON) file. `${VAR}` references are
// substituted from the environment before parsing, and PICSHIFT_HOST /
// PICSHIFT_PORT override the listen address afterwards.

mod img_map;

pub use img_map::parse_img_map;

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::constants::{
    DEFAULT_CACHE_TTL_SECS, DEFAULT_ENCODE_TIMEOUT_SECS, DEFAULT_EVICTION_INTERVAL_SECS,
    DEFAULT_EXHAUST_PATH, DEFAULT_HOST, DEFAULT_IMAGE_PATH, DEFAULT_LOCK_TTL_SECS,
    DEFAULT_LOCK_WAIT_TIMEOUT_MS, DEFAULT_MAX_CACHE_SIZE_MB, DEFAULT_METADATA_PATH,
    DEFAULT_PORT, DEFAULT_QUALITY, DEFAULT_REMOTE_RAW_PATH, DEFAULT_REMOTE_TIMEOUT_SECS,
    ENV_HOST, ENV_PORT, HTTP_REGEXP,
};
use crate::eviction::EvictionOrder;
use crate::metadata::ChecksumMode;
use crate::negotiation::FormatToggles;
use crate::transcoder::CropStrategy;

/// Output formats that may appear in `convert_types`
const KNOWN_CONVERT_TYPES: &[&str] = &["webp", "avif", "jxl"];

/// Log output settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct LogConfig {
    /// Default filter directive; `RUST_LOG` wins when set
    pub level: String,
    /// JSON lines instead of human-readable output
    pub json: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub host: String,
    pub port: u16,

    pub image_path: PathBuf,
    pub exhaust_path: PathBuf,
    pub metadata_path: PathBuf,
    pub remote_raw_path: PathBuf,

    /// Source extensions served at all
    pub allowed_types: Vec<String>,
    /// Output formats produced: any of webp, avif, jxl
    pub convert_types: Vec<String>,
    /// Encode quality (1-100)
    pub quality: u8,
    pub strip_metadata: bool,

    pub enable_extra_params: bool,
    pub extra_params_crop_interesting: CropStrategy,

    /// Cache budget in MB over exhaust, metadata and remote-raw (0 = unbounded)
    pub max_cache_size: u64,
    /// Seconds a remote copy is trusted without revalidation
    pub cache_ttl: u64,

    /// Request prefix → remote base URL or absolute local directory
    pub img_map: BTreeMap<String, String>,
    /// Origin to proxy every request to, e.g. `https://origin.example.com`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub proxy: Option<String>,

    pub checksum_mode: ChecksumMode,
    pub eviction_order: EvictionOrder,
    pub eviction_interval_secs: u64,

    pub lock_ttl_secs: u64,
    pub lock_wait_timeout_ms: u64,
    pub encode_timeout_secs: u64,
    pub remote_timeout_secs: u64,

    /// Serve WebP to clients that do not advertise it
    pub webp_universal: bool,
    /// Path to the JPEG XL encoder binary; `cjxl` on PATH when unset
    #[serde(skip_serializing_if = "Option::is_none")]
    pub jxl_encoder: Option<PathBuf>,

    pub log: LogConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            image_path: PathBuf::from(DEFAULT_IMAGE_PATH),
            exhaust_path: PathBuf::from(DEFAULT_EXHAUST_PATH),
            metadata_path: PathBuf::from(DEFAULT_METADATA_PATH),
            remote_raw_path: PathBuf::from(DEFAULT_REMOTE_RAW_PATH),
            allowed_types: ["jpg", "png", "jpeg", "bmp", "gif", "svg", "nef", "heic", "webp"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            convert_types: vec!["webp".to_string()],
            quality: DEFAULT_QUALITY,
            strip_metadata: true,
            enable_extra_params: false,
            extra_params_crop_interesting: CropStrategy::default(),
            max_cache_size: DEFAULT_MAX_CACHE_SIZE_MB,
            cache_ttl: DEFAULT_CACHE_TTL_SECS,
            img_map: BTreeMap::new(),
            proxy: None,
            checksum_mode: ChecksumMode::default(),
            eviction_order: EvictionOrder::default(),
            eviction_interval_secs: DEFAULT_EVICTION_INTERVAL_SECS,
            lock_ttl_secs: DEFAULT_LOCK_TTL_SECS,
            lock_wait_timeout_ms: DEFAULT_LOCK_WAIT_TIMEOUT_MS,
            encode_timeout_secs: DEFAULT_ENCODE_TIMEOUT_SECS,
            remote_timeout_secs: DEFAULT_REMOTE_TIMEOUT_SECS,
            webp_universal: false,
            jxl_encoder: None,
            log: LogConfig::default(),
        }
    }
}

impl Config {
    pub fn from_yaml_with_env(yaml: &str) -> Result<Self, String> {
        // Replace ${VAR_NAME} with environment variable values
        let re = Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)\}").map_err(|e| e.to_string())?;

        let mut missing = None;
        let substituted = re.replace_all(yaml, |caps: &regex::Captures| {
            let var_name = &caps[1];
            std::env::var(var_name).unwrap_or_else(|_| {
                missing.get_or_insert_with(|| var_name.to_string());
                String::new()
            })
        });
        if let Some(var_name) = missing {
            return Err(format!(
                "Environment variable '{}' is referenced but not set",
                var_name
            ));
        }

        let mut config: Config =
            serde_yaml::from_str(&substituted).map_err(|e| e.to_string())?;
        config.img_map = parse_img_map(&config.img_map);
        config.allowed_types = lowercase_all(&config.allowed_types);
        config.convert_types = lowercase_all(&config.convert_types);

        Ok(config)
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, String> {
        let yaml = std::fs::read_to_string(path)
            .map_err(|e| format!("Failed to read config file: {}", e))?;
        Self::from_yaml_with_env(&yaml)
    }

    /// Load, apply environment overrides and validate
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, String> {
        let mut config = Self::from_file(path)?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides_from(|name| std::env::var(name).ok());
    }

    fn apply_overrides_from(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(host) = lookup(ENV_HOST).filter(|h| !h.is_empty()) {
            self.host = host;
        }
        if let Some(port) = lookup(ENV_PORT).filter(|p| !p.is_empty()) {
            match port.parse() {
                Ok(port) => self.port = port,
                Err(_) => tracing::warn!(value = %port, "Ignoring invalid {}", ENV_PORT),
            }
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.host.is_empty() {
            return Err("host cannot be empty".to_string());
        }
        if !(1..=100).contains(&self.quality) {
            return Err(format!(
                "quality must be between 1 and 100, got {}",
                self.quality
            ));
        }
        if self.allowed_types.is_empty() {
            return Err("allowed_types cannot be empty".to_string());
        }
        for format in &self.convert_types {
            if !KNOWN_CONVERT_TYPES.contains(&format.as_str()) {
                return Err(format!(
                    "Unknown convert type '{}', expected one of {:?}",
                    format, KNOWN_CONVERT_TYPES
                ));
            }
        }
        for (name, path) in [
            ("image_path", &self.image_path),
            ("exhaust_path", &self.exhaust_path),
            ("metadata_path", &self.metadata_path),
            ("remote_raw_path", &self.remote_raw_path),
        ] {
            if path.as_os_str().is_empty() {
                return Err(format!("{} cannot be empty", name));
            }
        }
        if let Some(proxy) = &self.proxy {
            let http = Regex::new(HTTP_REGEXP).map_err(|e| e.to_string())?;
            if !http.is_match(proxy) {
                return Err(format!("proxy must be an http(s) URL, got '{}'", proxy));
            }
        }
        if self.lock_ttl_secs == 0 {
            return Err("lock_ttl_secs must be greater than 0".to_string());
        }
        if self.encode_timeout_secs == 0 {
            return Err("encode_timeout_secs must be greater than 0".to_string());
        }
        if self.remote_timeout_secs == 0 {
            return Err("remote_timeout_secs must be greater than 0".to_string());
        }
        if self.max_cache_size > 0 && self.eviction_interval_secs == 0 {
            return Err(
                "eviction_interval_secs must be greater than 0 when max_cache_size is set"
                    .to_string(),
            );
        }
        Ok(())
    }

    pub fn format_toggles(&self) -> FormatToggles {
        FormatToggles::from_convert_types(&self.convert_types, self.webp_universal)
    }

    /// Cache budget in bytes, `None` when unbounded
    pub fn max_cache_size_bytes(&self) -> Option<u64> {
        (self.max_cache_size > 0).then(|| self.max_cache_size * 1024 * 1024)
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl)
    }

    pub fn lock_ttl(&self) -> Duration {
        Duration::from_secs(self.lock_ttl_secs)
    }

    pub fn lock_wait_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_wait_timeout_ms)
    }

    pub fn encode_timeout(&self) -> Duration {
        Duration::from_secs(self.encode_timeout_secs)
    }

    pub fn remote_timeout(&self) -> Duration {
        Duration::from_secs(self.remote_timeout_secs)
    }

    pub fn eviction_interval(&self) -> Duration {
        Duration::from_secs(self.eviction_interval_secs)
    }

    pub fn listen_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn lowercase_all(items: &[String]) -> Vec<String> {
    items.iter().map(|s| s.trim().to_ascii_lowercase()).collect()
}
