// Constants module - centralized defaults and fixed limits
//
// Configuration defaults live here so the config layer, the CLI and the
// sample config printed by `--dump-config` agree.

// =============================================================================
// Server defaults
// =============================================================================

/// Default listen address
pub const DEFAULT_HOST: &str = "127.0.0.1";

/// Default listen port
pub const DEFAULT_PORT: u16 = 3333;

/// Environment variable overriding the listen address
pub const ENV_HOST: &str = "PICSHIFT_HOST";

/// Environment variable overriding the listen port
pub const ENV_PORT: &str = "PICSHIFT_PORT";

// =============================================================================
// Storage layout defaults
// =============================================================================

pub const DEFAULT_IMAGE_PATH: &str = "./pics";
pub const DEFAULT_EXHAUST_PATH: &str = "./exhaust";
pub const DEFAULT_METADATA_PATH: &str = "./metadata";
pub const DEFAULT_REMOTE_RAW_PATH: &str = "./remote-raw";

/// Host alias used in cache paths for files under the local image root
pub const LOCAL_HOST_ALIAS: &str = "local";

/// Image map targets and proxy hosts must match this to be treated as remote
pub const HTTP_REGEXP: &str = r"^https?://";

// =============================================================================
// Conversion defaults
// =============================================================================

/// Default encode quality (1-100)
pub const DEFAULT_QUALITY: u8 = 80;

/// Largest width/height libwebp accepts
pub const WEBP_MAX_DIMENSION: u32 = 16383;

/// Largest width/height an AVIF image may declare
pub const AVIF_MAX_DIMENSION: u32 = 65536;

/// Largest width/height a resize may produce, whatever the target format
pub const MAX_RESIZE_DIMENSION: u32 = 16384;

/// Largest pixel count a resize may allocate (RGBA, 4 bytes each)
pub const MAX_RESIZE_PIXELS: u64 = 64_000_000;

/// External JPEG XL encoder looked up on PATH
pub const DEFAULT_JXL_ENCODER: &str = "cjxl";

/// Default upper bound for a single encode, in seconds
pub const DEFAULT_ENCODE_TIMEOUT_SECS: u64 = 60;

// =============================================================================
// Cache defaults
// =============================================================================

/// Default remote revalidation window in seconds (3 days)
pub const DEFAULT_CACHE_TTL_SECS: u64 = 259_200;

/// Default cache budget in MB (0 = unbounded)
pub const DEFAULT_MAX_CACHE_SIZE_MB: u64 = 0;

/// Default eviction pass interval in seconds
pub const DEFAULT_EVICTION_INTERVAL_SECS: u64 = 60;

/// Default remote origin request timeout in seconds
pub const DEFAULT_REMOTE_TIMEOUT_SECS: u64 = 30;

// =============================================================================
// Lock defaults
// =============================================================================

/// Conversion lock TTL in seconds; a crashed owner frees the key after this
pub const DEFAULT_LOCK_TTL_SECS: u64 = 300;

/// How long a follower waits for the owner before converting itself
pub const DEFAULT_LOCK_WAIT_TIMEOUT_MS: u64 = 10_000;

/// Poll interval while waiting on another conversion
pub const LOCK_POLL_INTERVAL_MS: u64 = 20;

/// Interval of the background sweep that drops expired lock entries
pub const LOCK_SWEEP_INTERVAL_SECS: u64 = 600;

/// Sample configuration printed by `--dump-config`
pub const SAMPLE_CONFIG: &str = r#"# picshift configuration
host: "127.0.0.1"
port: 3333
quality: 80
image_path: "./pics"
exhaust_path: "./exhaust"
metadata_path: "./metadata"
remote_raw_path: "./remote-raw"
img_map: {}
allowed_types: ["jpg", "png", "jpeg", "gif", "bmp", "svg", "heic", "nef", "webp"]
convert_types: ["webp"]
strip_metadata: true
enable_extra_params: false
extra_params_crop_interesting: "InterestingAttention"
cache_ttl: 259200
max_cache_size: 0
checksum_mode: content
eviction_order: access_time
log:
  level: info
  json: false
"#;
