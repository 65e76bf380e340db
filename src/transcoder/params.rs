//! Output formats and per-request extra parameters

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::str::FromStr;

use super::error::TranscodeError;

/// Output format of a cached artifact
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    /// The source's own encoding (served raw, or re-encoded as-is when resized)
    #[serde(rename = "raw")]
    Original,
    WebP,
    Avif,
    Jxl,
}

impl OutputFormat {
    /// Preference order, most compact first
    pub const PREFERENCE: [OutputFormat; 4] = [
        OutputFormat::Jxl,
        OutputFormat::Avif,
        OutputFormat::WebP,
        OutputFormat::Original,
    ];

    /// Name used as the exhaust subdirectory
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Original => "raw",
            Self::WebP => "webp",
            Self::Avif => "avif",
            Self::Jxl => "jxl",
        }
    }

    /// Content-Type for transcoded formats. `Original` depends on the source.
    pub fn content_type(&self) -> Option<&'static str> {
        match self {
            Self::Original => None,
            Self::WebP => Some("image/webp"),
            Self::Avif => Some("image/avif"),
            Self::Jxl => Some("image/jxl"),
        }
    }

    /// File extension for transcoded formats
    pub fn extension(&self) -> Option<&'static str> {
        match self {
            Self::Original => None,
            Self::WebP => Some("webp"),
            Self::Avif => Some("avif"),
            Self::Jxl => Some("jxl"),
        }
    }

    /// Largest width/height the encoder accepts, if capped
    pub fn max_dimension(&self) -> Option<u32> {
        match self {
            Self::WebP => Some(crate::constants::WEBP_MAX_DIMENSION),
            Self::Avif => Some(crate::constants::AVIF_MAX_DIMENSION),
            Self::Jxl | Self::Original => None,
        }
    }
}

impl std::fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OutputFormat {
    type Err = TranscodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "raw" | "original" => Ok(OutputFormat::Original),
            "webp" => Ok(OutputFormat::WebP),
            "avif" => Ok(OutputFormat::Avif),
            "jxl" => Ok(OutputFormat::Jxl),
            other => Err(TranscodeError::unsupported_format("unknown", other)),
        }
    }
}

/// Content-Type for a source extension
pub fn content_type_for_extension(ext: &str) -> &'static str {
    match ext.to_lowercase().as_str() {
        "jpg" | "jpeg" => "image/jpeg",
        "png" => "image/png",
        "gif" => "image/gif",
        "bmp" => "image/bmp",
        "svg" => "image/svg+xml",
        "webp" => "image/webp",
        "avif" => "image/avif",
        "jxl" => "image/jxl",
        "heic" => "image/heic",
        "tif" | "tiff" => "image/tiff",
        _ => "application/octet-stream",
    }
}

/// How width+height requests are fitted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum CropStrategy {
    /// Fit within the box, no cropping
    #[serde(rename = "InterestingNone")]
    None,
    /// Crop to fill, centred
    #[serde(rename = "InterestingCentre")]
    Centre,
    /// Crop to fill, keeping the window with the most detail
    #[serde(rename = "InterestingEntropy")]
    Entropy,
    /// Crop to fill, keeping the window with the strongest edges
    #[default]
    #[serde(rename = "InterestingAttention")]
    Attention,
    /// Crop to fill, anchored top/left
    #[serde(rename = "InterestingLow")]
    Low,
    /// Crop to fill, anchored bottom/right
    #[serde(rename = "InterestingHigh")]
    High,
}

/// Optional geometric constraints, in pixels. Zero means unset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct ExtraParams {
    pub width: u32,
    pub height: u32,
    pub max_width: u32,
    pub max_height: u32,
}

impl ExtraParams {
    /// Parse from query parameters. Unparseable values count as unset.
    pub fn from_query(query: &HashMap<String, String>) -> Self {
        let get = |name: &str| {
            query
                .get(name)
                .and_then(|v| v.trim().parse::<u32>().ok())
                .unwrap_or(0)
        };
        Self {
            width: get("width"),
            height: get("height"),
            max_width: get("max_width"),
            max_height: get("max_height"),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.width == 0 && self.height == 0 && self.max_width == 0 && self.max_height == 0
    }

    /// Suffix distinguishing resized artifacts on disk
    pub fn cache_suffix(&self) -> String {
        format!(
            "w{}_h{}_mw{}_mh{}",
            self.width, self.height, self.max_width, self.max_height
        )
    }
}
