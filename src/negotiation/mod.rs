//! Client capability negotiation
//!
//! Derives the set of output formats a client can take from its `Accept`
//! header and User-Agent, then picks one winner per request. Pure functions,
//! no I/O.

pub mod user_agent;

use crate::transcoder::OutputFormat;

/// Server-side switches, fixed at configuration time
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FormatToggles {
    pub webp: bool,
    pub avif: bool,
    pub jxl: bool,
    /// Treat WebP as deliverable to every client when enabled
    pub webp_universal: bool,
}

impl FormatToggles {
    /// Build from the configured `convert_types` list
    pub fn from_convert_types(types: &[String], webp_universal: bool) -> Self {
        let has = |name: &str| types.iter().any(|t| t.eq_ignore_ascii_case(name));
        Self {
            webp: has("webp"),
            avif: has("avif"),
            jxl: has("jxl"),
            webp_universal,
        }
    }

    /// Formats to produce ahead of time during prefetch
    pub fn enabled_formats(&self) -> Vec<OutputFormat> {
        let mut formats = Vec::new();
        if self.webp {
            formats.push(OutputFormat::WebP);
        }
        if self.avif {
            formats.push(OutputFormat::Avif);
        }
        if self.jxl {
            formats.push(OutputFormat::Jxl);
        }
        formats
    }
}

/// Formats acceptable to one client. `raw` is always set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SupportedFormats {
    pub raw: bool,
    pub webp: bool,
    pub avif: bool,
    pub jxl: bool,
}

impl SupportedFormats {
    pub fn contains(&self, format: OutputFormat) -> bool {
        match format {
            OutputFormat::Original => self.raw,
            OutputFormat::WebP => self.webp,
            OutputFormat::Avif => self.avif,
            OutputFormat::Jxl => self.jxl,
        }
    }
}

/// Source types worth transcoding. Vector, animated, already compact and
/// undecodable sources (svg, gif, webp, heic, nef, ...) are served as-is.
const TRANSCODABLE_SOURCES: &[&str] = &["jpg", "jpeg", "png", "bmp"];

/// Whether a source with this extension may be transcoded at all
pub fn is_transcodable(source_ext: &str) -> bool {
    let ext = source_ext.to_ascii_lowercase();
    TRANSCODABLE_SOURCES.contains(&ext.as_str())
}

/// Derive the acceptable formats for one client
pub fn negotiate(
    accept: Option<&str>,
    user_agent: Option<&str>,
    toggles: &FormatToggles,
) -> SupportedFormats {
    let accepted = accept.map(parse_accept_header).unwrap_or_default();
    let accepts = |media: &str| accepted.iter().any(|m| m == media);

    let webp = toggles.webp && (accepts("image/webp") || toggles.webp_universal);
    let avif = toggles.avif && accepts("image/avif");
    // Keyed on AVIF acceptance rather than the AVIF toggle
    let jxl = toggles.jxl
        && accepts("image/avif")
        && user_agent.map(user_agent::supports_jxl).unwrap_or(false);

    SupportedFormats {
        raw: true,
        webp,
        avif,
        jxl,
    }
}

/// Pick the single format to serve: most compact first, limited to what the
/// client takes and the source type allows.
pub fn select_format(supported: &SupportedFormats, source_ext: &str) -> OutputFormat {
    if !is_transcodable(source_ext) {
        return OutputFormat::Original;
    }
    OutputFormat::PREFERENCE
        .into_iter()
        .find(|f| supported.contains(*f))
        .unwrap_or(OutputFormat::Original)
}

/// Media types listed in an `Accept` header with a non-zero q-value
fn parse_accept_header(accept: &str) -> Vec<String> {
    let mut media_types = Vec::new();

    for part in accept.split(',') {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }

        let (media_type, quality) = match part.split_once(';') {
            Some((mt, params)) => (mt.trim(), parse_quality(params)),
            None => (part, 1.0),
        };

        if quality > 0.0 {
            media_types.push(media_type.to_ascii_lowercase());
        }
    }

    media_types
}

/// Quality value from parameters (e.g. "q=0.8")
fn parse_quality(params: &str) -> f32 {
    for param in params.split(';') {
        if let Some(q) = param.trim().strip_prefix("q=") {
            if let Ok(quality) = q.parse::<f32>() {
                return quality.clamp(0.0, 1.0);
            }
        }
    }
    1.0
}
