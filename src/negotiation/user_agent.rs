//! JPEG XL client allow-list
//!
//! JXL support cannot be read from `Accept`, so it is guessed from the
//! User-Agent. The guess is approximate: a client matching a pattern may
//! still lack support, and new clients are missed until the table grows.

use regex::Regex;
use std::sync::OnceLock;

/// One client family known to decode JXL
struct UaPattern {
    name: &'static str,
    pattern: &'static str,
}

/// Safari 17+ on desktop, and every browser on iOS/iPadOS 17+ (all WebKit)
const JXL_CLIENTS: &[UaPattern] = &[
    UaPattern {
        name: "safari-desktop-17+",
        pattern: r"Version/(1[7-9]|[2-9]\d|\d{3,})(\.\d+)*\s.*Safari/",
    },
    UaPattern {
        name: "ios-17+",
        pattern: r"(iPhone|CPU) OS (1[7-9]|[2-9]\d|\d{3,})(_\d+)*\b",
    },
];

static COMPILED: OnceLock<Vec<(&'static str, Regex)>> = OnceLock::new();

/// Compiled pattern table, built on first use
fn patterns() -> &'static [(&'static str, Regex)] {
    COMPILED.get_or_init(|| {
        JXL_CLIENTS
            .iter()
            .map(|p| {
                (
                    p.name,
                    Regex::new(p.pattern).expect("JXL user-agent pattern is valid"),
                )
            })
            .collect()
    })
}

/// Name of the first matching client family, if any
pub fn matching_family(user_agent: &str) -> Option<&'static str> {
    patterns()
        .iter()
        .find(|(_, re)| re.is_match(user_agent))
        .map(|(name, _)| *name)
}

/// Best-effort guess whether this client decodes JPEG XL
pub fn supports_jxl(user_agent: &str) -> bool {
    matching_family(user_agent).is_some()
}
