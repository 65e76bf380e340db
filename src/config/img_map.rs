//! Image map validation
//!
//! An image map entry redirects a request prefix to another source: a remote
//! base URL or an absolute local directory. The prefix is either a path
//! (`/img`) or a request origin plus optional path (`http://a.example.com/img`),
//! the latter only matching requests for that host. Entries that fit neither
//! shape are dropped at load time and never reach the resolver.

use regex::Regex;
use std::collections::BTreeMap;

use crate::constants::HTTP_REGEXP;

/// Keep only usable entries, logging each dropped one
pub fn parse_img_map(raw: &BTreeMap<String, String>) -> BTreeMap<String, String> {
    let http = Regex::new(HTTP_REGEXP).ok();
    let is_url = |s: &str| http.as_ref().map(|re| re.is_match(s)).unwrap_or(false);

    let mut parsed = BTreeMap::new();
    for (prefix, target) in raw {
        if !(is_url(prefix) || prefix.starts_with('/')) {
            tracing::warn!(
                prefix = %prefix,
                target = %target,
                "img_map key must start with '/' or name an http(s) host, entry skipped"
            );
            continue;
        }
        if !(is_url(target) || target.starts_with('/')) {
            tracing::warn!(
                prefix = %prefix,
                target = %target,
                pattern = HTTP_REGEXP,
                "img_map target is neither an absolute URL nor an absolute path, entry skipped"
            );
            continue;
        }
        parsed.insert(prefix.clone(), target.clone());
    }
    parsed
}
