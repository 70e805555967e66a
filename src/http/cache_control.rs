// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! `Cache-Control` directive parsing and rendering.

use std::time::Duration;

use tracing::debug;

use super::{header, HeaderMap, HeaderValue};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheDirectives {
    pub max_age: Option<Duration>,
    /// `Duration::MAX` for a bare `max-stale` (any staleness accepted).
    pub max_stale: Option<Duration>,
    pub no_cache: bool,
    pub no_store: bool,
    pub only_if_cached: bool,
    pub must_revalidate: bool,
    /// Directives this layer does not interpret, kept verbatim.
    pub extensions: Vec<String>,
}

impl CacheDirectives {
    /// Parse a comma-separated directive list. Unparseable numbers drop the
    /// directive.
    pub fn parse(value: &str) -> Self {
        let mut directives = Self::default();
        for token in value.split(',').map(str::trim).filter(|t| !t.is_empty()) {
            let (name, arg) = match token.split_once('=') {
                Some((name, arg)) => (name.trim(), Some(arg.trim().trim_matches('"'))),
                None => (token, None),
            };
            match name.to_ascii_lowercase().as_str() {
                "max-age" => directives.max_age = arg.and_then(parse_seconds),
                "max-stale" => {
                    directives.max_stale = match arg {
                        Some(arg) => parse_seconds(arg),
                        None => Some(Duration::MAX),
                    }
                }
                "no-cache" => directives.no_cache = true,
                "no-store" => directives.no_store = true,
                "only-if-cached" => directives.only_if_cached = true,
                "must-revalidate" => directives.must_revalidate = true,
                _ => directives.extensions.push(token.to_string()),
            }
        }
        directives
    }

    /// Directives from every `Cache-Control` header; `None` when there are
    /// none.
    pub fn from_headers(headers: &HeaderMap) -> Option<Self> {
        let values: Vec<&str> = headers
            .get_all(header::CACHE_CONTROL)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .collect();
        if values.is_empty() {
            None
        } else {
            Some(Self::parse(&values.join(",")))
        }
    }

    /// Largest age at which a cached response may still be served when the
    /// network is unavailable.
    pub fn stale_limit(&self) -> Duration {
        self.max_age
            .unwrap_or_default()
            .saturating_add(self.max_stale.unwrap_or_default())
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    pub fn to_header_value(&self) -> String {
        let mut parts = Vec::new();
        if self.no_cache {
            parts.push("no-cache".to_string());
        }
        if self.no_store {
            parts.push("no-store".to_string());
        }
        if let Some(max_age) = self.max_age {
            parts.push(format!("max-age={}", max_age.as_secs()));
        }
        match self.max_stale {
            Some(max_stale) if max_stale == Duration::MAX => parts.push("max-stale".to_string()),
            Some(max_stale) => parts.push(format!("max-stale={}", max_stale.as_secs())),
            None => {}
        }
        if self.only_if_cached {
            parts.push("only-if-cached".to_string());
        }
        if self.must_revalidate {
            parts.push("must-revalidate".to_string());
        }
        parts.extend(self.extensions.iter().cloned());
        parts.join(", ")
    }
}

/// Rewrite response headers into the directives the response cache stores
/// them under: server `no-store`, `no-cache` and `must-revalidate` are
/// dropped, `Pragma` is removed and a missing `max-age` becomes
/// `default_max_age`. Returns the directives written.
pub fn normalize_response(headers: &mut HeaderMap, default_max_age: Duration) -> CacheDirectives {
    let mut directives = CacheDirectives::from_headers(headers).unwrap_or_default();
    if directives.no_store || directives.no_cache || directives.must_revalidate {
        debug!("Stripping conflicting response cache directives");
    }
    directives.no_store = false;
    directives.no_cache = false;
    directives.must_revalidate = false;
    if directives.max_age.is_none() {
        directives.max_age = Some(default_max_age);
    }

    headers.remove(header::PRAGMA);
    if let Ok(value) = HeaderValue::from_str(&directives.to_header_value()) {
        headers.insert(header::CACHE_CONTROL, value);
    }
    directives
}

fn parse_seconds(value: &str) -> Option<Duration> {
    value.parse::<u64>().ok().map(Duration::from_secs)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_common_directives() {
        let d = CacheDirectives::parse("public, max-age=60, max-stale=86400, no-cache");
        assert_eq!(d.max_age, Some(Duration::from_secs(60)));
        assert_eq!(d.max_stale, Some(Duration::from_secs(86_400)));
        assert!(d.no_cache);
        assert!(!d.no_store);
        assert_eq!(d.extensions, vec!["public".to_string()]);
    }

    #[test]
    fn bare_max_stale_accepts_anything() {
        let d = CacheDirectives::parse("max-stale");
        assert_eq!(d.max_stale, Some(Duration::MAX));
        assert_eq!(d.stale_limit(), Duration::MAX);
        assert_eq!(d.to_header_value(), "max-stale");
    }

    #[test]
    fn bad_numbers_are_ignored() {
        let d = CacheDirectives::parse("max-age=soon, NO-STORE");
        assert_eq!(d.max_age, None);
        assert!(d.no_store);
    }

    #[test]
    fn renders_round_trip_subset() {
        let d = CacheDirectives {
            max_age: Some(Duration::from_secs(60)),
            max_stale: Some(Duration::from_secs(3600)),
            ..Default::default()
        };
        assert_eq!(d.to_header_value(), "max-age=60, max-stale=3600");
        assert_eq!(CacheDirectives::parse(&d.to_header_value()), d);
    }

    #[test]
    fn multiple_headers_are_merged() {
        let mut headers = HeaderMap::new();
        assert!(CacheDirectives::from_headers(&headers).is_none());
        headers.append(header::CACHE_CONTROL, HeaderValue::from_static("max-age=5"));
        headers.append(header::CACHE_CONTROL, HeaderValue::from_static("no-store"));
        let d = CacheDirectives::from_headers(&headers).unwrap();
        assert_eq!(d.max_age, Some(Duration::from_secs(5)));
        assert!(d.no_store);
    }

    #[test]
    fn normalize_strips_blocking_directives_and_fills_max_age() {
        let mut headers = HeaderMap::new();
        headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-store, must-revalidate"));
        headers.insert(header::PRAGMA, HeaderValue::from_static("no-cache"));

        let d = normalize_response(&mut headers, Duration::from_secs(30));
        assert_eq!(d.max_age, Some(Duration::from_secs(30)));
        assert!(!d.no_store && !d.must_revalidate);
        assert!(headers.get(header::PRAGMA).is_none());
        assert_eq!(headers.get(header::CACHE_CONTROL).unwrap(), "max-age=30");
    }

    #[test]
    fn normalize_keeps_server_max_age() {
        let mut headers = HeaderMap::new();
        headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("private, max-age=5"));
        let d = normalize_response(&mut headers, Duration::from_secs(30));
        assert_eq!(d.max_age, Some(Duration::from_secs(5)));
        assert_eq!(d.extensions, vec!["private".to_string()]);
    }
}
