// Copyright (c) 2026 Relay Gateway Contributors
// SPDX-License-Identifier: AGPL-3.0
//! Origin allow-listing for browser clients.
//!
//! Same-origin requests always pass. Cross-origin requests pass only when the
//! origin is listed (or `*` is configured); otherwise they are refused without
//! any CORS headers so the browser enforces the denial.

use axum::http::header::{
    ACCESS_CONTROL_ALLOW_HEADERS, ACCESS_CONTROL_ALLOW_METHODS, ACCESS_CONTROL_ALLOW_ORIGIN,
    ACCESS_CONTROL_EXPOSE_HEADERS, ACCESS_CONTROL_MAX_AGE, VARY,
};
use axum::http::{HeaderMap, HeaderValue};
use std::collections::HashSet;

const ALLOW_METHODS: &str = "GET, POST, OPTIONS";
const ALLOW_HEADERS: &str = "Authorization, Content-Type, X-Device-ID, X-Request-ID, Idempotency-Key";
const EXPOSE_HEADERS: &str = "X-Request-ID, Idempotency-Key, X-Idempotency-Replayed";
const MAX_AGE: &str = "600";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CorsDecision {
    /// No `Origin` header: nothing to add.
    NotApplicable,
    /// Same-origin or listed; the origin to echo back.
    Allowed(String),
    Denied,
}

#[derive(Debug, Clone, Default)]
pub struct CorsPolicy {
    allow_all: bool,
    origins: HashSet<String>,
}

impl CorsPolicy {
    pub fn new(allowed: &[String]) -> Self {
        let mut policy = Self::default();
        for origin in allowed {
            if origin.trim() == "*" {
                policy.allow_all = true;
            } else if let Some(canonical) = canonical_origin(origin) {
                policy.origins.insert(canonical);
            }
        }
        policy
    }

    /// Decide for a request with the given `Origin`, `Host` and client-facing scheme.
    pub fn evaluate(&self, origin: Option<&str>, host: Option<&str>, scheme: &str) -> CorsDecision {
        let Some(origin) = origin.map(str::trim).filter(|o| !o.is_empty()) else {
            return CorsDecision::NotApplicable;
        };
        let Some(canonical) = canonical_origin(origin) else {
            return CorsDecision::Denied;
        };

        let same_origin = host
            .map(str::trim)
            .filter(|h| !h.is_empty())
            .and_then(|h| canonical_origin(&format!("{scheme}://{h}")))
            .is_some_and(|own| own == canonical);
        if same_origin || self.allow_all || self.origins.contains(&canonical) {
            CorsDecision::Allowed(origin.to_string())
        } else {
            CorsDecision::Denied
        }
    }
}

/// Attach the CORS response headers for an allowed origin.
pub fn apply_headers(headers: &mut HeaderMap, origin: &str) {
    let Ok(origin) = HeaderValue::from_str(origin) else {
        return;
    };
    headers.append(VARY, HeaderValue::from_static("Origin"));
    headers.insert(ACCESS_CONTROL_ALLOW_ORIGIN, origin);
    headers.insert(ACCESS_CONTROL_ALLOW_METHODS, HeaderValue::from_static(ALLOW_METHODS));
    headers.insert(ACCESS_CONTROL_ALLOW_HEADERS, HeaderValue::from_static(ALLOW_HEADERS));
    headers.insert(ACCESS_CONTROL_EXPOSE_HEADERS, HeaderValue::from_static(EXPOSE_HEADERS));
    headers.insert(ACCESS_CONTROL_MAX_AGE, HeaderValue::from_static(MAX_AGE));
}

/// `scheme://host[:port]`, lowercased, default ports dropped.
fn canonical_origin(raw: &str) -> Option<String> {
    let url = url::Url::parse(raw.trim()).ok()?;
    let host = url.host_str()?.to_ascii_lowercase();
    match url.port() {
        Some(port) => Some(format!("{}://{}:{}", url.scheme(), host, port)),
        None => Some(format!("{}://{}", url.scheme(), host)),
    }
}
