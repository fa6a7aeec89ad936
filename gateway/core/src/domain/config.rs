// Copyright (c) 2026 Relay Gateway Contributors
// SPDX-License-Identifier: AGPL-3.0

// Relay Configuration
//
// Immutable process-wide settings, loaded once at startup:
// - Upstream (core) location, credentials and TLS material
// - Static token / session signing key and session lifetime
// - Device, CORS and trusted-proxy allow-lists
// - Rate limiting, websocket and body-size limits
// - Revocation store location
//
// Sources, lowest precedence first: `Default`, an optional YAML file, then
// flags/env applied by the binary.

use ipnet::IpNet;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::domain::route_policy::UnscopedRoutePolicy;

pub const DEFAULT_MAX_BODY_BYTES: usize = 1 << 20;
pub const DEFAULT_MAX_WS_CONNECTIONS: usize = 100;
pub const DEFAULT_RATE_LIMIT_BURST: u32 = 20;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("core base url is required")]
    MissingCoreUrl,

    #[error("invalid core base url: {0}")]
    InvalidCoreUrl(String),

    #[error("core base url must use http or https")]
    UnsupportedScheme,

    #[error("both core client cert and key files must be provided together")]
    PartialClientIdentity,

    #[error("invalid trusted proxy cidr {value:?}: {reason}")]
    InvalidTrustedProxy { value: String, reason: String },

    #[error("failed to read {what} {path:?}: {source}")]
    Io {
        what: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse {what}: {reason}")]
    Tls { what: &'static str, reason: String },

    #[error("failed to build upstream client: {0}")]
    Client(String),

    #[error("failed to load revocation store: {0}")]
    RevocationStore(String),

    #[error("invalid rate limit: {0}")]
    InvalidRateLimit(String),

    #[error("invalid config file {path:?}: {reason}")]
    File { path: PathBuf, reason: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Base URL of the internal orchestration API.
    pub core_url: String,

    /// Bearer token the relay presents to the upstream.
    #[serde(skip_serializing)]
    pub core_token: Option<String>,

    /// Static shared secret granting every scope.
    #[serde(skip_serializing)]
    pub bridge_token: Option<String>,

    /// HMAC key for session tokens; falls back to `bridge_token` when unset.
    #[serde(skip_serializing)]
    pub session_signing_key: Option<String>,

    pub session_ttl_seconds: i64,

    /// Empty disables device allow-listing.
    pub allowed_device_ids: Vec<String>,

    /// Cross-origin allow-list; `*` allows any origin.
    pub cors_allowed_origins: Vec<String>,

    /// Peers allowed to set `X-Forwarded-For` / `X-Forwarded-Proto`.
    pub trusted_proxy_cidrs: Vec<String>,

    pub revocation_store_path: Option<PathBuf>,

    /// Requests per second per client; `<= 0` disables limiting.
    pub rate_limit_rps: f64,
    pub rate_limit_burst: u32,

    /// `0` means the default of 100.
    pub max_ws_connections: usize,

    pub max_body_bytes: usize,

    /// Upstream request timeout.
    pub timeout_seconds: u64,

    pub core_ca_file: Option<PathBuf>,
    pub core_client_cert_file: Option<PathBuf>,
    pub core_client_key_file: Option<PathBuf>,
    pub core_tls_server_name: Option<String>,
    /// Disables upstream certificate verification. Local development only.
    pub core_tls_insecure_skip_verify: bool,

    pub log_requests: bool,

    pub unscoped_route_policy: UnscopedRoutePolicy,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            core_url: "http://127.0.0.1:8787".to_string(),
            core_token: None,
            bridge_token: None,
            session_signing_key: None,
            session_ttl_seconds: 900,
            allowed_device_ids: Vec::new(),
            cors_allowed_origins: Vec::new(),
            trusted_proxy_cidrs: Vec::new(),
            revocation_store_path: None,
            rate_limit_rps: 0.0,
            rate_limit_burst: DEFAULT_RATE_LIMIT_BURST,
            max_ws_connections: DEFAULT_MAX_WS_CONNECTIONS,
            max_body_bytes: DEFAULT_MAX_BODY_BYTES,
            timeout_seconds: 30,
            core_ca_file: None,
            core_client_cert_file: None,
            core_client_key_file: None,
            core_tls_server_name: None,
            core_tls_insecure_skip_verify: false,
            log_requests: true,
            unscoped_route_policy: UnscopedRoutePolicy::default(),
        }
    }
}

impl RelayConfig {
    /// Load a YAML config file; missing keys keep their defaults.
    pub fn from_yaml_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            what: "config file",
            path: path.to_path_buf(),
            source,
        })?;
        serde_yaml::from_str(&raw).map_err(|e| ConfigError::File {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })
    }

    /// Fill zero/blank values with their defaults and apply floors.
    pub fn normalized(mut self) -> Self {
        self.core_token = non_blank(self.core_token);
        self.bridge_token = non_blank(self.bridge_token);
        self.session_signing_key = non_blank(self.session_signing_key);
        self.core_tls_server_name = non_blank(self.core_tls_server_name);
        if self.timeout_seconds == 0 {
            self.timeout_seconds = 30;
        }
        if self.session_ttl_seconds <= 0 {
            self.session_ttl_seconds = 900;
        }
        self.session_ttl_seconds = self.session_ttl_seconds.max(60);
        if self.max_ws_connections == 0 {
            self.max_ws_connections = DEFAULT_MAX_WS_CONNECTIONS;
        }
        if self.max_body_bytes == 0 {
            self.max_body_bytes = DEFAULT_MAX_BODY_BYTES;
        }
        self.allowed_device_ids = trimmed_list(self.allowed_device_ids);
        self.cors_allowed_origins = trimmed_list(self.cors_allowed_origins);
        self.trusted_proxy_cidrs = trimmed_list(self.trusted_proxy_cidrs);
        self
    }

    /// Validate the pieces that can be checked without touching the disk.
    pub fn validate(&self) -> Result<url::Url, ConfigError> {
        let raw = self.core_url.trim();
        if raw.is_empty() {
            return Err(ConfigError::MissingCoreUrl);
        }
        let core_url =
            url::Url::parse(raw).map_err(|e| ConfigError::InvalidCoreUrl(e.to_string()))?;
        if core_url.scheme() != "http" && core_url.scheme() != "https" {
            return Err(ConfigError::UnsupportedScheme);
        }
        if self.core_client_cert_file.is_some() != self.core_client_key_file.is_some() {
            return Err(ConfigError::PartialClientIdentity);
        }
        self.trusted_proxies()?;
        self.validate_rate_limit()?;
        Ok(core_url)
    }

    fn validate_rate_limit(&self) -> Result<(), ConfigError> {
        let rps = self.rate_limit_rps;
        if !rps.is_finite() {
            return Err(ConfigError::InvalidRateLimit(format!(
                "rate_limit_rps must be a finite number, got {rps}"
            )));
        }
        if rps <= 0.0 {
            return Ok(());
        }
        if refill_period(rps).is_none() {
            return Err(ConfigError::InvalidRateLimit(format!(
                "rate_limit_rps {rps} is outside the supported range"
            )));
        }
        if self.rate_limit_burst == 0 {
            return Err(ConfigError::InvalidRateLimit(
                "rate_limit_burst must be at least 1 when rate limiting is enabled".to_string(),
            ));
        }
        Ok(())
    }

    /// Parse trusted proxy entries; bare addresses become host networks.
    pub fn trusted_proxies(&self) -> Result<Vec<IpNet>, ConfigError> {
        self.trusted_proxy_cidrs
            .iter()
            .map(|item| {
                if let Ok(ip) = item.parse::<IpAddr>() {
                    return Ok(IpNet::from(ip));
                }
                item.parse::<IpNet>()
                    .map_err(|e| ConfigError::InvalidTrustedProxy {
                        value: item.clone(),
                        reason: e.to_string(),
                    })
            })
            .collect()
    }

    /// Neither a static token nor a signing key: every caller is admitted.
    pub fn is_open_mode(&self) -> bool {
        self.bridge_token.is_none() && self.session_signing_key.is_none()
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds.max(1))
    }

    pub fn core_tls_enabled(&self) -> bool {
        self.core_url.trim().to_ascii_lowercase().starts_with("https://")
    }
}

/// Interval between token refills for `rps`. `None` when `rps` is not a
/// positive rate a bucket can represent at nanosecond resolution.
pub fn refill_period(rps: f64) -> Option<Duration> {
    if !(rps.is_finite() && rps > 0.0) {
        return None;
    }
    Duration::try_from_secs_f64(1.0 / rps)
        .ok()
        .filter(|period| !period.is_zero() && period.as_nanos() <= u128::from(u64::MAX))
}

/// Split a comma-separated list, dropping blanks.
pub fn parse_csv(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(str::to_string)
        .collect()
}

fn trimmed_list(items: Vec<String>) -> Vec<String> {
    items
        .into_iter()
        .map(|item| item.trim().to_string())
        .filter(|item| !item.is_empty())
        .collect()
}

fn non_blank(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_csv_drops_blanks() {
        assert_eq!(parse_csv(" a, ,b ,"), vec!["a".to_string(), "b".to_string()]);
        assert!(parse_csv("").is_empty());
    }

    #[test]
    fn test_validate_rejects_bad_urls() {
        let mut cfg = RelayConfig::default();
        cfg.core_url = "".into();
        assert!(matches!(cfg.validate(), Err(ConfigError::MissingCoreUrl)));
        cfg.core_url = "ftp://core".into();
        assert!(matches!(cfg.validate(), Err(ConfigError::UnsupportedScheme)));
    }

    #[test]
    fn test_validate_rejects_partial_client_identity() {
        let cfg = RelayConfig {
            core_client_cert_file: Some("client.pem".into()),
            ..RelayConfig::default()
        };
        assert!(matches!(cfg.validate(), Err(ConfigError::PartialClientIdentity)));
    }

    #[test]
    fn test_trusted_proxies_accept_bare_ips_and_cidrs() {
        let cfg = RelayConfig {
            trusted_proxy_cidrs: vec!["10.0.0.0/8".into(), "127.0.0.1".into(), "::1".into()],
            ..RelayConfig::default()
        };
        let nets = cfg.trusted_proxies().unwrap();
        assert_eq!(nets.len(), 3);
        assert_eq!(nets[1].prefix_len(), 32);
        assert_eq!(nets[2].prefix_len(), 128);

        let bad = RelayConfig {
            trusted_proxy_cidrs: vec!["not-a-cidr".into()],
            ..RelayConfig::default()
        };
        assert!(matches!(bad.validate(), Err(ConfigError::InvalidTrustedProxy { .. })));
    }

    #[test]
    fn test_normalized_applies_floors_and_blank_secrets() {
        let cfg = RelayConfig {
            bridge_token: Some("   ".into()),
            session_ttl_seconds: 5,
            max_ws_connections: 0,
            timeout_seconds: 0,
            ..RelayConfig::default()
        }
        .normalized();
        assert!(cfg.bridge_token.is_none());
        assert!(cfg.is_open_mode());
        assert_eq!(cfg.session_ttl_seconds, 60);
        assert_eq!(cfg.max_ws_connections, DEFAULT_MAX_WS_CONNECTIONS);
        assert_eq!(cfg.timeout_seconds, 30);
    }

    #[test]
    fn test_validate_rejects_unrepresentable_rates() {
        for rps in [1e-300, 1e300, f64::INFINITY, f64::NAN] {
            let cfg = RelayConfig {
                rate_limit_rps: rps,
                ..RelayConfig::default()
            };
            assert!(
                matches!(cfg.validate(), Err(ConfigError::InvalidRateLimit(_))),
                "rps {rps} must be rejected"
            );
        }
        let cfg = RelayConfig {
            rate_limit_rps: -1.0,
            ..RelayConfig::default()
        };
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_zero_burst_rejected_only_when_limiting() {
        let limited = RelayConfig {
            rate_limit_rps: 5.0,
            rate_limit_burst: 0,
            ..RelayConfig::default()
        }
        .normalized();
        assert_eq!(limited.rate_limit_burst, 0);
        assert!(matches!(limited.validate(), Err(ConfigError::InvalidRateLimit(_))));

        let disabled = RelayConfig {
            rate_limit_burst: 0,
            ..RelayConfig::default()
        };
        assert!(disabled.validate().is_ok());
    }

    #[test]
    fn test_refill_period() {
        assert_eq!(refill_period(4.0), Some(Duration::from_millis(250)));
        assert_eq!(refill_period(0.0), None);
        assert_eq!(refill_period(1e-300), None);
        assert_eq!(refill_period(1e12), None);
    }

    #[test]
    fn test_yaml_file_keeps_defaults_for_missing_keys() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("relay.yaml");
        std::fs::write(
            &path,
            "core_url: https://core.internal:8443\nrate_limit_rps: 5\nunscoped_route_policy: run\n",
        )
        .unwrap();
        let cfg = RelayConfig::from_yaml_file(&path).unwrap();
        assert_eq!(cfg.core_url, "https://core.internal:8443");
        assert_eq!(cfg.rate_limit_rps, 5.0);
        assert_eq!(cfg.unscoped_route_policy, UnscopedRoutePolicy::Run);
        assert_eq!(cfg.max_body_bytes, DEFAULT_MAX_BODY_BYTES);
        assert!(cfg.core_tls_enabled());
    }
}
