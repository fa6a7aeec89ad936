// Copyright (c) 2026 Relay Gateway Contributors
// SPDX-License-Identifier: AGPL-3.0
//! Command-line and environment configuration.
//!
//! Every relay setting is an optional flag backed by a `RELAY_*` variable.
//! Settings that are given override the YAML file, which overrides defaults.

use anyhow::{Context, Result};
use clap::builder::BoolishValueParser;
use clap::Parser;
use relay_core::domain::config::parse_csv;
use relay_core::domain::route_policy::UnscopedRoutePolicy;
use relay_core::RelayConfig;
use std::path::PathBuf;

/// Relay Gateway - secure realtime relay for a private orchestration API
#[derive(Debug, Parser)]
#[command(name = "relay-gateway")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to a YAML configuration file
    #[arg(short, long, env = "RELAY_CONFIG_PATH", value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Listen host
    #[arg(long, env = "RELAY_HOST", default_value = "127.0.0.1")]
    pub host: String,

    /// Listen port
    #[arg(long, env = "RELAY_PORT", default_value = "9797")]
    pub port: u16,

    /// Log level (trace, debug, info, warn, error); RUST_LOG takes precedence
    #[arg(long, env = "RELAY_LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Base URL of the internal orchestration API
    #[arg(long, env = "RELAY_CORE_URL")]
    pub core_url: Option<String>,

    /// Bearer token presented to the orchestration API
    #[arg(long, env = "RELAY_CORE_TOKEN", hide_env_values = true)]
    pub core_token: Option<String>,

    /// Static shared secret accepted from clients (grants every scope)
    #[arg(long, env = "RELAY_BRIDGE_TOKEN", hide_env_values = true)]
    pub bridge_token: Option<String>,

    /// HMAC key for session tokens (defaults to the bridge token)
    #[arg(long, env = "RELAY_SESSION_SIGNING_KEY", hide_env_values = true)]
    pub session_signing_key: Option<String>,

    /// Default session lifetime in seconds
    #[arg(long, env = "RELAY_SESSION_TTL_SECONDS")]
    pub session_ttl_seconds: Option<i64>,

    /// Comma-separated device allow-list
    #[arg(long, env = "RELAY_ALLOWED_DEVICE_IDS")]
    pub allowed_device_ids: Option<String>,

    /// Comma-separated browser origins allowed cross-origin (`*` for any)
    #[arg(long, env = "RELAY_CORS_ALLOWED_ORIGINS")]
    pub cors_allowed_origins: Option<String>,

    /// Comma-separated proxy CIDRs or addresses whose forwarding headers are honoured
    #[arg(long, env = "RELAY_TRUSTED_PROXY_CIDRS")]
    pub trusted_proxy_cidrs: Option<String>,

    /// File that persists revoked session ids
    #[arg(long, env = "RELAY_REVOCATION_STORE_PATH", value_name = "FILE")]
    pub revocation_store_path: Option<PathBuf>,

    /// Requests per second per client (0 disables rate limiting)
    #[arg(long, env = "RELAY_RATE_LIMIT_RPS")]
    pub rate_limit_rps: Option<f64>,

    #[arg(long, env = "RELAY_RATE_LIMIT_BURST")]
    pub rate_limit_burst: Option<u32>,

    #[arg(long, env = "RELAY_MAX_WS_CONNECTIONS")]
    pub max_ws_connections: Option<usize>,

    #[arg(long, env = "RELAY_MAX_BODY_BYTES")]
    pub max_body_bytes: Option<usize>,

    /// Upstream request timeout in seconds
    #[arg(long, env = "RELAY_TIMEOUT")]
    pub timeout: Option<u64>,

    #[arg(long, env = "RELAY_CORE_CA_FILE", value_name = "FILE")]
    pub core_ca_file: Option<PathBuf>,

    #[arg(long, env = "RELAY_CORE_CLIENT_CERT_FILE", value_name = "FILE")]
    pub core_client_cert_file: Option<PathBuf>,

    #[arg(long, env = "RELAY_CORE_CLIENT_KEY_FILE", value_name = "FILE")]
    pub core_client_key_file: Option<PathBuf>,

    #[arg(long, env = "RELAY_CORE_TLS_SERVER_NAME")]
    pub core_tls_server_name: Option<String>,

    /// Skip upstream certificate verification (development only)
    #[arg(long, env = "RELAY_CORE_TLS_INSECURE_SKIP_VERIFY", value_parser = BoolishValueParser::new())]
    pub core_tls_insecure_skip_verify: Option<bool>,

    #[arg(long, env = "RELAY_LOG_REQUESTS", value_parser = BoolishValueParser::new())]
    pub log_requests: Option<bool>,

    /// What unmatched mutating routes require: `deny` (admin only) or `run`
    #[arg(long, env = "RELAY_UNSCOPED_ROUTE_POLICY")]
    pub unscoped_route_policy: Option<UnscopedRoutePolicy>,
}

impl Cli {
    pub fn load_config(&self) -> Result<RelayConfig> {
        let base = match &self.config {
            Some(path) => RelayConfig::from_yaml_file(path)
                .with_context(|| format!("Failed to load configuration from {}", path.display()))?,
            None => RelayConfig::default(),
        };
        Ok(self.apply(base))
    }

    /// Overlay every setting that was given on top of `config`.
    pub fn apply(&self, mut config: RelayConfig) -> RelayConfig {
        if let Some(v) = &self.core_url {
            config.core_url = v.clone();
        }
        if let Some(v) = &self.core_token {
            config.core_token = Some(v.clone());
        }
        if let Some(v) = &self.bridge_token {
            config.bridge_token = Some(v.clone());
        }
        if let Some(v) = &self.session_signing_key {
            config.session_signing_key = Some(v.clone());
        }
        if let Some(v) = self.session_ttl_seconds {
            config.session_ttl_seconds = v;
        }
        if let Some(v) = &self.allowed_device_ids {
            config.allowed_device_ids = parse_csv(v);
        }
        if let Some(v) = &self.cors_allowed_origins {
            config.cors_allowed_origins = parse_csv(v);
        }
        if let Some(v) = &self.trusted_proxy_cidrs {
            config.trusted_proxy_cidrs = parse_csv(v);
        }
        if let Some(v) = &self.revocation_store_path {
            config.revocation_store_path = Some(v.clone());
        }
        if let Some(v) = self.rate_limit_rps {
            config.rate_limit_rps = v;
        }
        if let Some(v) = self.rate_limit_burst {
            config.rate_limit_burst = v;
        }
        if let Some(v) = self.max_ws_connections {
            config.max_ws_connections = v;
        }
        if let Some(v) = self.max_body_bytes {
            config.max_body_bytes = v;
        }
        if let Some(v) = self.timeout {
            config.timeout_seconds = v;
        }
        if let Some(v) = &self.core_ca_file {
            config.core_ca_file = Some(v.clone());
        }
        if let Some(v) = &self.core_client_cert_file {
            config.core_client_cert_file = Some(v.clone());
        }
        if let Some(v) = &self.core_client_key_file {
            config.core_client_key_file = Some(v.clone());
        }
        if let Some(v) = &self.core_tls_server_name {
            config.core_tls_server_name = Some(v.clone());
        }
        if let Some(v) = self.core_tls_insecure_skip_verify {
            config.core_tls_insecure_skip_verify = v;
        }
        if let Some(v) = self.log_requests {
            config.log_requests = v;
        }
        if let Some(v) = self.unscoped_route_policy {
            config.unscoped_route_policy = v;
        }
        config
    }
}
