// Copyright (c) 2026 Relay Gateway Contributors
// SPDX-License-Identifier: AGPL-3.0

// Upstream (Core) Client
//
// Single `reqwest::Client` shared by every request and realtime connection.
// TLS material is loaded once at construction; failures there are fatal.
//
// Every call makes exactly one attempt. Timeouts surface as `Timeout` (504),
// any other transport failure or an undecodable JSON body as 502.

use axum::http::{HeaderMap, Method, StatusCode};
use reqwest::{Certificate, Identity};
use serde_json::{Map, Value};
use std::net::ToSocketAddrs;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use url::Url;

use crate::domain::config::{ConfigError, RelayConfig};
use crate::domain::realtime::{parse_sse, PollSettings, SseEvent};

pub const REQUEST_ID_HEADER: &str = "x-request-id";
pub const IDEMPOTENCY_KEY_HEADER: &str = "idempotency-key";
pub const IDEMPOTENCY_REPLAYED_HEADER: &str = "x-idempotency-replayed";

const DEFAULT_RAW_CONTENT_TYPE: &str = "text/html; charset=utf-8";

#[derive(Debug, Error)]
pub enum UpstreamError {
    #[error("core API timed out: {0}")]
    Timeout(String),

    #[error("core API unreachable: {0}")]
    Unreachable(String),

    #[error("failed to read core response: {0}")]
    Read(String),

    #[error("core API returned invalid JSON")]
    InvalidJson,

    #[error("failed to build core URL")]
    InvalidUrl,

    #[error("core events stream returned status {0}")]
    Status(u16),
}

impl UpstreamError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            UpstreamError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            _ => StatusCode::BAD_GATEWAY,
        }
    }

    fn from_send(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            UpstreamError::Timeout(err.to_string())
        } else {
            UpstreamError::Unreachable(err.to_string())
        }
    }

    fn from_read(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            UpstreamError::Timeout(err.to_string())
        } else {
            UpstreamError::Read(err.to_string())
        }
    }
}

/// Outbound request description shared by REST forwarding and realtime commands.
#[derive(Debug, Clone)]
pub struct UpstreamRequest<'a> {
    pub method: Method,
    pub path: &'a str,
    pub query: Option<&'a str>,
    pub body: Option<&'a Value>,
    pub request_id: &'a str,
    pub idempotency_key: Option<&'a str>,
}

/// Decoded JSON response plus the upstream correlation headers.
#[derive(Debug, Clone)]
pub struct UpstreamJson {
    pub status: StatusCode,
    pub payload: Value,
    pub core_request_id: Option<String>,
    pub idempotency_key: Option<String>,
    pub replayed: bool,
}

/// Response forwarded byte-for-byte.
#[derive(Debug)]
pub struct UpstreamRaw {
    pub status: StatusCode,
    pub content_type: String,
    pub response: reqwest::Response,
}

#[derive(Debug, Clone)]
pub struct CoreHealth {
    pub status: StatusCode,
}

#[derive(Debug, Clone)]
pub struct UpstreamClient {
    http: reqwest::Client,
    base: Url,
    core_token: Option<String>,
    timeout: Duration,
}

impl UpstreamClient {
    pub fn from_config(config: &RelayConfig) -> Result<Self, ConfigError> {
        let mut base = config.validate()?;
        let timeout = config.timeout();
        let mut builder = reqwest::Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout.min(Duration::from_secs(30)));

        if config.core_tls_insecure_skip_verify {
            tracing::warn!("Core TLS certificate verification is disabled");
            builder = builder.danger_accept_invalid_certs(true);
        }
        if let Some(ca) = &config.core_ca_file {
            let pem = read_material("core CA file", ca)?;
            let certs = Certificate::from_pem_bundle(&pem).map_err(|e| ConfigError::Tls {
                what: "core CA file",
                reason: e.to_string(),
            })?;
            if certs.is_empty() {
                return Err(ConfigError::Tls {
                    what: "core CA file",
                    reason: "no certificates found".to_string(),
                });
            }
            for cert in certs {
                builder = builder.add_root_certificate(cert);
            }
        }
        if let (Some(cert), Some(key)) = (&config.core_client_cert_file, &config.core_client_key_file) {
            let mut pem = read_material("core client certificate", cert)?;
            pem.push(b'\n');
            pem.extend(read_material("core client key", key)?);
            let identity = Identity::from_pem(&pem).map_err(|e| ConfigError::Tls {
                what: "core client certificate",
                reason: e.to_string(),
            })?;
            builder = builder.identity(identity);
        }
        if let Some(server_name) = &config.core_tls_server_name {
            // Connect to the configured address but present `server_name` for SNI
            // and certificate verification.
            let host = base.host_str().ok_or(ConfigError::InvalidCoreUrl("missing host".into()))?;
            let port = base.port_or_known_default().unwrap_or(443);
            let addr = (host, port)
                .to_socket_addrs()
                .map_err(|e| ConfigError::InvalidCoreUrl(e.to_string()))?
                .next()
                .ok_or_else(|| ConfigError::InvalidCoreUrl(format!("{host} did not resolve")))?;
            base.set_host(Some(server_name))
                .map_err(|e| ConfigError::InvalidCoreUrl(e.to_string()))?;
            builder = builder.resolve(server_name, addr);
        }

        let http = builder.build().map_err(|e| ConfigError::Client(e.to_string()))?;
        Ok(Self {
            http,
            base,
            core_token: config.core_token.clone(),
            timeout,
        })
    }

    /// `base.path + path`, with the query replaced.
    pub fn url_for(&self, path: &str, query: Option<&str>) -> Result<Url, UpstreamError> {
        let mut url = self.base.clone();
        let joined = format!(
            "{}/{}",
            url.path().trim_end_matches('/'),
            path.trim_start_matches('/')
        );
        url.set_path(&joined);
        url.set_query(query.filter(|q| !q.is_empty()));
        if url.cannot_be_a_base() {
            return Err(UpstreamError::InvalidUrl);
        }
        Ok(url)
    }

    fn request(&self, method: Method, url: Url, request_id: &str) -> reqwest::RequestBuilder {
        let mut builder = self
            .http
            .request(method, url)
            .header(REQUEST_ID_HEADER, request_id);
        if let Some(token) = &self.core_token {
            builder = builder.bearer_auth(token);
        }
        builder
    }

    pub async fn json_request(&self, req: UpstreamRequest<'_>) -> Result<UpstreamJson, UpstreamError> {
        let url = self.url_for(req.path, req.query)?;
        let is_post = req.method == Method::POST;
        let mut builder = self
            .request(req.method, url, req.request_id)
            .header(reqwest::header::CONTENT_TYPE, "application/json");
        if let Some(key) = req.idempotency_key.map(str::trim).filter(|k| !k.is_empty()) {
            builder = builder.header(IDEMPOTENCY_KEY_HEADER, key);
        }
        if is_post {
            let body = match req.body {
                Some(body) => serde_json::to_vec(body).map_err(|_| UpstreamError::InvalidJson)?,
                None => b"{}".to_vec(),
            };
            builder = builder.body(body);
        }

        let response = builder.send().await.map_err(UpstreamError::from_send)?;
        let status = response.status();
        let headers = response.headers().clone();
        let raw = response.bytes().await.map_err(UpstreamError::from_read)?;
        let mut payload = decode_json(&raw)?;
        attach_request_id(&mut payload, req.request_id);

        Ok(UpstreamJson {
            status,
            payload,
            core_request_id: header_value(&headers, REQUEST_ID_HEADER),
            idempotency_key: header_value(&headers, IDEMPOTENCY_KEY_HEADER),
            replayed: header_value(&headers, IDEMPOTENCY_REPLAYED_HEADER)
                .is_some_and(|v| v.eq_ignore_ascii_case("true")),
        })
    }

    pub async fn raw_request(
        &self,
        path: &str,
        query: Option<&str>,
        request_id: &str,
    ) -> Result<UpstreamRaw, UpstreamError> {
        let url = self.url_for(path, query)?;
        let response = self
            .request(Method::GET, url, request_id)
            .send()
            .await
            .map_err(UpstreamError::from_send)?;
        let content_type = header_value(response.headers(), reqwest::header::CONTENT_TYPE.as_str())
            .unwrap_or_else(|| DEFAULT_RAW_CONTENT_TYPE.to_string());
        Ok(UpstreamRaw {
            status: response.status(),
            content_type,
            response,
        })
    }

    /// One `GET /health` against the core; no retries.
    pub async fn health_probe(&self, request_id: &str) -> Result<CoreHealth, UpstreamError> {
        let url = self.url_for("/health", None)?;
        let response = self
            .request(Method::GET, url, request_id)
            .send()
            .await
            .map_err(UpstreamError::from_send)?;
        Ok(CoreHealth {
            status: response.status(),
        })
    }

    /// One long-poll of `/events/stream`, returning every parsed frame.
    pub async fn poll_events(
        &self,
        since_id: i64,
        settings: PollSettings,
        request_id: &str,
    ) -> Result<Vec<SseEvent>, UpstreamError> {
        let query = format!(
            "timeout={}&interval={}&since_id={}",
            settings.timeout_secs, settings.interval_secs, since_id
        );
        let url = self.url_for("/events/stream", Some(&query))?;
        let response = self
            .request(Method::GET, url, request_id)
            .timeout(Duration::from_secs_f64(settings.timeout_secs) + self.timeout)
            .send()
            .await
            .map_err(UpstreamError::from_send)?;
        if response.status() != StatusCode::OK {
            return Err(UpstreamError::Status(response.status().as_u16()));
        }
        let body = response.text().await.map_err(UpstreamError::from_read)?;
        Ok(parse_sse(&body))
    }
}

fn read_material(what: &'static str, path: &Path) -> Result<Vec<u8>, ConfigError> {
    std::fs::read(path).map_err(|source| ConfigError::Io {
        what,
        path: path.to_path_buf(),
        source,
    })
}

fn header_value(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Empty bodies decode to `{}`.
fn decode_json(raw: &[u8]) -> Result<Value, UpstreamError> {
    if raw.iter().all(u8::is_ascii_whitespace) {
        return Ok(Value::Object(Map::new()));
    }
    serde_json::from_slice(raw).map_err(|_| UpstreamError::InvalidJson)
}

/// Adds `request_id` to JSON objects that lack one.
pub fn attach_request_id(payload: &mut Value, request_id: &str) {
    if let Value::Object(obj) = payload {
        obj.entry("request_id")
            .or_insert_with(|| Value::String(request_id.to_string()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn client(url: &str) -> UpstreamClient {
        let config = RelayConfig {
            core_url: url.to_string(),
            core_token: Some("core-secret".into()),
            ..RelayConfig::default()
        };
        UpstreamClient::from_config(&config).unwrap()
    }

    #[test]
    fn test_url_for_preserves_base_path() {
        let upstream = client("http://core.internal:8787/api/");
        let url = upstream.url_for("/jobs/j1", Some("limit=5")).unwrap();
        assert_eq!(url.as_str(), "http://core.internal:8787/api/jobs/j1?limit=5");
        let url = upstream.url_for("models", None).unwrap();
        assert_eq!(url.as_str(), "http://core.internal:8787/api/models");
    }

    #[test]
    fn test_attach_request_id_only_fills_missing() {
        let mut obj = json!({"job_id": "j1"});
        attach_request_id(&mut obj, "rid");
        assert_eq!(obj["request_id"], "rid");

        let mut existing = json!({"request_id": "upstream"});
        attach_request_id(&mut existing, "rid");
        assert_eq!(existing["request_id"], "upstream");

        let mut list = json!([1, 2]);
        attach_request_id(&mut list, "rid");
        assert_eq!(list, json!([1, 2]));
    }

    #[test]
    fn test_missing_ca_file_is_fatal() {
        let config = RelayConfig {
            core_url: "https://core.internal".into(),
            core_ca_file: Some("/nonexistent/ca.pem".into()),
            ..RelayConfig::default()
        };
        assert!(matches!(
            UpstreamClient::from_config(&config),
            Err(ConfigError::Io { what: "core CA file", .. })
        ));
    }

    #[tokio::test]
    async fn test_json_request_forwards_headers_and_reads_replay() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/run_async")
            .match_header("authorization", "Bearer core-secret")
            .match_header("x-request-id", "rid-1")
            .match_header("idempotency-key", "idem-1")
            .match_body(mockito::Matcher::Json(json!({"objective": "x"})))
            .with_status(202)
            .with_header("x-request-id", "core-rid")
            .with_header("idempotency-key", "idem-1")
            .with_header("x-idempotency-replayed", "true")
            .with_body(r#"{"job_id":"j1"}"#)
            .create_async()
            .await;

        let body = json!({"objective": "x"});
        let result = client(&server.url())
            .json_request(UpstreamRequest {
                method: Method::POST,
                path: "/run_async",
                query: None,
                body: Some(&body),
                request_id: "rid-1",
                idempotency_key: Some("idem-1"),
            })
            .await
            .unwrap();

        mock.assert_async().await;
        assert_eq!(result.status, StatusCode::ACCEPTED);
        assert_eq!(result.payload["job_id"], "j1");
        assert_eq!(result.payload["request_id"], "rid-1");
        assert_eq!(result.core_request_id.as_deref(), Some("core-rid"));
        assert!(result.replayed);
    }

    #[tokio::test]
    async fn test_malformed_upstream_json_is_bad_gateway() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/models")
            .with_body("<html>oops")
            .create_async()
            .await;
        let err = client(&server.url())
            .json_request(UpstreamRequest {
                method: Method::GET,
                path: "/models",
                query: None,
                body: None,
                request_id: "rid",
                idempotency_key: None,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, UpstreamError::InvalidJson));
        assert_eq!(err.status_code(), StatusCode::BAD_GATEWAY);
    }

    #[tokio::test]
    async fn test_poll_events_sends_cursor_and_parses_frames() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/events/stream")
            .match_query(mockito::Matcher::AllOf(vec![
                mockito::Matcher::UrlEncoded("since_id".into(), "41".into()),
                mockito::Matcher::UrlEncoded("timeout".into(), "1".into()),
            ]))
            .with_header("content-type", "text/event-stream")
            .with_body("event: audit\ndata: {\"id\":42}\n\nevent: timeout\ndata: {}\n\n")
            .create_async()
            .await;

        let settings = PollSettings::from_query(Some("1"), Some("0.05"));
        let events = client(&server.url())
            .poll_events(41, settings, "rid")
            .await
            .unwrap();
        mock.assert_async().await;
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].id(), Some(42));
    }

    #[tokio::test]
    async fn test_poll_events_non_ok_is_error() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/events/stream")
            .match_query(mockito::Matcher::Any)
            .with_status(503)
            .create_async()
            .await;
        let err = client(&server.url())
            .poll_events(0, PollSettings::default(), "rid")
            .await
            .unwrap_err();
        assert!(matches!(err, UpstreamError::Status(503)));
    }
}
