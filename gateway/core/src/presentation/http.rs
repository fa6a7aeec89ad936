// Copyright (c) 2026 Relay Gateway Contributors
// SPDX-License-Identifier: AGPL-3.0
//! # Relay HTTP Surface
//!
//! ```text
//! every request   request id -> CORS (403 / 204 preflight) -> access log
//! /health, /metrics                      served directly
//! everything else rate limit (429) -> auth gate (401/403) -> route
//!   POST /auth/session[/revoke]          admin only
//!   GET  /ws                             realtime upgrade
//!   *                                    allow-listed forward or 404
//! ```

use axum::body::Body;
use axum::extract::{ConnectInfo, Query, Request, State};
use axum::http::header::{CONTENT_TYPE, HOST, ORIGIN};
use axum::http::{HeaderValue, Method, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Extension, Json, Router};
use serde::Deserialize;
use serde_json::{json, Map, Value};
use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, warn};
use uuid::Uuid;

use crate::application::auth_gate::{AuthGate, Credentials};
use crate::application::realtime::SERVICE_NAME;
use crate::application::session_admin::SessionAdmin;
use crate::application::token_service::{now_unix, TokenService};
use crate::domain::auth_context::AuthorizationContext;
use crate::domain::config::{ConfigError, RelayConfig};
use crate::domain::route_policy::{classify, ForwardKind, RoutePolicy, REALTIME_PATH};
use crate::domain::scope::Scope;
use crate::infrastructure::client_identity::{header_str, TrustedProxies};
use crate::infrastructure::connection_governor::ConnectionGovernor;
use crate::infrastructure::cors::{self, CorsDecision, CorsPolicy};
use crate::infrastructure::metrics::RelayMetrics;
use crate::infrastructure::rate_limiter::{Admission, RateLimiter};
use crate::infrastructure::revocation_store::RevocationStore;
use crate::infrastructure::upstream::{
    attach_request_id, UpstreamClient, UpstreamRequest, IDEMPOTENCY_KEY_HEADER,
    IDEMPOTENCY_REPLAYED_HEADER, REQUEST_ID_HEADER,
};
use crate::presentation::error::{ApiError, RelayError};
use crate::presentation::ws;

/// Correlation id of the request being handled.
#[derive(Debug, Clone)]
pub struct RequestId(pub String);

pub(crate) struct RelayState {
    pub(crate) config: RelayConfig,
    pub(crate) policy: RoutePolicy,
    pub(crate) gate: AuthGate,
    pub(crate) sessions: SessionAdmin,
    pub(crate) revocations: Arc<RevocationStore>,
    pub(crate) upstream: Arc<UpstreamClient>,
    pub(crate) limiter: RateLimiter,
    pub(crate) cors: CorsPolicy,
    pub(crate) proxies: TrustedProxies,
    pub(crate) connections: ConnectionGovernor,
    pub(crate) metrics: RelayMetrics,
}

/// The relay: owns every piece of shared state and builds the axum router.
#[derive(Clone)]
pub struct Relay {
    state: Arc<RelayState>,
}

impl std::fmt::Debug for Relay {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Relay")
            .field("core_url", &self.state.config.core_url)
            .field("open_mode", &self.state.gate.is_open())
            .finish_non_exhaustive()
    }
}

impl Relay {
    /// Validate `config`, load TLS material and the revocation store, and
    /// assemble the relay. Any failure here is fatal for the process.
    pub fn new(config: RelayConfig) -> Result<Self, ConfigError> {
        let config = config.normalized();
        let proxies = TrustedProxies::new(config.trusted_proxies()?);
        let upstream = Arc::new(UpstreamClient::from_config(&config)?);

        let revocations = Arc::new(match &config.revocation_store_path {
            Some(path) => RevocationStore::load(path.clone(), now_unix())
                .map_err(|e| ConfigError::RevocationStore(e.to_string()))?,
            None => RevocationStore::in_memory(),
        });

        let signing_key = config
            .session_signing_key
            .as_deref()
            .or(config.bridge_token.as_deref());
        let tokens = TokenService::new(signing_key, config.session_ttl_seconds);
        let allowed_devices: HashSet<String> = config.allowed_device_ids.iter().cloned().collect();

        let gate = AuthGate::new(
            config.bridge_token.clone(),
            tokens.clone(),
            Arc::clone(&revocations),
            allowed_devices.clone(),
        );
        let sessions = SessionAdmin::new(tokens, Arc::clone(&revocations), allowed_devices);
        let metrics = RelayMetrics::new();
        let connections = ConnectionGovernor::new(config.max_ws_connections, metrics.ws_active.clone());

        Ok(Self {
            state: Arc::new(RelayState {
                policy: RoutePolicy::new(config.unscoped_route_policy),
                limiter: RateLimiter::new(config.rate_limit_rps, config.rate_limit_burst),
                cors: CorsPolicy::new(&config.cors_allowed_origins),
                gate,
                sessions,
                revocations,
                upstream,
                proxies,
                connections,
                metrics,
                config,
            }),
        })
    }

    pub fn config(&self) -> &RelayConfig {
        &self.state.config
    }

    /// True when neither a static token nor a signing key is configured.
    pub fn is_open_mode(&self) -> bool {
        self.state.gate.is_open()
    }

    pub fn metrics_text(&self) -> String {
        self.state.metrics.render()
    }

    pub fn router(&self) -> Router {
        let state = Arc::clone(&self.state);

        let protected = Router::new()
            .route("/auth/session", post(issue_session))
            .route("/auth/session/revoke", post(revoke_session))
            .route(REALTIME_PATH, get(ws::realtime_upgrade))
            .fallback(forward)
            .layer(middleware::from_fn_with_state(Arc::clone(&state), authenticate))
            .layer(middleware::from_fn_with_state(Arc::clone(&state), rate_limit));

        Router::new()
            .route("/health", get(health))
            .route("/metrics", get(metrics_text))
            .merge(protected)
            .layer(middleware::from_fn_with_state(Arc::clone(&state), request_context))
            .with_state(state)
    }
}

pub(crate) fn peer_addr(request: &Request) -> Option<SocketAddr> {
    request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| *addr)
}

fn normalize_request_id(raw: Option<&str>) -> String {
    raw.map(str::trim)
        .filter(|id| !id.is_empty() && HeaderValue::from_str(id).is_ok())
        .map(str::to_string)
        .unwrap_or_else(|| Uuid::new_v4().simple().to_string())
}

async fn request_context(
    State(relay): State<Arc<RelayState>>,
    mut request: Request,
    next: Next,
) -> Response {
    let started = Instant::now();
    relay.metrics.requests.increment(1);

    let request_id = normalize_request_id(header_str(request.headers(), REQUEST_ID_HEADER));
    request.extensions_mut().insert(RequestId(request_id.clone()));
    let method = request.method().clone();
    let path = request.uri().path().to_string();

    let peer = peer_addr(&request);
    let scheme = relay.proxies.request_scheme(request.headers(), peer);
    let decision = relay.cors.evaluate(
        header_str(request.headers(), ORIGIN.as_str()),
        header_str(request.headers(), HOST.as_str()),
        scheme,
    );

    let mut response = match &decision {
        CorsDecision::Denied => {
            warn!(request_id = %request_id, path = %path, "CORS origin not allowed");
            RelayError::CorsDenied
                .with_request_id(&request_id)
                .into_response()
        }
        CorsDecision::Allowed(_) if method == Method::OPTIONS => StatusCode::NO_CONTENT.into_response(),
        _ => next.run(request).await,
    };

    if let CorsDecision::Allowed(origin) = &decision {
        cors::apply_headers(response.headers_mut(), origin);
    }
    if let Ok(value) = HeaderValue::from_str(&request_id) {
        response.headers_mut().insert(REQUEST_ID_HEADER, value);
    }

    if relay.config.log_requests {
        info!(
            request_id = %request_id,
            method = %method,
            path = %path,
            status = response.status().as_u16(),
            duration_ms = started.elapsed().as_secs_f64() * 1000.0,
            "Relay request"
        );
    }
    response
}

async fn rate_limit(
    State(relay): State<Arc<RelayState>>,
    Extension(RequestId(request_id)): Extension<RequestId>,
    request: Request,
    next: Next,
) -> Response {
    let client = relay.proxies.client_key(request.headers(), peer_addr(&request));
    match relay.limiter.check(&client) {
        Admission::Allowed => next.run(request).await,
        Admission::Limited { retry_after_secs } => {
            relay.metrics.rate_limited.increment(1);
            warn!(request_id = %request_id, client = %client, "Rate limit exceeded");
            RelayError::RateLimited { retry_after_secs }
                .with_request_id(request_id)
                .into_response()
        }
    }
}

async fn authenticate(
    State(relay): State<Arc<RelayState>>,
    Extension(RequestId(request_id)): Extension<RequestId>,
    mut request: Request,
    next: Next,
) -> Response {
    let credentials =
        Credentials::extract(request.headers(), request.uri().path(), request.uri().query());
    match relay.gate.authenticate(&credentials) {
        Ok(context) => {
            request.extensions_mut().insert(context);
            next.run(request).await
        }
        Err(failure) => {
            relay.metrics.unauthorized.increment(1);
            warn!(
                request_id = %request_id,
                path = %request.uri().path(),
                reason = %failure,
                "Rejected request credentials"
            );
            RelayError::from(failure)
                .with_request_id(request_id)
                .into_response()
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct HealthQuery {
    deep: Option<String>,
}

async fn health(
    State(relay): State<Arc<RelayState>>,
    Extension(RequestId(request_id)): Extension<RequestId>,
    Query(query): Query<HealthQuery>,
) -> Response {
    let mut payload = json!({
        "ok": true,
        "service": SERVICE_NAME,
        "request_id": request_id,
        "relay": relay_snapshot(&relay),
    });
    if query.deep.as_deref() != Some("1") {
        return Json(payload).into_response();
    }

    let (status, core) = match relay.upstream.health_probe(&request_id).await {
        Ok(probe) => {
            let healthy = probe.status.is_success();
            let core = json!({
                "reachable": !probe.status.is_server_error(),
                "status": probe.status.as_u16(),
                "healthy": healthy,
            });
            let status = if healthy { StatusCode::OK } else { StatusCode::BAD_GATEWAY };
            (status, core)
        }
        Err(e) => (
            StatusCode::BAD_GATEWAY,
            json!({"reachable": false, "error": e.to_string()}),
        ),
    };
    payload["core"] = core;
    if status != StatusCode::OK {
        payload["ok"] = Value::Bool(false);
    }
    (status, Json(payload)).into_response()
}

fn relay_snapshot(relay: &RelayState) -> Value {
    let config = &relay.config;
    json!({
        "rate_limit_rps": config.rate_limit_rps,
        "rate_limit_burst": config.rate_limit_burst,
        "rate_limit_clients": relay.limiter.client_count(),
        "ws_max_connections": relay.connections.max(),
        "ws_active_connections": relay.connections.active(),
        "revoked_sessions": relay.revocations.len(),
        "revocation_store_path": relay
            .revocations
            .path()
            .map(|p| p.display().to_string())
            .unwrap_or_default(),
        "core_tls_enabled": config.core_tls_enabled(),
        "core_mtls_enabled": config.core_client_cert_file.is_some(),
    })
}

async fn metrics_text(State(relay): State<Arc<RelayState>>) -> Response {
    (
        [(CONTENT_TYPE, HeaderValue::from_static("text/plain; version=0.0.4"))],
        relay.metrics.render(),
    )
        .into_response()
}

async fn issue_session(
    State(relay): State<Arc<RelayState>>,
    Extension(caller): Extension<AuthorizationContext>,
    Extension(RequestId(request_id)): Extension<RequestId>,
    request: Request,
) -> Result<Json<Value>, ApiError> {
    if !caller.has_scope(Scope::Admin) {
        warn!(request_id = %request_id, subject = %caller.subject, "Session issuance requires admin scope");
        return Err(RelayError::Forbidden.with_request_id(request_id));
    }
    let payload = read_json_object(request.into_body(), relay.config.max_body_bytes)
        .await
        .map_err(|e| e.with_request_id(&request_id))?;
    let issued = relay
        .sessions
        .issue(&caller, &payload)
        .map_err(|e| RelayError::from(e).with_request_id(&request_id))?;
    relay.metrics.sessions_issued.increment(1);
    respond_with(issued, &request_id)
}

async fn revoke_session(
    State(relay): State<Arc<RelayState>>,
    Extension(caller): Extension<AuthorizationContext>,
    Extension(RequestId(request_id)): Extension<RequestId>,
    request: Request,
) -> Result<Json<Value>, ApiError> {
    if !caller.has_scope(Scope::Admin) {
        warn!(request_id = %request_id, subject = %caller.subject, "Session revocation requires admin scope");
        return Err(RelayError::Forbidden.with_request_id(request_id));
    }
    let payload = read_json_object(request.into_body(), relay.config.max_body_bytes)
        .await
        .map_err(|e| e.with_request_id(&request_id))?;
    let revoked = relay
        .sessions
        .revoke(&payload)
        .map_err(|e| RelayError::from(e).with_request_id(&request_id))?;
    relay.metrics.sessions_revoked.increment(1);
    respond_with(revoked, &request_id)
}

fn respond_with<T: serde::Serialize>(value: T, request_id: &str) -> Result<Json<Value>, ApiError> {
    let mut body = serde_json::to_value(value).map_err(|e| {
        RelayError::Internal(format!("failed to encode response: {e}")).with_request_id(request_id)
    })?;
    attach_request_id(&mut body, request_id);
    Ok(Json(body))
}

/// Read a size-capped body that must be a JSON object; blank means `{}`.
pub(crate) async fn read_json_object(body: Body, limit: usize) -> Result<Map<String, Value>, RelayError> {
    let raw = axum::body::to_bytes(body, limit)
        .await
        .map_err(|_| RelayError::BadRequest("request body too large".to_string()))?;
    if raw.iter().all(u8::is_ascii_whitespace) {
        return Ok(Map::new());
    }
    serde_json::from_slice(&raw)
        .map_err(|_| RelayError::BadRequest("request body must be valid JSON object".to_string()))
}

async fn forward(
    State(relay): State<Arc<RelayState>>,
    Extension(caller): Extension<AuthorizationContext>,
    Extension(RequestId(request_id)): Extension<RequestId>,
    request: Request,
) -> Result<Response, ApiError> {
    let fail = |e: RelayError| e.with_request_id(&request_id);
    let method = request.method().clone();
    let path = request.uri().path().to_string();
    let query = request.uri().query().map(str::to_string);

    let Some(kind) = classify(&path) else {
        return Err(fail(RelayError::NotFound));
    };
    if !caller.can_access(&relay.policy, &method, &path) {
        warn!(
            request_id = %request_id,
            subject = %caller.subject,
            method = %method,
            path = %path,
            required = %relay.policy.required_scope(&method, &path),
            "Forbidden by token scope"
        );
        return Err(fail(RelayError::Forbidden));
    }

    if kind == ForwardKind::Raw {
        if method != Method::GET {
            return Err(fail(RelayError::MethodNotAllowed));
        }
        let raw = relay
            .upstream
            .raw_request(&path, query.as_deref(), &request_id)
            .await
            .map_err(|e| {
                relay.metrics.upstream_errors.increment(1);
                fail(e.into())
            })?;
        if raw.status.is_server_error() {
            relay.metrics.upstream_errors.increment(1);
        }
        let mut response = Response::new(Body::from_stream(raw.response.bytes_stream()));
        *response.status_mut() = raw.status;
        if let Ok(content_type) = HeaderValue::from_str(&raw.content_type) {
            response.headers_mut().insert(CONTENT_TYPE, content_type);
        }
        return Ok(response);
    }

    if method != Method::GET && method != Method::POST {
        return Err(fail(RelayError::MethodNotAllowed));
    }
    let idempotency_key = header_str(request.headers(), IDEMPOTENCY_KEY_HEADER)
        .map(str::trim)
        .filter(|k| !k.is_empty())
        .map(str::to_string);
    let body = if method == Method::POST {
        let object = read_json_object(request.into_body(), relay.config.max_body_bytes)
            .await
            .map_err(fail)?;
        Some(Value::Object(object))
    } else {
        None
    };

    let result = relay
        .upstream
        .json_request(UpstreamRequest {
            method,
            path: &path,
            query: query.as_deref(),
            body: body.as_ref(),
            request_id: &request_id,
            idempotency_key: idempotency_key.as_deref(),
        })
        .await
        .map_err(|e| {
            relay.metrics.upstream_errors.increment(1);
            warn!(request_id = %request_id, path = %path, error = %e, "Core request failed");
            fail(e.into())
        })?;
    if result.status.is_server_error() {
        relay.metrics.upstream_errors.increment(1);
    }

    // The core may report a replay without echoing the key; the client's own key stands in.
    let key = result.idempotency_key.or(idempotency_key);
    let mut response = (result.status, Json(result.payload)).into_response();
    if key.is_some() || result.replayed {
        let headers = response.headers_mut();
        if let Some(key) = key.and_then(|k| HeaderValue::from_str(&k).ok()) {
            headers.insert(IDEMPOTENCY_KEY_HEADER, key);
        }
        headers.insert(
            IDEMPOTENCY_REPLAYED_HEADER,
            HeaderValue::from_static(if result.replayed { "true" } else { "false" }),
        );
    }
    Ok(response)
}
