// Copyright (c) 2026 Relay Gateway Contributors
// SPDX-License-Identifier: AGPL-3.0
//! # Realtime Relay
//!
//! One [`RealtimeSession`] per accepted socket. [`RealtimeSession::serve`] runs
//! two activities until either side stops:
//!
//! - the **command loop** reads client frames one at a time and answers each;
//! - the **audit pump** long-polls the core's `/events/stream` from the
//!   session's resume cursor and pushes every `audit` frame.
//!
//! They share only the cursor (an atomic) and the outbound sink, whose
//! implementations serialize writes. A write failure on either side cancels
//! the other, and `serve` returns only after the pump task has been joined.

use async_trait::async_trait;
use axum::http::Method;
use futures::{Stream, StreamExt};
use metrics::Counter;
use serde_json::{json, Map, Value};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::domain::auth_context::AuthorizationContext;
use crate::domain::realtime::{
    browser_route, normalize_command_path, terminal_session_id, ClientMessage, PollSettings,
    SseEvent, AUDIT_EVENT,
};
use crate::domain::route_policy::{classify, ForwardKind, RoutePolicy, REALTIME_PATH};
use crate::infrastructure::upstream::{UpstreamClient, UpstreamRequest};

pub const SERVICE_NAME: &str = "relay-gateway";

const PUMP_ERROR_BACKOFF: Duration = Duration::from_millis(500);
const PUMP_IDLE_DELAY: Duration = Duration::from_millis(100);

#[derive(Debug, Error)]
#[error("realtime connection closed")]
pub struct SinkClosed;

/// Outbound half of a realtime connection. Implementations must not
/// interleave concurrent sends.
#[async_trait]
pub trait OutboundSink: Send + Sync {
    async fn send(&self, message: Value) -> Result<(), SinkClosed>;
}

pub struct RealtimeSession {
    context: AuthorizationContext,
    policy: RoutePolicy,
    upstream: Arc<UpstreamClient>,
    upstream_errors: Counter,
    request_id: String,
    cursor: AtomicI64,
    poll: PollSettings,
}

impl RealtimeSession {
    pub fn new(
        context: AuthorizationContext,
        policy: RoutePolicy,
        upstream: Arc<UpstreamClient>,
        upstream_errors: Counter,
        request_id: String,
        since_id: i64,
        poll: PollSettings,
    ) -> Self {
        Self {
            context,
            policy,
            upstream,
            upstream_errors,
            request_id,
            cursor: AtomicI64::new(since_id.max(0)),
            poll,
        }
    }

    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    /// Current resume cursor.
    pub fn since_id(&self) -> i64 {
        self.cursor.load(Ordering::Acquire)
    }

    pub fn hello(&self) -> Value {
        json!({
            "type": "hello",
            "request_id": self.request_id,
            "service": SERVICE_NAME,
        })
    }

    /// Drive the connection until the client goes away or a write fails.
    pub async fn serve<S>(self: Arc<Self>, sink: Arc<dyn OutboundSink>, mut incoming: S)
    where
        S: Stream<Item = String> + Send + Unpin,
    {
        if sink.send(self.hello()).await.is_err() {
            return;
        }
        debug!(request_id = %self.request_id, subject = %self.context.subject, "Realtime connection opened");

        let cancel = CancellationToken::new();
        let pump = tokio::spawn({
            let session = Arc::clone(&self);
            let sink = Arc::clone(&sink);
            let cancel = cancel.clone();
            async move {
                session.run_audit_pump(sink.as_ref(), &cancel).await;
                cancel.cancel();
            }
        });

        loop {
            let frame = tokio::select! {
                _ = cancel.cancelled() => break,
                frame = incoming.next() => frame,
            };
            let Some(text) = frame else { break };
            let reply = self.handle_message(&text).await;
            if sink.send(reply).await.is_err() {
                break;
            }
        }

        cancel.cancel();
        if let Err(e) = pump.await {
            warn!(request_id = %self.request_id, error = %e, "Audit pump task failed");
        }
        debug!(request_id = %self.request_id, "Realtime connection closed");
    }

    /// Long-poll the core and push `audit` events until cancelled or the sink closes.
    pub async fn run_audit_pump(&self, sink: &dyn OutboundSink, cancel: &CancellationToken) {
        while !cancel.is_cancelled() {
            let since = self.since_id();
            let polled = tokio::select! {
                _ = cancel.cancelled() => return,
                polled = self.upstream.poll_events(since, self.poll, &self.request_id) => polled,
            };

            let frames = match polled {
                Ok(frames) => frames,
                Err(e) => {
                    self.upstream_errors.increment(1);
                    warn!(request_id = %self.request_id, error = %e, "Audit stream poll failed");
                    let envelope = json!({
                        "type": "error",
                        "source": "events",
                        "error": e.to_string(),
                        "request_id": self.request_id,
                    });
                    if sink.send(envelope).await.is_err() || !pause(cancel, PUMP_ERROR_BACKOFF).await {
                        return;
                    }
                    continue;
                }
            };

            let events: Vec<SseEvent> = frames.into_iter().filter(|e| e.event == AUDIT_EVENT).collect();
            if let Some(next) = events.iter().filter_map(SseEvent::id).max().filter(|n| *n > since) {
                // A concurrent `set_since_id` wins over the pump's advance.
                let _ = self
                    .cursor
                    .compare_exchange(since, next, Ordering::AcqRel, Ordering::Acquire);
            }

            for event in &events {
                let envelope = json!({
                    "type": "event",
                    "event": event.event,
                    "data": event.data,
                    "request_id": self.request_id,
                });
                if sink.send(envelope).await.is_err() {
                    return;
                }
            }
            if events.is_empty() && !pause(cancel, PUMP_IDLE_DELAY).await {
                return;
            }
        }
    }

    /// Answer one client frame. Every frame gets exactly one reply.
    pub async fn handle_message(&self, raw: &str) -> Value {
        match serde_json::from_str::<ClientMessage>(raw) {
            Ok(msg) => self.dispatch(msg).await,
            Err(e) => self.error(None, format!("invalid message: {e}")),
        }
    }

    async fn dispatch(&self, msg: ClientMessage) -> Value {
        let id = msg.id.clone();
        match msg.kind.trim().to_ascii_lowercase().as_str() {
            "ping" => json!({"type": "pong", "id": id, "request_id": self.request_id}),
            "set_since_id" => match msg.since_id {
                Some(since) => {
                    let next = since.max(0);
                    self.cursor.store(next, Ordering::Release);
                    json!({"type": "ack", "id": id, "since_id": next, "request_id": self.request_id})
                }
                None => self.error(id, "'since_id' is required"),
            },
            "command" => self.command(msg).await,
            "terminal_list" => {
                let call = CoreCall::get("/terminal/sessions");
                self.relay(id, "terminal_sessions", call, None).await
            }
            "terminal_start" => {
                let call = CoreCall::post("/terminal/sessions", msg.body.unwrap_or_default())
                    .idempotent(msg.idempotency_key.as_deref());
                self.relay(id, "terminal_started", call, None).await
            }
            "terminal_poll" => self.terminal_poll(msg).await,
            "terminal_input" => self.terminal_input(msg).await,
            "terminal_close" => self.terminal_close(msg).await,
            kind => match browser_route(kind) {
                Some(route) => {
                    let call = CoreCall {
                        method: route.method.clone(),
                        path: &route.path,
                        query: None,
                        body: (route.method == Method::POST).then(|| msg.body.unwrap_or_default()),
                        idempotency_key: msg.idempotency_key.as_deref(),
                    };
                    let extra = ("path", Value::String(route.path.clone()));
                    self.relay(id, &route.reply, call, Some(extra)).await
                }
                None => {
                    let kind = msg.kind;
                    self.error(id, format!("unsupported message type: {kind}"))
                }
            },
        }
    }

    async fn command(&self, msg: ClientMessage) -> Value {
        let id = msg.id.clone();
        let method = match msg.method.as_deref().map(str::trim).filter(|m| !m.is_empty()) {
            Some(m) if m.eq_ignore_ascii_case("GET") => Method::GET,
            Some(m) if m.eq_ignore_ascii_case("POST") => Method::POST,
            Some(_) => return self.error(id, "method must be GET or POST"),
            None if msg.body.is_some() => Method::POST,
            None => Method::GET,
        };

        let Some(full_path) = msg.path.as_deref().and_then(normalize_command_path) else {
            return self.not_forwardable(id, "");
        };
        let mut query = msg.query.as_deref().map(str::trim).filter(|q| !q.is_empty()).map(str::to_string);
        let path = match full_path.split_once('?') {
            Some((path, inline)) => {
                if query.is_none() && !inline.is_empty() {
                    query = Some(inline.to_string());
                }
                path.to_string()
            }
            None => full_path,
        };

        let call = CoreCall {
            method,
            path: &path,
            query: query.as_deref(),
            body: msg.body,
            idempotency_key: msg.idempotency_key.as_deref(),
        };
        self.relay(id, "command_result", call, None).await
    }

    async fn terminal_poll(&self, msg: ClientMessage) -> Value {
        let id = msg.id.clone();
        let session = match terminal_session_id(msg.session_id.as_deref()) {
            Ok(session) => session,
            Err(e) => return self.error(id, e),
        };
        let (since_seq, limit) = msg.terminal_window();
        let path = format!("/terminal/sessions/{session}/output");
        let query = format!("since_seq={since_seq}&limit={limit}");
        let call = CoreCall {
            query: Some(&query),
            ..CoreCall::get(&path)
        };
        self.relay(id, "terminal_output", call, Some(("session_id", Value::String(session))))
            .await
    }

    async fn terminal_input(&self, msg: ClientMessage) -> Value {
        let id = msg.id.clone();
        let session = match terminal_session_id(msg.session_id.as_deref()) {
            Ok(session) => session,
            Err(e) => return self.error(id, e),
        };
        let Some(input) = msg.terminal_input() else {
            return self.error(id, "'input' is required");
        };
        let path = format!("/terminal/sessions/{session}/input");
        let body = Map::from_iter([("input".to_string(), Value::String(input))]);
        let call = CoreCall::post(&path, body).idempotent(msg.idempotency_key.as_deref());
        self.relay(id, "terminal_input_result", call, Some(("session_id", Value::String(session))))
            .await
    }

    async fn terminal_close(&self, msg: ClientMessage) -> Value {
        let id = msg.id.clone();
        let session = match terminal_session_id(msg.session_id.as_deref()) {
            Ok(session) => session,
            Err(e) => return self.error(id, e),
        };
        let path = format!("/terminal/sessions/{session}/close");
        let call = CoreCall::post(&path, msg.body.unwrap_or_default())
            .idempotent(msg.idempotency_key.as_deref());
        self.relay(id, "terminal_closed", call, Some(("session_id", Value::String(session))))
            .await
    }

    /// Authorize `call` against the caller's scopes, send it upstream and
    /// answer with a `reply_type` envelope, plus `extra` when given.
    async fn relay(
        &self,
        id: Option<Value>,
        reply_type: &str,
        call: CoreCall<'_>,
        extra: Option<(&'static str, Value)>,
    ) -> Value {
        let CoreCall {
            method,
            path,
            query,
            body,
            idempotency_key,
        } = call;
        if path == REALTIME_PATH || classify(path) != Some(ForwardKind::Json) {
            return self.not_forwardable(id, path);
        }
        if !self.context.can_access(&self.policy, &method, path) {
            warn!(
                request_id = %self.request_id,
                subject = %self.context.subject,
                method = %method,
                path,
                "Realtime command forbidden by token scope"
            );
            return json!({
                "type": "error",
                "id": id,
                "error": "forbidden by token scope",
                "path": path,
                "method": method.as_str(),
                "request_id": self.request_id,
            });
        }

        let command_request_id = Uuid::new_v4().to_string();
        let body = body.map(Value::Object);
        let result = self
            .upstream
            .json_request(UpstreamRequest {
                method,
                path,
                query,
                body: body.as_ref(),
                request_id: &command_request_id,
                idempotency_key,
            })
            .await;

        match result {
            Ok(result) => {
                let mut envelope = json!({
                    "type": reply_type,
                    "id": id,
                    "status": result.status.as_u16(),
                    "payload": result.payload,
                    "core_request": command_request_id,
                    "core_request_id": result.core_request_id,
                    "idempotency_key": result.idempotency_key.or(idempotency_key.map(str::to_string)),
                    "replayed": result.replayed,
                    "request_id": self.request_id,
                });
                if let (Some((field, value)), Some(obj)) = (extra, envelope.as_object_mut()) {
                    obj.insert(field.to_string(), value);
                }
                envelope
            }
            Err(e) => {
                self.upstream_errors.increment(1);
                self.error(id, e.to_string())
            }
        }
    }

    fn not_forwardable(&self, id: Option<Value>, path: &str) -> Value {
        json!({
            "type": "error",
            "id": id,
            "error": "path is not command-forwardable",
            "path": path,
            "request_id": self.request_id,
        })
    }

    fn error(&self, id: Option<Value>, message: impl Into<String>) -> Value {
        json!({
            "type": "error",
            "id": id,
            "error": message.into(),
            "request_id": self.request_id,
        })
    }
}

/// One JSON call the realtime relay makes on a client's behalf.
struct CoreCall<'a> {
    method: Method,
    path: &'a str,
    query: Option<&'a str>,
    body: Option<Map<String, Value>>,
    idempotency_key: Option<&'a str>,
}

impl<'a> CoreCall<'a> {
    fn get(path: &'a str) -> Self {
        Self {
            method: Method::GET,
            path,
            query: None,
            body: None,
            idempotency_key: None,
        }
    }

    fn post(path: &'a str, body: Map<String, Value>) -> Self {
        Self {
            method: Method::POST,
            path,
            query: None,
            body: Some(body),
            idempotency_key: None,
        }
    }

    fn idempotent(self, key: Option<&'a str>) -> Self {
        Self {
            idempotency_key: key,
            ..self
        }
    }
}

/// Sleep unless cancelled first; `false` means stop.
async fn pause(cancel: &CancellationToken, delay: Duration) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(delay) => true,
    }
}
