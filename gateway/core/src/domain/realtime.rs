// Copyright (c) 2026 Relay Gateway Contributors
// SPDX-License-Identifier: AGPL-3.0
//! # Realtime Wire Types
//!
//! Client messages accepted on the realtime socket, the upstream routes behind
//! the typed terminal and browser messages, the line-oriented Server-Sent-Events
//! parser used by the audit pump, and the bounds applied to long-poll parameters.

use axum::http::Method;
use serde::Deserialize;
use serde_json::{Map, Value};

use crate::domain::route_policy::{is_resource_id, BROWSER_ACTIONS};

pub const DEFAULT_POLL_TIMEOUT_SECS: f64 = 20.0;
pub const DEFAULT_POLL_INTERVAL_SECS: f64 = 0.25;
pub const POLL_TIMEOUT_RANGE: (f64, f64) = (1.0, 120.0);
pub const POLL_INTERVAL_RANGE: (f64, f64) = (0.05, 5.0);

/// Only this SSE event name is relayed to clients.
pub const AUDIT_EVENT: &str = "audit";

pub const DEFAULT_TERMINAL_OUTPUT_LIMIT: i64 = 600;
pub const TERMINAL_OUTPUT_LIMIT_RANGE: (i64, i64) = (1, 5000);

/// Message sent by a realtime client.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ClientMessage {
    #[serde(rename = "type")]
    pub kind: String,
    pub id: Option<Value>,
    pub method: Option<String>,
    pub path: Option<String>,
    pub query: Option<String>,
    pub body: Option<Map<String, Value>>,
    pub idempotency_key: Option<String>,
    pub since_id: Option<i64>,
    pub session_id: Option<String>,
    pub since_seq: Option<i64>,
    pub limit: Option<i64>,
    pub input: Option<String>,
}

impl ClientMessage {
    /// Keystrokes for `terminal_input`: the `input` field, or `body.input`
    /// when the field is blank. Only an empty result is missing.
    pub fn terminal_input(&self) -> Option<String> {
        let direct = self.input.clone().unwrap_or_default();
        let input = if direct.trim().is_empty() {
            match self.body.as_ref().and_then(|b| b.get("input")) {
                Some(Value::String(s)) => s.clone(),
                Some(Value::Null) | None => direct,
                Some(other) => other.to_string(),
            }
        } else {
            direct
        };
        (!input.is_empty()).then_some(input)
    }

    /// `since_seq` and `limit` for `terminal_poll`, defaulted and clamped.
    pub fn terminal_window(&self) -> (i64, i64) {
        let since_seq = self.since_seq.unwrap_or(0).max(0);
        let limit = self
            .limit
            .unwrap_or(DEFAULT_TERMINAL_OUTPUT_LIMIT)
            .clamp(TERMINAL_OUTPUT_LIMIT_RANGE.0, TERMINAL_OUTPUT_LIMIT_RANGE.1);
        (since_seq, limit)
    }
}

/// Validate a terminal session id for use as a path segment.
pub fn terminal_session_id(raw: Option<&str>) -> Result<String, &'static str> {
    let id = raw.map(str::trim).unwrap_or_default();
    if id.is_empty() {
        return Err("'session_id' is required");
    }
    if !is_resource_id(id) {
        return Err("invalid 'session_id'");
    }
    Ok(id.to_string())
}

/// Upstream call behind a typed `browser_*` message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrowserRoute {
    pub method: Method,
    pub path: String,
    /// `type` of the reply envelope.
    pub reply: String,
}

/// Resolve `browser_{action}`. Reads keep the message type as the reply type,
/// `browser_close` answers `browser_closed`, the rest answer `{type}_result`.
pub fn browser_route(kind: &str) -> Option<BrowserRoute> {
    let action = kind.strip_prefix("browser_")?;
    if !BROWSER_ACTIONS.contains(&action) {
        return None;
    }
    let path = format!("/browser/{action}");
    let (method, reply) = match action {
        "status" | "pages" => (Method::GET, kind.to_string()),
        "close" => (Method::POST, "browser_closed".to_string()),
        _ => (Method::POST, format!("{kind}_result")),
    };
    Some(BrowserRoute { method, path, reply })
}

/// Long-poll cadence for one connection's audit pump.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PollSettings {
    pub timeout_secs: f64,
    pub interval_secs: f64,
}

impl PollSettings {
    /// Build from optional raw query values; unparsable values use defaults,
    /// everything is clamped into range.
    pub fn from_query(timeout: Option<&str>, interval: Option<&str>) -> Self {
        let timeout = parse_f64_or(timeout, DEFAULT_POLL_TIMEOUT_SECS);
        let interval = parse_f64_or(interval, DEFAULT_POLL_INTERVAL_SECS);
        Self {
            timeout_secs: timeout.clamp(POLL_TIMEOUT_RANGE.0, POLL_TIMEOUT_RANGE.1),
            interval_secs: interval.clamp(POLL_INTERVAL_RANGE.0, POLL_INTERVAL_RANGE.1),
        }
    }
}

impl Default for PollSettings {
    fn default() -> Self {
        Self {
            timeout_secs: DEFAULT_POLL_TIMEOUT_SECS,
            interval_secs: DEFAULT_POLL_INTERVAL_SECS,
        }
    }
}

fn parse_f64_or(value: Option<&str>, fallback: f64) -> f64 {
    value
        .and_then(|v| v.trim().parse::<f64>().ok())
        .filter(|v| v.is_finite())
        .unwrap_or(fallback)
}

/// One parsed SSE frame.
#[derive(Debug, Clone, PartialEq)]
pub struct SseEvent {
    pub event: String,
    pub data: Map<String, Value>,
}

impl SseEvent {
    /// Numeric `data.id`, accepting numbers or numeric strings.
    pub fn id(&self) -> Option<i64> {
        match self.data.get("id")? {
            Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }
}

/// Parse a buffered SSE body. Every `data:` line yields one event named by the
/// most recent `event:` line (default `message`); the name resets afterwards.
pub fn parse_sse(raw: &str) -> Vec<SseEvent> {
    let mut current = "message".to_string();
    let mut events = Vec::new();
    for line in raw.split('\n') {
        let line = line.trim_end_matches('\r');
        if let Some(name) = line.strip_prefix("event:") {
            let name = name.trim();
            current = if name.is_empty() { "message" } else { name }.to_string();
        } else if let Some(data) = line.strip_prefix("data:") {
            events.push(SseEvent {
                event: std::mem::replace(&mut current, "message".to_string()),
                data: parse_sse_data(data.trim()),
            });
        }
    }
    events
}

fn parse_sse_data(raw: &str) -> Map<String, Value> {
    match serde_json::from_str::<Value>(raw) {
        Ok(Value::Object(obj)) => obj,
        Ok(other) => Map::from_iter([("value".to_string(), other)]),
        Err(_) => Map::from_iter([("raw".to_string(), Value::String(raw.to_string()))]),
    }
}

/// Normalize a command path: absolute URLs are refused, a leading `/` is added.
pub fn normalize_command_path(path: &str) -> Option<String> {
    let value = path.trim();
    if value.is_empty() || value.contains("://") {
        return None;
    }
    if value.starts_with('/') {
        Some(value.to_string())
    } else {
        Some(format!("/{value}"))
    }
}
