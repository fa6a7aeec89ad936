// Copyright (c) 2026 Relay Gateway Contributors
// SPDX-License-Identifier: AGPL-3.0
//! # Route Policy
//!
//! The fixed allow-list of upstream paths the relay forwards, and the scope
//! each `(method, path)` pair requires. The same table backs REST forwarding
//! and realtime `command` messages so both transports authorize identically.
//!
//! ```text
//! GET  <any forwardable path>                  -> read
//! POST /run | /run_async | /check              -> run
//! POST /plans                                  -> plan
//! POST /plans/{id}/approve[_async]             -> approve
//! POST /plans/{id}/retry_failed[_async]        -> approve
//! POST /plans/{id}/reject                      -> reject
//! POST /undo | /plans/{id}/undo                -> undo
//! POST /jobs/{id}/cancel                       -> cancel
//! POST /terminal/sessions                      -> run
//! POST /terminal/sessions/{id}/input|close     -> run
//! POST /browser/{action}                       -> run
//! anything else                                -> UnscopedRoutePolicy
//! ```

use axum::http::Method;
use serde::{Deserialize, Serialize};

use crate::domain::scope::Scope;

/// What a mutating route without an explicit rule requires.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UnscopedRoutePolicy {
    /// Only `admin` may call it.
    #[default]
    Deny,
    /// Any caller holding `run` may call it.
    Run,
}

impl std::str::FromStr for UnscopedRoutePolicy {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "deny" => Ok(Self::Deny),
            "run" => Ok(Self::Run),
            other => Err(format!("unknown unscoped route policy: {other}")),
        }
    }
}

/// How a forwardable path is relayed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForwardKind {
    /// JSON request/response, decoded and annotated with the request id.
    Json,
    /// HTML or event-stream, forwarded byte-for-byte.
    Raw,
}

const EXACT_JSON_PATHS: &[&str] = &[
    "/health",
    "/models",
    "/openapi.json",
    "/dashboard/data",
    "/history",
    "/run",
    "/run_async",
    "/undo",
    "/check",
    "/jobs",
    "/plans",
    "/events",
    "/terminal/sessions",
];

/// Remote browser operations under `/browser/`.
pub const BROWSER_ACTIONS: &[&str] = &[
    "status",
    "pages",
    "action",
    "navigate",
    "click",
    "fill",
    "extract_text",
    "screenshot",
    "wait_for_selector",
    "evaluate_js",
    "close",
];

const TERMINAL_SESSIONS: &str = "/terminal/sessions";
const TERMINAL_ACTIONS: &[&str] = &["output", "input", "close"];

const PLAN_ACTIONS: &[&str] = &[
    "approve",
    "approve_async",
    "reject",
    "undo",
    "retry_failed",
    "retry_failed_async",
];

/// Path the realtime upgrade lives on; never forwardable through a command.
pub const REALTIME_PATH: &str = "/ws";

/// Classify `path` against the allow-list. `None` means "not forwardable".
pub fn classify(path: &str) -> Option<ForwardKind> {
    if EXACT_JSON_PATHS.contains(&path) {
        return Some(ForwardKind::Json);
    }
    if path == "/dashboard" || path == "/events/stream" {
        return Some(ForwardKind::Raw);
    }
    if let Some(action) = path.strip_prefix("/browser/") {
        return BROWSER_ACTIONS.contains(&action).then_some(ForwardKind::Json);
    }
    if let Some(rest) = path.strip_prefix(TERMINAL_SESSIONS) {
        let (id, action) = rest.strip_prefix('/')?.split_once('/')?;
        return (is_resource_id(id) && TERMINAL_ACTIONS.contains(&action)).then_some(ForwardKind::Json);
    }

    let mut segments = path.strip_prefix('/')?.split('/');
    let collection = segments.next()?;
    let id = segments.next()?;
    let action = segments.next();
    if segments.next().is_some() || !is_resource_id(id) {
        return None;
    }

    match (collection, action) {
        ("jobs" | "plans", None) => Some(ForwardKind::Json),
        ("jobs" | "plans", Some("stream")) => Some(ForwardKind::Raw),
        ("jobs", Some("cancel")) => Some(ForwardKind::Json),
        ("plans", Some(action)) if PLAN_ACTIONS.contains(&action) => Some(ForwardKind::Json),
        _ => None,
    }
}

/// A usable `{id}` segment: non-empty and not a dot segment in any spelling.
pub fn is_resource_id(id: &str) -> bool {
    if id.trim().is_empty() || id.contains('?') || id.contains('/') {
        return false;
    }
    let decoded = id.to_ascii_lowercase().replace("%2e", ".");
    decoded != "." && decoded != ".."
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RoutePolicy {
    unscoped: UnscopedRoutePolicy,
}

impl RoutePolicy {
    pub fn new(unscoped: UnscopedRoutePolicy) -> Self {
        Self { unscoped }
    }

    /// Scope required for `method path`.
    pub fn required_scope(&self, method: &Method, path: &str) -> Scope {
        if method == Method::GET || method == Method::HEAD {
            return Scope::Read;
        }
        if method == Method::POST {
            if let Some(scope) = explicit_post_scope(path) {
                return scope;
            }
        }
        match self.unscoped {
            UnscopedRoutePolicy::Deny => Scope::Admin,
            UnscopedRoutePolicy::Run => Scope::Run,
        }
    }
}

fn explicit_post_scope(path: &str) -> Option<Scope> {
    match path {
        "/run" | "/run_async" | "/check" => return Some(Scope::Run),
        "/plans" => return Some(Scope::Plan),
        "/undo" => return Some(Scope::Undo),
        TERMINAL_SESSIONS => return Some(Scope::Run),
        _ => {}
    }
    if path.starts_with("/browser/") {
        return Some(Scope::Run);
    }
    if let Some(rest) = path.strip_prefix("/terminal/sessions/") {
        return (rest.ends_with("/input") || rest.ends_with("/close")).then_some(Scope::Run);
    }

    let rest = path.strip_prefix('/')?;
    let (collection, rest) = rest.split_once('/')?;
    let (_id, action) = rest.split_once('/')?;
    match (collection, action) {
        ("plans", "approve" | "approve_async" | "retry_failed" | "retry_failed_async") => {
            Some(Scope::Approve)
        }
        ("plans", "reject") => Some(Scope::Reject),
        ("plans", "undo") => Some(Scope::Undo),
        ("jobs", "cancel") => Some(Scope::Cancel),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_allow_list() {
        assert_eq!(classify("/models"), Some(ForwardKind::Json));
        assert_eq!(classify("/dashboard"), Some(ForwardKind::Raw));
        assert_eq!(classify("/events/stream"), Some(ForwardKind::Raw));
        assert_eq!(classify("/jobs/j1"), Some(ForwardKind::Json));
        assert_eq!(classify("/jobs/j1/cancel"), Some(ForwardKind::Json));
        assert_eq!(classify("/jobs/j1/stream"), Some(ForwardKind::Raw));
        assert_eq!(classify("/plans/p1/approve_async"), Some(ForwardKind::Json));
        assert_eq!(classify("/plans/p1/stream"), Some(ForwardKind::Raw));
        assert_eq!(classify("/terminal/sessions"), Some(ForwardKind::Json));
        assert_eq!(classify("/terminal/sessions/t1/output"), Some(ForwardKind::Json));
        assert_eq!(classify("/terminal/sessions/t1/input"), Some(ForwardKind::Json));
        assert_eq!(classify("/browser/navigate"), Some(ForwardKind::Json));
        assert_eq!(classify("/browser/status"), Some(ForwardKind::Json));
    }

    #[test]
    fn test_classify_rejects_unknown_and_traversal() {
        assert_eq!(classify("/admin"), None);
        assert_eq!(classify("/jobs/"), None);
        assert_eq!(classify("/jobs/j1/delete"), None);
        assert_eq!(classify("/plans/p1/approve/extra"), None);
        assert_eq!(classify("/jobs/.."), None);
        assert_eq!(classify("/plans/%2E%2e/approve"), None);
        assert_eq!(classify("/ws"), None);
        assert_eq!(classify("/terminal/sessions/t1"), None);
        assert_eq!(classify("/terminal/sessions/../input"), None);
        assert_eq!(classify("/terminal/sessions/t1/resize"), None);
        assert_eq!(classify("/terminal/sessionsx"), None);
        assert_eq!(classify("/browser/download"), None);
        assert_eq!(classify("/browser/navigate/extra"), None);
    }

    #[test]
    fn test_required_scope_table() {
        let policy = RoutePolicy::default();
        assert_eq!(policy.required_scope(&Method::GET, "/jobs/j1/cancel"), Scope::Read);
        assert_eq!(policy.required_scope(&Method::POST, "/run_async"), Scope::Run);
        assert_eq!(policy.required_scope(&Method::POST, "/plans"), Scope::Plan);
        assert_eq!(policy.required_scope(&Method::POST, "/plans/p1/approve"), Scope::Approve);
        assert_eq!(policy.required_scope(&Method::POST, "/plans/p1/retry_failed_async"), Scope::Approve);
        assert_eq!(policy.required_scope(&Method::POST, "/plans/p1/reject"), Scope::Reject);
        assert_eq!(policy.required_scope(&Method::POST, "/plans/p1/undo"), Scope::Undo);
        assert_eq!(policy.required_scope(&Method::POST, "/undo"), Scope::Undo);
        assert_eq!(policy.required_scope(&Method::POST, "/jobs/j1/cancel"), Scope::Cancel);
        assert_eq!(policy.required_scope(&Method::GET, "/terminal/sessions/t1/output"), Scope::Read);
        assert_eq!(policy.required_scope(&Method::POST, "/terminal/sessions"), Scope::Run);
        assert_eq!(policy.required_scope(&Method::POST, "/terminal/sessions/t1/input"), Scope::Run);
        assert_eq!(policy.required_scope(&Method::POST, "/terminal/sessions/t1/close"), Scope::Run);
        assert_eq!(policy.required_scope(&Method::POST, "/browser/evaluate_js"), Scope::Run);
    }

    #[test]
    fn test_unscoped_mutation_follows_policy() {
        let strict = RoutePolicy::new(UnscopedRoutePolicy::Deny);
        let legacy = RoutePolicy::new(UnscopedRoutePolicy::Run);
        assert_eq!(strict.required_scope(&Method::POST, "/jobs/j1"), Scope::Admin);
        assert_eq!(legacy.required_scope(&Method::POST, "/jobs/j1"), Scope::Run);
        assert_eq!(strict.required_scope(&Method::DELETE, "/jobs/j1"), Scope::Admin);
    }
}
