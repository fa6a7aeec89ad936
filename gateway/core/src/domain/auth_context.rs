// Copyright (c) 2026 Relay Gateway Contributors
// SPDX-License-Identifier: AGPL-3.0
//! Per-request authorization context produced by the auth gate.
//!
//! Constructed once per HTTP request or realtime connection and owned by it.
//! An unauthorized context never carries scopes.

use axum::http::Method;

use crate::domain::route_policy::RoutePolicy;
use crate::domain::scope::{Scope, ScopeSet};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenKind {
    /// No credentials configured at all; every caller gets every scope.
    Open,
    /// Static shared secret.
    Static,
    /// Signed session token.
    Session,
}

impl TokenKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TokenKind::Open => "open",
            TokenKind::Static => "static",
            TokenKind::Session => "session",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthorizationContext {
    pub token_kind: TokenKind,
    pub subject: String,
    pub session_id: Option<String>,
    pub device_id: Option<String>,
    scopes: ScopeSet,
    pub expires_at: Option<i64>,
}

impl AuthorizationContext {
    pub fn open() -> Self {
        Self {
            token_kind: TokenKind::Open,
            subject: "open-access".to_string(),
            session_id: None,
            device_id: None,
            scopes: ScopeSet::all(),
            expires_at: None,
        }
    }

    pub fn static_token(device_id: Option<String>) -> Self {
        Self {
            token_kind: TokenKind::Static,
            subject: "relay-static-token".to_string(),
            session_id: None,
            device_id,
            scopes: ScopeSet::all(),
            expires_at: None,
        }
    }

    pub fn session(
        subject: String,
        session_id: String,
        device_id: Option<String>,
        scopes: ScopeSet,
        expires_at: i64,
    ) -> Self {
        Self {
            token_kind: TokenKind::Session,
            subject,
            session_id: Some(session_id),
            device_id,
            scopes,
            expires_at: Some(expires_at),
        }
    }

    pub fn scopes(&self) -> &ScopeSet {
        &self.scopes
    }

    pub fn has_scope(&self, scope: Scope) -> bool {
        self.scopes.allows(scope)
    }

    /// Whether this caller may invoke `method path` under `policy`.
    pub fn can_access(&self, policy: &RoutePolicy, method: &Method, path: &str) -> bool {
        self.has_scope(policy.required_scope(method, path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_session_cannot_reach_mutating_routes() {
        let policy = RoutePolicy::default();
        let ctx = AuthorizationContext::session(
            "watch".into(),
            "sid".into(),
            None,
            [Scope::Read].into_iter().collect(),
            i64::MAX,
        );
        assert!(ctx.can_access(&policy, &Method::GET, "/jobs"));
        assert!(!ctx.can_access(&policy, &Method::POST, "/run"));
        assert!(!ctx.can_access(&policy, &Method::POST, "/plans/p1/approve"));
    }

    #[test]
    fn test_static_and_open_contexts_hold_admin() {
        assert!(AuthorizationContext::open().has_scope(Scope::Admin));
        assert!(AuthorizationContext::static_token(None).has_scope(Scope::Admin));
    }
}
