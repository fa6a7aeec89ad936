// Copyright (c) 2026 Relay Gateway Contributors
// SPDX-License-Identifier: AGPL-3.0
//! Session issuance and revocation behind `/auth/session` and
//! `/auth/session/revoke`. Callers must already hold `admin`.

use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::HashSet;
use std::sync::Arc;
use thiserror::Error;
use tracing::info;

use crate::application::token_service::{now_unix, TokenError, TokenService};
use crate::domain::auth_context::AuthorizationContext;
use crate::domain::scope::Scope;
use crate::domain::session::MAX_SESSION_TTL_SECS;
use crate::infrastructure::revocation_store::{RevocationStore, RevocationStoreError};

#[derive(Debug, Error)]
pub enum SessionAdminError {
    #[error("{0}")]
    Invalid(String),

    #[error(transparent)]
    Token(#[from] TokenError),

    #[error(transparent)]
    Store(#[from] RevocationStoreError),
}

#[derive(Debug, Clone, Serialize)]
pub struct IssuedSession {
    pub token: String,
    pub token_type: &'static str,
    pub subject: String,
    pub session_id: String,
    pub scopes: Vec<Scope>,
    pub device_id: Option<String>,
    pub expires_at: i64,
    pub issued_at: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct RevokedSession {
    pub revoked: bool,
    pub already_revoked: bool,
    pub session_id: String,
    pub subject: String,
    pub expires_at: i64,
    pub via: &'static str,
}

#[derive(Debug, Clone)]
pub struct SessionAdmin {
    tokens: TokenService,
    revocations: Arc<RevocationStore>,
    allowed_devices: HashSet<String>,
}

impl SessionAdmin {
    pub fn new(
        tokens: TokenService,
        revocations: Arc<RevocationStore>,
        allowed_devices: HashSet<String>,
    ) -> Self {
        Self {
            tokens,
            revocations,
            allowed_devices,
        }
    }

    /// Issue a session token. Subject and device default to the caller's;
    /// scopes default to every non-admin scope.
    pub fn issue(
        &self,
        caller: &AuthorizationContext,
        payload: &Map<String, Value>,
    ) -> Result<IssuedSession, SessionAdminError> {
        let subject = string_field(payload, "subject").unwrap_or_else(|| caller.subject.clone());
        let device_id = string_field(payload, "device_id").or_else(|| caller.device_id.clone());

        if !self.allowed_devices.is_empty() {
            match device_id.as_deref() {
                None => {
                    return Err(SessionAdminError::Invalid(
                        "'device_id' is required when device allowlist is enabled".into(),
                    ))
                }
                Some(id) if !self.allowed_devices.contains(id) => {
                    return Err(SessionAdminError::Invalid(
                        "device_id is not in allowed list".into(),
                    ))
                }
                Some(_) => {}
            }
        }

        let ttl = int_field(payload, "ttl_seconds").filter(|ttl| *ttl > 0);
        let mut scopes = scopes_field(payload.get("scopes"));
        if scopes.is_empty() {
            scopes = Scope::OPERATIONAL.iter().map(|s| s.as_str().to_string()).collect();
        }

        let (token, claims) = self.tokens.issue(&subject, &scopes, device_id.as_deref(), ttl)?;
        info!(
            subject = %claims.sub,
            session_id = %claims.jti,
            device_id = claims.device_id.as_deref().unwrap_or(""),
            expires_at = claims.exp,
            "Issued session token"
        );
        Ok(IssuedSession {
            token,
            token_type: "session",
            subject: claims.sub,
            session_id: claims.jti,
            scopes: claims.scopes,
            device_id: claims.device_id,
            expires_at: claims.exp,
            issued_at: claims.iat,
        })
    }

    /// Revoke by `token` or by `session_id` (+ optional `expires_at`).
    pub fn revoke(&self, payload: &Map<String, Value>) -> Result<RevokedSession, SessionAdminError> {
        self.revoke_at(payload, now_unix())
    }

    pub fn revoke_at(
        &self,
        payload: &Map<String, Value>,
        now: i64,
    ) -> Result<RevokedSession, SessionAdminError> {
        let (session_id, subject, mut expires_at, via) = match string_field(payload, "token") {
            Some(token) => {
                let claims = self
                    .tokens
                    .verify_at(&token, now)
                    .map_err(|_| SessionAdminError::Invalid("invalid session token".into()))?;
                if claims.jti.trim().is_empty() {
                    return Err(SessionAdminError::Invalid("session token is not revocable".into()));
                }
                (claims.jti, claims.sub, claims.exp, "token")
            }
            None => {
                let session_id = string_field(payload, "session_id").ok_or_else(|| {
                    SessionAdminError::Invalid("'token' or 'session_id' is required".into())
                })?;
                let expires_at = int_field(payload, "expires_at").unwrap_or(0);
                (session_id, String::new(), expires_at, "session_id")
            }
        };
        if expires_at <= now {
            expires_at = now + MAX_SESSION_TTL_SECS;
        }

        let already_revoked = self.revocations.revoke(&session_id, expires_at, now)?;
        info!(session_id = %session_id, via, already_revoked, "Revoked session");
        Ok(RevokedSession {
            revoked: true,
            already_revoked,
            session_id,
            subject,
            expires_at,
            via,
        })
    }
}

fn string_field(payload: &Map<String, Value>, key: &str) -> Option<String> {
    let text = match payload.get(key)? {
        Value::String(s) => s.trim().to_string(),
        Value::Null => return None,
        other => other.to_string(),
    };
    (!text.is_empty()).then_some(text)
}

fn int_field(payload: &Map<String, Value>, key: &str) -> Option<i64> {
    match payload.get(key)? {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Accepts a JSON array or a comma-separated string.
fn scopes_field(value: Option<&Value>) -> Vec<String> {
    let items: Vec<String> = match value {
        Some(Value::Array(items)) => items
            .iter()
            .map(|item| match item {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            })
            .collect(),
        Some(Value::String(csv)) => csv.split(',').map(str::to_string).collect(),
        _ => Vec::new(),
    };
    items
        .into_iter()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}
