// Copyright (c) 2026 Relay Gateway Contributors
// SPDX-License-Identifier: AGPL-3.0

// Auth Gate
//
// Resolves a request's credentials into an AuthorizationContext:
//
//   no static token and no signing key  -> open mode, every scope
//   bearer == static token (ct compare) -> static, every scope
//   valid, unrevoked session token      -> session, the token's scopes
//   anything else                       -> AuthFailure
//
// Device binding applies to static and session credentials alike. The
// realtime upgrade path may also carry `token` and `device_id` as query
// parameters because browsers cannot set headers on the handshake.

use axum::http::header::AUTHORIZATION;
use axum::http::{HeaderMap, StatusCode};
use std::collections::HashSet;
use std::sync::Arc;
use subtle::ConstantTimeEq;
use thiserror::Error;

use crate::application::token_service::{now_unix, TokenError, TokenService};
use crate::domain::auth_context::AuthorizationContext;
use crate::domain::route_policy::REALTIME_PATH;
use crate::infrastructure::client_identity::header_str;
use crate::infrastructure::revocation_store::RevocationStore;

pub const DEVICE_ID_HEADER: &str = "x-device-id";

#[derive(Debug, Error)]
pub enum AuthFailure {
    #[error("missing bearer credential")]
    MissingCredential,

    #[error("invalid session token: {0}")]
    InvalidToken(#[from] TokenError),

    #[error("session token has been revoked")]
    Revoked,

    #[error("device id does not match the token")]
    DeviceMismatch,

    #[error("device id is not in the allowed list")]
    DeviceNotAllowed,
}

impl AuthFailure {
    /// Credential problems are 401; a good credential from the wrong device is 403.
    pub fn status_code(&self) -> StatusCode {
        match self {
            AuthFailure::DeviceMismatch | AuthFailure::DeviceNotAllowed => StatusCode::FORBIDDEN,
            _ => StatusCode::UNAUTHORIZED,
        }
    }
}

/// Credential material pulled from one request.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub token: Option<String>,
    pub device_id: Option<String>,
}

impl Credentials {
    /// Read the bearer token and device id. Query fallbacks apply to the
    /// realtime path only.
    pub fn extract(headers: &HeaderMap, path: &str, query: Option<&str>) -> Self {
        let realtime = path == REALTIME_PATH;

        let token = header_str(headers, AUTHORIZATION.as_str())
            .map(str::trim)
            .and_then(|value| {
                let (scheme, rest) = value.split_once(' ')?;
                scheme.eq_ignore_ascii_case("bearer").then(|| rest.trim())
            })
            .filter(|t| !t.is_empty())
            .map(str::to_string)
            .or_else(|| realtime.then(|| query_param(query, "token")).flatten());

        let device_id = header_str(headers, DEVICE_ID_HEADER)
            .map(str::trim)
            .filter(|d| !d.is_empty())
            .map(str::to_string)
            .or_else(|| realtime.then(|| query_param(query, "device_id")).flatten());

        Self { token, device_id }
    }
}

/// First non-blank value of `name` in a raw query string.
pub fn query_param(query: Option<&str>, name: &str) -> Option<String> {
    url::form_urlencoded::parse(query?.as_bytes())
        .find(|(key, _)| key == name)
        .map(|(_, value)| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

#[derive(Debug, Clone)]
pub struct AuthGate {
    static_token: Option<String>,
    tokens: TokenService,
    revocations: Arc<RevocationStore>,
    allowed_devices: HashSet<String>,
}

impl AuthGate {
    pub fn new(
        static_token: Option<String>,
        tokens: TokenService,
        revocations: Arc<RevocationStore>,
        allowed_devices: impl IntoIterator<Item = String>,
    ) -> Self {
        Self {
            static_token: static_token.filter(|t| !t.is_empty()),
            tokens,
            revocations,
            allowed_devices: allowed_devices.into_iter().collect(),
        }
    }

    pub fn is_open(&self) -> bool {
        self.static_token.is_none() && !self.tokens.is_configured()
    }

    pub fn allowed_devices(&self) -> &HashSet<String> {
        &self.allowed_devices
    }

    pub fn authenticate(&self, credentials: &Credentials) -> Result<AuthorizationContext, AuthFailure> {
        self.authenticate_at(credentials, now_unix())
    }

    pub fn authenticate_at(
        &self,
        credentials: &Credentials,
        now: i64,
    ) -> Result<AuthorizationContext, AuthFailure> {
        if self.is_open() {
            return Ok(AuthorizationContext::open());
        }
        let token = credentials
            .token
            .as_deref()
            .ok_or(AuthFailure::MissingCredential)?;

        if let Some(expected) = &self.static_token {
            if bool::from(token.as_bytes().ct_eq(expected.as_bytes())) {
                let device_id = self.resolve_device(credentials.device_id.as_deref(), None)?;
                return Ok(AuthorizationContext::static_token(device_id));
            }
        }

        let claims = self.tokens.verify_at(token, now)?;
        if self.revocations.is_revoked(&claims.jti, now) {
            return Err(AuthFailure::Revoked);
        }
        let device_id =
            self.resolve_device(credentials.device_id.as_deref(), claims.device_id.as_deref())?;
        let subject = if claims.sub.trim().is_empty() {
            "session".to_string()
        } else {
            claims.sub.trim().to_string()
        };

        Ok(AuthorizationContext::session(
            subject,
            claims.jti,
            device_id,
            claims.scopes.into_iter().collect(),
            claims.exp,
        ))
    }

    /// The request's device id wins; the token's fills in when absent. Both
    /// present must match exactly, and an allow-list requires a listed id.
    fn resolve_device(
        &self,
        requested: Option<&str>,
        bound: Option<&str>,
    ) -> Result<Option<String>, AuthFailure> {
        let bound = bound.map(str::trim).filter(|d| !d.is_empty());
        let resolved = requested.map(str::trim).filter(|d| !d.is_empty()).or(bound);

        if let (Some(bound), Some(resolved)) = (bound, resolved) {
            if bound != resolved {
                return Err(AuthFailure::DeviceMismatch);
            }
        }
        if self.allowed_devices.is_empty() {
            return Ok(resolved.map(str::to_string));
        }
        match resolved {
            Some(id) if self.allowed_devices.contains(id) => Ok(Some(id.to_string())),
            _ => Err(AuthFailure::DeviceNotAllowed),
        }
    }
}
