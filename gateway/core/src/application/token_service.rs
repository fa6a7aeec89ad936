// Copyright (c) 2026 Relay Gateway Contributors
// SPDX-License-Identifier: AGPL-3.0
//! # Session Token Service
//!
//! Issues and verifies self-contained, HMAC-signed session tokens.
//!
//! ```text
//! na1.<base64url(claims json)>.<base64url(HMAC-SHA256(<encoded claims>, key))>
//! ```
//!
//! Verification is stateless; revocation is checked separately by the caller
//! against the [`RevocationStore`](crate::infrastructure::revocation_store::RevocationStore).

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;
use thiserror::Error;
use uuid::Uuid;

use crate::domain::scope::{normalize_scopes, Scope, ScopeError};
use crate::domain::session::{clamp_ttl, SessionTokenClaims};

type HmacSha256 = Hmac<Sha256>;

const TOKEN_PREFIX: &str = "na1";

#[derive(Debug, Error)]
pub enum TokenError {
    #[error("session signing key is not configured")]
    NotConfigured,

    #[error("invalid token format")]
    Malformed,

    #[error("invalid token signature")]
    BadSignature,

    #[error("invalid token payload")]
    InvalidPayload,

    #[error("token expired")]
    Expired,

    #[error(transparent)]
    Scope(#[from] ScopeError),
}

#[derive(Clone)]
pub struct TokenService {
    key: Option<Vec<u8>>,
    default_ttl: i64,
}

impl std::fmt::Debug for TokenService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenService")
            .field("configured", &self.key.is_some())
            .field("default_ttl", &self.default_ttl)
            .finish()
    }
}

impl TokenService {
    /// `key` is the dedicated signing key or, failing that, the static token.
    pub fn new(key: Option<&str>, default_ttl: i64) -> Self {
        Self {
            key: key.filter(|k| !k.is_empty()).map(|k| k.as_bytes().to_vec()),
            default_ttl,
        }
    }

    pub fn is_configured(&self) -> bool {
        self.key.is_some()
    }

    pub fn issue<S: AsRef<str>>(
        &self,
        subject: &str,
        scopes: &[S],
        device_id: Option<&str>,
        ttl_seconds: Option<i64>,
    ) -> Result<(String, SessionTokenClaims), TokenError> {
        self.issue_at(subject, scopes, device_id, ttl_seconds, now_unix())
    }

    pub fn issue_at<S: AsRef<str>>(
        &self,
        subject: &str,
        scopes: &[S],
        device_id: Option<&str>,
        ttl_seconds: Option<i64>,
        now: i64,
    ) -> Result<(String, SessionTokenClaims), TokenError> {
        let key = self.key.as_deref().ok_or(TokenError::NotConfigured)?;
        let scopes = normalize_scopes(scopes)?;
        let ttl = clamp_ttl(ttl_seconds, self.default_ttl);

        let claims = SessionTokenClaims {
            sub: subject.trim().to_string(),
            scopes,
            device_id: device_id
                .map(str::trim)
                .filter(|d| !d.is_empty())
                .map(str::to_string),
            jti: Uuid::new_v4().simple().to_string(),
            exp: now + ttl,
            iat: now,
        };

        let payload = serde_json::to_vec(&claims).map_err(|_| TokenError::InvalidPayload)?;
        let body = URL_SAFE_NO_PAD.encode(payload);
        let signature = URL_SAFE_NO_PAD.encode(sign(key, body.as_bytes()));
        Ok((format!("{TOKEN_PREFIX}.{body}.{signature}"), claims))
    }

    pub fn verify(&self, token: &str) -> Result<SessionTokenClaims, TokenError> {
        self.verify_at(token, now_unix())
    }

    pub fn verify_at(&self, token: &str, now: i64) -> Result<SessionTokenClaims, TokenError> {
        let key = self.key.as_deref().ok_or(TokenError::NotConfigured)?;

        let mut parts = token.trim().split('.');
        let (Some(prefix), Some(body), Some(signature), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(TokenError::Malformed);
        };
        if prefix != TOKEN_PREFIX || body.is_empty() || signature.is_empty() {
            return Err(TokenError::Malformed);
        }

        let expected = URL_SAFE_NO_PAD.encode(sign(key, body.as_bytes()));
        if !bool::from(expected.as_bytes().ct_eq(signature.as_bytes())) {
            return Err(TokenError::BadSignature);
        }

        let raw = URL_SAFE_NO_PAD
            .decode(body)
            .map_err(|_| TokenError::InvalidPayload)?;
        // Scopes are decoded as strings so an unknown scope surfaces as a scope
        // error rather than a generic payload error.
        let wire: WireClaims =
            serde_json::from_slice(&raw).map_err(|_| TokenError::InvalidPayload)?;
        if wire.exp <= now {
            return Err(TokenError::Expired);
        }
        let scopes: Vec<Scope> = normalize_scopes(&wire.scopes)?;

        Ok(SessionTokenClaims {
            sub: wire.sub,
            scopes,
            device_id: wire.device_id.filter(|d| !d.is_empty()),
            jti: wire.jti,
            exp: wire.exp,
            iat: wire.iat,
        })
    }
}

#[derive(serde::Deserialize)]
struct WireClaims {
    #[serde(default)]
    sub: String,
    #[serde(default)]
    scopes: Vec<String>,
    #[serde(default)]
    device_id: Option<String>,
    #[serde(default)]
    jti: String,
    exp: i64,
    #[serde(default)]
    iat: i64,
}

fn sign(key: &[u8], body: &[u8]) -> Vec<u8> {
    let mut mac = match HmacSha256::new_from_slice(key) {
        Ok(mac) => mac,
        Err(_) => unreachable!("hmac accepts keys of any length"),
    };
    mac.update(body);
    mac.finalize().into_bytes().to_vec()
}

pub(crate) fn now_unix() -> i64 {
    chrono::Utc::now().timestamp()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service() -> TokenService {
        TokenService::new(Some("signing-key"), 900)
    }

    #[test]
    fn test_issue_then_verify_returns_normalized_claims() {
        let svc = service();
        let (token, issued) = svc
            .issue_at("phone", &["Run", "read", "run"], Some("dev-1"), Some(120), 1_000)
            .unwrap();
        assert!(token.starts_with("na1."));
        assert_eq!(token.split('.').count(), 3);
        assert_eq!(issued.exp, 1_120);

        let verified = svc.verify_at(&token, 1_100).unwrap();
        assert_eq!(verified, issued);
        assert_eq!(verified.scopes, vec![Scope::Run, Scope::Read]);
        assert_eq!(verified.device_id.as_deref(), Some("dev-1"));
    }

    #[test]
    fn test_expired_token_rejected_even_with_valid_signature() {
        let svc = service();
        let (token, _) = svc.issue_at("x", &["read"], None, Some(60), 1_000).unwrap();
        assert!(matches!(svc.verify_at(&token, 1_060), Err(TokenError::Expired)));
    }

    #[test]
    fn test_tampered_payload_fails_signature_check() {
        let svc = service();
        let (token, _) = svc.issue_at("x", &["read"], None, None, 1_000).unwrap();
        let parts: Vec<&str> = token.split('.').collect();
        let forged_claims = URL_SAFE_NO_PAD
            .encode(br#"{"sub":"x","scopes":["admin"],"jti":"j","exp":99999999999,"iat":1}"#);
        let forged = format!("{}.{}.{}", parts[0], forged_claims, parts[2]);
        assert!(matches!(svc.verify_at(&forged, 1_001), Err(TokenError::BadSignature)));
    }

    #[test]
    fn test_token_from_other_key_rejected() {
        let other = TokenService::new(Some("different"), 900);
        let (token, _) = other.issue_at("x", &["read"], None, None, 1_000).unwrap();
        assert!(matches!(service().verify_at(&token, 1_001), Err(TokenError::BadSignature)));
    }

    #[test]
    fn test_malformed_tokens() {
        let svc = service();
        for token in ["", "na1.abc", "na2.a.b", "na1.a.b.c", "na1..sig"] {
            assert!(matches!(svc.verify_at(token, 0), Err(TokenError::Malformed)), "{token}");
        }
    }

    #[test]
    fn test_unknown_scope_rejected_at_issue() {
        let err = service()
            .issue_at("x", &["read", "superuser"], None, None, 0)
            .unwrap_err();
        assert!(err.to_string().contains("unknown scope"));
    }

    #[test]
    fn test_unconfigured_service_refuses_to_issue() {
        let svc = TokenService::new(None, 900);
        assert!(!svc.is_configured());
        assert!(matches!(
            svc.issue_at("x", &["read"], None, None, 0),
            Err(TokenError::NotConfigured)
        ));
    }
}
