// Copyright (c) 2026 Relay Gateway Contributors
// SPDX-License-Identifier: AGPL-3.0
//! Claims carried inside a signed session token.

use serde::{Deserialize, Serialize};

use crate::domain::scope::Scope;

/// Lower bound applied to requested session lifetimes, in seconds.
pub const MIN_SESSION_TTL_SECS: i64 = 60;
/// Upper bound applied to requested session lifetimes, in seconds.
pub const MAX_SESSION_TTL_SECS: i64 = 24 * 3600;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionTokenClaims {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub sub: String,

    /// Normalized, deduplicated, first-seen order.
    #[serde(default)]
    pub scopes: Vec<Scope>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,

    /// Session identifier, the handle used for revocation.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub jti: String,

    /// Unix seconds.
    pub exp: i64,

    /// Unix seconds.
    #[serde(default)]
    pub iat: i64,
}

impl SessionTokenClaims {
    pub fn is_expired_at(&self, now: i64) -> bool {
        self.exp <= now
    }
}

/// Clamp a requested ttl into `[60s, 24h]`; non-positive requests fall back
/// to the configured default, which is itself clamped.
pub fn clamp_ttl(requested: Option<i64>, default_ttl: i64) -> i64 {
    let ttl = match requested {
        Some(value) if value > 0 => value,
        _ => default_ttl,
    };
    ttl.clamp(MIN_SESSION_TTL_SECS, MAX_SESSION_TTL_SECS)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clamp_ttl_bounds() {
        assert_eq!(clamp_ttl(Some(5), 900), 60);
        assert_eq!(clamp_ttl(Some(10 * 24 * 3600), 900), 24 * 3600);
        assert_eq!(clamp_ttl(None, 900), 900);
        assert_eq!(clamp_ttl(Some(-1), 900), 900);
        assert_eq!(clamp_ttl(None, 0), 60);
    }

    #[test]
    fn test_claims_serialize_without_empty_fields() {
        let claims = SessionTokenClaims {
            sub: "phone".into(),
            scopes: vec![Scope::Read],
            device_id: None,
            jti: "abc".into(),
            exp: 20,
            iat: 10,
        };
        let json = serde_json::to_value(&claims).unwrap();
        assert_eq!(json["scopes"], serde_json::json!(["read"]));
        assert!(json.get("device_id").is_none());
    }
}
