// Copyright (c) 2026 Relay Gateway Contributors
// SPDX-License-Identifier: AGPL-3.0
//! Resolve who a request came from, honouring proxy headers only when the
//! physical peer sits inside a trusted network.

use axum::http::HeaderMap;
use ipnet::IpNet;
use std::net::{IpAddr, SocketAddr};

pub const FORWARDED_FOR: &str = "x-forwarded-for";
pub const FORWARDED_PROTO: &str = "x-forwarded-proto";

#[derive(Debug, Clone, Default)]
pub struct TrustedProxies {
    networks: Vec<IpNet>,
}

impl TrustedProxies {
    pub fn new(networks: Vec<IpNet>) -> Self {
        Self { networks }
    }

    pub fn contains(&self, ip: IpAddr) -> bool {
        self.networks.iter().any(|net| net.contains(&ip))
    }

    fn trusts(&self, peer: Option<SocketAddr>) -> bool {
        peer.is_some_and(|addr| self.contains(addr.ip()))
    }

    /// Key used for rate limiting: the first forwarded hop when the peer is a
    /// trusted proxy, otherwise the peer address.
    pub fn client_key(&self, headers: &HeaderMap, peer: Option<SocketAddr>) -> String {
        if self.trusts(peer) {
            let forwarded = header_str(headers, FORWARDED_FOR)
                .and_then(|v| v.split(',').next())
                .map(str::trim)
                .filter(|v| !v.is_empty());
            if let Some(first) = forwarded {
                return first.to_string();
            }
        }
        match peer {
            Some(addr) => addr.ip().to_string(),
            None => "unknown".to_string(),
        }
    }

    /// `http` or `https` as seen by the client.
    pub fn request_scheme(&self, headers: &HeaderMap, peer: Option<SocketAddr>) -> &'static str {
        if self.trusts(peer) {
            let proto = header_str(headers, FORWARDED_PROTO)
                .and_then(|v| v.split(',').next())
                .map(|v| v.trim().to_ascii_lowercase());
            if proto.as_deref() == Some("https") {
                return "https";
            }
        }
        "http"
    }
}

pub(crate) fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn proxies() -> TrustedProxies {
        TrustedProxies::new(vec!["10.0.0.0/8".parse().unwrap()])
    }

    fn forwarded(value: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(FORWARDED_FOR, HeaderValue::from_str(value).unwrap());
        headers.insert(FORWARDED_PROTO, HeaderValue::from_static("https"));
        headers
    }

    #[test]
    fn test_forwarded_for_honoured_from_trusted_peer() {
        let peer: SocketAddr = "10.1.2.3:5555".parse().unwrap();
        let headers = forwarded("203.0.113.9, 10.1.2.3");
        assert_eq!(proxies().client_key(&headers, Some(peer)), "203.0.113.9");
        assert_eq!(proxies().request_scheme(&headers, Some(peer)), "https");
    }

    #[test]
    fn test_forwarded_for_ignored_from_untrusted_peer() {
        let peer: SocketAddr = "198.51.100.7:5555".parse().unwrap();
        let headers = forwarded("203.0.113.9");
        assert_eq!(proxies().client_key(&headers, Some(peer)), "198.51.100.7");
        assert_eq!(proxies().request_scheme(&headers, Some(peer)), "http");
    }

    #[test]
    fn test_missing_peer_is_unknown() {
        assert_eq!(proxies().client_key(&forwarded("1.1.1.1"), None), "unknown");
    }
}
