// Copyright (c) 2026 Relay Gateway Contributors
// SPDX-License-Identifier: AGPL-3.0
//! Relay counters on a private Prometheus recorder.
//!
//! The recorder is owned by the relay instead of being installed globally, so
//! several relays (and tests) in one process keep separate counts.

use metrics::{Counter, Gauge, Key, KeyName, Level, Metadata, Recorder, SharedString};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

pub struct RelayMetrics {
    handle: PrometheusHandle,
    pub requests: Counter,
    pub unauthorized: Counter,
    pub rate_limited: Counter,
    pub sessions_issued: Counter,
    pub sessions_revoked: Counter,
    pub ws_rejected: Counter,
    pub ws_active: Gauge,
    pub upstream_errors: Counter,
}

impl std::fmt::Debug for RelayMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayMetrics").finish_non_exhaustive()
    }
}

static METADATA: Metadata<'static> = Metadata::new(module_path!(), Level::INFO, Some(module_path!()));

impl RelayMetrics {
    pub fn new() -> Self {
        let recorder = PrometheusBuilder::new().build_recorder();
        let counter = |name: &'static str, help: &'static str| {
            recorder.describe_counter(KeyName::from_const_str(name), None, SharedString::const_str(help));
            recorder.register_counter(&Key::from_static_name(name), &METADATA)
        };

        let requests = counter("relay_requests_total", "Requests received by the relay");
        let unauthorized = counter("relay_unauthorized_total", "Requests rejected for missing or invalid credentials");
        let rate_limited = counter("relay_rate_limited_total", "Requests rejected by the per-client rate limiter");
        let sessions_issued = counter("relay_session_issued_total", "Session tokens issued");
        let sessions_revoked = counter("relay_session_revoked_total", "Session tokens revoked");
        let ws_rejected = counter("relay_ws_rejected_total", "Realtime upgrades refused at the connection limit");
        let upstream_errors = counter("relay_upstream_errors_total", "Failed calls to the core API");

        recorder.describe_gauge(
            KeyName::from_const_str("relay_ws_active_connections"),
            None,
            SharedString::const_str("Open realtime connections"),
        );
        let ws_active = recorder.register_gauge(&Key::from_static_name("relay_ws_active_connections"), &METADATA);
        ws_active.set(0.0);

        Self {
            handle: recorder.handle(),
            requests,
            unauthorized,
            rate_limited,
            sessions_issued,
            sessions_revoked,
            ws_rejected,
            ws_active,
            upstream_errors,
        }
    }

    /// Prometheus text exposition.
    pub fn render(&self) -> String {
        self.handle.render()
    }
}

impl Default for RelayMetrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_includes_every_series() {
        let metrics = RelayMetrics::new();
        metrics.requests.increment(3);
        metrics.ws_active.set(2.0);
        let text = metrics.render();
        assert!(text.contains("relay_requests_total 3"));
        assert!(text.contains("relay_ws_active_connections 2"));
        assert!(text.contains("relay_unauthorized_total 0"));
    }

    #[test]
    fn test_recorders_are_independent() {
        let a = RelayMetrics::new();
        let b = RelayMetrics::new();
        a.sessions_issued.increment(1);
        assert!(a.render().contains("relay_session_issued_total 1"));
        assert!(b.render().contains("relay_session_issued_total 0"));
    }
}
