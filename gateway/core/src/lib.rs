// Copyright (c) 2026 Relay Gateway Contributors
// SPDX-License-Identifier: AGPL-3.0
//! Relay gateway core
//!
//! Secure realtime relay that fronts an internal orchestration API for
//! untrusted remote clients.
//!
//! # Architecture
//!
//! - **domain:** scopes, authorization context, token claims, route policy, config
//! - **application:** token service, auth gate, session administration, realtime relay
//! - **infrastructure:** revocation store, rate limiting, upstream client, metrics
//! - **presentation:** axum HTTP and WebSocket surface

pub mod domain;
pub mod application;
pub mod infrastructure;
pub mod presentation;

pub use domain::config::{ConfigError, RelayConfig};
pub use presentation::http::Relay;
