// Copyright (c) 2026 Relay Gateway Contributors
// SPDX-License-Identifier: AGPL-3.0
//! Infrastructure layer: files, the upstream HTTP client, shared limiter state
//! and the metrics registry.

pub mod client_identity;
pub mod connection_governor;
pub mod cors;
pub mod metrics;
pub mod rate_limiter;
pub mod revocation_store;
pub mod upstream;
