// Copyright (c) 2026 Relay Gateway Contributors
// SPDX-License-Identifier: AGPL-3.0
//! Domain layer: pure types and rules, no I/O.

pub mod auth_context;
pub mod config;
pub mod realtime;
pub mod route_policy;
pub mod scope;
pub mod session;
