// Copyright (c) 2026 Relay Gateway Contributors
// SPDX-License-Identifier: AGPL-3.0
//! Application layer: services that combine domain rules with infrastructure.

pub mod auth_gate;
pub mod realtime;
pub mod session_admin;
pub mod token_service;
