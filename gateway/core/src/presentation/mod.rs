// Copyright (c) 2026 Relay Gateway Contributors
// SPDX-License-Identifier: AGPL-3.0

pub mod error;
pub mod http;
pub mod ws;
