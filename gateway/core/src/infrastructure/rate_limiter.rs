// Copyright (c) 2026 Relay Gateway Contributors
// SPDX-License-Identifier: AGPL-3.0
//! Per-client token-bucket admission control.
//!
//! One `governor` direct limiter per resolved client key. Buckets idle longer
//! than [`CLIENT_IDLE_TTL`] are swept on every check.

use governor::clock::{Clock, DefaultClock};
use governor::{DefaultDirectRateLimiter, Quota, RateLimiter as Governor};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::num::NonZeroU32;
use std::time::{Duration, Instant};

use crate::domain::config::refill_period;

pub const CLIENT_IDLE_TTL: Duration = Duration::from_secs(15 * 60);

/// Outcome of a rate-limit check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Allowed,
    /// Seconds the client should wait before retrying (at least 1).
    Limited { retry_after_secs: u64 },
}

struct ClientLimiter {
    bucket: DefaultDirectRateLimiter,
    last_seen: Instant,
}

pub struct RateLimiter {
    quota: Option<Quota>,
    clients: Mutex<HashMap<String, ClientLimiter>>,
    clock: DefaultClock,
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("enabled", &self.quota.is_some())
            .field("clients", &self.clients.lock().len())
            .finish()
    }
}

impl RateLimiter {
    /// `rps <= 0` disables limiting entirely. Rates outside what
    /// [`refill_period`] accepts are refused by `RelayConfig::validate`.
    pub fn new(rps: f64, burst: u32) -> Self {
        let quota = refill_period(rps)
            .and_then(Quota::with_period)
            .map(|quota| quota.allow_burst(NonZeroU32::new(burst).unwrap_or(NonZeroU32::MIN)));
        Self {
            quota,
            clients: Mutex::new(HashMap::new()),
            clock: DefaultClock::default(),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.quota.is_some()
    }

    /// Number of tracked client buckets.
    pub fn client_count(&self) -> usize {
        self.clients.lock().len()
    }

    pub fn check(&self, client_key: &str) -> Admission {
        self.check_at(client_key, Instant::now())
    }

    fn check_at(&self, client_key: &str, now: Instant) -> Admission {
        let Some(quota) = self.quota else {
            return Admission::Allowed;
        };

        let mut clients = self.clients.lock();
        clients.retain(|_, client| now.saturating_duration_since(client.last_seen) <= CLIENT_IDLE_TTL);

        let client = clients
            .entry(client_key.to_string())
            .or_insert_with(|| ClientLimiter {
                bucket: Governor::direct(quota),
                last_seen: now,
            });
        client.last_seen = now;

        match client.bucket.check() {
            Ok(()) => Admission::Allowed,
            Err(not_until) => {
                let wait = not_until.wait_time_from(self.clock.now());
                Admission::Limited {
                    retry_after_secs: wait.as_secs_f64().ceil().max(1.0) as u64,
                }
            }
        }
    }
}
