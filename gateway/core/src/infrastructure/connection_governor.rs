// Copyright (c) 2026 Relay Gateway Contributors
// SPDX-License-Identifier: AGPL-3.0
//! Cap on concurrent realtime connections.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use metrics::Gauge;

#[derive(Debug)]
pub struct ConnectionGovernor {
    max: usize,
    active: Arc<AtomicUsize>,
    gauge: Gauge,
}

/// Slot held for the lifetime of one connection; released on drop.
#[derive(Debug)]
pub struct ConnectionPermit {
    active: Arc<AtomicUsize>,
    gauge: Gauge,
}

impl ConnectionGovernor {
    pub fn new(max: usize, gauge: Gauge) -> Self {
        Self {
            max,
            active: Arc::new(AtomicUsize::new(0)),
            gauge,
        }
    }

    pub fn max(&self) -> usize {
        self.max
    }

    pub fn active(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }

    /// Claim a slot, or `None` when the cap is reached.
    pub fn try_acquire(&self) -> Option<ConnectionPermit> {
        let mut current = self.active.load(Ordering::Acquire);
        loop {
            if current >= self.max {
                return None;
            }
            match self.active.compare_exchange_weak(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    self.gauge.set((current + 1) as f64);
                    return Some(ConnectionPermit {
                        active: Arc::clone(&self.active),
                        gauge: self.gauge.clone(),
                    });
                }
                Err(observed) => current = observed,
            }
        }
    }
}

impl Drop for ConnectionPermit {
    fn drop(&mut self) {
        let remaining = self.active.fetch_sub(1, Ordering::AcqRel).saturating_sub(1);
        self.gauge.set(remaining as f64);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cap_and_release() {
        let governor = ConnectionGovernor::new(2, Gauge::noop());
        let a = governor.try_acquire().unwrap();
        let _b = governor.try_acquire().unwrap();
        assert!(governor.try_acquire().is_none());
        assert_eq!(governor.active(), 2);

        drop(a);
        assert_eq!(governor.active(), 1);
        assert!(governor.try_acquire().is_some());
        // The temporary permit above was dropped immediately.
        assert_eq!(governor.active(), 1);
    }

    #[test]
    fn test_concurrent_acquire_never_exceeds_cap() {
        let governor = Arc::new(ConnectionGovernor::new(8, Gauge::noop()));
        let handles: Vec<_> = (0..32)
            .map(|_| {
                let governor = Arc::clone(&governor);
                std::thread::spawn(move || governor.try_acquire())
            })
            .collect();
        let permits: Vec<_> = handles
            .into_iter()
            .filter_map(|h| h.join().unwrap())
            .collect();
        assert_eq!(permits.len(), 8);
        assert_eq!(governor.active(), 8);
    }
}
