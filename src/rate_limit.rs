//! Interval-based boolean rate gates.

use std::sync::atomic::{AtomicI64, Ordering};

/// Thread-safe boolean rate limiter: `gate` returns true at most once per
/// `interval` of the caller's tick clock.
pub struct RateGate {
    interval: i64,
    last: AtomicI64,
}

impl RateGate {
    pub fn new(interval: i64) -> Self {
        Self {
            interval,
            // Far enough in the past that the first gate always opens.
            last: AtomicI64::new(i64::MIN / 2),
        }
    }

    pub fn gate(&self, now: i64) -> bool {
        let prev = self.last.load(Ordering::Acquire);
        if now - prev < self.interval {
            false
        } else {
            self.last.store(now, Ordering::Release);
            true
        }
    }
}
