//! Registry of outstanding request packet IDs.
//!
//! When this node sends a request that solicits an OK or ERROR, the packet
//! ID is registered here. A reply is only processed if its in-re packet ID
//! is present and fresh; checking consumes the entry, so a reply can be
//! accepted at most once.

use std::collections::HashMap;

use parking_lot::Mutex;

/// How long a sent request stays answerable, in ticks.
pub const EXPECT_TTL: i64 = 10_000;

/// Purge stale entries once the table grows past this.
const PURGE_THRESHOLD: usize = 256;

/// Short-lived registry of solicited request packet IDs.
#[derive(Default)]
pub struct Expect {
    outstanding: Mutex<HashMap<u64, i64>>,
}

impl Expect {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that a request with this packet ID was just sent.
    pub fn sending(&self, packet_id: u64, now: i64) {
        let mut outstanding = self.outstanding.lock();
        if outstanding.len() >= PURGE_THRESHOLD {
            outstanding.retain(|_, sent| now - *sent <= EXPECT_TTL);
        }
        outstanding.insert(packet_id, now);
    }

    /// True if a reply to this packet ID is expected and fresh. Consumes the
    /// entry either way once found.
    pub fn expecting(&self, packet_id: u64, now: i64) -> bool {
        match self.outstanding.lock().remove(&packet_id) {
            Some(sent) => now - sent <= EXPECT_TTL,
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expecting_consumes_the_entry() {
        let e = Expect::new();
        e.sending(7, 1000);
        assert!(e.expecting(7, 1500));
        assert!(!e.expecting(7, 1500));
    }

    #[test]
    fn stale_entries_are_not_expected() {
        let e = Expect::new();
        e.sending(7, 1000);
        assert!(!e.expecting(7, 1000 + EXPECT_TTL + 1));
    }

    #[test]
    fn unknown_ids_are_not_expected() {
        let e = Expect::new();
        assert!(!e.expecting(99, 0));
    }
}
