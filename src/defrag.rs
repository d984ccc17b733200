//! Bounded reassembly cache for fragmented packets.
//!
//! In-flight partial packets are keyed by packet ID. The head arrives as a
//! normal packet with the FRAGMENTED flag and does not know the fragment
//! count; the first non-head fragment to arrive fixes `total_fragments`,
//! after which it cannot change. Entries are bounded globally and per path,
//! and expire by age. Every error variant collapses to a silent drop at the
//! call site.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::buf::{PacketVector, Slice};
use crate::config::DefragConfig;
use crate::path::{Path, PathKey};
use crate::protocol::MAX_PACKET_FRAGMENTS;

/// Outcome of feeding one fragment to the defragmenter.
pub enum AssembleResult {
    /// All fragments present: the ordered vector, head first.
    Complete(PacketVector),
    /// Fragment accepted; more are needed.
    Queued,
    ErrDuplicateFragment,
    ErrInvalidFragment,
    ErrTooManyFragmentsForPath,
    ErrOutOfMemory,
}

struct FragmentedMessage {
    /// Zero until a non-head fragment reports the total.
    total_fragments: u8,
    have: u8,
    slices: [Option<Slice>; MAX_PACKET_FRAGMENTS],
    created: i64,
    path_key: PathKey,
    /// Keeps the binding path alive while the entry exists.
    _path: Arc<Path>,
}

impl FragmentedMessage {
    fn complete(&self) -> bool {
        self.total_fragments != 0
            && self.have == self.total_fragments
            && self.slices[0].is_some()
    }
}

#[derive(Default)]
struct DefragState {
    messages: HashMap<u64, FragmentedMessage>,
    per_path: HashMap<PathKey, usize>,
}

impl DefragState {
    fn remove(&mut self, packet_id: u64) -> Option<FragmentedMessage> {
        let msg = self.messages.remove(&packet_id)?;
        if let Some(count) = self.per_path.get_mut(&msg.path_key) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                self.per_path.remove(&msg.path_key);
            }
        }
        Some(msg)
    }
}

/// Bounded associative store of in-flight partial packets.
pub struct Defragmenter {
    state: Mutex<DefragState>,
    config: DefragConfig,
}

impl Defragmenter {
    pub fn new(config: DefragConfig) -> Self {
        Self {
            state: Mutex::new(DefragState::default()),
            config,
        }
    }

    /// Feed one fragment. The head is fed with `fragment_no = 0` and
    /// `total_fragments = 0` (unknown); indicator fragments carry their real
    /// numbers.
    pub fn assemble(
        &self,
        packet_id: u64,
        slice: Slice,
        fragment_no: u8,
        total_fragments: u8,
        ticks: i64,
        path: &Arc<Path>,
    ) -> AssembleResult {
        let head = fragment_no == 0 && total_fragments == 0;
        if !head {
            let total = total_fragments as usize;
            if total < 2
                || total > MAX_PACKET_FRAGMENTS
                || fragment_no == 0
                || fragment_no >= total_fragments
            {
                return AssembleResult::ErrInvalidFragment;
            }
        }

        let mut state = self.state.lock();

        if !state.messages.contains_key(&packet_id) {
            // Expire stale entries before admitting a new one.
            if state.messages.len() >= self.config.max_in_flight {
                let expired: Vec<u64> = state
                    .messages
                    .iter()
                    .filter(|(_, m)| ticks - m.created > self.config.timeout_ms)
                    .map(|(id, _)| *id)
                    .collect();
                for id in expired {
                    state.remove(id);
                }
                if state.messages.len() >= self.config.max_in_flight {
                    return AssembleResult::ErrOutOfMemory;
                }
            }

            let key = path.key();
            let in_flight = state.per_path.get(&key).copied().unwrap_or(0);
            if in_flight >= self.config.max_per_path {
                return AssembleResult::ErrTooManyFragmentsForPath;
            }
            *state.per_path.entry(key).or_insert(0) += 1;
            state.messages.insert(
                packet_id,
                FragmentedMessage {
                    total_fragments: 0,
                    have: 0,
                    slices: Default::default(),
                    created: ticks,
                    path_key: key,
                    _path: path.clone(),
                },
            );
        }

        let msg = state
            .messages
            .get_mut(&packet_id)
            .expect("entry inserted above");

        if !head {
            if msg.total_fragments == 0 {
                msg.total_fragments = total_fragments;
            } else if msg.total_fragments != total_fragments {
                // Conflicting totals poison the whole entry.
                state.remove(packet_id);
                return AssembleResult::ErrInvalidFragment;
            }
        }

        let slot = fragment_no as usize;
        if msg.slices[slot].is_some() {
            return AssembleResult::ErrDuplicateFragment;
        }
        msg.slices[slot] = Some(slice);
        msg.have += 1;

        if msg.complete() {
            let msg = state.remove(packet_id).expect("entry present");
            let mut pktv = PacketVector::new();
            for slot in msg.slices.into_iter().take(msg.total_fragments as usize) {
                match slot {
                    Some(s) => pktv.push(s),
                    // A fragment numbered past a smaller late-arriving total;
                    // cannot happen because totals are fixed at first sight.
                    None => return AssembleResult::ErrInvalidFragment,
                }
            }
            return AssembleResult::Complete(pktv);
        }
        AssembleResult::Queued
    }

    /// Drop entries older than the reassembly deadline.
    pub fn gc(&self, ticks: i64) {
        let mut state = self.state.lock();
        let expired: Vec<u64> = state
            .messages
            .iter()
            .filter(|(_, m)| ticks - m.created > self.config.timeout_ms)
            .map(|(id, _)| *id)
            .collect();
        for id in expired {
            state.remove(id);
        }
    }

    #[cfg(test)]
    fn in_flight(&self) -> usize {
        self.state.lock().messages.len()
    }
}
