//! WHOIS: identity lookup for unknown packet sources.
//!
//! A packet from an address we hold no key for cannot be authenticated, so
//! it is parked in a small per-address ring while a WHOIS request goes to
//! the current best root. Rings overwrite their oldest entry on overflow.
//! When the identity arrives in an OK(WHOIS), the parked packets are played
//! back through the normal receive path, where they now authenticate.

use std::sync::Arc;

use tracing::debug;

use crate::buf::{Buf, PacketVector};
use crate::context::CallContext;
use crate::identity::{Address, ADDRESS_LENGTH};
use crate::path::Path;
use crate::protocol::{self, Verb, MIN_PACKET_LENGTH, UDP_DEFAULT_MTU};

use super::Engine;

/// Parked packets and retry state for one unknown address.
pub(crate) struct WhoisQueueItem {
    /// Ring of (packet, size, arrival path); index `count % capacity`.
    packets: Vec<Option<(Arc<Buf>, usize, Arc<Path>)>>,
    count: u64,
    last_retry: i64,
    retries: u32,
}

impl Engine {
    /// Park a packet for an unknown source. Returns whether a lookup round
    /// is due now.
    pub(crate) fn enqueue_whois(
        &self,
        cc: &CallContext,
        source: Address,
        pkt: Arc<Buf>,
        size: usize,
        path: &Arc<Path>,
    ) -> bool {
        let capacity = self.config.whois.max_waiting_packets.max(1);
        let mut queue = self.whois_queue.lock();
        let item = queue.entry(source).or_insert_with(|| WhoisQueueItem {
            packets: vec![None; capacity],
            count: 0,
            last_retry: i64::MIN / 2,
            retries: 0,
        });
        let slot = (item.count % item.packets.len() as u64) as usize;
        item.packets[slot] = Some((pkt, size, path.clone()));
        item.count += 1;
        cc.ticks - item.last_retry >= self.config.whois.retry_delay_ms
    }

    /// Send WHOIS requests for every address whose retry timer has lapsed,
    /// batched into as few packets as fit the MTU, via the best root.
    pub fn send_pending_whois(&self, cc: &CallContext) {
        let root = match self.topology.root() {
            Some(r) => r,
            None => return,
        };
        let root_path = match root.path(cc) {
            Some(p) => p,
            None => return,
        };

        let to_send: Vec<Address> = {
            let mut queue = self.whois_queue.lock();
            queue
                .iter_mut()
                .filter(|(_, item)| cc.ticks - item.last_retry >= self.config.whois.retry_delay_ms)
                .map(|(address, item)| {
                    item.last_retry = cc.ticks;
                    item.retries += 1;
                    tracing::trace!(address = %address, retry = item.retries, "identity lookup due");
                    *address
                })
                .collect()
        };
        if to_send.is_empty() {
            return;
        }

        let per_packet = (UDP_DEFAULT_MTU - MIN_PACKET_LENGTH) / ADDRESS_LENGTH;
        for chunk in to_send.chunks(per_packet) {
            let mut buf = Buf::new();
            let packet_id = root
                .key()
                .next_message(self.ctx.identity.address(), root.address());
            let mut at = protocol::new_packet(
                &mut buf,
                packet_id,
                root.address(),
                self.ctx.identity.address(),
                Verb::Whois,
            );
            for address in chunk {
                buf[at..at + ADDRESS_LENGTH].copy_from_slice(&address.to_bytes());
                at += ADDRESS_LENGTH;
            }
            self.expect.sending(packet_id, cc.ticks);
            debug!(root = %root.address(), addresses = chunk.len(), "sending identity lookup");
            root.send(&self.ctx, cc, &mut buf, at, Some(&root_path));
        }
    }

    /// An identity for `address` was just installed: play the parked
    /// packets back through the receive path.
    pub(crate) fn retry_queued_whois(&self, cc: &CallContext, address: Address) {
        let item = self.whois_queue.lock().remove(&address);
        let item = match item {
            Some(i) => i,
            None => return,
        };
        debug!(address = %address, "replaying packets parked for identity lookup");
        for (pkt, size, path) in item.packets.into_iter().flatten() {
            self.receive_assembled(cc, &path, PacketVector::single(pkt, 0, size));
        }
    }

    /// Number of packets currently parked for `address`.
    #[cfg(test)]
    pub(crate) fn whois_backlog(&self, address: Address) -> usize {
        self.whois_queue
            .lock()
            .get(&address)
            .map(|item| item.packets.iter().flatten().count())
            .unwrap_or(0)
    }

    /// How many lookup rounds have been sent for `address`.
    #[cfg(test)]
    pub(crate) fn whois_retries(&self, address: Address) -> u32 {
        self.whois_queue
            .lock()
            .get(&address)
            .map(|item| item.retries)
            .unwrap_or(0)
    }
}
