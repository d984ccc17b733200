//! The packet engine: receive pipeline, dispatch, and periodic service.
//!
//! `on_remote_packet` is the single entry point for datagrams and may be
//! called concurrently from any number of I/O threads. The pipeline is
//! parse, defragment, authenticate and decrypt, deduplicate, decompress,
//! dispatch; every failure is a silent drop paired with a trace event, and
//! nothing in here blocks on I/O.

mod handlers;
mod hello;
mod whois;

#[cfg(test)]
mod tests;

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use parking_lot::Mutex;
use rand::RngCore;
use tracing::{debug, trace};

use crate::buf::{Buf, PacketVector, Slice};
use crate::codec::{self, PolyStream, SalsaPolyStream};
use crate::config::EngineConfig;
use crate::context::{CallContext, Context, AUTH_AUTHENTICATED, AUTH_ENCRYPTED};
use crate::defrag::{AssembleResult, Defragmenter};
use crate::endpoint::TransportAddr;
use crate::expect::Expect;
use crate::identity::{Address, Identity};
use crate::path::Path;
use crate::peer::Peer;
use crate::protocol::{
    self, CipherSuite, Verb, ENCRYPTED_SECTION_START, FLAGS_INDEX, FLAG_FRAGMENTED,
    FRAGMENT_COUNTS_INDEX, FRAGMENT_INDICATOR, FRAGMENT_INDICATOR_INDEX, FRAGMENT_PAYLOAD_START,
    MAC_INDEX, MIN_FRAGMENT_LENGTH, MIN_PACKET_LENGTH, PATH_KEEPALIVE_PERIOD, PAYLOAD_START,
    VERB_FLAG_COMPRESSED, VERB_INDEX, VERB_MASK,
};
use crate::topology::Topology;
use crate::trace::PacketDropReason;

use whois::WhoisQueueItem;

/// The layer-1 packet engine.
pub struct Engine {
    ctx: Context,
    config: EngineConfig,
    topology: Topology,
    expect: Expect,
    defrag: Defragmenter,
    whois_queue: Mutex<HashMap<Address, WhoisQueueItem>>,
    /// Random per-run ID announced in HELLO metadata.
    instance_id: u64,
}

impl Engine {
    pub fn new(ctx: Context, config: EngineConfig) -> Self {
        Self {
            topology: Topology::new(config.peer.clone()),
            expect: Expect::new(),
            defrag: Defragmenter::new(config.defrag.clone()),
            whois_queue: Mutex::new(HashMap::new()),
            instance_id: rand::rng().next_u64(),
            config,
            ctx,
        }
    }

    pub fn context(&self) -> &Context {
        &self.ctx
    }

    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    pub fn expect(&self) -> &Expect {
        &self.expect
    }

    pub fn instance_id(&self) -> u64 {
        self.instance_id
    }

    /// Rebuild the root set from the trust store's current identities.
    pub fn sync_roots(&self, cc: &CallContext, root_identities: &[Identity]) {
        self.topology.sync_roots(&self.ctx, cc, root_identities);
    }

    /// Ingest one datagram from a physical socket.
    ///
    /// All faults are contained here: packet-level rejects drop silently
    /// with a trace event, and unexpected panics from deeper layers are
    /// caught and reported rather than unwinding into the I/O thread.
    pub fn on_remote_packet(
        &self,
        cc: &CallContext,
        local_socket: i64,
        from: TransportAddr,
        data: Arc<Buf>,
        len: usize,
    ) {
        let path = self.topology.path(local_socket, from);
        path.received(cc.ticks, len);
        trace!(len, from = %from, local_socket, "datagram received");

        let result = catch_unwind(AssertUnwindSafe(|| self.receive(cc, &path, data, len)));
        if result.is_err() {
            self.ctx.trace.unexpected_error(
                cc,
                0x31c5_9047,
                "unexpected panic while processing an incoming datagram",
            );
        }
    }

    /// Early parse and reassembly; hands completed packets onward.
    fn receive(&self, cc: &CallContext, path: &Arc<Path>, data: Arc<Buf>, len: usize) {
        if len < MIN_FRAGMENT_LENGTH {
            return;
        }

        let packet_id = protocol::packet_id(&data[..]);
        let destination = protocol::destination(&data[..]);
        if destination != self.ctx.identity.address() {
            self.relay(cc, path, destination, data, len);
            return;
        }

        let pktv = if data[FRAGMENT_INDICATOR_INDEX] == FRAGMENT_INDICATOR {
            // A non-head fragment of a larger packet.
            let counts = data[FRAGMENT_COUNTS_INDEX];
            let total_fragments = counts >> 4;
            let fragment_no = counts & 0x0f;
            match self.defrag.assemble(
                packet_id,
                Slice::new(data, FRAGMENT_PAYLOAD_START, len),
                fragment_no,
                total_fragments,
                cc.ticks,
                path,
            ) {
                AssembleResult::Complete(v) => v,
                _ => return,
            }
        } else if len < MIN_PACKET_LENGTH {
            return;
        } else if data[FLAGS_INDEX] & FLAG_FRAGMENTED != 0 {
            // Head of a fragment series; the total count comes from the
            // other fragments.
            match self
                .defrag
                .assemble(packet_id, Slice::new(data, 0, len), 0, 0, cc.ticks, path)
            {
                AssembleResult::Complete(v) => v,
                _ => return,
            }
        } else {
            PacketVector::single(data, 0, len)
        };

        self.receive_assembled(cc, path, pktv);
    }

    /// Authenticate, decrypt and dispatch a fully assembled packet.
    pub(crate) fn receive_assembled(&self, cc: &CallContext, path: &Arc<Path>, pktv: PacketVector) {
        let head = match pktv.head() {
            Some(h) => h,
            None => return,
        };
        let hdr = head.as_bytes();
        let packet_id = protocol::packet_id(hdr);
        let source = protocol::source(hdr);
        let hops = protocol::hops(hdr);
        let cipher = CipherSuite::from_flags(hdr[FLAGS_INDEX]);
        let total_size = pktv.total_size();

        // HELLO under the legacy ciphers is accepted in the clear; it
        // carries its own authentication.
        if matches!(cipher, CipherSuite::Poly1305None | CipherSuite::Reserved)
            && hdr[VERB_INDEX] & VERB_MASK == Verb::Hello.to_byte()
        {
            let mut pkt = Buf::new();
            let size = match pktv.merge_copy(&mut pkt) {
                Ok(n) => n,
                Err(_) => return,
            };
            if size < MIN_PACKET_LENGTH {
                return;
            }
            if let Some(peer) = self.handle_hello(cc, path, &mut pkt, size) {
                peer.received(
                    &self.ctx,
                    cc,
                    path,
                    hops,
                    packet_id,
                    size - PAYLOAD_START,
                    Verb::Hello,
                    Verb::Nop,
                );
            }
            return;
        }

        let peer = self.topology.peer(&self.ctx, cc, source, false);

        let mut auth: u8 = 0;
        let mut pkt = Buf::new();
        let mut pkt_size: usize = 0;

        if let Some(peer) = &peer {
            let mut iv = [0u8; 8];
            iv.copy_from_slice(&hdr[..8]);
            match cipher {
                CipherSuite::Poly1305None => {
                    let per_packet_key = protocol::salsa_derive_per_packet_key(
                        peer.key().cipher_key(),
                        &hdr[..FLAGS_INDEX + 1],
                        total_size,
                    );
                    let mut stream = PolyStream::new(&per_packet_key, &iv);
                    pkt_size = match pktv.merge_map(&mut pkt, ENCRYPTED_SECTION_START, &mut stream)
                    {
                        Ok(n) => n,
                        Err(_) => return,
                    };
                    if pkt_size < MIN_PACKET_LENGTH {
                        return;
                    }
                    let tag = stream.finish();
                    if !codec::secure_eq(&tag[..8], &pkt[MAC_INDEX..MAC_INDEX + 8]) {
                        self.ctx.trace.incoming_packet_dropped(
                            cc,
                            0x8d2f_11c0,
                            packet_id,
                            Some(peer.identity()),
                            Some(path.address()),
                            hops,
                            None,
                            PacketDropReason::MacFailed,
                        );
                        return;
                    }
                    auth = AUTH_AUTHENTICATED;
                }
                CipherSuite::Poly1305Salsa2012 => {
                    let per_packet_key = protocol::salsa_derive_per_packet_key(
                        peer.key().cipher_key(),
                        &hdr[..FLAGS_INDEX + 1],
                        total_size,
                    );
                    let mut stream = SalsaPolyStream::new(&per_packet_key, &iv);
                    pkt_size = match pktv.merge_map(&mut pkt, ENCRYPTED_SECTION_START, &mut stream)
                    {
                        Ok(n) => n,
                        Err(_) => return,
                    };
                    if pkt_size < MIN_PACKET_LENGTH {
                        return;
                    }
                    let tag = stream.finish();
                    if !codec::secure_eq(&tag[..8], &pkt[MAC_INDEX..MAC_INDEX + 8]) {
                        self.ctx.trace.incoming_packet_dropped(
                            cc,
                            0x8d2f_11c1,
                            packet_id,
                            Some(peer.identity()),
                            Some(path.address()),
                            hops,
                            None,
                            PacketDropReason::MacFailed,
                        );
                        return;
                    }
                    auth = AUTH_AUTHENTICATED | AUTH_ENCRYPTED;
                }
                CipherSuite::Reserved | CipherSuite::AesGmacSiv => {
                    // Cipher slots with no implementation in this core.
                    self.ctx.trace.incoming_packet_dropped(
                        cc,
                        0x6a43_0f21,
                        packet_id,
                        Some(peer.identity()),
                        Some(path.address()),
                        hops,
                        None,
                        PacketDropReason::InvalidObject,
                    );
                    return;
                }
            }
        }

        if auth != 0 {
            let peer = peer.expect("authentication implies a known peer");
            self.process_authenticated(cc, path, &peer, auth, packet_id, hops, pkt, pkt_size);
        } else {
            // Unknown source: park the packet and look the identity up.
            if pkt_size == 0 {
                pkt_size = match pktv.merge_copy(&mut pkt) {
                    Ok(n) => n,
                    Err(_) => return,
                };
            }
            if pkt_size >= MIN_PACKET_LENGTH {
                debug!(source = %source, "unknown packet source, queueing identity lookup");
                let send_pending = self.enqueue_whois(cc, source, Arc::new(pkt), pkt_size, path);
                if send_pending {
                    self.send_pending_whois(cc);
                }
            }
        }
    }

    /// Deduplicate, decompress and dispatch an authenticated packet.
    #[allow(clippy::too_many_arguments)]
    fn process_authenticated(
        &self,
        cc: &CallContext,
        path: &Arc<Path>,
        peer: &Arc<Peer>,
        auth: u8,
        packet_id: u64,
        hops: u8,
        mut pkt: Buf,
        mut pkt_size: usize,
    ) {
        if peer.deduplicate_incoming_packet(packet_id) {
            trace!(packet_id = format_args!("{:016x}", packet_id), "duplicate packet");
            return;
        }

        let verb_flags = pkt[VERB_INDEX];

        // Decompression only after MAC validation, so the decompressor never
        // sees attacker-chosen input.
        if verb_flags & VERB_FLAG_COMPRESSED != 0 && pkt_size > PAYLOAD_START {
            let mut dec = Buf::new();
            dec[..PAYLOAD_START].copy_from_slice(&pkt[..PAYLOAD_START]);
            let expanded =
                codec::decompress_payload(&pkt[PAYLOAD_START..pkt_size], &mut dec[PAYLOAD_START..]);
            match expanded {
                Some(n) => {
                    pkt = dec;
                    pkt_size = PAYLOAD_START + n;
                }
                None => {
                    self.ctx.trace.incoming_packet_dropped(
                        cc,
                        0xc4e1_99b2,
                        packet_id,
                        Some(peer.identity()),
                        Some(path.address()),
                        hops,
                        Verb::from_byte(verb_flags),
                        PacketDropReason::InvalidCompressedData,
                    );
                    return;
                }
            }
        }

        let verb = match Verb::from_byte(verb_flags) {
            Some(v) => v,
            None => {
                self.ctx.trace.incoming_packet_dropped(
                    cc,
                    0x70aa_e2d3,
                    packet_id,
                    Some(peer.identity()),
                    Some(path.address()),
                    hops,
                    None,
                    PacketDropReason::UnrecognizedVerb,
                );
                return;
            }
        };

        // HELLO normally arrives in the clear and is handled earlier.
        // Reaching it here is not invalid; it re-runs its own
        // authentication and replay accounting.
        if verb == Verb::Hello {
            if self.handle_hello(cc, path, &mut pkt, pkt_size).is_some() {
                peer.received(
                    &self.ctx,
                    cc,
                    path,
                    hops,
                    packet_id,
                    pkt_size.saturating_sub(PAYLOAD_START),
                    Verb::Hello,
                    Verb::Nop,
                );
            }
            return;
        }

        let packet = &pkt[..pkt_size];
        let mut in_re_verb = Verb::Nop;
        let ok = match verb {
            Verb::Nop => true,
            Verb::Error => {
                self.handle_error(cc, packet_id, path, peer, packet, &mut in_re_verb)
            }
            Verb::Ok => self.handle_ok(cc, packet_id, path, peer, packet, &mut in_re_verb),
            Verb::Whois => self.handle_whois(cc, packet_id, path, peer, packet),
            Verb::Rendezvous => self.handle_rendezvous(cc, packet_id, path, peer, packet),
            Verb::Echo => self.handle_echo(cc, packet_id, path, peer, packet),
            Verb::PushDirectPaths => {
                self.handle_push_direct_paths(cc, packet_id, path, peer, packet)
            }
            Verb::UserMessage => self.handle_user_message(cc, packet_id, path, peer, packet),
            Verb::Encap => self.handle_encap(cc, packet_id, path, peer, packet),
            // Everything else terminates in the layer above.
            other => self
                .ctx
                .upper
                .handle_verb(cc, packet_id, auth, path, peer, other, packet),
        };

        if ok {
            peer.received(
                &self.ctx,
                cc,
                path,
                hops,
                packet_id,
                pkt_size.saturating_sub(PAYLOAD_START),
                verb,
                in_re_verb,
            );
        }
    }

    /// Datagram addressed to another node: hand to the relay hook.
    fn relay(
        &self,
        cc: &CallContext,
        path: &Arc<Path>,
        destination: Address,
        data: Arc<Buf>,
        len: usize,
    ) {
        match &self.ctx.relay {
            Some(hook) => hook.relay(cc, path, destination, &data, len),
            None => {
                trace!(destination = %destination, "dropping packet for another node");
            }
        }
    }

    /// Open (or reuse) a path to `addr` and announce ourselves on it.
    /// Used for rendezvous hole punching and pushed direct paths.
    pub(crate) fn try_contact(
        &self,
        cc: &CallContext,
        peer: &Arc<Peer>,
        local_socket: i64,
        addr: TransportAddr,
    ) {
        let path = self.topology.path(local_socket, addr);
        debug!(peer = %peer.address(), addr = %addr, "trying new path");
        if let Some(packet_id) = peer.send_hello(&self.ctx, cc, &path, self.instance_id) {
            self.expect.sending(packet_id, cc.ticks);
        }
    }

    /// Send a HELLO to a known peer and register the expected OK.
    pub fn send_hello(&self, cc: &CallContext, peer: &Arc<Peer>, path: &Arc<Path>) -> bool {
        match peer.send_hello(&self.ctx, cc, path, self.instance_id) {
            Some(packet_id) => {
                self.expect.sending(packet_id, cc.ticks);
                true
            }
            None => false,
        }
    }

    /// Background service: topology GC, reassembly expiry, WHOIS retries,
    /// root keepalives and per-peer path pruning.
    pub fn do_periodic_tasks(&self, cc: &CallContext) {
        self.topology.do_periodic_tasks(&self.ctx, cc);
        self.defrag.gc(cc.ticks);
        self.send_pending_whois(cc);

        for peer in self.topology.all_peers() {
            peer.prune_dead_paths(cc);
        }
        for root in self.topology.roots_snapshot() {
            if cc.ticks - root.last_send() >= PATH_KEEPALIVE_PERIOD {
                if let Some(path) = root.path(cc) {
                    self.send_hello(cc, &root, &path);
                }
            }
        }
    }

    /// Persist all peers; for orderly shutdown.
    pub fn save_all(&self, cc: &CallContext) {
        self.topology.save_all(&self.ctx, cc);
    }
}
