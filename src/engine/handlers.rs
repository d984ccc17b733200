//! Verb handlers terminating in the packet core: ERROR, OK, WHOIS,
//! RENDEZVOUS, ECHO, PUSH_DIRECT_PATHS, USER_MESSAGE, ENCAP.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;

use tracing::debug;

use crate::buf::{Buf, Reader, Writer};
use crate::context::CallContext;
use crate::endpoint::TransportAddr;
use crate::identity::{Address, Identity, ADDRESS_LENGTH, IDENTITY_MARSHAL_SIZE};
use crate::path::Path;
use crate::peer::{Peer, RemoteVersion};
use crate::protocol::{self, Verb, MIN_PACKET_LENGTH, PAYLOAD_START, UDP_DEFAULT_MTU};
use crate::trace::PacketDropReason;

use super::Engine;

/// Cap on endpoint records acted on per PUSH_DIRECT_PATHS message.
const MAX_PUSHED_PATHS: usize = 8;

impl Engine {
    fn drop_packet(
        &self,
        cc: &CallContext,
        tag: u32,
        packet_id: u64,
        path: &Arc<Path>,
        peer: &Arc<Peer>,
        verb: Verb,
        reason: PacketDropReason,
    ) {
        self.ctx.trace.incoming_packet_dropped(
            cc,
            tag,
            packet_id,
            Some(peer.identity()),
            Some(path.address()),
            0,
            Some(verb),
            reason,
        );
    }

    /// ERROR: a failure report for something we sent. Unsolicited reports
    /// are rejected; solicited ones surface as events only, since inner
    /// error semantics belong to the verbs above this layer.
    pub(crate) fn handle_error(
        &self,
        cc: &CallContext,
        packet_id: u64,
        path: &Arc<Path>,
        peer: &Arc<Peer>,
        packet: &[u8],
        in_re_verb: &mut Verb,
    ) -> bool {
        let mut r = Reader::new(packet, PAYLOAD_START);
        let parsed = (|| {
            let v = r.read_u8()?;
            let id = r.read_u64()?;
            let code = r.read_u8()?;
            Ok::<_, crate::buf::BufError>((v, id, code))
        })();
        let (in_re, in_re_packet_id, error_code) = match parsed {
            Ok(v) => v,
            Err(_) => {
                self.drop_packet(
                    cc,
                    0x4f10_88a1,
                    packet_id,
                    path,
                    peer,
                    Verb::Error,
                    PacketDropReason::MalformedPacket,
                );
                return false;
            }
        };
        *in_re_verb = Verb::from_byte(in_re).unwrap_or(Verb::Nop);

        if !self.expect.expecting(in_re_packet_id, cc.ticks) {
            self.drop_packet(
                cc,
                0x4f10_88a2,
                packet_id,
                path,
                peer,
                Verb::Error,
                PacketDropReason::ReplyNotExpected,
            );
            return false;
        }

        debug!(
            peer = %peer.address(),
            in_re = %in_re_verb,
            error_code,
            "peer reported an error"
        );
        true
    }

    /// OK: a reply to something we sent. Gated on the expect table, then
    /// dispatched by the verb it answers.
    pub(crate) fn handle_ok(
        &self,
        cc: &CallContext,
        packet_id: u64,
        path: &Arc<Path>,
        peer: &Arc<Peer>,
        packet: &[u8],
        in_re_verb: &mut Verb,
    ) -> bool {
        let mut r = Reader::new(packet, PAYLOAD_START);
        let parsed = (|| {
            let v = r.read_u8()?;
            let id = r.read_u64()?;
            Ok::<_, crate::buf::BufError>((v, id))
        })();
        let (in_re, in_re_packet_id) = match parsed {
            Ok(v) => v,
            Err(_) => {
                self.drop_packet(
                    cc,
                    0x5521_d7e0,
                    packet_id,
                    path,
                    peer,
                    Verb::Ok,
                    PacketDropReason::MalformedPacket,
                );
                return false;
            }
        };

        if !self.expect.expecting(in_re_packet_id, cc.ticks) {
            self.drop_packet(
                cc,
                0x5521_d7e1,
                packet_id,
                path,
                peer,
                Verb::Ok,
                PacketDropReason::ReplyNotExpected,
            );
            return false;
        }

        match Verb::from_byte(in_re) {
            Some(Verb::Hello) => {
                *in_re_verb = Verb::Hello;
                self.handle_ok_hello(cc, packet_id, path, peer, packet, r.position())
            }
            Some(Verb::Whois) => {
                *in_re_verb = Verb::Whois;
                self.handle_ok_whois(cc, packet_id, path, peer, packet, r.position())
            }
            Some(other) => {
                *in_re_verb = other;
                debug!(peer = %peer.address(), in_re = %other, "OK for a verb with no reply handling");
                true
            }
            None => {
                *in_re_verb = Verb::Nop;
                true
            }
        }
    }

    /// OK(HELLO): learn the peer's version and measure round-trip latency
    /// from the echoed timestamp.
    fn handle_ok_hello(
        &self,
        cc: &CallContext,
        packet_id: u64,
        path: &Arc<Path>,
        peer: &Arc<Peer>,
        packet: &[u8],
        at: usize,
    ) -> bool {
        let mut r = Reader::new(packet, at);
        let parsed = (|| {
            let timestamp_echo = r.read_u64()?;
            let proto = r.read_u8()?;
            let major = r.read_u8()?;
            let minor = r.read_u8()?;
            let revision = r.read_u16()?;
            Ok::<_, crate::buf::BufError>((timestamp_echo, proto, major, minor, revision))
        })();
        let (timestamp_echo, proto, major, minor, revision) = match parsed {
            Ok(v) => v,
            Err(_) => {
                self.drop_packet(
                    cc,
                    0x5521_d7e2,
                    packet_id,
                    path,
                    peer,
                    Verb::Ok,
                    PacketDropReason::MalformedPacket,
                );
                return false;
            }
        };
        let external = match TransportAddr::unmarshal(&mut r) {
            Ok(addr) => addr,
            Err(_) => {
                self.drop_packet(
                    cc,
                    0x5521_d7e3,
                    packet_id,
                    path,
                    peer,
                    Verb::Ok,
                    PacketDropReason::MalformedPacket,
                );
                return false;
            }
        };

        if proto >= 11 && !Self::verify_ok_hello_hmac(peer, packet) {
            self.drop_packet(
                cc,
                0x5521_d7e4,
                packet_id,
                path,
                peer,
                Verb::Ok,
                PacketDropReason::MacFailed,
            );
            return false;
        }

        peer.record_latency(cc.ticks - timestamp_echo as i64);
        peer.set_remote_version(RemoteVersion {
            proto,
            major,
            minor,
            revision,
        });
        if let Some(external) = external {
            debug!(peer = %peer.address(), observed = %external, "peer confirmed our external address");
        }
        true
    }

    /// OK(WHOIS): install the returned identities and replay any packets
    /// parked while they were unknown.
    fn handle_ok_whois(
        &self,
        cc: &CallContext,
        packet_id: u64,
        path: &Arc<Path>,
        peer: &Arc<Peer>,
        packet: &[u8],
        at: usize,
    ) -> bool {
        let mut r = Reader::new(packet, at);
        while r.remaining() >= IDENTITY_MARSHAL_SIZE {
            let identity = match Identity::unmarshal(&mut r) {
                Ok(id) => id,
                Err(_) => {
                    self.drop_packet(
                        cc,
                        0x5521_d7e5,
                        packet_id,
                        path,
                        peer,
                        Verb::Ok,
                        PacketDropReason::InvalidObject,
                    );
                    return false;
                }
            };
            if !identity.locally_validate() {
                self.drop_packet(
                    cc,
                    0x5521_d7e6,
                    packet_id,
                    path,
                    peer,
                    Verb::Ok,
                    PacketDropReason::InvalidObject,
                );
                continue;
            }
            let address = identity.address();
            let known = self.topology.peer(&self.ctx, cc, address, false);
            match known {
                Some(existing) if existing.identity() != &identity => {
                    debug!(address = %address, "lookup returned an identity conflicting with a known peer");
                    continue;
                }
                Some(_) => {}
                None => {
                    match Peer::new(
                        &self.ctx.identity,
                        identity,
                        self.config.peer.clone(),
                        cc.ticks,
                    ) {
                        Ok(new_peer) => {
                            self.topology.add(&self.ctx, cc, Arc::new(new_peer));
                        }
                        Err(_) => continue,
                    }
                }
            }
            self.retry_queued_whois(cc, address);
        }
        true
    }

    /// WHOIS: answer an identity lookup from our peer map, batching as many
    /// identities per OK as fit a datagram.
    pub(crate) fn handle_whois(
        &self,
        cc: &CallContext,
        packet_id: u64,
        path: &Arc<Path>,
        peer: &Arc<Peer>,
        packet: &[u8],
    ) -> bool {
        if !peer.whois_gate.gate(cc.ticks) {
            self.drop_packet(
                cc,
                0x39aa_01f7,
                packet_id,
                path,
                peer,
                Verb::Whois,
                PacketDropReason::RateLimitExceeded,
            );
            return true;
        }

        let mut requested = Vec::new();
        let mut at = PAYLOAD_START;
        while at + ADDRESS_LENGTH <= packet.len() {
            let mut raw = [0u8; ADDRESS_LENGTH];
            raw.copy_from_slice(&packet[at..at + ADDRESS_LENGTH]);
            requested.push(Address::from_bytes(&raw));
            at += ADDRESS_LENGTH;
        }

        let mut found: Vec<Arc<Peer>> = Vec::new();
        for address in requested {
            if let Some(known) = self.topology.peer(&self.ctx, cc, address, true) {
                found.push(known);
            }
        }

        let mut batch_start = 0;
        while batch_start < found.len() {
            let mut buf = Buf::new();
            let reply_id = peer
                .key()
                .next_message(self.ctx.identity.address(), peer.address());
            protocol::new_packet(
                &mut buf,
                reply_id,
                peer.address(),
                self.ctx.identity.address(),
                Verb::Ok,
            );
            let len = {
                let mut w = Writer::new(&mut buf[..UDP_DEFAULT_MTU], PAYLOAD_START);
                let mut ok = w.write_u8(Verb::Whois.to_byte()).is_ok();
                ok &= w.write_u64(packet_id).is_ok();
                if !ok {
                    return false;
                }
                while batch_start < found.len() {
                    // Marshal to scratch first so a full batch never leaves
                    // a partially written identity behind.
                    let mut scratch = [0u8; IDENTITY_MARSHAL_SIZE];
                    let mut sw = Writer::new(&mut scratch, 0);
                    if found[batch_start].identity().marshal(&mut sw).is_err() {
                        batch_start += 1;
                        continue;
                    }
                    if w.write_bytes(&scratch).is_err() {
                        // Batch full; the rest goes in the next packet.
                        break;
                    }
                    batch_start += 1;
                }
                w.position()
            };
            if !peer.send(&self.ctx, cc, &mut buf, len, Some(path)) {
                return false;
            }
        }
        true
    }

    /// ECHO: reflect the payload in an OK, rate gated.
    pub(crate) fn handle_echo(
        &self,
        cc: &CallContext,
        packet_id: u64,
        path: &Arc<Path>,
        peer: &Arc<Peer>,
        packet: &[u8],
    ) -> bool {
        if !peer.echo_gate.gate(cc.ticks) {
            self.drop_packet(
                cc,
                0x2b91_44c8,
                packet_id,
                path,
                peer,
                Verb::Echo,
                PacketDropReason::RateLimitExceeded,
            );
            return true;
        }

        let mut buf = Buf::new();
        let reply_id = peer
            .key()
            .next_message(self.ctx.identity.address(), peer.address());
        protocol::new_packet(
            &mut buf,
            reply_id,
            peer.address(),
            self.ctx.identity.address(),
            Verb::Ok,
        );
        let built = (|| {
            let mut w = Writer::new(&mut buf[..], PAYLOAD_START);
            w.write_u8(Verb::Echo.to_byte())?;
            w.write_u64(packet_id)?;
            w.write_bytes(&packet[PAYLOAD_START..])?;
            Ok::<_, crate::buf::BufError>(w.position())
        })();
        match built {
            Ok(len) => peer.send(&self.ctx, cc, &mut buf, len, Some(path)),
            Err(_) => {
                self.drop_packet(
                    cc,
                    0x2b91_44c9,
                    packet_id,
                    path,
                    peer,
                    Verb::Echo,
                    PacketDropReason::MalformedPacket,
                );
                false
            }
        }
    }

    /// RENDEZVOUS: a root is brokering a hole punch; contact the advertised
    /// endpoint. Ignored from anyone who is not a current root.
    pub(crate) fn handle_rendezvous(
        &self,
        cc: &CallContext,
        packet_id: u64,
        path: &Arc<Path>,
        peer: &Arc<Peer>,
        packet: &[u8],
    ) -> bool {
        if !self.topology.is_root(peer.address()) {
            debug!(peer = %peer.address(), "ignoring rendezvous from non-root");
            return true;
        }

        let mut r = Reader::new(packet, PAYLOAD_START);
        let parsed = (|| {
            let _flags = r.read_u8()?;
            let mut raw = [0u8; ADDRESS_LENGTH];
            raw.copy_from_slice(r.read_bytes(ADDRESS_LENGTH)?);
            let with = Address::from_bytes(&raw);
            let port = r.read_u16()?;
            let addr_len = r.read_u8()?;
            Ok::<_, crate::buf::BufError>((with, port, addr_len))
        })();
        let (with, port, addr_len) = match parsed {
            Ok(v) => v,
            Err(_) => {
                self.drop_packet(
                    cc,
                    0x7e3d_2ab0,
                    packet_id,
                    path,
                    peer,
                    Verb::Rendezvous,
                    PacketDropReason::MalformedPacket,
                );
                return false;
            }
        };
        if port == 0 {
            return true;
        }

        let ip: Option<IpAddr> = match addr_len {
            4 => r.read_bytes(4).ok().map(|b| {
                let mut o = [0u8; 4];
                o.copy_from_slice(b);
                IpAddr::V4(Ipv4Addr::from(o))
            }),
            16 => r.read_bytes(16).ok().map(|b| {
                let mut o = [0u8; 16];
                o.copy_from_slice(b);
                IpAddr::V6(Ipv6Addr::from(o))
            }),
            _ => None,
        };
        let at_addr = match ip {
            Some(ip) => TransportAddr::new(SocketAddr::new(ip, port)),
            None => return true, // unsupported address form; not an error
        };

        if let Some(with_peer) = self.topology.peer(&self.ctx, cc, with, false) {
            self.try_contact(cc, &with_peer, path.local_socket(), at_addr);
        }
        true
    }

    /// PUSH_DIRECT_PATHS: a peer advertises endpoints we might reach it at
    /// directly. Bounded and rate gated; each well-formed endpoint gets a
    /// contact attempt.
    pub(crate) fn handle_push_direct_paths(
        &self,
        cc: &CallContext,
        packet_id: u64,
        path: &Arc<Path>,
        peer: &Arc<Peer>,
        packet: &[u8],
    ) -> bool {
        if !peer.push_paths_gate.gate(cc.ticks) {
            self.drop_packet(
                cc,
                0x90c1_5d22,
                packet_id,
                path,
                peer,
                Verb::PushDirectPaths,
                PacketDropReason::RateLimitExceeded,
            );
            return true;
        }

        let mut r = Reader::new(packet, PAYLOAD_START);
        let num_paths = match r.read_u16() {
            Ok(n) => n as usize,
            Err(_) => {
                self.drop_packet(
                    cc,
                    0x90c1_5d23,
                    packet_id,
                    path,
                    peer,
                    Verb::PushDirectPaths,
                    PacketDropReason::MalformedPacket,
                );
                return false;
            }
        };

        let mut contacted = 0;
        for _ in 0..num_paths {
            let record = (|| {
                let _flags = r.read_u8()?;
                let ext_len = r.read_u16()? as usize;
                r.skip(ext_len)?;
                let addr_type = r.read_u8()?;
                let record_len = r.read_u8()? as usize;
                let record = r.read_bytes(record_len)?;
                Ok::<_, crate::buf::BufError>((addr_type, record))
            })();
            let (addr_type, record) = match record {
                Ok(v) => v,
                Err(_) => {
                    self.drop_packet(
                        cc,
                        0x90c1_5d24,
                        packet_id,
                        path,
                        peer,
                        Verb::PushDirectPaths,
                        PacketDropReason::MalformedPacket,
                    );
                    return false;
                }
            };

            let endpoint = match (addr_type, record.len()) {
                (4, 6) => {
                    let mut ip = [0u8; 4];
                    ip.copy_from_slice(&record[..4]);
                    let port = u16::from_be_bytes([record[4], record[5]]);
                    (port != 0).then(|| {
                        TransportAddr::new(SocketAddr::new(IpAddr::V4(Ipv4Addr::from(ip)), port))
                    })
                }
                (6, 18) => {
                    let mut ip = [0u8; 16];
                    ip.copy_from_slice(&record[..16]);
                    let port = u16::from_be_bytes([record[16], record[17]]);
                    (port != 0).then(|| {
                        TransportAddr::new(SocketAddr::new(IpAddr::V6(Ipv6Addr::from(ip)), port))
                    })
                }
                // Unknown record types skip cleanly by length.
                _ => None,
            };

            if let Some(endpoint) = endpoint {
                if contacted < MAX_PUSHED_PATHS {
                    self.try_contact(cc, peer, path.local_socket(), endpoint);
                    contacted += 1;
                }
            }
        }
        true
    }

    /// USER_MESSAGE: opaque application payload, delivered upward.
    pub(crate) fn handle_user_message(
        &self,
        cc: &CallContext,
        packet_id: u64,
        path: &Arc<Path>,
        peer: &Arc<Peer>,
        packet: &[u8],
    ) -> bool {
        let mut r = Reader::new(packet, PAYLOAD_START);
        let message_type = match r.read_u64() {
            Ok(t) => t,
            Err(_) => {
                self.drop_packet(
                    cc,
                    0xae77_3810,
                    packet_id,
                    path,
                    peer,
                    Verb::UserMessage,
                    PacketDropReason::MalformedPacket,
                );
                return false;
            }
        };
        let payload = &packet[r.position()..];
        self.ctx.upper.user_message(cc, peer, message_type, payload);
        true
    }

    /// ENCAP: reserved for encapsulated transport; accepted and inert.
    pub(crate) fn handle_encap(
        &self,
        _cc: &CallContext,
        _packet_id: u64,
        _path: &Arc<Path>,
        peer: &Arc<Peer>,
        packet: &[u8],
    ) -> bool {
        debug!(
            peer = %peer.address(),
            len = packet.len().saturating_sub(MIN_PACKET_LENGTH),
            "ENCAP accepted (no encapsulation support)"
        );
        true
    }
}
