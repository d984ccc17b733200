//! HELLO: identity announcement and peer establishment.
//!
//! HELLO is the only verb accepted in the clear under the legacy ciphers,
//! because it must be processable before any key is negotiated. It carries
//! the sender's full identity and authenticates itself: protocol version 11
//! and later append an HMAC-SHA384 trailer keyed from the identity
//! agreement, older versions rely on the legacy Poly1305 MAC field. The
//! reply is an OK echoing the HELLO's timestamp so the sender can measure
//! round-trip latency.

use std::sync::Arc;

use tracing::debug;

use crate::buf::{Buf, Reader, Writer};
use crate::codec;
use crate::context::CallContext;
use crate::dictionary::Dictionary;
use crate::endpoint::TransportAddr;
use crate::identity::Identity;
use crate::path::Path;
use crate::peer::{Peer, RemoteVersion};
use crate::protocol::{
    self, Verb, ENCRYPTED_SECTION_START, FLAGS_HOPS_MASK, FLAGS_INDEX, HELLO_HMAC_SIZE, MAC_INDEX,
    PAYLOAD_START, PROTO_VERSION, PROTO_VERSION_MIN, VERSION_MAJOR, VERSION_MINOR,
    VERSION_REVISION,
};
use crate::trace::PacketDropReason;

use super::Engine;

impl Engine {
    /// Process a HELLO and reply with OK(HELLO). Returns the (possibly
    /// newly learned) peer on success.
    pub(crate) fn handle_hello(
        &self,
        cc: &CallContext,
        path: &Arc<Path>,
        pkt: &mut Buf,
        packet_size: usize,
    ) -> Option<Arc<Peer>> {
        let packet_id = protocol::packet_id(&pkt[..]);
        let hops = protocol::hops(&pkt[..]);
        let source = protocol::source(&pkt[..]);
        let mut legacy_mac = [0u8; 8];
        legacy_mac.copy_from_slice(&pkt[MAC_INDEX..MAC_INDEX + 8]);

        let drop = |tag: u32, identity: Option<&Identity>, reason: PacketDropReason| {
            self.ctx.trace.incoming_packet_dropped(
                cc,
                tag,
                packet_id,
                identity,
                Some(path.address()),
                hops,
                Some(Verb::Hello),
                reason,
            );
        };

        // Fixed fields and the sender's identity.
        let parsed = (|| -> Result<_, crate::buf::BufError> {
            let mut r = Reader::new(&pkt[..packet_size], PAYLOAD_START);
            let proto = r.read_u8()?;
            let major = r.read_u8()?;
            let minor = r.read_u8()?;
            let revision = r.read_u16()?;
            let timestamp = r.read_u64()?;
            Ok((r.position(), proto, major, minor, revision, timestamp))
        })();
        let (mut cursor, proto, major, minor, revision, timestamp) = match parsed {
            Ok(v) => v,
            Err(_) => {
                drop(0x21b0_7a11, None, PacketDropReason::MalformedPacket);
                return None;
            }
        };

        if proto < PROTO_VERSION_MIN {
            drop(0x21b0_7a12, None, PacketDropReason::PeerTooOld);
            return None;
        }

        let identity = {
            let mut r = Reader::new(&pkt[..packet_size], cursor);
            match Identity::unmarshal(&mut r) {
                Ok(id) => {
                    cursor = r.position();
                    id
                }
                Err(_) => {
                    drop(0x21b0_7a13, None, PacketDropReason::InvalidObject);
                    return None;
                }
            }
        };
        if identity.address() != source {
            // An identity claiming someone else's source address is treated
            // as an authentication failure, not a parse failure.
            drop(0x21b0_7a14, None, PacketDropReason::MacFailed);
            return None;
        }

        // Find or learn the peer.
        let peer = match self.topology.peer(&self.ctx, cc, identity.address(), true) {
            Some(peer) => {
                if peer.identity() != &identity {
                    drop(0x21b0_7a15, Some(peer.identity()), PacketDropReason::MacFailed);
                    return None;
                }
                peer
            }
            None => {
                if !identity.locally_validate() {
                    drop(0x21b0_7a16, Some(&identity), PacketDropReason::InvalidObject);
                    return None;
                }
                match Peer::new(
                    &self.ctx.identity,
                    identity.clone(),
                    self.config.peer.clone(),
                    cc.ticks,
                ) {
                    Ok(peer) => self.topology.add(&self.ctx, cc, Arc::new(peer)),
                    Err(_) => {
                        drop(0x21b0_7a17, Some(&identity), PacketDropReason::Unspecified);
                        return None;
                    }
                }
            }
        };
        // Charged here for freshly learned peers too, so a replayed HELLO
        // is answered at most once.
        if peer.deduplicate_incoming_packet(packet_id) {
            return None;
        }

        // Authenticate under the regime for the sender's version.
        let mut packet_size = packet_size;
        if proto >= 11 {
            if packet_size < PAYLOAD_START + HELLO_HMAC_SIZE {
                drop(0x21b0_7a18, Some(peer.identity()), PacketDropReason::MacFailed);
                return None;
            }
            packet_size -= HELLO_HMAC_SIZE;
            // The HMAC covers the packet as built by the sender: hops zero
            // and the legacy MAC field zero.
            pkt[FLAGS_INDEX] &= !FLAGS_HOPS_MASK;
            pkt[MAC_INDEX..MAC_INDEX + 8].fill(0);
            let hmac = codec::hmac_sha384(peer.key().hello_hmac_key(), &pkt[..packet_size]);
            if !codec::secure_eq(&hmac, &pkt[packet_size..packet_size + HELLO_HMAC_SIZE]) {
                drop(0x21b0_7a19, Some(peer.identity()), PacketDropReason::MacFailed);
                return None;
            }
        } else {
            if packet_size <= ENCRYPTED_SECTION_START {
                drop(0x21b0_7a1a, Some(peer.identity()), PacketDropReason::MacFailed);
                return None;
            }
            let per_packet_key = protocol::salsa_derive_per_packet_key(
                peer.key().cipher_key(),
                &pkt[..FLAGS_INDEX + 1],
                packet_size,
            );
            let mut iv = [0u8; 8];
            iv.copy_from_slice(&pkt[..8]);
            let tag = codec::poly1305_packet_mac(
                &per_packet_key,
                &iv,
                &pkt[ENCRYPTED_SECTION_START..packet_size],
            );
            if !codec::secure_eq(&tag[..8], &legacy_mac) {
                drop(0x21b0_7a1b, Some(peer.identity()), PacketDropReason::MacFailed);
                return None;
            }
        }

        // The address the sender sent this packet to: our external address
        // from their point of view. Consumed by the self-awareness layer.
        let external = {
            let mut r = Reader::new(&pkt[..packet_size], cursor);
            match TransportAddr::unmarshal(&mut r) {
                Ok(addr) => {
                    cursor = r.position();
                    addr
                }
                Err(_) => {
                    drop(0x21b0_7a1c, Some(peer.identity()), PacketDropReason::InvalidObject);
                    return None;
                }
            }
        };
        if let Some(external) = external {
            debug!(peer = %peer.address(), observed = %external, "peer reports our external address");
        }

        // Version 11+: AES-CTR encrypted metadata dictionary.
        if proto >= 11 {
            cursor += 4; // reserved
            if cursor + codec::DICTIONARY_NONCE_SIZE < packet_size {
                let mut nonce = [0u8; codec::DICTIONARY_NONCE_SIZE];
                nonce.copy_from_slice(&pkt[cursor..cursor + codec::DICTIONARY_NONCE_SIZE]);
                cursor += codec::DICTIONARY_NONCE_SIZE;
                codec::aes_ctr_crypt_in_place(
                    peer.key().dictionary_key(),
                    &nonce,
                    &mut pkt[cursor..packet_size],
                );

                let dict_ok = (|| -> Option<Dictionary> {
                    let mut r = Reader::new(&pkt[..packet_size], cursor);
                    r.skip(2).ok()?; // reserved
                    let dict_size = r.read_u16().ok()? as usize;
                    let dict_bytes = r.read_bytes(dict_size).ok()?;
                    Dictionary::decode(dict_bytes)
                })();
                match dict_ok {
                    Some(dict) => {
                        if !dict.is_empty() {
                            // No metadata keys are consumed by the core yet.
                            debug!(peer = %peer.address(), keys = dict.len(), "HELLO metadata received");
                        }
                    }
                    None => {
                        drop(0x21b0_7a1d, Some(peer.identity()), PacketDropReason::InvalidObject);
                        return Some(peer);
                    }
                }
            }
        }

        peer.set_remote_version(RemoteVersion {
            proto,
            major,
            minor,
            revision,
        });

        self.send_ok_hello(cc, path, &peer, proto, packet_id, timestamp);
        Some(peer)
    }

    /// Build and send the OK(HELLO) reply.
    fn send_ok_hello(
        &self,
        cc: &CallContext,
        path: &Arc<Path>,
        peer: &Arc<Peer>,
        remote_proto: u8,
        in_re_packet_id: u64,
        timestamp_echo: u64,
    ) {
        let mut buf = Buf::new();
        let ok_id = peer
            .key()
            .next_message(self.ctx.identity.address(), peer.address());
        protocol::new_packet(
            &mut buf,
            ok_id,
            peer.address(),
            self.ctx.identity.address(),
            Verb::Ok,
        );

        let end = (|| -> Result<usize, crate::buf::BufError> {
            let mut w = Writer::new(&mut buf[..], PAYLOAD_START);
            w.write_u8(Verb::Hello.to_byte())?;
            w.write_u64(in_re_packet_id)?;
            w.write_u64(timestamp_echo)?;
            w.write_u8(PROTO_VERSION)?;
            w.write_u8(VERSION_MAJOR)?;
            w.write_u8(VERSION_MINOR)?;
            w.write_u16(VERSION_REVISION)?;
            path.address().marshal(&mut w)?;
            w.write_u16(0)?; // legacy field, always zero
            if remote_proto >= 11 {
                // Empty response dictionary precedes the reply authenticator.
                w.write_u16(0)?;
            }
            Ok(w.position())
        })();
        let mut len = match end {
            Ok(n) => n,
            Err(_) => return,
        };
        if remote_proto >= 11 {
            let hmac = codec::hmac_sha384(peer.key().hello_hmac_key(), &buf[..len]);
            buf[len..len + HELLO_HMAC_SIZE].copy_from_slice(&hmac);
            len += HELLO_HMAC_SIZE;
        }

        if !peer.send(&self.ctx, cc, &mut buf, len, Some(path)) {
            debug!(peer = %peer.address(), "failed to send OK(HELLO)");
        }
    }

    /// Verify the trailing reply authenticator on an OK(HELLO) from a
    /// version 11+ peer.
    ///
    /// The sender computed it over the reply as built, before armoring:
    /// flags and the MAC field were still zero, so both are zeroed here
    /// (unlike HELLO itself, the flags byte of an OK legitimately changes
    /// in transit when the armor writes the cipher bits).
    pub(crate) fn verify_ok_hello_hmac(peer: &Peer, pkt: &[u8]) -> bool {
        if pkt.len() < PAYLOAD_START + HELLO_HMAC_SIZE {
            return false;
        }
        let body_len = pkt.len() - HELLO_HMAC_SIZE;
        let mut working = pkt[..body_len].to_vec();
        working[FLAGS_INDEX] = 0;
        working[MAC_INDEX..MAC_INDEX + 8].fill(0);
        let hmac = codec::hmac_sha384(peer.key().hello_hmac_key(), &working);
        codec::secure_eq(&hmac, &pkt[body_len..])
    }
}
