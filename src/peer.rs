//! Remote peer state: identity, negotiated key, replay filter, paths.

use std::fmt;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use rand::RngCore;
use tracing::trace;

use crate::buf::{Buf, BufError, Reader, Writer};
use crate::codec;
use crate::config::PeerLimitsConfig;
use crate::context::{CallContext, Context};
use crate::dictionary::Dictionary;
use crate::identity::{Address, Identity, IdentityError, SymmetricKey};
use crate::path::Path;
use crate::protocol::{
    self, CipherSuite, Verb, FLAGS_INDEX, FLAG_FRAGMENTED, HELLO_HMAC_SIZE, PAYLOAD_START,
    PROTO_VERSION, UDP_DEFAULT_MTU, VERSION_MAJOR, VERSION_MINOR, VERSION_REVISION,
};
use crate::rate_limit::RateGate;
use crate::store::ObjectKind;

/// Dictionary key: sender's random per-run instance ID.
pub const HELLO_DICT_KEY_INSTANCE_ID: &str = "I";
/// Dictionary key: sender's tick clock at HELLO build time.
pub const HELLO_DICT_KEY_CLOCK: &str = "C";

/// Slots in the replay filter. Must be a power of two.
const DEDUP_BUFFER_SIZE: usize = 512;

/// Minimum interval between answered WHOIS requests from one peer.
const WHOIS_RATE_GATE: i64 = 100;
/// Minimum interval between answered ECHOs from one peer.
const ECHO_RATE_GATE: i64 = 1_000;
/// Minimum interval between acted-on PUSH_DIRECT_PATHS from one peer.
const PUSH_DIRECT_PATHS_RATE_GATE: i64 = 1_000;

/// Remote software version learned from HELLO / OK(HELLO).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RemoteVersion {
    pub proto: u8,
    pub major: u8,
    pub minor: u8,
    pub revision: u16,
}

/// Lock-free filter of recently seen packet IDs.
///
/// A fixed table of hashed slots; a packet is a duplicate when its slot
/// already holds its own marker. Collisions only widen the window, never
/// produce false accepts of the same ID.
struct DedupFilter {
    slots: [AtomicU64; DEDUP_BUFFER_SIZE],
}

impl DedupFilter {
    fn new() -> Self {
        Self {
            slots: std::array::from_fn(|_| AtomicU64::new(0)),
        }
    }

    /// True if `packet_id` was already seen; records it either way.
    fn check_and_insert(&self, packet_id: u64) -> bool {
        let mixed = packet_id.wrapping_mul(0x9e37_79b9_7f4a_7c15) | 1;
        let slot = (mixed >> 32) as usize & (DEDUP_BUFFER_SIZE - 1);
        self.slots[slot].swap(mixed, Ordering::Relaxed) == mixed
    }
}

/// A remote node we share key material with.
///
/// Created on the first valid HELLO or loaded from the peer cache, and
/// registered in the topology where one peer per address wins the insertion
/// race. Idle non-root peers are collected and persisted by the topology's
/// periodic tasks.
pub struct Peer {
    identity: Identity,
    key: SymmetricKey,
    limits: PeerLimitsConfig,
    paths: Mutex<Vec<Arc<Path>>>,
    dedup: DedupFilter,
    remote_version: Mutex<Option<RemoteVersion>>,
    last_receive: AtomicI64,
    last_send: AtomicI64,
    /// Round-trip estimate in milliseconds; negative means unknown.
    latency: AtomicI64,
    packets_in: AtomicU64,
    packets_out: AtomicU64,
    created: i64,
    pub(crate) whois_gate: RateGate,
    pub(crate) echo_gate: RateGate,
    pub(crate) push_paths_gate: RateGate,
}

impl Peer {
    /// Build a peer from a learned identity, deriving the long-term key by
    /// agreement with our own identity.
    pub fn new(
        local: &Identity,
        identity: Identity,
        limits: PeerLimitsConfig,
        ticks: i64,
    ) -> Result<Self, IdentityError> {
        let raw = local.agree(&identity).ok_or(IdentityError::AgreementFailed)?;
        Ok(Self {
            identity,
            key: SymmetricKey::new(raw),
            limits,
            paths: Mutex::new(Vec::new()),
            dedup: DedupFilter::new(),
            remote_version: Mutex::new(None),
            last_receive: AtomicI64::new(0),
            last_send: AtomicI64::new(0),
            latency: AtomicI64::new(-1),
            packets_in: AtomicU64::new(0),
            packets_out: AtomicU64::new(0),
            created: ticks,
            whois_gate: RateGate::new(WHOIS_RATE_GATE),
            echo_gate: RateGate::new(ECHO_RATE_GATE),
            push_paths_gate: RateGate::new(PUSH_DIRECT_PATHS_RATE_GATE),
        })
    }

    pub fn address(&self) -> Address {
        self.identity.address()
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn key(&self) -> &SymmetricKey {
        &self.key
    }

    /// Cipher used for packets we send to this peer.
    pub fn cipher(&self) -> CipherSuite {
        CipherSuite::Poly1305Salsa2012
    }

    pub fn last_receive(&self) -> i64 {
        self.last_receive.load(Ordering::Relaxed)
    }

    pub fn last_send(&self) -> i64 {
        self.last_send.load(Ordering::Relaxed)
    }

    pub fn packets_in(&self) -> u64 {
        self.packets_in.load(Ordering::Relaxed)
    }

    pub fn packets_out(&self) -> u64 {
        self.packets_out.load(Ordering::Relaxed)
    }

    pub fn latency(&self) -> i64 {
        self.latency.load(Ordering::Relaxed)
    }

    /// Fold a fresh round-trip sample into the running estimate.
    pub fn record_latency(&self, sample: i64) {
        let sample = sample.max(0);
        let prev = self.latency.load(Ordering::Relaxed);
        let next = if prev < 0 { sample } else { (prev * 3 + sample) / 4 };
        self.latency.store(next, Ordering::Relaxed);
    }

    pub fn remote_version(&self) -> Option<RemoteVersion> {
        *self.remote_version.lock()
    }

    pub fn set_remote_version(&self, v: RemoteVersion) {
        *self.remote_version.lock() = Some(v);
    }

    /// True if this packet ID was already accepted from this peer.
    pub fn deduplicate_incoming_packet(&self, packet_id: u64) -> bool {
        self.dedup.check_and_insert(packet_id)
    }

    /// Record a fully processed packet: liveness, counters, path learning.
    /// Only zero-hop packets teach us new direct paths.
    #[allow(clippy::too_many_arguments)]
    pub fn received(
        &self,
        _ctx: &Context,
        cc: &CallContext,
        path: &Arc<Path>,
        hops: u8,
        packet_id: u64,
        payload_len: usize,
        verb: Verb,
        in_re_verb: Verb,
    ) {
        self.last_receive.store(cc.ticks, Ordering::Relaxed);
        self.packets_in.fetch_add(1, Ordering::Relaxed);
        if hops == 0 {
            self.learn_path(path);
        }
        trace!(
            peer = %self.address(),
            packet_id = format_args!("{:016x}", packet_id),
            %verb,
            in_re = %in_re_verb,
            payload_len,
            hops,
            "packet processed"
        );
    }

    fn learn_path(&self, path: &Arc<Path>) {
        let mut paths = self.paths.lock();
        if paths.iter().any(|p| Arc::ptr_eq(p, path)) {
            return;
        }
        if paths.len() >= self.limits.max_paths {
            // Evict the stalest before admitting the new path.
            if let Some(stalest) = paths
                .iter()
                .enumerate()
                .min_by_key(|(_, p)| p.last_in())
                .map(|(i, _)| i)
            {
                paths.swap_remove(stalest);
            }
        }
        paths.push(path.clone());
    }

    /// The current best path: most recently alive.
    pub fn path(&self, cc: &CallContext) -> Option<Arc<Path>> {
        self.paths
            .lock()
            .iter()
            .filter(|p| p.alive(cc.ticks))
            .max_by_key(|p| p.last_in())
            .cloned()
    }

    /// Direct paths currently held by this peer.
    pub fn paths(&self) -> Vec<Arc<Path>> {
        self.paths.lock().clone()
    }

    /// Drop paths that have gone silent.
    pub fn prune_dead_paths(&self, cc: &CallContext) {
        self.paths.lock().retain(|p| p.alive(cc.ticks));
    }

    /// Armor a built packet under this peer's key and send it, fragmenting
    /// when it exceeds the datagram MTU. Uses the best current path unless
    /// one is given.
    pub fn send(
        &self,
        ctx: &Context,
        cc: &CallContext,
        buf: &mut Buf,
        len: usize,
        via: Option<&Arc<Path>>,
    ) -> bool {
        let path = match via {
            Some(p) => p.clone(),
            None => match self.path(cc) {
                Some(p) => p,
                None => return false,
            },
        };
        if len > UDP_DEFAULT_MTU {
            // The fragmented flag participates in per-packet key derivation
            // and must be set before armoring.
            buf[FLAGS_INDEX] |= FLAG_FRAGMENTED;
        }
        if protocol::armor(buf, len, &self.key, self.cipher()).is_err() {
            return false;
        }
        let ok = if len > UDP_DEFAULT_MTU {
            match protocol::fragment(&buf[..len], UDP_DEFAULT_MTU) {
                Some(frames) => frames.iter().all(|f| path.send(ctx, cc, f)),
                None => false,
            }
        } else {
            path.send(ctx, cc, &buf[..len])
        };
        if ok {
            self.last_send.store(cc.ticks, Ordering::Relaxed);
            self.packets_out.fetch_add(1, Ordering::Relaxed);
        }
        ok
    }

    /// Build and send a HELLO announcing our identity on `path`.
    ///
    /// HELLO travels under the unencrypted legacy cipher and authenticates
    /// itself: the versioned trailing HMAC-SHA384 covers the whole packet
    /// with hops masked and the legacy MAC field zeroed, and the metadata
    /// dictionary rides in an AES-CTR-encrypted section. Returns the packet
    /// ID so the caller can register the expected OK.
    pub fn send_hello(
        &self,
        ctx: &Context,
        cc: &CallContext,
        path: &Arc<Path>,
        instance_id: u64,
    ) -> Option<u64> {
        let mut buf = Buf::new();
        let packet_id = self
            .key
            .next_message(ctx.identity.address(), self.address());
        protocol::new_packet(
            &mut buf,
            packet_id,
            self.address(),
            ctx.identity.address(),
            Verb::Hello,
        );

        let mut nonce = [0u8; codec::DICTIONARY_NONCE_SIZE];
        rand::rng().fill_bytes(&mut nonce);

        let mut dict = Dictionary::new();
        dict.set_u64(HELLO_DICT_KEY_INSTANCE_ID, instance_id);
        dict.set_u64(HELLO_DICT_KEY_CLOCK, cc.ticks as u64);
        let dict_bytes = dict.encode();

        let (encrypted_start, end) =
            match write_hello_payload(ctx, cc, &mut buf, path, &nonce, &dict_bytes) {
                Ok(v) => v,
                Err(_) => return None,
            };

        codec::aes_ctr_crypt_in_place(
            self.key.dictionary_key(),
            &nonce,
            &mut buf[encrypted_start..end],
        );
        let hmac = codec::hmac_sha384(self.key.hello_hmac_key(), &buf[..end]);
        buf[end..end + HELLO_HMAC_SIZE].copy_from_slice(&hmac);
        let len = end + HELLO_HMAC_SIZE;

        // Legacy MAC for transit through version-unaware relays.
        if protocol::armor(&mut buf, len, &self.key, CipherSuite::Poly1305None).is_err() {
            return None;
        }
        if path.send(ctx, cc, &buf[..len]) {
            self.last_send.store(cc.ticks, Ordering::Relaxed);
            self.packets_out.fetch_add(1, Ordering::Relaxed);
            Some(packet_id)
        } else {
            None
        }
    }

    /// Persist this peer to the store, prefixed with its creation tick.
    pub fn save(&self, ctx: &Context, _cc: &CallContext) {
        let mut blob = Vec::with_capacity(96);
        blob.extend_from_slice(&(self.created as u64).to_be_bytes());
        if self.marshal_into(&mut blob).is_ok() {
            ctx.store
                .put(ObjectKind::Peer, [self.address().to_u64(), 0], &blob);
        }
    }

    fn marshal_into(&self, out: &mut Vec<u8>) -> Result<(), BufError> {
        let mut scratch = [0u8; 128];
        let mut w = Writer::new(&mut scratch, 0);
        w.write_u8(0)?; // format
        self.identity.marshal(&mut w)?;
        match self.remote_version() {
            Some(v) => {
                w.write_u8(1)?;
                w.write_u8(v.proto)?;
                w.write_u8(v.major)?;
                w.write_u8(v.minor)?;
                w.write_u16(v.revision)?;
            }
            None => w.write_u8(0)?,
        }
        let n = w.position();
        out.extend_from_slice(&scratch[..n]);
        Ok(())
    }

    /// Rebuild a peer from a cache blob body (creation prefix already
    /// stripped). The identity is re-validated and keys re-derived.
    pub fn unmarshal(
        local: &Identity,
        limits: PeerLimitsConfig,
        data: &[u8],
        ticks: i64,
    ) -> Result<Self, IdentityError> {
        let mut r = Reader::new(data, 0);
        let format = r.read_u8()?;
        if format != 0 {
            return Err(IdentityError::UnknownKeyType(format));
        }
        let identity = Identity::unmarshal(&mut r)?;
        if !identity.locally_validate() {
            return Err(IdentityError::ProofOfWorkFailed);
        }
        let peer = Self::new(local, identity, limits, ticks)?;
        if r.read_u8()? == 1 {
            let proto = r.read_u8()?;
            let major = r.read_u8()?;
            let minor = r.read_u8()?;
            let revision = r.read_u16()?;
            peer.set_remote_version(RemoteVersion {
                proto,
                major,
                minor,
                revision,
            });
        }
        Ok(peer)
    }
}

/// Write the HELLO payload fields; returns (encrypted section start, end).
fn write_hello_payload(
    ctx: &Context,
    cc: &CallContext,
    buf: &mut Buf,
    path: &Arc<Path>,
    nonce: &[u8; codec::DICTIONARY_NONCE_SIZE],
    dict_bytes: &[u8],
) -> Result<(usize, usize), BufError> {
    let mut w = Writer::new(&mut buf[..], PAYLOAD_START);
    w.write_u8(PROTO_VERSION)?;
    w.write_u8(VERSION_MAJOR)?;
    w.write_u8(VERSION_MINOR)?;
    w.write_u16(VERSION_REVISION)?;
    w.write_u64(cc.ticks as u64)?;
    ctx.identity.marshal(&mut w)?;
    // The address we are sending to, for the remote's NAT self-detection.
    path.address().marshal(&mut w)?;
    w.write_bytes(&[0u8; 4])?; // reserved
    w.write_bytes(nonce)?;
    let encrypted_start = w.position();
    w.write_u16(0)?; // reserved
    w.write_u16(dict_bytes.len() as u16)?;
    w.write_bytes(dict_bytes)?;
    Ok((encrypted_start, w.position()))
}

impl fmt::Debug for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Peer")
            .field("address", &self.address())
            .field("last_receive", &self.last_receive())
            .field("latency", &self.latency())
            .finish()
    }
}
