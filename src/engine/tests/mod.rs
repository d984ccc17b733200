use std::sync::Arc;

use super::Engine;
use crate::buf::Buf;
use crate::config::{EngineConfig, PeerLimitsConfig};
use crate::context::{CallContext, Context};
use crate::endpoint::TransportAddr;
use crate::identity::{Identity, SymmetricKey};
use crate::peer::Peer;
use crate::protocol::{self, CipherSuite, Verb, PAYLOAD_START};
use crate::store::MemoryStore;
use crate::test_support::{
    test_transport_addr, RecordingRelay, RecordingTrace, RecordingTransport, RecordingUpper,
};


/// A node under test: an engine plus handles to its recording collaborators.
pub(super) struct TestNode {
    pub engine: Engine,
    pub addr: TransportAddr,
    pub transport: Arc<RecordingTransport>,
    pub trace: Arc<RecordingTrace>,
    pub upper: Arc<RecordingUpper>,
    pub store: Arc<MemoryStore>,
}

impl TestNode {
    pub fn identity(&self) -> &Identity {
        &self.engine.context().identity
    }
}

pub(super) fn make_node(port: u16) -> TestNode {
    make_node_with_relay(port, None)
}

pub(super) fn make_node_with_relay(
    port: u16,
    relay: Option<Arc<RecordingRelay>>,
) -> TestNode {
    let transport = Arc::new(RecordingTransport::default());
    let trace = Arc::new(RecordingTrace::default());
    let upper = Arc::new(RecordingUpper::default());
    let store = Arc::new(MemoryStore::new());
    let ctx = Context {
        identity: Identity::generate(),
        store: store.clone(),
        trace: trace.clone(),
        transport: transport.clone(),
        upper: upper.clone(),
        relay: relay.map(|r| r as Arc<dyn crate::context::RelayHook>),
    };
    TestNode {
        engine: Engine::new(ctx, EngineConfig::default()),
        addr: test_transport_addr(port),
        transport,
        trace,
        upper,
        store,
    }
}

/// Feed raw datagram bytes into a node as if they arrived from `from`.
pub(super) fn deliver(node: &TestNode, cc: &CallContext, from: TransportAddr, bytes: &[u8]) {
    let buf = Arc::new(Buf::from_bytes(bytes).unwrap());
    node.engine.on_remote_packet(cc, 1, from, buf, bytes.len());
}

/// Move every datagram `from` sent to `to` across the wire. Returns how
/// many were delivered.
pub(super) fn pump(cc: &CallContext, from: &TestNode, to: &TestNode) -> usize {
    let mut delivered = 0;
    for (_, remote, data) in from.transport.take() {
        if remote == to.addr {
            deliver(to, cc, from.addr, &data);
            delivered += 1;
        }
    }
    delivered
}

/// Register `target` as a known peer of `owner` (as if learned earlier).
pub(super) fn peer_entry(owner: &TestNode, target: &TestNode, cc: &CallContext) -> Arc<Peer> {
    let peer = Peer::new(
        &owner.engine.context().identity,
        target.engine.context().identity.clone(),
        PeerLimitsConfig::default(),
        cc.ticks,
    )
    .unwrap();
    owner
        .engine
        .topology()
        .add(owner.engine.context(), cc, Arc::new(peer))
}

/// Run a full HELLO exchange so both nodes know each other and have live
/// paths.
pub(super) fn handshake(cc: &CallContext, a: &TestNode, b: &TestNode) {
    let peer_b = peer_entry(a, b, cc);
    let path = a.engine.topology().path(1, b.addr);
    assert!(a.engine.send_hello(cc, &peer_b, &path));
    assert_eq!(pump(cc, a, b), 1, "HELLO should reach the other node");
    assert_eq!(pump(cc, b, a), 1, "OK(HELLO) should come back");
}

/// The symmetric key `sender` uses toward `receiver`, derived out of band.
pub(super) fn key_between(sender: &Identity, receiver: &Identity) -> SymmetricKey {
    SymmetricKey::new(sender.agree(receiver).unwrap())
}

/// Build and armor a packet from `sender` to `receiver` with the given verb
/// and payload. Returns the wire bytes and the packet ID.
pub(super) fn armored_packet(
    sender: &Identity,
    receiver: &Identity,
    key: &SymmetricKey,
    verb: Verb,
    payload: &[u8],
) -> (Vec<u8>, u64) {
    let mut buf = Buf::new();
    let packet_id = key.next_message(sender.address(), receiver.address());
    let mut at = protocol::new_packet(
        &mut buf,
        packet_id,
        receiver.address(),
        sender.address(),
        verb,
    );
    buf[at..at + payload.len()].copy_from_slice(payload);
    at += payload.len();
    protocol::armor(&mut buf, at, key, CipherSuite::Poly1305Salsa2012).unwrap();
    (buf[..at].to_vec(), packet_id)
}

/// Decode an armored packet with `key` as its receiver would, asserting the
/// MAC. Returns the cleartext packet bytes.
pub(super) fn decode_armored(key: &SymmetricKey, wire: &[u8]) -> Vec<u8> {
    use crate::buf::StreamTransform;
    use crate::codec::SalsaPolyStream;
    use crate::protocol::{ENCRYPTED_SECTION_START, MAC_INDEX};

    let per_packet_key = protocol::salsa_derive_per_packet_key(
        key.cipher_key(),
        &wire[..protocol::FLAGS_INDEX + 1],
        wire.len(),
    );
    let mut iv = [0u8; 8];
    iv.copy_from_slice(&wire[..8]);
    let mut stream = SalsaPolyStream::new(&per_packet_key, &iv);
    let mut clear = wire.to_vec();
    let (_, tail) = clear.split_at_mut(ENCRYPTED_SECTION_START);
    stream.apply(tail, &wire[ENCRYPTED_SECTION_START..]);
    let tag = stream.finish();
    assert_eq!(&tag[..8], &wire[MAC_INDEX..MAC_INDEX + 8], "MAC mismatch");
    clear
}

/// Shorthand for a payload-bearing user message body.
pub(super) fn user_message_payload(message_type: u64, body: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(8 + body.len());
    out.extend_from_slice(&message_type.to_be_bytes());
    out.extend_from_slice(body);
    out
}

pub(super) fn cc(ticks: i64) -> CallContext {
    CallContext::new(ticks)
}

/// Payload offset helper for reading reply bodies.
pub(super) const REPLY_HEADER: usize = PAYLOAD_START + 1 + 8;
