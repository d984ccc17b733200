//! Shared fixtures for unit and scenario tests.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::buf::Buf;
use crate::context::{CallContext, Context, RelayHook, UpperLayer};
use crate::endpoint::TransportAddr;
use crate::identity::{Address, Identity};
use crate::path::Path;
use crate::peer::Peer;
use crate::protocol::Verb;
use crate::store::MemoryStore;
use crate::trace::{PacketDropReason, TraceSink};
use crate::transport::Transport;

pub(crate) fn test_transport_addr(port: u16) -> TransportAddr {
    TransportAddr::new(format!("192.0.2.1:{}", port).parse().unwrap())
}

/// Upper layer that accepts everything and records forwarded verbs.
#[derive(Default)]
pub(crate) struct RecordingUpper {
    pub verbs: Mutex<Vec<(Verb, u8, usize)>>,
    pub user_messages: Mutex<Vec<(u64, Vec<u8>)>>,
}

impl UpperLayer for RecordingUpper {
    fn handle_verb(
        &self,
        _cc: &CallContext,
        _packet_id: u64,
        auth: u8,
        _path: &Arc<Path>,
        _peer: &Arc<Peer>,
        verb: Verb,
        packet: &[u8],
    ) -> bool {
        self.verbs.lock().push((verb, auth, packet.len()));
        true
    }

    fn user_message(&self, _cc: &CallContext, _peer: &Arc<Peer>, message_type: u64, payload: &[u8]) {
        self.user_messages
            .lock()
            .push((message_type, payload.to_vec()));
    }
}

/// Transport that captures every outgoing datagram.
#[derive(Default)]
pub(crate) struct RecordingTransport {
    pub sent: Mutex<Vec<(i64, TransportAddr, Vec<u8>)>>,
}

impl RecordingTransport {
    pub fn take(&self) -> Vec<(i64, TransportAddr, Vec<u8>)> {
        std::mem::take(&mut *self.sent.lock())
    }

    pub fn sent_count(&self) -> usize {
        self.sent.lock().len()
    }
}

impl Transport for RecordingTransport {
    fn send_datagram(&self, local_socket: i64, remote: &TransportAddr, data: &[u8]) -> bool {
        self.sent.lock().push((local_socket, *remote, data.to_vec()));
        true
    }
}

/// Trace sink that records drop reasons and unexpected errors.
#[derive(Default)]
pub(crate) struct RecordingTrace {
    pub drops: Mutex<Vec<(u32, PacketDropReason)>>,
    pub errors: Mutex<Vec<String>>,
}

impl RecordingTrace {
    pub fn reasons(&self) -> Vec<PacketDropReason> {
        self.drops.lock().iter().map(|(_, r)| *r).collect()
    }
}

impl TraceSink for RecordingTrace {
    fn incoming_packet_dropped(
        &self,
        _cc: &CallContext,
        tag: u32,
        _packet_id: u64,
        _peer: Option<&Identity>,
        _path_addr: Option<&TransportAddr>,
        _hops: u8,
        _verb: Option<Verb>,
        reason: PacketDropReason,
    ) {
        self.drops.lock().push((tag, reason));
    }

    fn unexpected_error(&self, _cc: &CallContext, _tag: u32, message: &str) {
        self.errors.lock().push(message.to_string());
    }
}

/// Relay hook that records handed-off datagrams.
#[derive(Default)]
pub(crate) struct RecordingRelay {
    pub relayed: Mutex<Vec<(Address, Vec<u8>)>>,
}

impl RelayHook for RecordingRelay {
    fn relay(
        &self,
        _cc: &CallContext,
        _path: &Arc<Path>,
        destination: Address,
        data: &Arc<Buf>,
        len: usize,
    ) {
        self.relayed
            .lock()
            .push((destination, data[..len].to_vec()));
    }
}

/// A context with recording collaborators and a fresh identity.
pub(crate) fn test_context() -> (Context, Arc<MemoryStore>) {
    let store = Arc::new(MemoryStore::new());
    let ctx = Context {
        identity: Identity::generate(),
        store: store.clone(),
        trace: Arc::new(RecordingTrace::default()),
        transport: Arc::new(RecordingTransport::default()),
        upper: Arc::new(RecordingUpper::default()),
        relay: None,
    };
    (ctx, store)
}
