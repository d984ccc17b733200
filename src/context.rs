//! Execution context and injected collaborator capabilities.
//!
//! All global state lives in [`Context`], owned by the embedder and handed
//! to the engine at construction. External subsystems (persistent storage,
//! tracing, the physical socket layer, the virtual-ethernet layer above,
//! relay policy) are capability traits; the core calls them and never
//! assumes a concrete backend.

use std::sync::Arc;

use crate::buf::Buf;
use crate::identity::{Address, Identity};
use crate::path::Path;
use crate::peer::Peer;
use crate::protocol::Verb;
use crate::store::Store;
use crate::trace::TraceSink;
use crate::transport::Transport;

/// Authentication result flag: the packet MAC verified.
pub const AUTH_AUTHENTICATED: u8 = 0x01;

/// Authentication result flag: the payload was encrypted in transit.
pub const AUTH_ENCRYPTED: u8 = 0x02;

/// Per-call context: the current monotonic tick in milliseconds.
///
/// Carried through every operation instead of being read from a clock so
/// that callers control time, which keeps expiry and retry behavior
/// deterministic under test.
#[derive(Clone, Copy, Debug)]
pub struct CallContext {
    pub ticks: i64,
}

impl CallContext {
    pub fn new(ticks: i64) -> Self {
        Self { ticks }
    }
}

/// The layer above this one: receives verbs that terminate outside the
/// packet core (virtual-ethernet frames, multicast control, network config)
/// and application user messages.
pub trait UpperLayer: Send + Sync {
    /// Handle a forwarded verb. `packet` is the full assembled cleartext
    /// packet; `auth` carries the `AUTH_*` flags. Returns whether the packet
    /// was meaningfully consumed (drives peer liveness accounting).
    fn handle_verb(
        &self,
        cc: &CallContext,
        packet_id: u64,
        auth: u8,
        path: &Arc<Path>,
        peer: &Arc<Peer>,
        verb: Verb,
        packet: &[u8],
    ) -> bool;

    /// Deliver an application-defined user message.
    fn user_message(&self, cc: &CallContext, peer: &Arc<Peer>, message_type: u64, payload: &[u8]);
}

/// Hook invoked for datagrams addressed to another node. The core performs
/// no authentication and no further processing on relayed packets; policy
/// (forward, drop, rate limit) belongs entirely to the hook.
pub trait RelayHook: Send + Sync {
    fn relay(
        &self,
        cc: &CallContext,
        path: &Arc<Path>,
        destination: Address,
        data: &Arc<Buf>,
        len: usize,
    );
}

/// Everything the packet core needs from its embedder.
pub struct Context {
    /// This node's identity, with secret key material.
    pub identity: Identity,
    /// Persistent object store (peer cache).
    pub store: Arc<dyn Store>,
    /// Structured drop/event reporter.
    pub trace: Arc<dyn TraceSink>,
    /// Non-blocking datagram send.
    pub transport: Arc<dyn Transport>,
    /// The layer above.
    pub upper: Arc<dyn UpperLayer>,
    /// Relay policy for packets not addressed to us; `None` drops them.
    pub relay: Option<Arc<dyn RelayHook>>,
}
