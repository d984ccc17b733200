//! Weft: layer-1 packet core of a peer-to-peer virtual-network overlay.
//!
//! Nodes identified by a 40-bit address exchange authenticated, optionally
//! encrypted, optionally compressed packets over unreliable datagram
//! transports. This crate is the receive/dispatch core: it reassembles
//! fragments, authenticates and decrypts packets, deduplicates replays,
//! runs the HELLO handshake, resolves unknown senders through WHOIS, and
//! maintains the peer/path topology with its background garbage collection.
//!
//! The physical socket layer, the virtual-ethernet layer above, persistent
//! storage, and the trust store enumerating roots are external collaborators
//! injected through capability traits on [`Context`].

pub mod buf;
pub mod codec;
pub mod config;
pub mod context;
pub mod defrag;
pub mod dictionary;
pub mod endpoint;
pub mod engine;
pub mod expect;
pub mod identity;
pub mod path;
pub mod peer;
pub mod protocol;
pub mod rate_limit;
pub mod store;
pub mod topology;
pub mod trace;
pub mod transport;

#[cfg(test)]
pub(crate) mod test_support;

// Re-export identity types
pub use identity::{Address, Identity, IdentityError, SymmetricKey};

// Re-export buffer types
pub use buf::{Buf, BufError, PacketVector, Slice, BUF_MEM_SIZE};

// Re-export wire-level types
pub use endpoint::TransportAddr;
pub use protocol::{CipherSuite, ProtocolError, Verb};

// Re-export topology types
pub use path::Path;
pub use peer::Peer;
pub use topology::Topology;

// Re-export capability interfaces
pub use context::{
    CallContext, Context, RelayHook, UpperLayer, AUTH_AUTHENTICATED, AUTH_ENCRYPTED,
};
pub use store::{MemoryStore, ObjectKind, Store};
pub use trace::{LogSink, PacketDropReason, TraceSink};
pub use transport::Transport;

// Re-export engine types
pub use config::{DefragConfig, EngineConfig, PeerLimitsConfig, WhoisConfig};
pub use engine::Engine;
