//! One physical path: a (local socket, remote address) pair.

use std::fmt;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

use crate::context::{CallContext, Context};
use crate::endpoint::TransportAddr;
use crate::protocol::PATH_ALIVE_TIMEOUT;

/// Map key identifying one physical path.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct PathKey {
    pub local_socket: i64,
    pub remote: TransportAddr,
}

/// One (local socket, remote address) pair with liveness timestamps.
///
/// Paths are owned by the topology's path map; peers and the defragmenter
/// hold the same `Arc` handles. A path with no holder other than the map is
/// reclaimed by the topology's garbage collector.
pub struct Path {
    local_socket: i64,
    address: TransportAddr,
    last_in: AtomicI64,
    last_out: AtomicI64,
    bytes_in: AtomicU64,
}

impl Path {
    pub fn new(local_socket: i64, address: TransportAddr) -> Self {
        Self {
            local_socket,
            address,
            last_in: AtomicI64::new(0),
            last_out: AtomicI64::new(0),
            bytes_in: AtomicU64::new(0),
        }
    }

    pub fn key(&self) -> PathKey {
        PathKey {
            local_socket: self.local_socket,
            remote: self.address,
        }
    }

    pub fn local_socket(&self) -> i64 {
        self.local_socket
    }

    pub fn address(&self) -> &TransportAddr {
        &self.address
    }

    /// Record an inbound datagram on this path.
    pub fn received(&self, ticks: i64, bytes: usize) {
        self.last_in.store(ticks, Ordering::Relaxed);
        self.bytes_in.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    /// Send a datagram out this path.
    pub fn send(&self, ctx: &Context, cc: &CallContext, data: &[u8]) -> bool {
        let ok = ctx
            .transport
            .send_datagram(self.local_socket, &self.address, data);
        if ok {
            self.last_out.store(cc.ticks, Ordering::Relaxed);
        }
        ok
    }

    pub fn last_in(&self) -> i64 {
        self.last_in.load(Ordering::Relaxed)
    }

    pub fn last_out(&self) -> i64 {
        self.last_out.load(Ordering::Relaxed)
    }

    pub fn bytes_in(&self) -> u64 {
        self.bytes_in.load(Ordering::Relaxed)
    }

    pub fn alive(&self, ticks: i64) -> bool {
        ticks - self.last_in() < PATH_ALIVE_TIMEOUT
    }
}

impl fmt::Debug for Path {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Path")
            .field("local_socket", &self.local_socket)
            .field("address", &self.address)
            .field("last_in", &self.last_in())
            .finish()
    }
}
