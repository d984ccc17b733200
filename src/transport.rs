//! Physical datagram transport capability.

use crate::endpoint::TransportAddr;

/// Non-blocking datagram send owned by the embedder.
///
/// `local_socket` identifies which bound socket to send from; it is the
/// same opaque handle the embedder passed into the receive path. Sends are
/// fire-and-forget; the return value only reports local submission failure.
pub trait Transport: Send + Sync {
    fn send_datagram(&self, local_socket: i64, remote: &TransportAddr, data: &[u8]) -> bool;
}
