//! Structured drop/event reporting.
//!
//! Every packet-level failure is a silent drop on the wire paired with an
//! event through the [`TraceSink`]. Each call site passes a fixed 32-bit
//! tag so the emitting location can be identified across builds without
//! relying on log text.

use std::fmt;

use crate::context::CallContext;
use crate::endpoint::TransportAddr;
use crate::identity::Identity;
use crate::protocol::Verb;

/// Why an incoming packet was dropped.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PacketDropReason {
    Unspecified,
    MalformedPacket,
    MacFailed,
    InvalidObject,
    InvalidCompressedData,
    UnrecognizedVerb,
    ReplyNotExpected,
    PeerTooOld,
    RateLimitExceeded,
}

impl fmt::Display for PacketDropReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PacketDropReason::Unspecified => "unspecified",
            PacketDropReason::MalformedPacket => "malformed packet",
            PacketDropReason::MacFailed => "MAC failed",
            PacketDropReason::InvalidObject => "invalid object",
            PacketDropReason::InvalidCompressedData => "invalid compressed data",
            PacketDropReason::UnrecognizedVerb => "unrecognized verb",
            PacketDropReason::ReplyNotExpected => "reply not expected",
            PacketDropReason::PeerTooOld => "peer too old",
            PacketDropReason::RateLimitExceeded => "rate limit exceeded",
        };
        write!(f, "{}", s)
    }
}

/// Pluggable sink for drop events and unexpected internal failures.
pub trait TraceSink: Send + Sync {
    #[allow(clippy::too_many_arguments)]
    fn incoming_packet_dropped(
        &self,
        cc: &CallContext,
        tag: u32,
        packet_id: u64,
        peer: Option<&Identity>,
        path_addr: Option<&TransportAddr>,
        hops: u8,
        verb: Option<Verb>,
        reason: PacketDropReason,
    );

    fn unexpected_error(&self, cc: &CallContext, tag: u32, message: &str);
}

/// Default sink that forwards events to the `tracing` subscriber.
pub struct LogSink;

impl TraceSink for LogSink {
    fn incoming_packet_dropped(
        &self,
        _cc: &CallContext,
        tag: u32,
        packet_id: u64,
        peer: Option<&Identity>,
        path_addr: Option<&TransportAddr>,
        hops: u8,
        verb: Option<Verb>,
        reason: PacketDropReason,
    ) {
        let peer = peer.map(|p| p.address().to_string()).unwrap_or_default();
        let path = path_addr.map(TransportAddr::to_string).unwrap_or_default();
        let verb = verb.map(|v| v.to_string()).unwrap_or_default();
        tracing::debug!(
            tag = format_args!("{:08x}", tag),
            packet_id = format_args!("{:016x}", packet_id),
            peer = %peer,
            path = %path,
            hops,
            verb = %verb,
            %reason,
            "incoming packet dropped"
        );
    }

    fn unexpected_error(&self, _cc: &CallContext, tag: u32, message: &str) {
        tracing::warn!(tag = format_args!("{:08x}", tag), message, "unexpected error");
    }
}
