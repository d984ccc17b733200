//! Physical endpoint addressing.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use thiserror::Error;

use crate::buf::{Reader, Writer};

/// Wire family tags for marshalled addresses.
const FAMILY_NIL: u8 = 0x00;
const FAMILY_IPV4: u8 = 0x04;
const FAMILY_IPV6: u8 = 0x06;

/// Errors from endpoint marshalling.
#[derive(Debug, Error)]
pub enum EndpointError {
    #[error("unknown address family: 0x{0:02x}")]
    UnknownFamily(u8),

    #[error("address truncated: {0}")]
    Truncated(#[from] crate::buf::BufError),
}

/// Address of a remote transport endpoint (IP and port).
///
/// Marshalled as a family byte followed by the raw address bytes and a
/// big-endian port. A nil marker is written for "no address" slots.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct TransportAddr(SocketAddr);

impl TransportAddr {
    pub fn new(addr: SocketAddr) -> Self {
        Self(addr)
    }

    pub fn socket_addr(&self) -> SocketAddr {
        self.0
    }

    pub fn ip(&self) -> IpAddr {
        self.0.ip()
    }

    pub fn port(&self) -> u16 {
        self.0.port()
    }

    pub fn marshal(&self, w: &mut Writer<'_>) -> Result<(), crate::buf::BufError> {
        match self.0.ip() {
            IpAddr::V4(ip) => {
                w.write_u8(FAMILY_IPV4)?;
                w.write_bytes(&ip.octets())?;
            }
            IpAddr::V6(ip) => {
                w.write_u8(FAMILY_IPV6)?;
                w.write_bytes(&ip.octets())?;
            }
        }
        w.write_u16(self.0.port())
    }

    /// Parse a marshalled address. `Ok(None)` for the nil marker.
    pub fn unmarshal(r: &mut Reader<'_>) -> Result<Option<Self>, EndpointError> {
        match r.read_u8()? {
            FAMILY_NIL => Ok(None),
            FAMILY_IPV4 => {
                let mut octets = [0u8; 4];
                octets.copy_from_slice(r.read_bytes(4)?);
                let port = r.read_u16()?;
                Ok(Some(Self(SocketAddr::new(
                    IpAddr::V4(Ipv4Addr::from(octets)),
                    port,
                ))))
            }
            FAMILY_IPV6 => {
                let mut octets = [0u8; 16];
                octets.copy_from_slice(r.read_bytes(16)?);
                let port = r.read_u16()?;
                Ok(Some(Self(SocketAddr::new(
                    IpAddr::V6(Ipv6Addr::from(octets)),
                    port,
                ))))
            }
            other => Err(EndpointError::UnknownFamily(other)),
        }
    }

    /// Write the nil marker into an address slot.
    pub fn marshal_nil(w: &mut Writer<'_>) -> Result<(), crate::buf::BufError> {
        w.write_u8(FAMILY_NIL)
    }
}

impl From<SocketAddr> for TransportAddr {
    fn from(addr: SocketAddr) -> Self {
        Self(addr)
    }
}

impl fmt::Display for TransportAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Debug for TransportAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TransportAddr({})", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn marshal_round_trips_v4_and_v6() {
        for s in ["192.0.2.7:9993", "[2001:db8::1]:40000"] {
            let addr = TransportAddr::new(s.parse().unwrap());
            let mut buf = [0u8; 32];
            let mut w = Writer::new(&mut buf, 0);
            addr.marshal(&mut w).unwrap();
            let n = w.position();

            let mut r = Reader::new(&buf[..n], 0);
            assert_eq!(TransportAddr::unmarshal(&mut r).unwrap(), Some(addr));
        }
    }

    #[test]
    fn nil_marker_parses_as_none() {
        let buf = [FAMILY_NIL];
        let mut r = Reader::new(&buf, 0);
        assert_eq!(TransportAddr::unmarshal(&mut r).unwrap(), None);
    }

    #[test]
    fn unknown_family_is_rejected() {
        let buf = [0x09u8, 0, 0];
        let mut r = Reader::new(&buf, 0);
        assert!(matches!(
            TransportAddr::unmarshal(&mut r),
            Err(EndpointError::UnknownFamily(0x09))
        ));
    }
}
