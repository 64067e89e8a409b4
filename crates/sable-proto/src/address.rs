//! Socks-style destination addresses.
//!
//! Wire form is a tagged union followed by a big-endian port:
//!
//! ```text
//! 0x01 || ipv4 (4 bytes)        || port (u16)
//! 0x03 || len (u8) || domain    || port (u16)
//! 0x04 || ipv6 (16 bytes)       || port (u16)
//! ```

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use bytes::{Buf, BufMut};

use crate::ProtocolError;

const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_IPV6: u8 = 0x04;

/// A destination address: a socket address or an unresolved domain name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Address {
    Socket(SocketAddr),
    Domain(String, u16),
}

impl Address {
    /// Decode an address from `buf`, advancing past it.
    pub fn read_from(buf: &mut impl Buf) -> Result<Self, ProtocolError> {
        if buf.remaining() < 1 {
            return Err(ProtocolError::BadHeader);
        }
        match buf.get_u8() {
            ATYP_IPV4 => {
                if buf.remaining() < 4 + 2 {
                    return Err(ProtocolError::BadHeader);
                }
                let mut octets = [0u8; 4];
                buf.copy_to_slice(&mut octets);
                let port = buf.get_u16();
                Ok(Address::Socket(SocketAddr::new(
                    IpAddr::V4(Ipv4Addr::from(octets)),
                    port,
                )))
            }
            ATYP_DOMAIN => {
                if buf.remaining() < 1 {
                    return Err(ProtocolError::BadHeader);
                }
                let len = buf.get_u8() as usize;
                if len == 0 || buf.remaining() < len + 2 {
                    return Err(ProtocolError::BadHeader);
                }
                let mut name = vec![0u8; len];
                buf.copy_to_slice(&mut name);
                let name = String::from_utf8(name).map_err(|_| ProtocolError::BadHeader)?;
                let port = buf.get_u16();
                Ok(Address::Domain(name, port))
            }
            ATYP_IPV6 => {
                if buf.remaining() < 16 + 2 {
                    return Err(ProtocolError::BadHeader);
                }
                let mut octets = [0u8; 16];
                buf.copy_to_slice(&mut octets);
                let port = buf.get_u16();
                Ok(Address::Socket(SocketAddr::new(
                    IpAddr::V6(Ipv6Addr::from(octets)),
                    port,
                )))
            }
            _ => Err(ProtocolError::BadHeader),
        }
    }

    /// Encode the address into `buf`.
    pub fn write_to(&self, buf: &mut impl BufMut) {
        match self {
            Address::Socket(SocketAddr::V4(addr)) => {
                buf.put_u8(ATYP_IPV4);
                buf.put_slice(&addr.ip().octets());
                buf.put_u16(addr.port());
            }
            Address::Socket(SocketAddr::V6(addr)) => {
                buf.put_u8(ATYP_IPV6);
                buf.put_slice(&addr.ip().octets());
                buf.put_u16(addr.port());
            }
            Address::Domain(name, port) => {
                buf.put_u8(ATYP_DOMAIN);
                buf.put_u8(name.len() as u8);
                buf.put_slice(name.as_bytes());
                buf.put_u16(*port);
            }
        }
    }

    /// Serialized length in bytes.
    pub fn serialized_len(&self) -> usize {
        match self {
            Address::Socket(SocketAddr::V4(_)) => 1 + 4 + 2,
            Address::Socket(SocketAddr::V6(_)) => 1 + 16 + 2,
            Address::Domain(name, _) => 1 + 1 + name.len() + 2,
        }
    }

    pub fn port(&self) -> u16 {
        match self {
            Address::Socket(addr) => addr.port(),
            Address::Domain(_, port) => *port,
        }
    }
}

impl From<SocketAddr> for Address {
    fn from(addr: SocketAddr) -> Self {
        Address::Socket(addr)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Address::Socket(addr) => addr.fmt(f),
            Address::Domain(name, port) => write!(f, "{}:{}", name, port),
        }
    }
}
