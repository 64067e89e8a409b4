//! Server-side Shadowsocks 2022 services.
//!
//! This crate provides:
//! - [`Service`]: single-user stream (TCP) and datagram (UDP) protocol
//!   state machines behind a pre-shared key
//! - [`MultiService`]: the same listener serving many users via the
//!   encrypted identity header
//! - The [`Handler`] seam through which decrypted streams and packets
//!   are delivered to the host
//!
//! Transport acceptance stays outside: the host owns the TCP listener
//! and UDP socket and feeds accepted connections and received datagrams
//! into the service. All protocol faults are fatal to the offending
//! connection or packet and surface to the caller wrapped with the
//! source address; nothing is retried here.

#![forbid(unsafe_code)]

pub mod multi;
pub mod sessions;
pub mod stream;
pub mod udp;

pub use multi::MultiService;
pub use stream::{ServerReadHalf, ServerStream, ServerWriteHalf};
pub use udp::SessionWriter;

pub use sable_crypto::Method;

use std::fmt;
use std::hash::Hash;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use bytes::{Bytes, BytesMut};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use zeroize::Zeroizing;

use sable_crypto::{derive_psk, SaltPool};
use sable_proto::{Address, ProtocolError, SALT_WINDOW_SECS};

use crate::sessions::SessionCache;
use crate::udp::UdpCrypto;

/// Protocol tag carried in delivered metadata.
pub const PROTOCOL_NAME: &str = "shadowsocks";

/// Sessions kept in the UDP cache before the oldest is evicted.
const MAX_UDP_SESSIONS: usize = 4096;

/// Byte stream the stream service can run over.
pub trait StreamIo: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin> StreamIo for T {}

/// Type-erased transport handed to [`ServerStream`].
pub type BoxedStream = Box<dyn StreamIo>;

/// User identifier for multi-user mode: anything hashable and cheap to
/// clone. The protocol itself never sees it.
pub trait UserKey: Clone + Eq + Hash + fmt::Debug + Send + Sync + 'static {}
impl<T: Clone + Eq + Hash + fmt::Debug + Send + Sync + 'static> UserKey for T {}

/// Metadata delivered with an accepted stream.
#[derive(Debug, Clone)]
pub struct StreamMetadata<U = ()> {
    pub source: SocketAddr,
    pub destination: Address,
    pub user: Option<U>,
    pub protocol: &'static str,
}

/// Metadata delivered with a validated datagram.
#[derive(Debug, Clone)]
pub struct PacketMetadata<U = ()> {
    pub source: SocketAddr,
    pub destination: Address,
    pub user: Option<U>,
    pub protocol: &'static str,
}

/// Host-side sink for sealed reply datagrams.
#[async_trait]
pub trait PacketSender: Send + Sync {
    async fn send_packet(&self, packet: Bytes, to: SocketAddr) -> io::Result<()>;
}

/// The host's entry points for decrypted traffic.
///
/// `handle_stream` receives a fully validated connection positioned at
/// the first payload byte. `handle_packet` receives one validated inner
/// datagram plus a [`SessionWriter`] that seals replies back to the
/// client; the writer may be kept and used after the call returns.
#[async_trait]
pub trait Handler<U: UserKey = ()>: Send + Sync {
    async fn handle_stream(
        &self,
        stream: ServerStream,
        metadata: StreamMetadata<U>,
    ) -> io::Result<()>;

    async fn handle_packet(
        &self,
        session_id: u64,
        writer: SessionWriter,
        payload: BytesMut,
        metadata: PacketMetadata<U>,
    ) -> io::Result<()>;
}

/// A stream-path fault, wrapped with the peer that caused it.
#[derive(Debug, Error)]
#[error("connection from {peer}: {cause}")]
pub struct ConnError {
    pub peer: SocketAddr,
    #[source]
    pub cause: ProtocolError,
}

/// A datagram-path fault, wrapped with the peer that caused it.
#[derive(Debug, Error)]
#[error("packet from {peer}: {cause}")]
pub struct PacketError {
    pub peer: SocketAddr,
    #[source]
    pub cause: ProtocolError,
}

/// Single-user Shadowsocks 2022 service.
pub struct Service {
    pub(crate) method: Method,
    pub(crate) psk: Zeroizing<Vec<u8>>,
    pub(crate) udp: UdpCrypto,
    pub(crate) replay: SaltPool,
    pub(crate) sessions: SessionCache,
}

impl Service {
    /// Build a service from raw PSK bytes.
    ///
    /// A PSK longer than the method's key length is coerced down with
    /// BLAKE3; a shorter one is rejected.
    pub fn new(method: Method, psk: &[u8], udp_timeout: Duration) -> Result<Self, ProtocolError> {
        let psk = normalize_psk(method, psk)?;
        let udp = match method.udp_cipher(&psk)? {
            Some(cipher) => UdpCrypto::Whole(Arc::new(cipher)),
            None => match method.block_cipher(&psk)? {
                Some(block) => UdpCrypto::Header(Arc::new(block)),
                None => return Err(ProtocolError::BadKey),
            },
        };
        Ok(Self {
            method,
            psk,
            udp,
            replay: SaltPool::new(Duration::from_secs(SALT_WINDOW_SECS)),
            sessions: SessionCache::new(udp_timeout, MAX_UDP_SESSIONS),
        })
    }

    /// Build a service from a base64 password, the configuration form.
    pub fn with_password(
        method: Method,
        password: &str,
        udp_timeout: Duration,
    ) -> Result<Self, ProtocolError> {
        let psk = decode_password(password)?;
        Self::new(method, &psk, udp_timeout)
    }

    pub fn method(&self) -> Method {
        self.method
    }

    /// Live UDP sessions, for observability.
    pub fn active_udp_sessions(&self) -> usize {
        self.sessions.len()
    }
}

impl fmt::Debug for Service {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Service")
            .field("method", &self.method)
            .finish_non_exhaustive()
    }
}

pub(crate) fn normalize_psk(
    method: Method,
    psk: &[u8],
) -> Result<Zeroizing<Vec<u8>>, ProtocolError> {
    let want = method.key_len();
    if psk.len() < want {
        Err(ProtocolError::BadKey)
    } else if psk.len() > want {
        Ok(derive_psk(psk, want))
    } else {
        Ok(Zeroizing::new(psk.to_vec()))
    }
}

pub(crate) fn decode_password(password: &str) -> Result<Zeroizing<Vec<u8>>, ProtocolError> {
    if password.is_empty() {
        return Err(ProtocolError::MissingKey);
    }
    BASE64
        .decode(password)
        .map(Zeroizing::new)
        .map_err(|_| ProtocolError::BadKey)
}
