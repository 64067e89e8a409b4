//! Wire-level types and constants for the Shadowsocks 2022 protocol.
//!
//! This crate provides:
//! - Protocol constants (header types, windows, chunk limits)
//! - The protocol error taxonomy
//! - Socks-style address serialization
//! - The AEAD record layer used by the stream transport

#![forbid(unsafe_code)]

pub mod address;
pub mod framing;

pub use address::Address;
pub use framing::{RecordReader, RecordWriter};

use std::time::{SystemTime, UNIX_EPOCH};

use thiserror::Error;

/// Header type byte of client-to-server headers.
pub const HEADER_TYPE_CLIENT: u8 = 0x00;

/// Header type byte of server-to-client headers.
pub const HEADER_TYPE_SERVER: u8 = 0x01;

/// Maximum accepted clock skew between peers, in seconds.
pub const TIMESTAMP_WINDOW_SECS: u64 = 30;

/// How long a request salt stays inadmissible.
pub const SALT_WINDOW_SECS: u64 = 60;

/// Maximum plaintext payload of one stream chunk.
pub const MAX_CHUNK_SIZE: usize = 0xFFFF;

/// Request fixed header: type + timestamp + variable-chunk length.
pub const REQUEST_FIXED_LEN: usize = 1 + 8 + 2;

/// Response fixed header for key/salt length `l`:
/// type + timestamp + request salt echo + initial payload length.
pub const fn response_fixed_len(l: usize) -> usize {
    1 + 8 + l + 2
}

/// Seconds since the Unix epoch.
pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Protocol fault taxonomy.
///
/// Every variant is fatal to the offending connection or packet; nothing
/// at this layer retries.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("missing PSK")]
    MissingKey,

    #[error("bad key")]
    BadKey,

    #[error(transparent)]
    UnknownMethod(#[from] sable_crypto::UnknownMethod),

    #[error("{0}")]
    Unsupported(&'static str),

    #[error("bad request: damaged header")]
    BadHeader,

    #[error("bad request: expected header type {expected}, got {got}")]
    BadHeaderType { expected: u8, got: u8 },

    #[error("bad request: timestamp {received} is {diff}s from now")]
    BadTimestamp { received: u64, diff: u64 },

    #[error("bad request: salt not unique")]
    SaltNotUnique,

    #[error("bad request: packet id not unique")]
    PacketIdNotUnique,

    #[error("bad request: missing payload or padding")]
    NoPadding,

    #[error("bad request: damaged padding")]
    BadPadding,

    #[error("invalid request")]
    InvalidRequest,

    #[error("decrypt failed")]
    DecryptFailed,

    #[error(transparent)]
    Crypto(#[from] sable_crypto::CryptoError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Validate a header timestamp against the local clock.
pub fn check_timestamp(epoch: u64) -> Result<(), ProtocolError> {
    let diff = unix_now().abs_diff(epoch);
    if diff > TIMESTAMP_WINDOW_SECS {
        return Err(ProtocolError::BadTimestamp {
            received: epoch,
            diff,
        });
    }
    Ok(())
}

impl ProtocolError {
    /// Convert into an `io::Error`, unwrapping an inner I/O cause.
    pub fn into_io(self) -> std::io::Error {
        match self {
            ProtocolError::Io(err) => err,
            other => std::io::Error::new(std::io::ErrorKind::InvalidData, other),
        }
    }
}
