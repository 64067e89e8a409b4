//! BLAKE3 key derivation.
//!
//! Every key in the protocol is derived from a pre-shared key:
//!
//! - the per-connection/per-session AEAD key comes from
//!   `derive_key("shadowsocks 2022 session subkey", psk || salt)`,
//! - the identity-header block cipher key comes from
//!   `derive_key("shadowsocks 2022 identity subkey", psk || salt)`,
//! - an over-long configured PSK is coerced to the method length by a
//!   plain BLAKE3 XOF of the material.
//!
//! Derived keys are returned in [`Zeroizing`] buffers.

use rand::rngs::OsRng;
use rand::RngCore;
use zeroize::{Zeroize, Zeroizing};

const SESSION_CONTEXT: &str = "shadowsocks 2022 session subkey";
const IDENTITY_CONTEXT: &str = "shadowsocks 2022 identity subkey";

/// Length of the identity hash carried in the encrypted identity header.
pub const PSK_HASH_LEN: usize = 16;

fn derive(context: &str, psk: &[u8], salt: &[u8], len: usize) -> Zeroizing<Vec<u8>> {
    let mut hasher = blake3::Hasher::new_derive_key(context);
    hasher.update(psk);
    hasher.update(salt);
    let mut out = Zeroizing::new(vec![0u8; len]);
    hasher.finalize_xof().fill(&mut out);
    out
}

/// Coerce arbitrary key material to `len` bytes (BLAKE3 XOF).
///
/// Used when a configured PSK is longer than the method's key length.
pub fn derive_psk(material: &[u8], len: usize) -> Zeroizing<Vec<u8>> {
    let mut hasher = blake3::Hasher::new();
    hasher.update(material);
    let mut out = Zeroizing::new(vec![0u8; len]);
    hasher.finalize_xof().fill(&mut out);
    out
}

/// Derive the AEAD session subkey for a connection salt or an 8-byte
/// UDP session ID (big-endian).
pub fn session_key(psk: &[u8], salt: &[u8], len: usize) -> Zeroizing<Vec<u8>> {
    derive(SESSION_CONTEXT, psk, salt, len)
}

/// Derive the identity subkey that encrypts the TCP identity header.
pub fn identity_subkey(psk: &[u8], salt: &[u8], len: usize) -> Zeroizing<Vec<u8>> {
    derive(IDENTITY_CONTEXT, psk, salt, len)
}

/// First 16 bytes of BLAKE3-512 of a user PSK.
///
/// This is what the identity header reveals after decryption; the wire
/// never carries the PSK itself or a plaintext user identifier.
pub fn psk_hash(psk: &[u8]) -> [u8; PSK_HASH_LEN] {
    let mut hasher = blake3::Hasher::new();
    hasher.update(psk);
    let mut wide = [0u8; 64];
    hasher.finalize_xof().fill(&mut wide);
    let mut out = [0u8; PSK_HASH_LEN];
    out.copy_from_slice(&wide[..PSK_HASH_LEN]);
    wide.zeroize();
    out
}

/// Deterministic byte stream from a keyed BLAKE3 XOF, seeded once from
/// the system CSPRNG.
///
/// The ChaCha method draws UDP session IDs and the 24-byte reply nonces
/// from one of these per session.
pub struct KeyedXof(blake3::OutputReader);

impl KeyedXof {
    /// Seed a new stream from `OsRng`.
    pub fn from_entropy() -> Self {
        let mut seed = [0u8; 32];
        OsRng.fill_bytes(&mut seed);
        let reader = blake3::Hasher::new_keyed(&seed).finalize_xof();
        seed.zeroize();
        Self(reader)
    }

    pub fn fill(&mut self, buf: &mut [u8]) {
        self.0.fill(buf);
    }

    pub fn next_u64(&mut self) -> u64 {
        let mut bytes = [0u8; 8];
        self.fill(&mut bytes);
        u64::from_be_bytes(bytes)
    }
}

impl std::fmt::Debug for KeyedXof {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("KeyedXof(..)")
    }
}
