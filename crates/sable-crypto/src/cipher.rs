//! Cipher method table and AEAD wrappers.
//!
//! The three `2022-blake3-*` methods fix the key/salt length and which
//! ciphers serve each role:
//!
//! | method | key/salt | stream AEAD | UDP |
//! |---|---|---|---|
//! | `2022-blake3-aes-128-gcm` | 16 | AES-128-GCM | AES block header + per-session GCM |
//! | `2022-blake3-aes-256-gcm` | 32 | AES-256-GCM | AES block header + per-session GCM |
//! | `2022-blake3-chacha20-poly1305` | 32 | ChaCha20-Poly1305 | XChaCha20-Poly1305, whole packet |
//!
//! Stream records use a 96-bit little-endian nonce counter starting at
//! zero. A key is only ever used in one direction, so the counter never
//! repeats under a key.

use std::fmt;
use std::str::FromStr;

use aes::Aes128;
use aes::Aes256;
use aes_gcm::aead::generic_array::GenericArray;
use aes_gcm::aead::{AeadInPlace, KeyInit};
use aes_gcm::{Aes128Gcm, Aes256Gcm};
use aes::cipher::{BlockDecrypt, BlockEncrypt};
use chacha20poly1305::{ChaCha20Poly1305, XChaCha20Poly1305};

use crate::CryptoError;

/// AEAD authentication tag length, shared by every supported cipher.
pub const TAG_SIZE: usize = 16;

/// Nonce length of the stream AEADs and the AES UDP body cipher.
pub const NONCE_SIZE: usize = 12;

/// Nonce length of XChaCha20-Poly1305 (UDP packets in the ChaCha method).
pub const XNONCE_SIZE: usize = 24;

/// AES block size; the UDP separate-header unit.
pub const BLOCK_SIZE: usize = 16;

/// A Shadowsocks 2022 cipher method.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Aes128Gcm,
    Aes256Gcm,
    ChaCha20Poly1305,
}

impl Method {
    /// Key length, which is also the request salt length.
    pub const fn key_len(self) -> usize {
        match self {
            Method::Aes128Gcm => 16,
            Method::Aes256Gcm => 32,
            Method::ChaCha20Poly1305 => 32,
        }
    }

    /// Whether the method supports the encrypted identity header
    /// (multi-user mode). Only the AES methods carry it.
    pub const fn supports_identity_header(self) -> bool {
        matches!(self, Method::Aes128Gcm | Method::Aes256Gcm)
    }

    /// Construct the stream AEAD for a derived session key.
    pub fn stream_cipher(self, key: &[u8]) -> Result<AeadCipher, CryptoError> {
        match self {
            Method::Aes128Gcm => Aes128Gcm::new_from_slice(key)
                .map(AeadCipher::Aes128Gcm)
                .map_err(|_| CryptoError::InvalidKeyLength),
            Method::Aes256Gcm => Aes256Gcm::new_from_slice(key)
                .map(AeadCipher::Aes256Gcm)
                .map_err(|_| CryptoError::InvalidKeyLength),
            Method::ChaCha20Poly1305 => ChaCha20Poly1305::new_from_slice(key)
                .map(AeadCipher::ChaCha20Poly1305)
                .map_err(|_| CryptoError::InvalidKeyLength),
        }
    }

    /// Construct the whole-packet UDP AEAD, if the method has one.
    ///
    /// Only the ChaCha method seals UDP packets as a unit (XChaCha with a
    /// random 24-byte nonce); the AES methods encrypt the packet header
    /// separately and use [`Method::block_cipher`].
    pub fn udp_cipher(self, key: &[u8]) -> Result<Option<AeadCipher>, CryptoError> {
        match self {
            Method::ChaCha20Poly1305 => XChaCha20Poly1305::new_from_slice(key)
                .map(|c| Some(AeadCipher::XChaCha20Poly1305(c)))
                .map_err(|_| CryptoError::InvalidKeyLength),
            _ => Ok(None),
        }
    }

    /// Construct the single-block header cipher, if the method has one.
    pub fn block_cipher(self, key: &[u8]) -> Result<Option<BlockCipher>, CryptoError> {
        match self {
            Method::Aes128Gcm | Method::Aes256Gcm => BlockCipher::new(key).map(Some),
            Method::ChaCha20Poly1305 => Ok(None),
        }
    }
}

impl FromStr for Method {
    type Err = UnknownMethod;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "2022-blake3-aes-128-gcm" => Ok(Method::Aes128Gcm),
            "2022-blake3-aes-256-gcm" => Ok(Method::Aes256Gcm),
            "2022-blake3-chacha20-poly1305" => Ok(Method::ChaCha20Poly1305),
            _ => Err(UnknownMethod(s.to_string())),
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Method::Aes128Gcm => "2022-blake3-aes-128-gcm",
            Method::Aes256Gcm => "2022-blake3-aes-256-gcm",
            Method::ChaCha20Poly1305 => "2022-blake3-chacha20-poly1305",
        };
        f.write_str(name)
    }
}

/// Error for an unrecognized method name.
#[derive(Debug, thiserror::Error)]
#[error("unknown method: {0}")]
pub struct UnknownMethod(pub String);

/// An AEAD instance for one direction of one session.
pub enum AeadCipher {
    Aes128Gcm(Aes128Gcm),
    Aes256Gcm(Aes256Gcm),
    ChaCha20Poly1305(ChaCha20Poly1305),
    XChaCha20Poly1305(XChaCha20Poly1305),
}

impl AeadCipher {
    /// Nonce length this cipher expects (12, or 24 for XChaCha).
    pub fn nonce_len(&self) -> usize {
        match self {
            AeadCipher::XChaCha20Poly1305(_) => XNONCE_SIZE,
            _ => NONCE_SIZE,
        }
    }

    /// Encrypt `buf` in place and return the detached tag.
    ///
    /// `nonce` must be exactly [`Self::nonce_len`] bytes.
    pub fn seal_detached(&self, nonce: &[u8], buf: &mut [u8]) -> Result<[u8; TAG_SIZE], CryptoError> {
        debug_assert_eq!(nonce.len(), self.nonce_len());
        let tag = match self {
            AeadCipher::Aes128Gcm(c) => {
                c.encrypt_in_place_detached(GenericArray::from_slice(nonce), &[], buf)
            }
            AeadCipher::Aes256Gcm(c) => {
                c.encrypt_in_place_detached(GenericArray::from_slice(nonce), &[], buf)
            }
            AeadCipher::ChaCha20Poly1305(c) => {
                c.encrypt_in_place_detached(GenericArray::from_slice(nonce), &[], buf)
            }
            AeadCipher::XChaCha20Poly1305(c) => {
                c.encrypt_in_place_detached(GenericArray::from_slice(nonce), &[], buf)
            }
        }
        .map_err(|_| CryptoError::Seal)?;

        let mut out = [0u8; TAG_SIZE];
        out.copy_from_slice(tag.as_slice());
        Ok(out)
    }

    /// Decrypt `buf` in place, verifying the detached `tag`.
    pub fn open_detached(&self, nonce: &[u8], buf: &mut [u8], tag: &[u8]) -> Result<(), CryptoError> {
        debug_assert_eq!(nonce.len(), self.nonce_len());
        if tag.len() != TAG_SIZE {
            return Err(CryptoError::Open);
        }
        match self {
            AeadCipher::Aes128Gcm(c) => c.decrypt_in_place_detached(
                GenericArray::from_slice(nonce),
                &[],
                buf,
                GenericArray::from_slice(tag),
            ),
            AeadCipher::Aes256Gcm(c) => c.decrypt_in_place_detached(
                GenericArray::from_slice(nonce),
                &[],
                buf,
                GenericArray::from_slice(tag),
            ),
            AeadCipher::ChaCha20Poly1305(c) => c.decrypt_in_place_detached(
                GenericArray::from_slice(nonce),
                &[],
                buf,
                GenericArray::from_slice(tag),
            ),
            AeadCipher::XChaCha20Poly1305(c) => c.decrypt_in_place_detached(
                GenericArray::from_slice(nonce),
                &[],
                buf,
                GenericArray::from_slice(tag),
            ),
        }
        .map_err(|_| CryptoError::Open)
    }
}

impl fmt::Debug for AeadCipher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AeadCipher::Aes128Gcm(_) => "Aes128Gcm",
            AeadCipher::Aes256Gcm(_) => "Aes256Gcm",
            AeadCipher::ChaCha20Poly1305(_) => "ChaCha20Poly1305",
            AeadCipher::XChaCha20Poly1305(_) => "XChaCha20Poly1305",
        };
        f.debug_tuple("AeadCipher").field(&name).finish()
    }
}

/// Single-block AES, used for the UDP packet header and the encrypted
/// identity header. ECB over exactly one block; never used for payload.
pub enum BlockCipher {
    Aes128(Aes128),
    Aes256(Aes256),
}

impl BlockCipher {
    /// Key length selects AES-128 or AES-256.
    pub fn new(key: &[u8]) -> Result<Self, CryptoError> {
        match key.len() {
            16 => Aes128::new_from_slice(key)
                .map(BlockCipher::Aes128)
                .map_err(|_| CryptoError::InvalidKeyLength),
            32 => Aes256::new_from_slice(key)
                .map(BlockCipher::Aes256)
                .map_err(|_| CryptoError::InvalidKeyLength),
            _ => Err(CryptoError::InvalidKeyLength),
        }
    }

    /// Encrypt one 16-byte block in place.
    pub fn encrypt_block(&self, block: &mut [u8]) {
        debug_assert_eq!(block.len(), BLOCK_SIZE);
        let block = GenericArray::from_mut_slice(block);
        match self {
            BlockCipher::Aes128(c) => c.encrypt_block(block),
            BlockCipher::Aes256(c) => c.encrypt_block(block),
        }
    }

    /// Decrypt one 16-byte block in place.
    pub fn decrypt_block(&self, block: &mut [u8]) {
        debug_assert_eq!(block.len(), BLOCK_SIZE);
        let block = GenericArray::from_mut_slice(block);
        match self {
            BlockCipher::Aes128(c) => c.decrypt_block(block),
            BlockCipher::Aes256(c) => c.decrypt_block(block),
        }
    }
}

impl fmt::Debug for BlockCipher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BlockCipher::Aes128(_) => "Aes128",
            BlockCipher::Aes256(_) => "Aes256",
        };
        f.debug_tuple("BlockCipher").field(&name).finish()
    }
}

/// 96-bit little-endian nonce counter for the stream record layer.
///
/// Starts at zero and increments once per sealed or opened record.
#[derive(Debug, Clone, Default)]
pub struct NonceCounter([u8; NONCE_SIZE]);

impl NonceCounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the current nonce and advance the counter.
    pub fn next(&mut self) -> [u8; NONCE_SIZE] {
        let current = self.0;
        for byte in self.0.iter_mut() {
            *byte = byte.wrapping_add(1);
            if *byte != 0 {
                break;
            }
        }
        current
    }
}
