//! Cryptographic primitives for Sable.
//!
//! This crate provides:
//! - AEAD constructors for the `2022-blake3-*` methods
//! - BLAKE3 key derivation (session and identity subkeys)
//! - Replay defense: a timed salt pool and a sliding counter window
//!
//! # Design
//!
//! All key material derived here is returned in [`zeroize::Zeroizing`]
//! wrappers so it is wiped when the deriving scope ends. Ciphers copy the
//! key into their own state; the derivation buffers never outlive the
//! constructor call that consumes them.

#![forbid(unsafe_code)]

pub mod cipher;
pub mod kdf;
pub mod replay;
pub mod seq_window;

pub use cipher::{
    AeadCipher, BlockCipher, Method, NonceCounter, UnknownMethod, BLOCK_SIZE, NONCE_SIZE, TAG_SIZE,
    XNONCE_SIZE,
};
pub use kdf::{derive_psk, identity_subkey, psk_hash, session_key, KeyedXof, PSK_HASH_LEN};
pub use replay::SaltPool;
pub use seq_window::CounterWindow;

use thiserror::Error;

/// Errors from cipher construction and AEAD operations.
#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("invalid key length")]
    InvalidKeyLength,

    #[error("aead seal failed")]
    Seal,

    #[error("aead open failed")]
    Open,
}
