//! AEAD record framing for the stream transport.
//!
//! The stream is a sequence of AEAD records under a per-direction
//! session key with a 96-bit little-endian nonce counter. Two framing
//! shapes share the counter:
//!
//! - **Header phase**: bare records whose plaintext length is known out
//!   of band (the fixed request/response headers, and the variable chunk
//!   whose length the fixed header carries).
//! - **Data phase**: self-describing chunks,
//!   `seal(u16 payload length) || seal(payload)`, payload capped at
//!   [`crate::MAX_CHUNK_SIZE`].
//!
//! Decrypted bytes land in the reader's cache; the handshake parses the
//! cache in place and whatever remains is the first payload bytes.

use std::io;

use bytes::{Buf, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use sable_crypto::{AeadCipher, NonceCounter, TAG_SIZE};

use crate::{ProtocolError, MAX_CHUNK_SIZE};

/// Decrypting reader over an AEAD record stream.
pub struct RecordReader<R> {
    inner: R,
    cipher: AeadCipher,
    nonce: NonceCounter,
    cache: BytesMut,
}

impl<R: AsyncRead + Unpin> RecordReader<R> {
    pub fn new(inner: R, cipher: AeadCipher) -> Self {
        Self {
            inner,
            cipher,
            nonce: NonceCounter::new(),
            cache: BytesMut::new(),
        }
    }

    /// Open a sealed record that was already read from the transport,
    /// appending the plaintext to the cache.
    pub fn open_buffered(&mut self, sealed: &[u8]) -> Result<(), ProtocolError> {
        if sealed.len() < TAG_SIZE {
            return Err(ProtocolError::BadHeader);
        }
        let (body, tag) = sealed.split_at(sealed.len() - TAG_SIZE);
        let start = self.cache.len();
        self.cache.extend_from_slice(body);
        let nonce = self.nonce.next();
        self.cipher
            .open_detached(&nonce, &mut self.cache[start..], tag)
            .map_err(|_| {
                self.cache.truncate(start);
                ProtocolError::DecryptFailed
            })
    }

    /// Read and open one bare record of exactly `len` plaintext bytes.
    pub async fn read_record(&mut self, len: usize) -> Result<(), ProtocolError> {
        let mut sealed = vec![0u8; len + TAG_SIZE];
        self.inner.read_exact(&mut sealed).await?;
        self.open_buffered(&sealed)
    }

    /// Read the next data-phase chunk into the cache.
    ///
    /// Returns `false` on a clean end of stream at a chunk boundary.
    pub async fn read_chunk(&mut self) -> Result<bool, ProtocolError> {
        let mut sealed_len = [0u8; 2 + TAG_SIZE];
        if !read_exact_or_eof(&mut self.inner, &mut sealed_len).await? {
            return Ok(false);
        }
        let (body, tag) = sealed_len.split_at_mut(2);
        let nonce = self.nonce.next();
        self.cipher
            .open_detached(&nonce, body, tag)
            .map_err(|_| ProtocolError::DecryptFailed)?;
        let len = u16::from_be_bytes([body[0], body[1]]) as usize;
        self.read_record(len).await?;
        Ok(true)
    }

    /// Decrypted bytes available without touching the transport.
    pub fn cached(&self) -> usize {
        self.cache.len()
    }

    /// Drop `n` already-decrypted bytes.
    pub fn discard(&mut self, n: usize) -> Result<(), ProtocolError> {
        if n > self.cache.len() {
            return Err(ProtocolError::BadPadding);
        }
        self.cache.advance(n);
        Ok(())
    }

    /// Direct access to the decrypted cache for in-place header parsing.
    pub fn buffer(&mut self) -> &mut BytesMut {
        &mut self.cache
    }

    /// Copy decrypted bytes into `dst`, reading further chunks as needed.
    ///
    /// Returns 0 only at end of stream.
    pub async fn read(&mut self, dst: &mut [u8]) -> Result<usize, ProtocolError> {
        while self.cache.is_empty() {
            if !self.read_chunk().await? {
                return Ok(0);
            }
        }
        let n = dst.len().min(self.cache.len());
        dst[..n].copy_from_slice(&self.cache[..n]);
        self.cache.advance(n);
        Ok(n)
    }
}

/// Encrypting writer producing AEAD records.
pub struct RecordWriter<W> {
    inner: W,
    cipher: AeadCipher,
    nonce: NonceCounter,
}

impl<W: AsyncWrite + Unpin> RecordWriter<W> {
    pub fn new(inner: W, cipher: AeadCipher) -> Self {
        Self {
            inner,
            cipher,
            nonce: NonceCounter::new(),
        }
    }

    /// Seal `plaintext` as one bare record appended to `out`.
    pub fn seal_record(&mut self, out: &mut BytesMut, plaintext: &[u8]) -> Result<(), ProtocolError> {
        let start = out.len();
        out.extend_from_slice(plaintext);
        let nonce = self.nonce.next();
        let tag = self.cipher.seal_detached(&nonce, &mut out[start..])?;
        out.extend_from_slice(&tag);
        Ok(())
    }

    /// Seal one data-phase chunk (length record + payload record).
    pub fn seal_chunk(&mut self, out: &mut BytesMut, payload: &[u8]) -> Result<(), ProtocolError> {
        debug_assert!(payload.len() <= MAX_CHUNK_SIZE);
        self.seal_record(out, &(payload.len() as u16).to_be_bytes())?;
        self.seal_record(out, payload)
    }

    /// Write a pre-assembled buffer to the transport in one flush.
    pub async fn flush_buffer(&mut self, buf: &[u8]) -> io::Result<()> {
        self.inner.write_all(buf).await?;
        self.inner.flush().await
    }

    /// Chunk `payload` into data-phase records and flush them.
    pub async fn write(&mut self, payload: &[u8]) -> Result<usize, ProtocolError> {
        let mut out = BytesMut::with_capacity(payload.len() + 2 * TAG_SIZE + 2 + 64);
        for chunk in payload.chunks(MAX_CHUNK_SIZE) {
            self.seal_chunk(&mut out, chunk)?;
        }
        self.flush_buffer(&out).await?;
        Ok(payload.len())
    }

    /// Shut down the underlying transport's write side.
    pub async fn shutdown(&mut self) -> io::Result<()> {
        self.inner.shutdown().await
    }
}

/// Fill `buf` exactly, or return `false` if the stream ended before the
/// first byte. EOF in the middle of `buf` is an error.
async fn read_exact_or_eof<R: AsyncRead + Unpin>(
    reader: &mut R,
    buf: &mut [u8],
) -> io::Result<bool> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..]).await?;
        if n == 0 {
            if filled == 0 {
                return Ok(false);
            }
            return Err(io::ErrorKind::UnexpectedEof.into());
        }
        filled += n;
    }
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use sable_crypto::Method;

    fn cipher_pair() -> (AeadCipher, AeadCipher) {
        let key = [0x42u8; 32];
        (
            Method::Aes256Gcm.stream_cipher(&key).unwrap(),
            Method::Aes256Gcm.stream_cipher(&key).unwrap(),
        )
    }

    #[tokio::test]
    async fn data_chunks_roundtrip() {
        let (seal, open) = cipher_pair();
        let (client, server) = tokio::io::duplex(1 << 16);
        let mut writer = RecordWriter::new(client, seal);
        let mut reader = RecordReader::new(server, open);

        writer.write(b"hello").await.unwrap();
        writer.write(b" world").await.unwrap();

        let mut dst = [0u8; 5];
        assert_eq!(reader.read(&mut dst).await.unwrap(), 5);
        assert_eq!(&dst, b"hello");
        let mut dst = [0u8; 16];
        assert_eq!(reader.read(&mut dst).await.unwrap(), 6);
        assert_eq!(&dst[..6], b" world");

        drop(writer);
        assert_eq!(reader.read(&mut dst).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn bare_records_share_the_nonce_counter() {
        let (seal, open) = cipher_pair();
        let (client, server) = tokio::io::duplex(1 << 16);
        let mut writer = RecordWriter::new(client, seal);
        let mut reader = RecordReader::new(server, open);

        let mut out = BytesMut::new();
        writer.seal_record(&mut out, b"fixed-header").unwrap();
        writer.seal_record(&mut out, b"variable-chunk").unwrap();
        writer.flush_buffer(&out).await.unwrap();
        // Data phase continues on the same counter.
        writer.write(b"tail").await.unwrap();

        reader.read_record(12).await.unwrap();
        assert_eq!(&reader.buffer()[..], b"fixed-header");
        reader.discard(12).unwrap();

        reader.read_record(14).await.unwrap();
        assert_eq!(&reader.buffer()[..], b"variable-chunk");
        reader.discard(14).unwrap();

        let mut dst = [0u8; 4];
        assert_eq!(reader.read(&mut dst).await.unwrap(), 4);
        assert_eq!(&dst, b"tail");
    }

    #[tokio::test]
    async fn corrupted_record_fails_open() {
        let (seal, open) = cipher_pair();
        let (client, server) = tokio::io::duplex(1 << 16);
        let mut writer = RecordWriter::new(client, seal);
        let mut reader = RecordReader::new(server, open);

        let mut out = BytesMut::new();
        writer.seal_record(&mut out, b"header").unwrap();
        out[0] ^= 0xff;
        writer.flush_buffer(&out).await.unwrap();

        assert!(matches!(
            reader.read_record(6).await,
            Err(ProtocolError::DecryptFailed)
        ));
    }

    #[tokio::test]
    async fn mismatched_keys_fail() {
        let seal = Method::Aes128Gcm.stream_cipher(&[1u8; 16]).unwrap();
        let open = Method::Aes128Gcm.stream_cipher(&[2u8; 16]).unwrap();
        let (client, server) = tokio::io::duplex(1 << 16);
        let mut writer = RecordWriter::new(client, seal);
        let mut reader = RecordReader::new(server, open);

        writer.write(b"data").await.unwrap();
        let mut dst = [0u8; 4];
        assert!(reader.read(&mut dst).await.is_err());
    }

    #[test]
    fn discard_beyond_cache_is_an_error() {
        let cipher = Method::Aes128Gcm.stream_cipher(&[0u8; 16]).unwrap();
        let mut reader = RecordReader::new(tokio::io::empty(), cipher);
        assert!(matches!(reader.discard(1), Err(ProtocolError::BadPadding)));
    }

    #[tokio::test]
    async fn max_size_chunk_roundtrip() {
        let (seal, open) = cipher_pair();
        let (client, server) = tokio::io::duplex(1 << 20);
        let mut writer = RecordWriter::new(client, seal);
        let mut reader = RecordReader::new(server, open);

        let payload = vec![0xA5u8; MAX_CHUNK_SIZE + 10];
        writer.write(&payload).await.unwrap();
        drop(writer);

        let mut got = Vec::new();
        let mut dst = [0u8; 4096];
        loop {
            let n = reader.read(&mut dst).await.unwrap();
            if n == 0 {
                break;
            }
            got.extend_from_slice(&dst[..n]);
        }
        assert_eq!(got, payload);
    }
}
