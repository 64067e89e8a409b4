//! Stream (TCP) service: handshake parsing and the server stream.
//!
//! Wire layout of a request:
//!
//! ```text
//! [ salt (L) ]
//! [ seal( type || u64 timestamp || u16 len ) ]                 fixed chunk
//! [ seal( address || u16 padding_len || padding || payload ) ] variable chunk
//! [ data chunks... ]
//! ```
//!
//! The response is only emitted when the handler first writes: a fresh
//! salt, then a fixed chunk `type || timestamp || request_salt ||
//! u16 len` echoing the client's salt, then the initial payload as one
//! bare record, all in a single flush.

use std::io;
use std::net::SocketAddr;

use bytes::{Buf, BufMut, BytesMut};
use rand::rngs::OsRng;
use rand::RngCore;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, ReadHalf, WriteHalf};
use tracing::debug;
use zeroize::Zeroizing;

use sable_crypto::{session_key, Method, TAG_SIZE};
use sable_proto::{
    check_timestamp, response_fixed_len, unix_now, Address, ProtocolError, RecordReader,
    RecordWriter, HEADER_TYPE_CLIENT, HEADER_TYPE_SERVER, MAX_CHUNK_SIZE, REQUEST_FIXED_LEN,
};

use crate::{BoxedStream, ConnError, Handler, Service, StreamMetadata, PROTOCOL_NAME};

impl Service {
    /// Run the request handshake on an accepted connection and hand the
    /// decrypted stream to `handler`.
    ///
    /// Every protocol fault, and any error the handler returns, comes
    /// back wrapped with the peer address so the host can log and close.
    pub async fn new_connection<S>(
        &self,
        conn: S,
        source: SocketAddr,
        handler: &dyn Handler,
    ) -> Result<(), ConnError>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        self.handle_connection(conn, source, handler)
            .await
            .map_err(|cause| ConnError { peer: source, cause })
    }

    async fn handle_connection<S>(
        &self,
        conn: S,
        source: SocketAddr,
        handler: &dyn Handler,
    ) -> Result<(), ProtocolError>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let io: BoxedStream = Box::new(conn);
        let (mut read_half, write_half) = tokio::io::split(io);

        let key_len = self.method.key_len();
        let mut prefix = vec![0u8; key_len + TAG_SIZE + REQUEST_FIXED_LEN];
        read_half
            .read_exact(&mut prefix)
            .await
            .map_err(map_header_eof)?;

        let salt = &prefix[..key_len];
        if !self.replay.check_and_insert(salt) {
            return Err(ProtocolError::SaltNotUnique);
        }

        let key = session_key(&self.psk, salt, key_len);
        let mut reader = RecordReader::new(read_half, self.method.stream_cipher(&key)?);

        let destination = read_request_header(&mut reader, &prefix[key_len..]).await?;
        debug!(%source, %destination, "accepted stream");

        let stream = ServerStream::new(
            reader,
            write_half,
            self.method,
            self.psk.clone(),
            salt.to_vec(),
        );
        let metadata = StreamMetadata {
            source,
            destination,
            user: None,
            protocol: PROTOCOL_NAME,
        };
        handler
            .handle_stream(stream, metadata)
            .await
            .map_err(ProtocolError::Io)
    }
}

/// A short read of the fixed-size prefix is a malformed request, not an
/// I/O failure.
pub(crate) fn map_header_eof(err: io::Error) -> ProtocolError {
    if err.kind() == io::ErrorKind::UnexpectedEof {
        ProtocolError::BadHeader
    } else {
        ProtocolError::Io(err)
    }
}

/// Decrypt and validate the request header chunks.
///
/// `sealed_fixed` is the fixed chunk as read off the wire (after the
/// salt and, in multi-user mode, the identity header). On success the
/// reader's cache holds the initial payload and the stream is in the
/// data phase.
///
/// Padding rule: the variable chunk must contain at least `padding_len`
/// bytes of padding, and a request with no padding must carry at least
/// one payload byte.
pub(crate) async fn read_request_header(
    reader: &mut RecordReader<ReadHalf<BoxedStream>>,
    sealed_fixed: &[u8],
) -> Result<Address, ProtocolError> {
    reader.open_buffered(sealed_fixed)?;

    let buf = reader.buffer();
    let header_type = buf.get_u8();
    if header_type != HEADER_TYPE_CLIENT {
        return Err(ProtocolError::BadHeaderType {
            expected: HEADER_TYPE_CLIENT,
            got: header_type,
        });
    }
    let epoch = buf.get_u64();
    check_timestamp(epoch)?;
    let length = buf.get_u16() as usize;

    reader.read_record(length).await?;

    let buf = reader.buffer();
    let destination = Address::read_from(buf)?;
    if buf.remaining() < 2 {
        return Err(ProtocolError::BadHeader);
    }
    let padding_len = buf.get_u16() as usize;

    if reader.cached() < padding_len {
        return Err(ProtocolError::BadPadding);
    }
    if padding_len > 0 {
        reader.discard(padding_len)?;
    } else if reader.cached() == 0 {
        return Err(ProtocolError::NoPadding);
    }

    Ok(destination)
}

/// Read side of an accepted connection, positioned at the payload.
pub struct ServerReadHalf {
    reader: RecordReader<ReadHalf<BoxedStream>>,
}

impl ServerReadHalf {
    /// Read decrypted payload bytes. Returns 0 at end of stream.
    pub async fn read(&mut self, dst: &mut [u8]) -> io::Result<usize> {
        self.reader.read(dst).await.map_err(ProtocolError::into_io)
    }
}

/// Write side of an accepted connection.
///
/// The response salt and header are generated lazily by the first
/// `write`; until then the client's request salt is held for the echo.
pub struct ServerWriteHalf {
    write_half: Option<WriteHalf<BoxedStream>>,
    writer: Option<RecordWriter<WriteHalf<BoxedStream>>>,
    method: Method,
    upsk: Zeroizing<Vec<u8>>,
    request_salt: Zeroizing<Vec<u8>>,
}

impl ServerWriteHalf {
    /// Encrypt and send payload bytes.
    ///
    /// The first call derives a fresh response key and emits the salt,
    /// the response header and the payload in one flush.
    pub async fn write(&mut self, payload: &[u8]) -> io::Result<usize> {
        if let Some(writer) = self.writer.as_mut() {
            return writer.write(payload).await.map_err(ProtocolError::into_io);
        }
        self.write_response(payload)
            .await
            .map_err(ProtocolError::into_io)
    }

    async fn write_response(&mut self, payload: &[u8]) -> Result<usize, ProtocolError> {
        let write_half = self
            .write_half
            .take()
            .ok_or_else(|| ProtocolError::Io(io::ErrorKind::NotConnected.into()))?;

        let key_len = self.method.key_len();
        let mut salt = vec![0u8; key_len];
        OsRng.fill_bytes(&mut salt);

        let key = session_key(&self.upsk, &salt, key_len);
        let mut writer = RecordWriter::new(write_half, self.method.stream_cipher(&key)?);

        let first = &payload[..payload.len().min(MAX_CHUNK_SIZE)];
        let mut out =
            BytesMut::with_capacity(key_len + response_fixed_len(key_len) + first.len() + 2 * TAG_SIZE);
        out.extend_from_slice(&salt);

        let mut fixed = BytesMut::with_capacity(response_fixed_len(key_len));
        fixed.put_u8(HEADER_TYPE_SERVER);
        fixed.put_u64(unix_now());
        fixed.put_slice(&self.request_salt);
        fixed.put_u16(first.len() as u16);
        writer.seal_record(&mut out, &fixed)?;

        if !first.is_empty() {
            writer.seal_record(&mut out, first)?;
        }
        writer.flush_buffer(&out).await?;

        // The echo has been sent; drop the held salt.
        self.request_salt = Zeroizing::new(Vec::new());
        self.writer = Some(writer);

        let rest = &payload[first.len()..];
        if !rest.is_empty() {
            if let Some(writer) = self.writer.as_mut() {
                writer.write(rest).await?;
            }
        }
        Ok(payload.len())
    }

    /// Shut down the transport's write side.
    pub async fn shutdown(&mut self) -> io::Result<()> {
        if let Some(writer) = self.writer.as_mut() {
            writer.shutdown().await
        } else if let Some(write_half) = self.write_half.as_mut() {
            use tokio::io::AsyncWriteExt;
            write_half.shutdown().await
        } else {
            Ok(())
        }
    }
}

/// A decrypted, validated server connection.
pub struct ServerStream {
    read: ServerReadHalf,
    write: ServerWriteHalf,
}

impl ServerStream {
    pub(crate) fn new(
        reader: RecordReader<ReadHalf<BoxedStream>>,
        write_half: WriteHalf<BoxedStream>,
        method: Method,
        upsk: Zeroizing<Vec<u8>>,
        request_salt: Vec<u8>,
    ) -> Self {
        Self {
            read: ServerReadHalf { reader },
            write: ServerWriteHalf {
                write_half: Some(write_half),
                writer: None,
                method,
                upsk,
                request_salt: Zeroizing::new(request_salt),
            },
        }
    }

    /// Read decrypted payload bytes. Returns 0 at end of stream.
    pub async fn read(&mut self, dst: &mut [u8]) -> io::Result<usize> {
        self.read.read(dst).await
    }

    /// Encrypt and send payload bytes; see [`ServerWriteHalf::write`].
    pub async fn write(&mut self, payload: &[u8]) -> io::Result<usize> {
        self.write.write(payload).await
    }

    pub async fn shutdown(&mut self) -> io::Result<()> {
        self.write.shutdown().await
    }

    /// Split into independently owned halves for concurrent relaying.
    pub fn into_split(self) -> (ServerReadHalf, ServerWriteHalf) {
        (self.read, self.write)
    }
}
