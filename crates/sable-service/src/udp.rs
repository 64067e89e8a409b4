//! Datagram (UDP) service.
//!
//! Two packet layouts share the inner header:
//!
//! AES methods (separate header encryption):
//! ```text
//! [ AES-ECB(iPSK): session_id || packet_id ]           16 bytes
//! [ AES-ECB(iPSK): identity header ]                   16 bytes, multi-user only
//! [ AEAD body, nonce = decrypted header bytes 4..16 ]
//! ```
//!
//! ChaCha method (whole-packet):
//! ```text
//! [ nonce ]                                            24 bytes
//! [ XChaCha seal( session_id || packet_id || body ) ]
//! ```
//!
//! Inner body: `type || u64 timestamp || u16 padding_len || padding ||
//! address || payload`. The header block layout is protocol-defined:
//! bytes `0..8` of the decrypted block key the session, bytes `4..16`
//! are the body nonce.

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::{Buf, BufMut, BytesMut};
use tracing::debug;

use sable_crypto::{AeadCipher, BlockCipher, BLOCK_SIZE, TAG_SIZE, XNONCE_SIZE};
use sable_proto::{
    check_timestamp, unix_now, Address, ProtocolError, HEADER_TYPE_CLIENT, HEADER_TYPE_SERVER,
};

use crate::sessions::UdpSession;
use crate::{Handler, PacketError, PacketMetadata, PacketSender, Service, PROTOCOL_NAME};

/// Service-wide UDP cipher state: either the whole-packet AEAD (ChaCha
/// method) or the header block cipher (AES methods), keyed by the iPSK.
#[derive(Clone)]
pub(crate) enum UdpCrypto {
    Whole(Arc<AeadCipher>),
    Header(Arc<BlockCipher>),
}

impl Service {
    /// Validate one received datagram and deliver its inner payload.
    ///
    /// `buffer` is the datagram as received. A failure on a session's
    /// first packet removes the session again, so a later valid first
    /// packet can establish a fresh one.
    pub async fn new_packet(
        &self,
        sender: &Arc<dyn PacketSender>,
        buffer: BytesMut,
        source: SocketAddr,
        handler: &dyn Handler,
    ) -> Result<(), PacketError> {
        self.process_packet(sender, buffer, source, handler)
            .await
            .map_err(|cause| PacketError { peer: source, cause })
    }

    async fn process_packet(
        &self,
        sender: &Arc<dyn PacketSender>,
        mut buffer: BytesMut,
        source: SocketAddr,
        handler: &dyn Handler,
    ) -> Result<(), ProtocolError> {
        let (session_id, packet_id, header_block) = match &self.udp {
            UdpCrypto::Whole(cipher) => {
                if buffer.len() < XNONCE_SIZE + 16 + TAG_SIZE {
                    return Err(ProtocolError::BadHeader);
                }
                let nonce = buffer.split_to(XNONCE_SIZE);
                let tag = buffer.split_off(buffer.len() - TAG_SIZE);
                cipher
                    .open_detached(&nonce, &mut buffer, &tag)
                    .map_err(|_| ProtocolError::DecryptFailed)?;
                (buffer.get_u64(), buffer.get_u64(), None)
            }
            UdpCrypto::Header(block) => {
                let (header, session_id, packet_id) =
                    decrypt_session_header(block, &mut buffer)?;
                (session_id, packet_id, Some(header))
            }
        };

        let whole_packet = matches!(self.udp, UdpCrypto::Whole(_));
        let (session, loaded) = self.sessions.get_or_create(session_id, || {
            UdpSession::new(
                self.method,
                &self.psk,
                session_id,
                header_block.as_ref().map(|h| &h[..8]),
                whole_packet,
            )
        })?;
        if !loaded {
            debug!(session_id, "created udp session");
        }

        let destination =
            match open_session_packet(&session, packet_id, header_block.as_ref(), &mut buffer) {
                Ok(destination) => destination,
                Err(err) => {
                    if !loaded {
                        self.sessions.remove(session_id);
                    }
                    return Err(err);
                }
            };

        session.set_remote_addr(source);
        let writer = SessionWriter {
            session,
            sender: sender.clone(),
            udp: self.udp.clone(),
        };
        let metadata = PacketMetadata {
            source,
            destination,
            user: None,
            protocol: PROTOCOL_NAME,
        };
        handler
            .handle_packet(session_id, writer, buffer, metadata)
            .await
            .map_err(ProtocolError::Io)
    }
}

/// Decrypt the leading 16-byte session header block in an AES-mode
/// packet and consume it from `buffer`.
pub(crate) fn decrypt_session_header(
    block: &BlockCipher,
    buffer: &mut BytesMut,
) -> Result<([u8; BLOCK_SIZE], u64, u64), ProtocolError> {
    if buffer.len() < BLOCK_SIZE + TAG_SIZE {
        return Err(ProtocolError::BadHeader);
    }
    let mut header = [0u8; BLOCK_SIZE];
    header.copy_from_slice(&buffer[..BLOCK_SIZE]);
    block.decrypt_block(&mut header);
    buffer.advance(BLOCK_SIZE);
    let session_id = u64::from_be_bytes(header[..8].try_into().unwrap());
    let packet_id = u64::from_be_bytes(header[8..16].try_into().unwrap());
    Ok((header, session_id, packet_id))
}

/// Replay-check the packet ID, open the AEAD body in the AES modes, and
/// parse the inner header. On return `buffer` holds the payload.
pub(crate) fn open_session_packet(
    session: &UdpSession,
    packet_id: u64,
    header_block: Option<&[u8; BLOCK_SIZE]>,
    buffer: &mut BytesMut,
) -> Result<Address, ProtocolError> {
    if !session.validate_packet_id(packet_id) {
        return Err(ProtocolError::PacketIdNotUnique);
    }

    if let Some(header) = header_block {
        let recv = session
            .recv_cipher
            .as_ref()
            .ok_or(ProtocolError::DecryptFailed)?;
        if buffer.len() < TAG_SIZE {
            return Err(ProtocolError::BadHeader);
        }
        let tag = buffer.split_off(buffer.len() - TAG_SIZE);
        recv.open_detached(&header[4..16], buffer, &tag)
            .map_err(|_| ProtocolError::DecryptFailed)?;
    }

    parse_inner_header(buffer)
}

/// Parse `type || timestamp || padding_len || padding || address`,
/// leaving the payload in `buffer`.
fn parse_inner_header(buffer: &mut BytesMut) -> Result<Address, ProtocolError> {
    if buffer.remaining() < 1 + 8 + 2 {
        return Err(ProtocolError::BadHeader);
    }
    let header_type = buffer.get_u8();
    if header_type != HEADER_TYPE_CLIENT {
        return Err(ProtocolError::BadHeaderType {
            expected: HEADER_TYPE_CLIENT,
            got: header_type,
        });
    }
    let epoch = buffer.get_u64();
    check_timestamp(epoch)?;

    let padding_len = buffer.get_u16() as usize;
    if buffer.remaining() < padding_len {
        return Err(ProtocolError::BadPadding);
    }
    buffer.advance(padding_len);

    Address::read_from(buffer)
}

/// Seals reply datagrams for one UDP session.
///
/// Cloneable; the handler may hold one for the session's lifetime and
/// write replies as upstream traffic arrives.
#[derive(Clone)]
pub struct SessionWriter {
    pub(crate) session: Arc<UdpSession>,
    pub(crate) sender: Arc<dyn PacketSender>,
    pub(crate) udp: UdpCrypto,
}

impl SessionWriter {
    /// Seal `payload` as a server reply naming `destination` as its
    /// origin, and send it to the session's last known client address.
    pub async fn write_packet(
        &self,
        payload: &[u8],
        destination: &Address,
    ) -> Result<(), ProtocolError> {
        let remote = self
            .session
            .remote_addr()
            .ok_or_else(|| ProtocolError::Io(std::io::ErrorKind::NotConnected.into()))?;

        let header_len = 16 + 1 + 8 + 8 + 2 + destination.serialized_len();
        let mut buf =
            BytesMut::with_capacity(XNONCE_SIZE + header_len + payload.len() + TAG_SIZE);

        match &self.udp {
            UdpCrypto::Whole(cipher) => {
                let mut nonce = [0u8; XNONCE_SIZE];
                self.session.fill_reply_nonce(&mut nonce)?;
                buf.put_slice(&nonce);
                self.put_reply_header(&mut buf, destination);
                buf.put_slice(payload);
                let tag = cipher.seal_detached(&nonce, &mut buf[XNONCE_SIZE..])?;
                buf.put_slice(&tag);
            }
            UdpCrypto::Header(block) => {
                self.put_reply_header(&mut buf, destination);
                buf.put_slice(payload);
                // Nonce comes from the plaintext session block, before
                // it is ECB-encrypted.
                let mut nonce = [0u8; 12];
                nonce.copy_from_slice(&buf[4..16]);
                let send = self
                    .session
                    .send_cipher
                    .as_ref()
                    .ok_or(sable_crypto::CryptoError::Seal)?;
                let tag = send.seal_detached(&nonce, &mut buf[BLOCK_SIZE..])?;
                buf.put_slice(&tag);
                block.encrypt_block(&mut buf[..BLOCK_SIZE]);
            }
        }

        self.sender
            .send_packet(buf.freeze(), remote)
            .await
            .map_err(ProtocolError::Io)
    }

    fn put_reply_header(&self, buf: &mut BytesMut, destination: &Address) {
        buf.put_u64(self.session.session_id);
        buf.put_u64(self.session.next_packet_id());
        buf.put_u8(HEADER_TYPE_SERVER);
        buf.put_u64(unix_now());
        buf.put_u64(self.session.remote_session_id);
        buf.put_u16(0); // padding length
        destination.write_to(buf);
    }

    /// The server-chosen session ID used in replies.
    pub fn session_id(&self) -> u64 {
        self.session.session_id
    }
}
