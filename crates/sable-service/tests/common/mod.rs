//! Client-side protocol construction for service tests.
//!
//! These helpers seal requests the way a client would, independently of
//! the server's record writer, so the tests exercise the wire format
//! rather than mirroring the implementation.

#![allow(dead_code)]

use std::io;
use std::net::SocketAddr;
use std::sync::Mutex;

use async_trait::async_trait;
use bytes::{Buf, BufMut, Bytes, BytesMut};

use sable_crypto::{
    identity_subkey, psk_hash, session_key, AeadCipher, BlockCipher, Method, NonceCounter,
    TAG_SIZE,
};
use sable_proto::{
    response_fixed_len, Address, HEADER_TYPE_CLIENT, HEADER_TYPE_SERVER,
};
use sable_service::{
    Handler, PacketMetadata, PacketSender, ServerStream, SessionWriter, StreamMetadata, UserKey,
};

/// Seals records under a counter nonce, client side.
pub struct RecordSealer {
    cipher: AeadCipher,
    nonce: NonceCounter,
}

impl RecordSealer {
    pub fn new(method: Method, key: &[u8]) -> Self {
        Self {
            cipher: method.stream_cipher(key).unwrap(),
            nonce: NonceCounter::new(),
        }
    }

    pub fn seal(&mut self, out: &mut BytesMut, plaintext: &[u8]) {
        let start = out.len();
        out.extend_from_slice(plaintext);
        let nonce = self.nonce.next();
        let tag = self.cipher.seal_detached(&nonce, &mut out[start..]).unwrap();
        out.extend_from_slice(&tag);
    }
}

/// Opens records under a counter nonce, client side.
pub struct RecordOpener {
    cipher: AeadCipher,
    nonce: NonceCounter,
}

impl RecordOpener {
    pub fn new(method: Method, key: &[u8]) -> Self {
        Self {
            cipher: method.stream_cipher(key).unwrap(),
            nonce: NonceCounter::new(),
        }
    }

    pub fn open(&mut self, sealed: &[u8]) -> Vec<u8> {
        let (body, tag) = sealed.split_at(sealed.len() - TAG_SIZE);
        let mut plain = body.to_vec();
        let nonce = self.nonce.next();
        self.cipher.open_detached(&nonce, &mut plain, tag).unwrap();
        plain
    }
}

/// Build a complete single-user request: salt, fixed chunk, variable
/// chunk with `padding` zero bytes and the initial payload.
pub fn build_request(
    method: Method,
    psk: &[u8],
    salt: &[u8],
    destination: &Address,
    padding: usize,
    payload: &[u8],
    epoch: u64,
) -> Vec<u8> {
    let mut variable = BytesMut::new();
    destination.write_to(&mut variable);
    variable.put_u16(padding as u16);
    variable.put_bytes(0, padding);
    variable.put_slice(payload);
    build_request_raw(method, psk, salt, HEADER_TYPE_CLIENT, epoch, &variable)
}

/// Build a request with full control over the header type and the
/// variable chunk contents.
pub fn build_request_raw(
    method: Method,
    psk: &[u8],
    salt: &[u8],
    header_type: u8,
    epoch: u64,
    variable: &[u8],
) -> Vec<u8> {
    let key = session_key(psk, salt, method.key_len());
    let mut sealer = RecordSealer::new(method, &key);

    let mut fixed = BytesMut::new();
    fixed.put_u8(header_type);
    fixed.put_u64(epoch);
    fixed.put_u16(variable.len() as u16);

    let mut out = BytesMut::new();
    out.put_slice(salt);
    sealer.seal(&mut out, &fixed);
    sealer.seal(&mut out, variable);
    out.to_vec()
}

/// Build a multi-user request: identity header between the salt and the
/// chunks, body keyed by the user PSK.
pub fn build_multi_request(
    method: Method,
    ipsk: &[u8],
    upsk: &[u8],
    salt: &[u8],
    destination: &Address,
    padding: usize,
    payload: &[u8],
    epoch: u64,
) -> Vec<u8> {
    let mut identity = psk_hash(upsk);
    let subkey = identity_subkey(ipsk, salt, method.key_len());
    BlockCipher::new(&subkey).unwrap().encrypt_block(&mut identity);

    let mut variable = BytesMut::new();
    destination.write_to(&mut variable);
    variable.put_u16(padding as u16);
    variable.put_bytes(0, padding);
    variable.put_slice(payload);

    let key = session_key(upsk, salt, method.key_len());
    let mut sealer = RecordSealer::new(method, &key);

    let mut fixed = BytesMut::new();
    fixed.put_u8(HEADER_TYPE_CLIENT);
    fixed.put_u64(epoch);
    fixed.put_u16(variable.len() as u16);

    let mut out = BytesMut::new();
    out.put_slice(salt);
    out.put_slice(&identity);
    sealer.seal(&mut out, &fixed);
    sealer.seal(&mut out, &variable);
    out.to_vec()
}

/// Parsed server response header and first payload.
pub struct Response {
    pub salt: Vec<u8>,
    pub request_salt: Vec<u8>,
    pub payload: Vec<u8>,
}

/// Open the server's first response flush.
pub fn open_response(method: Method, upsk: &[u8], data: &[u8]) -> Response {
    let l = method.key_len();
    let salt = data[..l].to_vec();
    let key = session_key(upsk, &salt, l);
    let mut opener = RecordOpener::new(method, &key);

    let fixed_end = l + response_fixed_len(l) + TAG_SIZE;
    let fixed = opener.open(&data[l..fixed_end]);
    assert_eq!(fixed[0], HEADER_TYPE_SERVER);
    let request_salt = fixed[9..9 + l].to_vec();
    let payload_len =
        u16::from_be_bytes([fixed[9 + l], fixed[9 + l + 1]]) as usize;

    let payload = if payload_len > 0 {
        opener.open(&data[fixed_end..fixed_end + payload_len + TAG_SIZE])
    } else {
        Vec::new()
    };
    Response {
        salt,
        request_salt,
        payload,
    }
}

/// Inner UDP body: type, timestamp, padding, address, payload.
fn udp_inner(destination: &Address, payload: &[u8], epoch: u64) -> BytesMut {
    let mut inner = BytesMut::new();
    inner.put_u8(HEADER_TYPE_CLIENT);
    inner.put_u64(epoch);
    inner.put_u16(0);
    destination.write_to(&mut inner);
    inner.put_slice(payload);
    inner
}

/// Build an AES-mode UDP packet. `identity_psk` adds the multi-user
/// identity block for that user key.
pub fn build_udp_aes(
    method: Method,
    psk: &[u8],
    block_psk: &[u8],
    session_id: u64,
    packet_id: u64,
    destination: &Address,
    payload: &[u8],
    epoch: u64,
    identity_psk: Option<&[u8]>,
) -> Vec<u8> {
    let mut header = [0u8; 16];
    header[..8].copy_from_slice(&session_id.to_be_bytes());
    header[8..].copy_from_slice(&packet_id.to_be_bytes());

    let key = session_key(psk, &header[..8], method.key_len());
    let cipher = method.stream_cipher(&key).unwrap();

    let mut body = udp_inner(destination, payload, epoch);
    let tag = cipher.seal_detached(&header[4..16], &mut body).unwrap();

    let block = BlockCipher::new(block_psk).unwrap();
    let mut out = BytesMut::new();

    let mut sealed_header = header;
    block.encrypt_block(&mut sealed_header);
    out.put_slice(&sealed_header);

    if let Some(upsk) = identity_psk {
        let mut identity = psk_hash(upsk);
        for (byte, mask) in identity.iter_mut().zip(header.iter()) {
            *byte ^= mask;
        }
        block.encrypt_block(&mut identity);
        out.put_slice(&identity);
    }

    out.put_slice(&body);
    out.put_slice(&tag);
    out.to_vec()
}

/// Build a whole-packet (XChaCha) UDP packet.
pub fn build_udp_xchacha(
    psk: &[u8],
    nonce: &[u8; 24],
    session_id: u64,
    packet_id: u64,
    destination: &Address,
    payload: &[u8],
    epoch: u64,
) -> Vec<u8> {
    let cipher = Method::ChaCha20Poly1305.udp_cipher(psk).unwrap().unwrap();

    let mut body = BytesMut::new();
    body.put_u64(session_id);
    body.put_u64(packet_id);
    body.extend_from_slice(&udp_inner(destination, payload, epoch));
    let tag = cipher.seal_detached(nonce, &mut body).unwrap();

    let mut out = BytesMut::new();
    out.put_slice(nonce);
    out.put_slice(&body);
    out.put_slice(&tag);
    out.to_vec()
}

/// Decoded server UDP reply.
pub struct UdpReply {
    pub session_id: u64,
    pub packet_id: u64,
    pub remote_session_id: u64,
    pub destination: Address,
    pub payload: Vec<u8>,
}

fn parse_reply_body(mut body: BytesMut) -> UdpReply {
    let session_id = body.get_u64();
    let packet_id = body.get_u64();
    assert_eq!(body.get_u8(), HEADER_TYPE_SERVER);
    let _epoch = body.get_u64();
    let remote_session_id = body.get_u64();
    let padding = body.get_u16() as usize;
    body.advance(padding);
    let destination = Address::read_from(&mut body).unwrap();
    UdpReply {
        session_id,
        packet_id,
        remote_session_id,
        destination,
        payload: body.to_vec(),
    }
}

/// Open an AES-mode server reply.
pub fn open_udp_reply_aes(method: Method, psk: &[u8], block_psk: &[u8], packet: &[u8]) -> UdpReply {
    let block = BlockCipher::new(block_psk).unwrap();
    let mut header = [0u8; 16];
    header.copy_from_slice(&packet[..16]);
    block.decrypt_block(&mut header);

    let key = session_key(psk, &header[..8], method.key_len());
    let cipher = method.stream_cipher(&key).unwrap();

    let mut body = BytesMut::from(&packet[16..packet.len() - TAG_SIZE]);
    cipher
        .open_detached(&header[4..16], &mut body, &packet[packet.len() - TAG_SIZE..])
        .unwrap();

    let mut full = BytesMut::new();
    full.put_slice(&header);
    full.extend_from_slice(&body);
    parse_reply_body(full)
}

/// Open a whole-packet (XChaCha) server reply.
pub fn open_udp_reply_xchacha(psk: &[u8], packet: &[u8]) -> UdpReply {
    let cipher = Method::ChaCha20Poly1305.udp_cipher(psk).unwrap().unwrap();
    let nonce = &packet[..24];
    let mut body = BytesMut::from(&packet[24..packet.len() - TAG_SIZE]);
    cipher
        .open_detached(nonce, &mut body, &packet[packet.len() - TAG_SIZE..])
        .unwrap();
    parse_reply_body(body)
}

/// Records everything sent toward clients.
#[derive(Default)]
pub struct CaptureSender {
    pub sent: Mutex<Vec<(Bytes, SocketAddr)>>,
}

#[async_trait]
impl PacketSender for CaptureSender {
    async fn send_packet(&self, packet: Bytes, to: SocketAddr) -> io::Result<()> {
        self.sent.lock().unwrap().push((packet, to));
        Ok(())
    }
}

/// Handler double: records deliveries, optionally replies.
#[derive(Default)]
pub struct TestHandler<U: UserKey = ()> {
    pub stream_reply: Option<Vec<u8>>,
    pub packet_reply: Option<Vec<u8>>,
    pub streams: Mutex<Vec<(StreamMetadata<U>, Vec<u8>)>>,
    pub packets: Mutex<Vec<(u64, PacketMetadata<U>, Vec<u8>)>>,
}

#[async_trait]
impl<U: UserKey> Handler<U> for TestHandler<U> {
    async fn handle_stream(
        &self,
        mut stream: ServerStream,
        metadata: StreamMetadata<U>,
    ) -> io::Result<()> {
        let mut buf = [0u8; 4096];
        let n = stream.read(&mut buf).await?;
        self.streams
            .lock()
            .unwrap()
            .push((metadata, buf[..n].to_vec()));
        if let Some(reply) = &self.stream_reply {
            stream.write(reply).await?;
        }
        Ok(())
    }

    async fn handle_packet(
        &self,
        session_id: u64,
        writer: SessionWriter,
        payload: bytes::BytesMut,
        metadata: PacketMetadata<U>,
    ) -> io::Result<()> {
        if let Some(reply) = &self.packet_reply {
            writer
                .write_packet(reply, &metadata.destination)
                .await
                .map_err(|e| e.into_io())?;
        }
        self.packets
            .lock()
            .unwrap()
            .push((session_id, metadata, payload.to_vec()));
        Ok(())
    }
}
