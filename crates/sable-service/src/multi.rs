//! Multi-user identity demultiplexing.
//!
//! One listener serves many users without a plaintext user identifier
//! on the wire. The client sends a 16-byte encrypted identity header
//! carrying `BLAKE3-512(uPSK)[0..16]`:
//!
//! - **TCP**: AES-ECB under an identity subkey derived from the iPSK
//!   and the request salt, placed right after the salt.
//! - **UDP**: AES-ECB under the iPSK, XORed with the decrypted session
//!   header block, placed right after it.
//!
//! The user table keeps a reverse map from identity hash to user; the
//! forward and reverse maps change together under one lock. Only the
//! AES methods carry the identity header.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, RwLock};

use bytes::{Buf, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tracing::debug;
use zeroize::Zeroizing;

use sable_crypto::{
    identity_subkey, psk_hash, session_key, BlockCipher, Method, BLOCK_SIZE, PSK_HASH_LEN,
    TAG_SIZE,
};
use sable_proto::{ProtocolError, RecordReader, REQUEST_FIXED_LEN};

use crate::sessions::UdpSession;
use crate::stream::{map_header_eof, read_request_header};
use crate::udp::{decrypt_session_header, open_session_packet, SessionWriter, UdpCrypto};
use crate::{
    decode_password, normalize_psk, BoxedStream, ConnError, Handler, PacketError, PacketMetadata,
    PacketSender, ServerStream, Service, StreamMetadata, UserKey, PROTOCOL_NAME,
};

/// Multi-user Shadowsocks 2022 service.
///
/// Wraps the single-user [`Service`] state (iPSK ciphers, replay filter,
/// session cache) and adds the user table.
pub struct MultiService<U: UserKey> {
    service: Service,
    users: RwLock<UserTable<U>>,
}

struct UserTable<U> {
    keys: HashMap<U, Zeroizing<Vec<u8>>>,
    hashes: HashMap<U, [u8; PSK_HASH_LEN]>,
    reverse: HashMap<[u8; PSK_HASH_LEN], U>,
}

impl<U> Default for UserTable<U> {
    fn default() -> Self {
        Self {
            keys: HashMap::new(),
            hashes: HashMap::new(),
            reverse: HashMap::new(),
        }
    }
}

impl<U: UserKey> MultiService<U> {
    /// Build a multi-user service around a listener iPSK.
    ///
    /// The ChaCha method has no identity header and is rejected.
    pub fn new(method: Method, ipsk: &[u8], udp_timeout: std::time::Duration) -> Result<Self, ProtocolError> {
        if !method.supports_identity_header() {
            return Err(ProtocolError::Unsupported(
                "2022-blake3-chacha20-poly1305 does not support multiple users",
            ));
        }
        Ok(Self {
            service: Service::new(method, ipsk, udp_timeout)?,
            users: RwLock::new(UserTable::default()),
        })
    }

    /// Build from a base64 iPSK password.
    pub fn with_password(
        method: Method,
        password: &str,
        udp_timeout: std::time::Duration,
    ) -> Result<Self, ProtocolError> {
        let ipsk = decode_password(password)?;
        Self::new(method, &ipsk, udp_timeout)
    }

    pub fn method(&self) -> Method {
        self.service.method()
    }

    /// Live UDP sessions, for observability.
    pub fn active_udp_sessions(&self) -> usize {
        self.service.active_udp_sessions()
    }

    /// Add a user or replace an existing user's key.
    ///
    /// Keeps the forward and reverse maps consistent: a replaced key's
    /// old identity hash stops resolving immediately.
    pub fn add_user(&self, user: U, key: &[u8]) -> Result<(), ProtocolError> {
        let key = normalize_psk(self.service.method, key)?;
        let hash = psk_hash(&key);

        let mut users = self.users.write().expect("user table poisoned");
        if let Some(old_hash) = users.hashes.insert(user.clone(), hash) {
            users.reverse.remove(&old_hash);
        }
        users.reverse.insert(hash, user.clone());
        users.keys.insert(user, key);
        Ok(())
    }

    /// Add a user from a base64 password.
    pub fn add_user_with_password(&self, user: U, password: &str) -> Result<(), ProtocolError> {
        let key = decode_password(password)?;
        self.add_user(user, &key)
    }

    /// Remove a user and both of its table entries.
    pub fn remove_user(&self, user: &U) {
        let mut users = self.users.write().expect("user table poisoned");
        if let Some(hash) = users.hashes.remove(user) {
            users.reverse.remove(&hash);
        }
        users.keys.remove(user);
    }

    pub fn user_count(&self) -> usize {
        self.users.read().expect("user table poisoned").keys.len()
    }

    /// Resolve a decrypted identity hash to a user and its key.
    fn lookup(&self, hash: &[u8; PSK_HASH_LEN]) -> Option<(U, Zeroizing<Vec<u8>>)> {
        let users = self.users.read().expect("user table poisoned");
        let user = users.reverse.get(hash)?.clone();
        let key = users.keys.get(&user)?.clone();
        Some((user, key))
    }

    /// Run the multi-user request handshake on an accepted connection.
    pub async fn new_connection<S>(
        &self,
        conn: S,
        source: SocketAddr,
        handler: &dyn Handler<U>,
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
        handler: &dyn Handler<U>,
    ) -> Result<(), ProtocolError>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let io: BoxedStream = Box::new(conn);
        let (mut read_half, write_half) = tokio::io::split(io);

        let key_len = self.service.method.key_len();
        let mut prefix = vec![0u8; key_len + BLOCK_SIZE + TAG_SIZE + REQUEST_FIXED_LEN];
        read_half
            .read_exact(&mut prefix)
            .await
            .map_err(map_header_eof)?;

        let salt = &prefix[..key_len];
        if !self.service.replay.check_and_insert(salt) {
            return Err(ProtocolError::SaltNotUnique);
        }

        let mut identity = [0u8; BLOCK_SIZE];
        identity.copy_from_slice(&prefix[key_len..key_len + BLOCK_SIZE]);
        let subkey = identity_subkey(&self.service.psk, salt, key_len);
        BlockCipher::new(&subkey)?.decrypt_block(&mut identity);

        let (user, upsk) = self
            .lookup(&identity)
            .ok_or(ProtocolError::InvalidRequest)?;

        let key = session_key(&upsk, salt, key_len);
        let mut reader =
            RecordReader::new(read_half, self.service.method.stream_cipher(&key)?);

        let destination =
            read_request_header(&mut reader, &prefix[key_len + BLOCK_SIZE..]).await?;
        debug!(%source, %destination, user = ?user, "accepted stream");

        let stream = ServerStream::new(
            reader,
            write_half,
            self.service.method,
            upsk,
            salt.to_vec(),
        );
        let metadata = StreamMetadata {
            source,
            destination,
            user: Some(user),
            protocol: PROTOCOL_NAME,
        };
        handler
            .handle_stream(stream, metadata)
            .await
            .map_err(ProtocolError::Io)
    }

    /// Validate one received datagram and deliver its inner payload.
    pub async fn new_packet(
        &self,
        sender: &Arc<dyn PacketSender>,
        buffer: BytesMut,
        source: SocketAddr,
        handler: &dyn Handler<U>,
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
        handler: &dyn Handler<U>,
    ) -> Result<(), ProtocolError> {
        let UdpCrypto::Header(block) = &self.service.udp else {
            // Construction rejects the whole-packet method.
            return Err(ProtocolError::BadHeader);
        };

        if buffer.len() < 2 * BLOCK_SIZE + TAG_SIZE {
            return Err(ProtocolError::BadHeader);
        }
        let (header, session_id, packet_id) = decrypt_session_header(block, &mut buffer)?;

        // The identity block is encrypted under the iPSK and masked
        // with the decrypted session header block.
        let mut identity = [0u8; BLOCK_SIZE];
        identity.copy_from_slice(&buffer[..BLOCK_SIZE]);
        block.decrypt_block(&mut identity);
        for (byte, mask) in identity.iter_mut().zip(header.iter()) {
            *byte ^= mask;
        }
        buffer.advance(BLOCK_SIZE);

        let (user, upsk) = self
            .lookup(&identity)
            .ok_or(ProtocolError::InvalidRequest)?;

        let (session, loaded) = self.service.sessions.get_or_create(session_id, || {
            UdpSession::new(
                self.service.method,
                &upsk,
                session_id,
                Some(&header[..8]),
                false,
            )
        })?;
        if !loaded {
            debug!(session_id, user = ?user, "created udp session");
        }

        let destination =
            match open_session_packet(&session, packet_id, Some(&header), &mut buffer) {
                Ok(destination) => destination,
                Err(err) => {
                    if !loaded {
                        self.service.sessions.remove(session_id);
                    }
                    return Err(err);
                }
            };

        session.set_remote_addr(source);
        let writer = SessionWriter {
            session,
            sender: sender.clone(),
            udp: self.service.udp.clone(),
        };
        let metadata = PacketMetadata {
            source,
            destination,
            user: Some(user),
            protocol: PROTOCOL_NAME,
        };
        handler
            .handle_packet(session_id, writer, buffer, metadata)
            .await
            .map_err(ProtocolError::Io)
    }
}
