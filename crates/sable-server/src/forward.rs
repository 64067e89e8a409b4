//! Direct-dial forwarding handler.
//!
//! Streams are relayed to a freshly dialed TCP connection; datagrams go
//! through one outbound UDP socket per session, with a pump task
//! sealing replies back through the session writer.

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{lookup_host, TcpStream, UdpSocket};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use sable_proto::Address;
use sable_service::{
    Handler, PacketMetadata, ServerStream, SessionWriter, StreamMetadata,
};

const RELAY_BUFFER_SIZE: usize = 16 * 1024;
const UDP_BUFFER_SIZE: usize = 64 * 1024;

/// Resolve a protocol address to a socket address.
async fn resolve(address: &Address) -> io::Result<SocketAddr> {
    match address {
        Address::Socket(addr) => Ok(*addr),
        Address::Domain(name, port) => lookup_host((name.as_str(), *port))
            .await?
            .next()
            .ok_or_else(|| {
                io::Error::new(io::ErrorKind::NotFound, format!("no address for {name}"))
            }),
    }
}

pub struct ForwardHandler {
    /// Outbound socket per UDP session.
    associations: Arc<Mutex<HashMap<u64, Arc<UdpSocket>>>>,
    udp_timeout: Duration,
}

impl ForwardHandler {
    pub fn new(udp_timeout: Duration) -> Self {
        Self {
            associations: Arc::new(Mutex::new(HashMap::new())),
            udp_timeout,
        }
    }
}

#[async_trait]
impl Handler for ForwardHandler {
    async fn handle_stream(
        &self,
        stream: ServerStream,
        metadata: StreamMetadata,
    ) -> io::Result<()> {
        let target = resolve(&metadata.destination).await?;
        let upstream = TcpStream::connect(target).await?;
        debug!(source = %metadata.source, destination = %metadata.destination, "relaying stream");

        let (mut client_read, mut client_write) = stream.into_split();
        let (mut upstream_read, mut upstream_write) = upstream.into_split();

        let client_to_upstream = async {
            let mut buf = [0u8; RELAY_BUFFER_SIZE];
            loop {
                let n = client_read.read(&mut buf).await?;
                if n == 0 {
                    break;
                }
                upstream_write.write_all(&buf[..n]).await?;
            }
            upstream_write.shutdown().await
        };

        let upstream_to_client = async {
            let mut buf = [0u8; RELAY_BUFFER_SIZE];
            loop {
                let n = upstream_read.read(&mut buf).await?;
                if n == 0 {
                    break;
                }
                client_write.write(&buf[..n]).await?;
            }
            client_write.shutdown().await
        };

        tokio::try_join!(client_to_upstream, upstream_to_client)?;
        Ok(())
    }

    async fn handle_packet(
        &self,
        session_id: u64,
        writer: SessionWriter,
        payload: BytesMut,
        metadata: PacketMetadata,
    ) -> io::Result<()> {
        let target = resolve(&metadata.destination).await?;

        let socket = {
            let mut associations = self.associations.lock().await;
            match associations.get(&session_id) {
                Some(socket) => socket.clone(),
                None => {
                    let bind_addr = if target.is_ipv6() { "[::]:0" } else { "0.0.0.0:0" };
                    let socket = Arc::new(UdpSocket::bind(bind_addr).await?);
                    associations.insert(session_id, socket.clone());
                    tokio::spawn(reply_pump(
                        session_id,
                        socket.clone(),
                        writer.clone(),
                        self.associations.clone(),
                        self.udp_timeout,
                    ));
                    debug!(session_id, "opened udp association");
                    socket
                }
            }
        };

        socket.send_to(&payload, target).await?;
        Ok(())
    }
}

/// Forward upstream replies back through the session writer until the
/// association idles out.
async fn reply_pump(
    session_id: u64,
    socket: Arc<UdpSocket>,
    writer: SessionWriter,
    associations: Arc<Mutex<HashMap<u64, Arc<UdpSocket>>>>,
    timeout: Duration,
) {
    let mut buf = vec![0u8; UDP_BUFFER_SIZE];
    loop {
        let received = tokio::time::timeout(timeout, socket.recv_from(&mut buf)).await;
        match received {
            Ok(Ok((n, from))) => {
                if let Err(err) = writer.write_packet(&buf[..n], &Address::from(from)).await {
                    warn!(session_id, "reply failed: {err}");
                    break;
                }
            }
            Ok(Err(err)) => {
                warn!(session_id, "association read failed: {err}");
                break;
            }
            Err(_) => {
                debug!(session_id, "udp association idle, closing");
                break;
            }
        }
    }
    associations.lock().await.remove(&session_id);
}
