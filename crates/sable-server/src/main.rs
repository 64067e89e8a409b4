#![forbid(unsafe_code)]

//! Sable server - Shadowsocks 2022 listener with a direct forwarder.
//!
//! Accepts TCP connections and UDP datagrams on one address, runs the
//! protocol services over them and relays decrypted traffic to the
//! requested destinations.

mod forward;

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use bytes::{Bytes, BytesMut};
use clap::Parser;
use tokio::net::{TcpListener, UdpSocket};
use tracing::{debug, info, warn};

use forward::ForwardHandler;
use sable_service::{Method, PacketSender, Service};

const DEFAULT_UDP_TIMEOUT_SECS: u64 = 300;

#[derive(Parser, Debug)]
#[command(name = "sable-server")]
#[command(about = "Shadowsocks 2022 server - relays encrypted TCP and UDP traffic")]
struct Args {
    /// TCP and UDP listen address
    #[arg(long, default_value = "0.0.0.0:8388")]
    listen: SocketAddr,

    /// Cipher method (e.g. 2022-blake3-aes-128-gcm)
    #[arg(long, default_value = "2022-blake3-aes-128-gcm")]
    method: String,

    /// Base64 pre-shared key
    #[arg(long)]
    password: String,

    /// UDP session timeout in seconds
    #[arg(long, default_value_t = DEFAULT_UDP_TIMEOUT_SECS)]
    udp_timeout: u64,

    /// Log level
    #[arg(long, default_value = "info")]
    log_level: String,
}

/// Reply path for sealed datagrams: the listen socket itself.
struct UdpSender(Arc<UdpSocket>);

#[async_trait::async_trait]
impl PacketSender for UdpSender {
    async fn send_packet(&self, packet: Bytes, to: SocketAddr) -> io::Result<()> {
        self.0.send_to(&packet, to).await.map(|_| ())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_new(&args.log_level)
                .context("invalid log level")?,
        )
        .init();

    let method: Method = args.method.parse()?;
    let udp_timeout = Duration::from_secs(args.udp_timeout);
    let service = Arc::new(
        Service::with_password(method, &args.password, udp_timeout)
            .context("build service")?,
    );
    let handler = Arc::new(ForwardHandler::new(udp_timeout));

    let tcp = TcpListener::bind(args.listen).await.context("bind tcp")?;
    let udp = Arc::new(UdpSocket::bind(args.listen).await.context("bind udp")?);
    info!("Listening on {} ({})", args.listen, method);

    let sender: Arc<dyn PacketSender> = Arc::new(UdpSender(udp.clone()));
    tokio::spawn(udp_loop(udp, sender, service.clone(), handler.clone()));

    loop {
        let (conn, peer) = tcp.accept().await?;
        let service = service.clone();
        let handler = handler.clone();
        tokio::spawn(async move {
            if let Err(err) = service.new_connection(conn, peer, handler.as_ref()).await {
                warn!("{err}");
            }
        });
    }
}

async fn udp_loop(
    socket: Arc<UdpSocket>,
    sender: Arc<dyn PacketSender>,
    service: Arc<Service>,
    handler: Arc<ForwardHandler>,
) {
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let (n, source) = match socket.recv_from(&mut buf).await {
            Ok(received) => received,
            Err(err) => {
                warn!("udp receive failed: {err}");
                continue;
            }
        };
        let packet = BytesMut::from(&buf[..n]);
        let service = service.clone();
        let sender = sender.clone();
        let handler = handler.clone();
        tokio::spawn(async move {
            if let Err(err) = service
                .new_packet(&sender, packet, source, handler.as_ref())
                .await
            {
                debug!("{err}");
            }
        });
    }
}
