//! Listener / connector (§4.10): accepts inbound peers and dials outbound ones.

use std::net::SocketAddr;
use std::time::Duration;

use anyhow::Context;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;

const OUTBOUND_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

pub struct Listener {
    tcp: TcpListener,
    pub local_addr: SocketAddr,
}

impl Listener {
    pub async fn bind(addr: SocketAddr) -> anyhow::Result<Self> {
        let socket = if addr.is_ipv4() {
            tokio::net::TcpSocket::new_v4()?
        } else {
            tokio::net::TcpSocket::new_v6()?
        };
        socket.set_reuseaddr(true)?;
        socket.bind(addr).context("binding listen socket")?;
        let tcp = socket.listen(1024).context("starting listener")?;
        let local_addr = tcp.local_addr()?;
        tracing::info!(%local_addr, "listening for incoming peer connections");
        Ok(Self { tcp, local_addr })
    }

    pub async fn accept(&self) -> anyhow::Result<(TcpStream, SocketAddr)> {
        self.tcp.accept().await.context("accepting inbound peer")
    }
}

pub async fn connect(addr: SocketAddr) -> anyhow::Result<TcpStream> {
    timeout(OUTBOUND_CONNECT_TIMEOUT, TcpStream::connect(addr))
        .await
        .context("connect timed out")?
        .with_context(|| format!("connecting to {addr}"))
}
