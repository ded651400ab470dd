//! TCP listener and dialer
//!
//! Accepts inbound connections, opens outbound ones with a deadline and
//! resolves DNS seeds into peer addresses.

use crate::network::peer::PeerError;
use crate::wire::netaddress::NetAddress;
use crate::wire::types::Services;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};

/// Time allowed for an outbound TCP connect
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// TCP server for accepting peer connections
pub struct Server {
    listener: TcpListener,
    address: SocketAddr,
}

impl Server {
    /// Bind the listener
    pub async fn bind(addr: SocketAddr) -> Result<Self, std::io::Error> {
        let listener = TcpListener::bind(addr).await?;
        let address = listener.local_addr()?;
        log::info!("Server listening on {}", address);

        Ok(Self { listener, address })
    }

    /// Bound address (with the real port when bound to port 0)
    pub fn local_addr(&self) -> SocketAddr {
        self.address
    }

    pub fn port(&self) -> u16 {
        self.address.port()
    }

    /// Accept the next inbound connection
    pub async fn accept(&self) -> Result<(TcpStream, SocketAddr), std::io::Error> {
        let (stream, addr) = self.listener.accept().await?;
        stream.set_nodelay(true)?;
        Ok((stream, addr))
    }
}

/// Connect to a peer, failing after `timeout`
pub async fn connect(addr: SocketAddr, timeout: Duration) -> Result<TcpStream, PeerError> {
    let stream = tokio::time::timeout(timeout, TcpStream::connect(addr))
        .await
        .map_err(|_| PeerError::ConnectTimeout)??;

    stream.set_nodelay(true)?;

    Ok(stream)
}

/// Resolve a DNS seed (or literal address) to peer addresses
pub async fn resolve(host: &str, default_port: u16) -> Result<Vec<NetAddress>, std::io::Error> {
    let target = if let Ok(addr) = host.parse::<SocketAddr>() {
        addr.to_string()
    } else if let Ok(ip) = host.parse::<IpAddr>() {
        SocketAddr::new(ip, default_port).to_string()
    } else if host.rsplit_once(':').is_some_and(|(_, port)| port.parse::<u16>().is_ok()) {
        host.to_string()
    } else {
        format!("{}:{}", host, default_port)
    };

    let now = chrono::Utc::now().timestamp() as u64;
    let addrs = tokio::net::lookup_host(target)
        .await?
        .map(|addr| NetAddress::new(addr.ip(), addr.port(), Services::NETWORK, now))
        .collect();

    Ok(addrs)
}
