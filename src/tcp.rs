//! The TCP module provides listeners and connectors that produce transports.
//!
//! [`RpcTcpListener`] accepts TCP connections and hands each one, wrapped in
//! a framed [`Transport`], to a connection handler that typically attaches
//! a [`Server`](crate::protocol::rpc::Server). The `connect_*` and `bind_*`
//! helpers establish client-side transports; name resolution happens here
//! and nowhere else.

use std::io;
use std::net::{IpAddr, SocketAddr};
#[cfg(unix)]
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs, UdpSocket};
use tracing::{debug, info, warn};

use crate::transport::{StreamConfig, Transport};

/// Called with every accepted connection and its peer address.
///
/// An error is logged and fails the connection's transport.
pub type ConnectionHandler = Arc<dyn Fn(Arc<Transport>, SocketAddr) -> anyhow::Result<()> + Send + Sync>;

/// Listens for RPC clients over TCP.
pub struct RpcTcpListener {
    /// TCP Listener for accepting incoming connections
    listener: TcpListener,
    /// Framing settings for accepted connections
    config: StreamConfig,
}

/// Generates a local loopback IP address from a 16-bit host number
/// Used for creating multiple local test addresses in the 127.88.x.y range
pub fn generate_host_ip(hostnum: u16) -> String {
    format!("127.88.{}.{}", ((hostnum >> 8) & 0xFF) as u8, (hostnum & 0xFF) as u8)
}

/// Interface for RPC TCP servers.
#[async_trait]
pub trait RpcTcp: Send + Sync {
    /// Returns the actual port number on which the server is listening
    ///
    /// This is especially useful when binding to port 0, which allows the OS
    /// to assign any available port.
    fn get_listen_port(&self) -> io::Result<u16>;

    /// Returns the IP address on which the server is listening
    fn get_listen_ip(&self) -> io::Result<IpAddr>;

    /// Accepts connections until the listener fails, handing each to
    /// `on_connection`.
    async fn handle_forever(&self, on_connection: ConnectionHandler) -> io::Result<()>;
}

impl RpcTcpListener {
    /// Creates a listener bound to `ipstr`.
    ///
    /// # Arguments
    ///
    /// * `ipstr` - IP address and port in the format "IP:PORT" (e.g. "127.0.0.1:111")
    ///   Special value "auto:PORT" attempts to find an available local address
    pub async fn bind(ipstr: &str) -> io::Result<RpcTcpListener> {
        let (ip, port) = ipstr.split_once(':').ok_or_else(|| {
            io::Error::new(io::ErrorKind::AddrNotAvailable, "IP Address must be of form ip:port")
        })?;
        let port = port.parse::<u16>().map_err(|_| {
            io::Error::new(io::ErrorKind::AddrNotAvailable, "Port not in range 0..=65535")
        })?;

        if ip != "auto" {
            return RpcTcpListener::bind_internal(ip, port).await;
        }

        const NUM_TRIES: u16 = 32;
        for try_ip in 1..=NUM_TRIES {
            let ip = generate_host_ip(try_ip);
            let result = RpcTcpListener::bind_internal(&ip, port).await;

            if result.is_ok() {
                return result;
            }
        }

        Err(io::Error::other("Can't bind automatically"))
    }

    async fn bind_internal(ip: &str, port: u16) -> io::Result<RpcTcpListener> {
        let ipstr = format!("{ip}:{port}");
        let listener = TcpListener::bind(&ipstr).await?;
        info!("Listening on {:?}", &ipstr);
        Ok(RpcTcpListener { listener, config: StreamConfig::default() })
    }

    /// Framing settings for connections accepted from now on.
    pub fn with_stream_config(mut self, config: StreamConfig) -> Self {
        self.config = config;
        self
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accepts one connection.
    pub async fn accept(&self) -> io::Result<(Arc<Transport>, SocketAddr)> {
        let (socket, peer) = self.listener.accept().await?;
        debug!("Accepting socket {:?}", socket);
        Ok((Transport::tcp_with(socket, self.config.clone()), peer))
    }
}

#[async_trait]
impl RpcTcp for RpcTcpListener {
    fn get_listen_port(&self) -> io::Result<u16> {
        Ok(self.listener.local_addr()?.port())
    }

    fn get_listen_ip(&self) -> io::Result<IpAddr> {
        Ok(self.listener.local_addr()?.ip())
    }

    async fn handle_forever(&self, on_connection: ConnectionHandler) -> io::Result<()> {
        loop {
            let (xprt, peer) = self.accept().await?;
            info!("Accepting connection from {}", peer);
            if let Err(e) = on_connection(Arc::clone(&xprt), peer) {
                warn!("Connection from {} refused: {:#}", peer, e);
                xprt.fail();
            }
        }
    }
}

/// Connects to an RPC server over TCP.
pub async fn connect_tcp(addr: impl ToSocketAddrs) -> io::Result<Arc<Transport>> {
    let socket = TcpStream::connect(addr).await?;
    debug!("connected to {:?}", socket.peer_addr());
    Ok(Transport::tcp(socket))
}

/// A datagram transport bound to `addr` and able to talk to anyone.
pub async fn bind_udp(addr: impl ToSocketAddrs) -> io::Result<Arc<Transport>> {
    let socket = UdpSocket::bind(addr).await?;
    Ok(Transport::datagram(socket))
}

/// A datagram transport that only talks to `peer`.
pub async fn connect_udp(peer: SocketAddr) -> io::Result<Arc<Transport>> {
    let local: SocketAddr = if peer.is_ipv4() { ([0, 0, 0, 0], 0).into() } else { ([0_u16; 8], 0).into() };
    let socket = UdpSocket::bind(local).await?;
    socket.connect(peer).await?;
    Ok(Transport::datagram(socket))
}

/// Connects to a unix-domain socket with descriptor passing enabled.
#[cfg(unix)]
pub async fn connect_unix(path: impl AsRef<Path>) -> io::Result<Arc<Transport>> {
    let socket = tokio::net::UnixStream::connect(path).await?;
    Ok(Transport::unix(socket, StreamConfig::default()))
}
