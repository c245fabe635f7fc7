use std::io;
use std::net::SocketAddr;
#[cfg(unix)]
use std::os::fd::AsRawFd;

use async_trait::async_trait;
use tokio::net::UdpSocket;
use tracing::{trace, warn};

use super::{ChannelOps, LinkState, Packet};

/// Largest UDP payload over IPv4.
pub(super) const MAX_DATAGRAM: usize = 65507;

pub(super) struct DatagramChannel {
    socket: UdpSocket,
    connected: bool,
}

impl DatagramChannel {
    pub(super) fn new(socket: UdpSocket, connected: bool) -> Self {
        Self { socket, connected }
    }
}

/// Errors that only mean a datagram went missing, such as an ICMP
/// port-unreachable reported on the next socket operation.
fn is_transient(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::WouldBlock
            | io::ErrorKind::Interrupted
            | io::ErrorKind::ConnectionRefused
            | io::ErrorKind::ConnectionReset
    )
}

#[async_trait]
impl ChannelOps for DatagramChannel {
    fn send(&self, link: &LinkState, bufs: &[&[u8]], dest: Option<SocketAddr>) -> io::Result<()> {
        let msg = bufs.concat();
        if msg.len() > MAX_DATAGRAM {
            warn!("datagram of {} bytes is too large, dropped", msg.len());
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "datagram too large"));
        }
        let sent = match (self.connected, dest) {
            (true, _) => self.socket.try_send(&msg),
            (false, Some(addr)) => self.socket.try_send_to(&msg, addr),
            (false, None) => {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    "unconnected datagram transport needs a destination",
                ))
            }
        };
        match sent {
            Ok(n) => {
                link.account(n, n);
                Ok(())
            }
            Err(e) if is_transient(&e) => {
                trace!("datagram to {:?} dropped: {e}", dest);
                Ok(())
            }
            Err(e) => {
                warn!("datagram send failed: {e}");
                link.fail();
                Err(e)
            }
        }
    }

    async fn recv(&self) -> io::Result<Option<Packet>> {
        let mut buf = vec![0_u8; MAX_DATAGRAM + 1];
        loop {
            match self.socket.recv_from(&mut buf).await {
                Ok((n, source)) => {
                    buf.truncate(n);
                    return Ok(Some(Packet { data: buf, source: Some(source) }));
                }
                Err(e) if is_transient(&e) => trace!("datagram receive: {e}"),
                Err(e) => return Err(e),
            }
        }
    }

    fn send_buffer_size(&self) -> i32 {
        #[cfg(unix)]
        return super::socket_send_buffer(self.socket.as_raw_fd());
        #[cfg(not(unix))]
        return -1;
    }
}
