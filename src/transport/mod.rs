//! Transports carry whole RPC messages between peers.
//!
//! A [`Transport`] is one of a fixed set of channel shapes:
//!
//! - datagram: a UDP socket; each send is one datagram, nothing is ordered
//!   or reliable and every received packet carries its source address;
//! - stream: any ordered byte stream (TCP, a pipe pair, an in-memory duplex)
//!   with length-prefixed framing, see [`framing`];
//! - unix: a unix-domain stream that can also pass open file descriptors.
//!
//! All shapes share the same surface: a synchronous non-blocking
//! [`Transport::send`], a single [`ReceiveHandler`] that gets every inbound
//! packet, [`Transport::poll`] for a single receive step, and EOF and byte
//! accounting. A write error other than would-block fails the transport for
//! good; the handler then sees exactly one `None` and no further sends are
//! attempted.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::io;
use std::net::SocketAddr;
#[cfg(unix)]
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpStream, UdpSocket};
use tokio::sync::{mpsc, Notify};
use tracing::{debug, trace, warn};

use crate::protocol::rpc::Session;

mod datagram;
pub mod framing;
mod stream;
#[cfg(unix)]
mod unix;

pub use framing::DEFAULT_MAX_PACKET;
#[cfg(unix)]
pub use unix::MAX_QUEUED_FDS;

/// One inbound message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Packet {
    pub data: Vec<u8>,
    /// Sender address; only datagram transports report one.
    pub source: Option<SocketAddr>,
}

/// Receives everything that arrives on a transport.
///
/// `None` reports end of file or a permanent failure and is delivered at
/// most once. The handler may replace or clear itself from inside
/// `receive`.
pub trait ReceiveHandler: Send + Sync {
    fn receive(&self, packet: Option<Packet>);
}

impl ReceiveHandler for mpsc::UnboundedSender<Option<Packet>> {
    fn receive(&self, packet: Option<Packet>) {
        let _ = self.send(packet);
    }
}

/// The shape of a transport.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum TransportKind {
    Datagram,
    Stream,
    Unix,
}

/// Settings for framed byte-stream transports.
#[derive(Clone, Debug)]
pub struct StreamConfig {
    /// Largest packet accepted or sent, header excluded.
    pub max_packet: usize,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self { max_packet: DEFAULT_MAX_PACKET }
    }
}

impl StreamConfig {
    pub fn with_max_packet(mut self, max_packet: usize) -> Self {
        self.max_packet = max_packet;
        self
    }
}

/// Failure flag and counters shared between a transport and its I/O tasks.
#[derive(Default)]
pub(crate) struct LinkState {
    failed: AtomicBool,
    notify: Notify,
    bytes_sent: AtomicU64,
    raw_bytes_sent: AtomicU64,
}

impl LinkState {
    /// Marks the link failed; returns true for the first caller.
    fn fail(&self) -> bool {
        let first = !self.failed.swap(true, Ordering::SeqCst);
        self.notify.notify_waiters();
        first
    }

    fn is_failed(&self) -> bool {
        self.failed.load(Ordering::SeqCst)
    }

    /// Resolves once the link has failed.
    async fn failed(&self) {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.is_failed() {
                return;
            }
            notified.await;
        }
    }

    fn account(&self, payload: usize, raw: usize) {
        self.bytes_sent.fetch_add(payload as u64, Ordering::SeqCst);
        self.raw_bytes_sent.fetch_add(raw as u64, Ordering::SeqCst);
    }
}

/// Capabilities every channel shape provides.
#[async_trait]
trait ChannelOps: Send + Sync {
    fn send(&self, link: &LinkState, bufs: &[&[u8]], dest: Option<SocketAddr>) -> io::Result<()>;

    /// Next inbound packet; `Ok(None)` on orderly end of file.
    async fn recv(&self) -> io::Result<Option<Packet>>;

    fn send_buffer_size(&self) -> i32;
}

enum Channel {
    Datagram(datagram::DatagramChannel),
    Stream(stream::StreamChannel),
    #[cfg(unix)]
    Unix(unix::UnixChannel),
}

impl Channel {
    fn ops(&self) -> &dyn ChannelOps {
        match self {
            Channel::Datagram(c) => c,
            Channel::Stream(c) => c,
            #[cfg(unix)]
            Channel::Unix(c) => c,
        }
    }
}

thread_local! {
    /// Transports whose receive handler is running on this thread.
    static DELIVERING: RefCell<Vec<usize>> = const { RefCell::new(Vec::new()) };
}

struct DeliveryScope(usize);

impl DeliveryScope {
    fn enter(id: usize) -> Self {
        DELIVERING.with(|d| d.borrow_mut().push(id));
        Self(id)
    }
}

impl Drop for DeliveryScope {
    fn drop(&mut self) {
        DELIVERING.with(|d| {
            let mut d = d.borrow_mut();
            if let Some(pos) = d.iter().rposition(|id| *id == self.0) {
                d.remove(pos);
            }
        });
    }
}

/// A message channel to one peer (or, for unconnected datagram sockets,
/// to many).
pub struct Transport {
    kind: TransportKind,
    connected: bool,
    channel: Channel,
    link: Arc<LinkState>,
    handler: Mutex<Option<Arc<dyn ReceiveHandler>>>,
    /// Packets that arrived while no handler was installed.
    pending: Mutex<VecDeque<Option<Packet>>>,
    eof_queued: AtomicBool,
    pumping: AtomicBool,
    stop_pump: Notify,
    session: Mutex<Weak<Session>>,
}

impl Transport {
    fn build(kind: TransportKind, connected: bool, channel: Channel, link: Arc<LinkState>) -> Arc<Self> {
        Arc::new(Self {
            kind,
            connected,
            channel,
            link,
            handler: Mutex::new(None),
            pending: Mutex::new(VecDeque::new()),
            eof_queued: AtomicBool::new(false),
            pumping: AtomicBool::new(false),
            stop_pump: Notify::new(),
            session: Mutex::new(Weak::new()),
        })
    }

    /// Wraps a UDP socket. A socket that was `connect`ed only talks to its peer.
    pub fn datagram(socket: UdpSocket) -> Arc<Self> {
        let connected = socket.peer_addr().is_ok();
        let channel = datagram::DatagramChannel::new(socket, connected);
        Self::build(
            TransportKind::Datagram,
            connected,
            Channel::Datagram(channel),
            Arc::new(LinkState::default()),
        )
    }

    /// Wraps an established TCP connection.
    pub fn tcp(socket: TcpStream) -> Arc<Self> {
        Self::tcp_with(socket, StreamConfig::default())
    }

    pub fn tcp_with(socket: TcpStream, config: StreamConfig) -> Arc<Self> {
        let _ = socket.set_nodelay(true);
        #[cfg(unix)]
        let sndbuf = socket_send_buffer(socket.as_raw_fd());
        #[cfg(not(unix))]
        let sndbuf = -1;
        let (reader, writer) = socket.into_split();
        Self::framed(reader, writer, config, sndbuf)
    }

    /// Wraps any bidirectional byte stream.
    pub fn stream<S>(io: S, config: StreamConfig) -> Arc<Self>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (reader, writer) = tokio::io::split(io);
        Self::framed(reader, writer, config, -1)
    }

    /// Wraps a pair of unidirectional streams, such as the two ends of two pipes.
    pub fn pipe<R, W>(reader: R, writer: W, config: StreamConfig) -> Arc<Self>
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self::framed(reader, writer, config, -1)
    }

    fn framed<R, W>(reader: R, writer: W, config: StreamConfig, sndbuf: i32) -> Arc<Self>
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let link = Arc::new(LinkState::default());
        let channel = stream::StreamChannel::new(reader, writer, Arc::clone(&link), &config, sndbuf);
        Self::build(TransportKind::Stream, true, Channel::Stream(channel), link)
    }

    /// Wraps a unix-domain stream socket, enabling descriptor passing.
    #[cfg(unix)]
    pub fn unix(socket: tokio::net::UnixStream, config: StreamConfig) -> Arc<Self> {
        let link = Arc::new(LinkState::default());
        let channel = unix::UnixChannel::new(socket, Arc::clone(&link), &config);
        Self::build(TransportKind::Unix, true, Channel::Unix(channel), link)
    }

    pub fn kind(&self) -> TransportKind {
        self.kind
    }

    /// Stream-shaped transports deliver everything, in order, or fail.
    pub fn is_reliable(&self) -> bool {
        self.kind != TransportKind::Datagram
    }

    /// Whether every packet goes to, and comes from, a single peer.
    pub fn is_connected(&self) -> bool {
        self.connected
    }

    /// Queues one message made of `bufs`.
    ///
    /// Never blocks. `dest` is only consulted by unconnected datagram
    /// transports. A message that cannot be sent on a failed transport, or
    /// that is too large for a stream, is reported as an error.
    pub fn send(&self, bufs: &[&[u8]], dest: Option<SocketAddr>) -> io::Result<()> {
        if self.link.is_failed() {
            return Err(io::Error::new(io::ErrorKind::NotConnected, "transport has failed"));
        }
        self.channel.ops().send(&self.link, bufs, dest)
    }

    /// Sends a break frame on a stream-shaped transport.
    pub fn send_break(&self) -> io::Result<()> {
        if self.link.is_failed() {
            return Err(io::Error::new(io::ErrorKind::NotConnected, "transport has failed"));
        }
        match &self.channel {
            Channel::Stream(c) => c.send_break(&self.link),
            #[cfg(unix)]
            Channel::Unix(c) => c.send_break(&self.link),
            Channel::Datagram(_) => Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "datagram transports have no break frames",
            )),
        }
    }

    /// Sends a message together with an open descriptor (unix transports only).
    #[cfg(unix)]
    pub fn send_with_fd(&self, bufs: &[&[u8]], fd: OwnedFd) -> io::Result<()> {
        if self.link.is_failed() {
            return Err(io::Error::new(io::ErrorKind::NotConnected, "transport has failed"));
        }
        match &self.channel {
            Channel::Unix(c) => c.send_with_fd(&self.link, bufs, fd),
            _ => Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "descriptor passing needs a unix transport",
            )),
        }
    }

    /// Claims the oldest descriptor received and not yet claimed.
    #[cfg(unix)]
    pub fn take_fd(&self) -> Option<OwnedFd> {
        match &self.channel {
            Channel::Unix(c) => c.take_fd(),
            _ => None,
        }
    }

    /// Installs or clears the receive handler.
    ///
    /// Safe to call from inside the handler. Installing a handler first
    /// hands it whatever arrived while there was none; clearing it stops
    /// the receive pump.
    pub fn set_receive_handler(&self, handler: Option<Arc<dyn ReceiveHandler>>) {
        let installed = handler.is_some();
        *self.handler.lock().expect("unable to unlock handler mutex") = handler;
        if installed {
            self.flush_pending();
        } else {
            self.stop_pump.notify_waiters();
        }
    }

    fn current_handler(&self) -> Option<Arc<dyn ReceiveHandler>> {
        self.handler.lock().expect("unable to unlock handler mutex").clone()
    }

    fn flush_pending(&self) {
        loop {
            let Some(handler) = self.current_handler() else {
                return;
            };
            let next = self.pending.lock().expect("unable to unlock pending mutex").pop_front();
            let Some(packet) = next else {
                return;
            };
            let _scope = DeliveryScope::enter(self.id());
            handler.receive(packet);
        }
    }

    fn deliver(&self, packet: Option<Packet>) {
        if packet.is_none() && self.eof_queued.swap(true, Ordering::SeqCst) {
            return;
        }
        match self.current_handler() {
            Some(handler) => {
                let _scope = DeliveryScope::enter(self.id());
                handler.receive(packet);
            }
            None => {
                trace!("no receive handler, parking packet");
                self.pending.lock().expect("unable to unlock pending mutex").push_back(packet);
            }
        }
    }

    fn id(&self) -> usize {
        self as *const Self as usize
    }

    /// Performs one receive step: waits for the next packet (or for the
    /// transport to fail) and hands it to the handler.
    ///
    /// Calling this from inside this transport's own receive handler is an
    /// error, as is polling after end of file was delivered.
    pub async fn poll(&self) -> io::Result<()> {
        let id = self.id();
        if DELIVERING.with(|d| d.borrow().contains(&id)) {
            return Err(io::Error::new(
                io::ErrorKind::Other,
                "poll called from within the transport's own receive handler",
            ));
        }
        if self.eof_queued.load(Ordering::SeqCst) {
            return Err(io::Error::new(io::ErrorKind::NotConnected, "transport is at EOF"));
        }
        if self.link.is_failed() {
            self.deliver(None);
            return Ok(());
        }

        let received = tokio::select! {
            r = self.channel.ops().recv() => r,
            _ = self.link.failed() => Ok(None),
        };
        match received {
            Ok(Some(packet)) => {
                trace!("received {} bytes from {:?}", packet.data.len(), packet.source);
                self.deliver(Some(packet));
            }
            Ok(None) => {
                debug!("transport reached EOF");
                self.link.fail();
                self.deliver(None);
            }
            Err(e) => {
                warn!("transport receive failed: {e}");
                self.link.fail();
                self.deliver(None);
            }
        }
        Ok(())
    }

    /// Starts a task that keeps polling while a handler is installed.
    ///
    /// Clearing the handler stops the task, but a handler installed again
    /// before it notices keeps it running.
    pub fn spawn_pump(self: &Arc<Self>) {
        if self.pumping.swap(true, Ordering::SeqCst) {
            return;
        }
        let xprt = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                let stopped = xprt.stop_pump.notified();
                tokio::pin!(stopped);
                stopped.as_mut().enable();
                if xprt.current_handler().is_none() {
                    break;
                }
                tokio::select! {
                    _ = &mut stopped => continue,
                    r = xprt.poll() => {
                        if let Err(e) = r {
                            debug!("receive pump stopping: {e}");
                            break;
                        }
                    }
                }
            }
            xprt.pumping.store(false, Ordering::SeqCst);
            // a handler installed between the last check and the store above
            // found the flag still set and did not start a pump
            if xprt.current_handler().is_some() && !xprt.eof_queued.load(Ordering::SeqCst) {
                xprt.spawn_pump();
            }
        });
    }

    /// Whether a receive pump task is running.
    pub fn is_pumping(&self) -> bool {
        self.pumping.load(Ordering::SeqCst)
    }

    /// Fails the transport; the handler sees end of file once.
    pub fn fail(&self) {
        if self.link.fail() {
            debug!("transport failed by owner");
        }
    }

    pub fn at_eof(&self) -> bool {
        self.link.is_failed()
    }

    /// Payload bytes accepted for sending so far.
    pub fn bytes_sent(&self) -> u64 {
        self.link.bytes_sent.load(Ordering::SeqCst)
    }

    /// Bytes accepted for sending including framing overhead; this is the
    /// offset into the peer's byte stream.
    pub fn raw_bytes_sent(&self) -> u64 {
        self.link.raw_bytes_sent.load(Ordering::SeqCst)
    }

    /// Kernel send buffer size, or -1 if unknown.
    pub fn send_buffer_size(&self) -> i32 {
        self.channel.ops().send_buffer_size()
    }

    pub(crate) fn session_slot(&self) -> &Mutex<Weak<Session>> {
        &self.session
    }
}

impl std::fmt::Debug for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transport")
            .field("kind", &self.kind)
            .field("connected", &self.connected)
            .field("failed", &self.link.is_failed())
            .finish()
    }
}

#[cfg(unix)]
pub(crate) fn socket_send_buffer(fd: RawFd) -> i32 {
    let mut val: libc::c_int = 0;
    let mut len = std::mem::size_of::<libc::c_int>() as libc::socklen_t;
    // SAFETY: `val` and `len` outlive the call and describe a c_int buffer
    let rc = unsafe {
        libc::getsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_SNDBUF,
            &mut val as *mut libc::c_int as *mut libc::c_void,
            &mut len,
        )
    };
    if rc < 0 {
        -1
    } else {
        val
    }
}
