//! Unix-domain stream transport with descriptor passing.
//!
//! Framing is the same as for any stream. A descriptor travels as
//! `SCM_RIGHTS` ancillary data attached to the first bytes of the frame it
//! was sent with. Received descriptors wait in a small queue until the
//! application claims them; once the queue is full, further arrivals are
//! closed.

use std::collections::VecDeque;
use std::io;
use std::mem;
use std::net::SocketAddr;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::ptr;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::Interest;
use tokio::net::UnixStream;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

use super::framing::{self, Frame, FrameDecoder};
use super::{ChannelOps, LinkState, Packet, StreamConfig};

/// Received descriptors kept for the application before new ones are closed.
pub const MAX_QUEUED_FDS: usize = 4;

const READ_CHUNK: usize = 16 * 1024;

struct Outgoing {
    frame: Vec<u8>,
    fd: Option<OwnedFd>,
}

pub(super) struct UnixChannel {
    socket: Arc<UnixStream>,
    decoder: tokio::sync::Mutex<FrameDecoder>,
    writer: mpsc::UnboundedSender<Outgoing>,
    fds: std::sync::Mutex<VecDeque<OwnedFd>>,
    max_packet: usize,
    sndbuf: i32,
}

impl UnixChannel {
    pub(super) fn new(socket: UnixStream, link: Arc<LinkState>, config: &StreamConfig) -> Self {
        let sndbuf = super::socket_send_buffer(socket.as_raw_fd());
        let socket = Arc::new(socket);
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(write_loop(Arc::clone(&socket), rx, link));
        Self {
            socket,
            decoder: tokio::sync::Mutex::new(FrameDecoder::new(config.max_packet)),
            writer: tx,
            fds: std::sync::Mutex::new(VecDeque::new()),
            max_packet: config.max_packet,
            sndbuf,
        }
    }

    fn enqueue(&self, link: &LinkState, out: Outgoing) -> io::Result<()> {
        if self.writer.send(out).is_err() {
            link.fail();
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "unix writer has exited"));
        }
        Ok(())
    }

    fn frame(&self, link: &LinkState, bufs: &[&[u8]]) -> io::Result<Vec<u8>> {
        match framing::encode_frame(bufs, self.max_packet) {
            Ok(frame) => {
                link.account(frame.len() - framing::HEADER_LEN, frame.len());
                Ok(frame)
            }
            Err(e) => {
                warn!("unix send: {e}");
                link.fail();
                Err(e)
            }
        }
    }

    pub(super) fn send_with_fd(&self, link: &LinkState, bufs: &[&[u8]], fd: OwnedFd) -> io::Result<()> {
        let frame = self.frame(link, bufs)?;
        self.enqueue(link, Outgoing { frame, fd: Some(fd) })
    }

    pub(super) fn send_break(&self, link: &LinkState) -> io::Result<()> {
        let frame = framing::encode_break().to_vec();
        link.account(0, frame.len());
        self.enqueue(link, Outgoing { frame, fd: None })
    }

    pub(super) fn take_fd(&self) -> Option<OwnedFd> {
        self.fds.lock().expect("unable to unlock descriptor queue mutex").pop_front()
    }

    fn queue_fds(&self, received: Vec<OwnedFd>) {
        if received.is_empty() {
            return;
        }
        let mut fds = self.fds.lock().expect("unable to unlock descriptor queue mutex");
        for fd in received {
            if fds.len() >= MAX_QUEUED_FDS {
                warn!("{} unclaimed descriptors queued, closing fd {}", fds.len(), fd.as_raw_fd());
                drop(fd);
            } else {
                trace!("queued received fd {}", fd.as_raw_fd());
                fds.push_back(fd);
            }
        }
    }
}

#[async_trait]
impl ChannelOps for UnixChannel {
    fn send(&self, link: &LinkState, bufs: &[&[u8]], _dest: Option<SocketAddr>) -> io::Result<()> {
        let frame = self.frame(link, bufs)?;
        self.enqueue(link, Outgoing { frame, fd: None })
    }

    async fn recv(&self) -> io::Result<Option<Packet>> {
        let mut decoder = self.decoder.lock().await;
        loop {
            match decoder.next_frame()? {
                Some(Frame::Packet(data)) => return Ok(Some(Packet { data, source: None })),
                Some(Frame::Break) => {
                    trace!("descriptor synchronisation break");
                    continue;
                }
                None => {}
            }
            let mut chunk = [0_u8; READ_CHUNK];
            let mut received = Vec::new();
            let n = loop {
                self.socket.readable().await?;
                let fd = self.socket.as_raw_fd();
                match self
                    .socket
                    .try_io(Interest::READABLE, || recvmsg_with_fds(fd, &mut chunk, &mut received))
                {
                    Ok(n) => break n,
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
                    Err(e) => return Err(e),
                }
            };
            self.queue_fds(received);
            if n == 0 {
                return Ok(None);
            }
            decoder.extend(&chunk[..n]);
        }
    }

    fn send_buffer_size(&self) -> i32 {
        self.sndbuf
    }
}

async fn write_loop(socket: Arc<UnixStream>, mut rx: mpsc::UnboundedReceiver<Outgoing>, link: Arc<LinkState>) {
    loop {
        let out = tokio::select! {
            out = rx.recv() => match out {
                Some(out) => out,
                None => break,
            },
            _ = link.failed() => break,
        };
        if let Err(e) = write_all(&socket, out).await {
            debug!("unix write failed: {e}");
            link.fail();
            break;
        }
    }
}

async fn write_all(socket: &UnixStream, out: Outgoing) -> io::Result<()> {
    let Outgoing { frame, mut fd } = out;
    let mut offset = 0;
    while offset < frame.len() {
        socket.writable().await?;
        let raw = socket.as_raw_fd();
        let passing = fd.as_ref().map(|f| f.as_raw_fd());
        match socket.try_io(Interest::WRITABLE, || sendmsg_with_fd(raw, &frame[offset..], passing)) {
            Ok(0) => return Err(io::Error::new(io::ErrorKind::WriteZero, "unix socket wrote 0 bytes")),
            Ok(n) => {
                offset += n;
                // the kernel holds its own reference once any byte went out
                fd = None;
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

/// Control buffer with the alignment `cmsghdr` requires.
#[repr(C, align(8))]
struct CmsgBuffer([u8; 128]);

fn sendmsg_with_fd(sock: RawFd, data: &[u8], fd: Option<RawFd>) -> io::Result<usize> {
    let mut iov = libc::iovec { iov_base: data.as_ptr() as *mut libc::c_void, iov_len: data.len() };
    let mut control = CmsgBuffer([0; 128]);
    // SAFETY: msghdr is plain old data; every pointer stored in it refers to
    // locals that outlive the sendmsg call
    unsafe {
        let mut msg: libc::msghdr = mem::zeroed();
        msg.msg_iov = &mut iov;
        msg.msg_iovlen = 1;
        if let Some(fd) = fd {
            let payload = mem::size_of::<RawFd>() as libc::c_uint;
            msg.msg_control = control.0.as_mut_ptr() as *mut libc::c_void;
            msg.msg_controllen = libc::CMSG_SPACE(payload) as _;
            let cmsg = libc::CMSG_FIRSTHDR(&msg);
            (*cmsg).cmsg_level = libc::SOL_SOCKET;
            (*cmsg).cmsg_type = libc::SCM_RIGHTS;
            (*cmsg).cmsg_len = libc::CMSG_LEN(payload) as _;
            ptr::write_unaligned(libc::CMSG_DATA(cmsg) as *mut RawFd, fd);
        }
        let n = libc::sendmsg(sock, &msg, 0);
        if n < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(n as usize)
    }
}

/// Received descriptors are close-on-exec, like every descriptor std opens.
#[cfg(any(target_os = "linux", target_os = "android"))]
const RECV_FLAGS: libc::c_int = libc::MSG_CMSG_CLOEXEC;
#[cfg(not(any(target_os = "linux", target_os = "android")))]
const RECV_FLAGS: libc::c_int = 0;

fn recvmsg_with_fds(sock: RawFd, buf: &mut [u8], fds: &mut Vec<OwnedFd>) -> io::Result<usize> {
    let mut iov = libc::iovec { iov_base: buf.as_mut_ptr() as *mut libc::c_void, iov_len: buf.len() };
    let mut control = CmsgBuffer([0; 128]);
    // SAFETY: as in sendmsg_with_fd; descriptors taken out of SCM_RIGHTS
    // messages are freshly installed in this process and owned by nobody else
    unsafe {
        let mut msg: libc::msghdr = mem::zeroed();
        msg.msg_iov = &mut iov;
        msg.msg_iovlen = 1;
        msg.msg_control = control.0.as_mut_ptr() as *mut libc::c_void;
        msg.msg_controllen = mem::size_of::<CmsgBuffer>() as _;
        let n = libc::recvmsg(sock, &mut msg, RECV_FLAGS);
        if n < 0 {
            return Err(io::Error::last_os_error());
        }
        let mut cmsg = libc::CMSG_FIRSTHDR(&msg);
        while !cmsg.is_null() {
            if (*cmsg).cmsg_level == libc::SOL_SOCKET && (*cmsg).cmsg_type == libc::SCM_RIGHTS {
                let data = libc::CMSG_DATA(cmsg) as *const RawFd;
                let bytes = (*cmsg).cmsg_len as usize - libc::CMSG_LEN(0) as usize;
                let count = bytes / mem::size_of::<RawFd>();
                for i in 0..count {
                    let fd = ptr::read_unaligned(data.add(i));
                    #[cfg(not(any(target_os = "linux", target_os = "android")))]
                    libc::fcntl(fd, libc::F_SETFD, libc::FD_CLOEXEC);
                    fds.push(OwnedFd::from_raw_fd(fd));
                }
            }
            cmsg = libc::CMSG_NXTHDR(&msg, cmsg);
        }
        if msg.msg_flags & libc::MSG_CTRUNC != 0 {
            warn!("descriptor control data truncated, some descriptors were lost");
        }
        Ok(n as usize)
    }
}
