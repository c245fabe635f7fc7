//! Record framing for byte-stream transports.
//!
//! Every packet is preceded by a 4-byte big-endian length word whose top bit
//! is always set. A word of exactly `0x80000000` (length zero) is a break
//! marker rather than an empty packet. A word without the top bit, or a
//! length above the configured maximum, is a protocol violation and the
//! connection cannot be resynchronised after it.

use std::io;

use tracing::trace;

/// Default upper bound on a single packet, header excluded.
pub const DEFAULT_MAX_PACKET: usize = 0x10400;
/// Top bit of the length word; set on every valid frame.
pub const LAST_FRAGMENT: u32 = 1 << 31;
/// Length word of a break frame.
pub const BREAK_MARKER: u32 = LAST_FRAGMENT;
/// Size of the length word.
pub const HEADER_LEN: usize = 4;

/// A unit decoded from the byte stream.
#[derive(Debug, PartialEq, Eq)]
pub enum Frame {
    Packet(Vec<u8>),
    Break,
}

/// Concatenates `bufs` behind a length word.
///
/// Fails without producing anything if the packet is empty or larger than
/// `max_packet`.
pub fn encode_frame(bufs: &[&[u8]], max_packet: usize) -> io::Result<Vec<u8>> {
    let len: usize = bufs.iter().map(|b| b.len()).sum();
    if len == 0 {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "empty packets cannot be framed, use a break instead",
        ));
    }
    if len > max_packet {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("packet of {len} bytes exceeds maximum {max_packet}"),
        ));
    }
    let mut frame = Vec::with_capacity(HEADER_LEN + len);
    frame.extend_from_slice(&(LAST_FRAGMENT | len as u32).to_be_bytes());
    for buf in bufs {
        frame.extend_from_slice(buf);
    }
    trace!("framed packet length:{}", len);
    Ok(frame)
}

/// The wire form of a break frame.
pub fn encode_break() -> [u8; HEADER_LEN] {
    BREAK_MARKER.to_be_bytes()
}

/// Incremental decoder for the framed byte stream.
#[derive(Debug)]
pub struct FrameDecoder {
    buf: Vec<u8>,
    max_packet: usize,
}

impl FrameDecoder {
    pub fn new(max_packet: usize) -> Self {
        Self { buf: Vec::new(), max_packet }
    }

    /// Appends bytes read from the stream.
    pub fn extend(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Bytes received but not yet returned as frames.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Returns the next complete frame, `Ok(None)` if more input is needed.
    pub fn next_frame(&mut self) -> io::Result<Option<Frame>> {
        if self.buf.len() < HEADER_LEN {
            return Ok(None);
        }
        let word = u32::from_be_bytes([self.buf[0], self.buf[1], self.buf[2], self.buf[3]]);
        if word & LAST_FRAGMENT == 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("frame header {word:#010x} lacks the record-mark bit"),
            ));
        }
        let len = (word & !LAST_FRAGMENT) as usize;
        if len > self.max_packet {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("frame length {len} exceeds max {}", self.max_packet),
            ));
        }
        if len == 0 {
            self.buf.drain(..HEADER_LEN);
            return Ok(Some(Frame::Break));
        }
        if self.buf.len() < HEADER_LEN + len {
            return Ok(None);
        }
        let packet = self.buf[HEADER_LEN..HEADER_LEN + len].to_vec();
        self.buf.drain(..HEADER_LEN + len);
        trace!("decoded frame length:{}", len);
        Ok(Some(Frame::Packet(packet)))
    }
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_PACKET)
    }
}
