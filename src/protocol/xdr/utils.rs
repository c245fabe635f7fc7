use std::io::{Read, Write};

pub const ALIGNMENT: usize = 4;

/// Upper bound on speculative allocation driven by a length prefix read off the wire.
const MAX_PREALLOC: usize = 64 * 1024;

pub fn padding_len(src_len: usize) -> usize {
    (ALIGNMENT - (src_len % ALIGNMENT)) % ALIGNMENT
}

pub fn read_padding(src_len: usize, src: &mut impl Read) -> std::io::Result<()> {
    let pad_len = padding_len(src_len);
    if pad_len > 0 {
        let mut padding_buffer: [u8; ALIGNMENT] = Default::default();
        src.read_exact(&mut padding_buffer[..pad_len])?;
    }
    Ok(())
}

pub fn write_padding(src_len: usize, dest: &mut impl Write) -> std::io::Result<()> {
    let pad_len = padding_len(src_len);
    if pad_len > 0 {
        let padding_buffer: [u8; ALIGNMENT] = Default::default();
        dest.write_all(&padding_buffer[..pad_len])?;
    }
    Ok(())
}

/// Reads exactly `length` opaque bytes plus padding into `dest`.
///
/// The length comes from the peer, so the buffer grows with the data that
/// actually arrives instead of being sized up front.
pub fn read_opaque(length: usize, dest: &mut Vec<u8>, src: &mut impl Read) -> std::io::Result<()> {
    dest.clear();
    dest.reserve(length.min(MAX_PREALLOC));
    let read = src.take(length as u64).read_to_end(dest)?;
    if read != length {
        dest.clear();
        return Err(std::io::Error::new(
            std::io::ErrorKind::UnexpectedEof,
            format!("opaque data truncated: {read} of {length} bytes"),
        ));
    }
    read_padding(length, src)
}

/// Capacity to reserve for `length` decoded elements.
pub fn prealloc_hint(length: usize) -> usize {
    length.min(MAX_PREALLOC / 8)
}

pub fn invalid_data(m: &str) -> std::io::Error {
    std::io::Error::new(std::io::ErrorKind::InvalidData, m)
}
