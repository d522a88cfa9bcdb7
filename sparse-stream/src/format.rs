//! Frame layout on the wire.
//!
//! A frame header is a fixed-width ASCII record:
//!
//! ```text
//! <kind> <start:%016x> <length:%016x>\r\n
//! ```
//!
//! with a two byte kind magic, so the full header is always
//! [`FRAME_LEN`] bytes. META and DATA frames are followed by `length`
//! payload bytes and the [`TERM`] byte sequence; ZERO and STOP carry
//! neither payload nor terminator.

use std::io::{Read, Write};

use crate::StreamError;

/// Fixed width of a frame header in bytes.
pub const FRAME_LEN: usize = 38;

/// Terminator written after META, DATA and trailer payloads.
pub const TERM: &[u8; 2] = b"\0\0";

const KIND_META: &[u8; 2] = b"ME";
const KIND_DATA: &[u8; 2] = b"DA";
const KIND_ZERO: &[u8; 2] = b"ZE";
const KIND_STOP: &[u8; 2] = b"ST";
const KIND_TRAILER: &[u8; 2] = b"CO";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    Meta,
    Data,
    Zero,
    Stop,
    /// Compression trailer marker, only valid after STOP.
    Trailer,
}

impl FrameKind {
    fn magic(self) -> &'static [u8; 2] {
        match self {
            FrameKind::Meta => KIND_META,
            FrameKind::Data => KIND_DATA,
            FrameKind::Zero => KIND_ZERO,
            FrameKind::Stop => KIND_STOP,
            FrameKind::Trailer => KIND_TRAILER,
        }
    }

    fn from_magic(magic: &[u8]) -> Option<Self> {
        match magic {
            m if m == KIND_META => Some(FrameKind::Meta),
            m if m == KIND_DATA => Some(FrameKind::Data),
            m if m == KIND_ZERO => Some(FrameKind::Zero),
            m if m == KIND_STOP => Some(FrameKind::Stop),
            m if m == KIND_TRAILER => Some(FrameKind::Trailer),
            _ => None,
        }
    }
}

impl std::fmt::Display for FrameKind {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        // magic bytes are always ASCII
        f.write_str(std::str::from_utf8(self.magic()).unwrap())
    }
}

/// A decoded frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Frame {
    pub kind: FrameKind,
    /// Logical byte offset within the virtual disk.
    pub start: u64,
    /// Payload length in bytes (original length for DATA frames, even
    /// when the payload is stored compressed).
    pub length: u64,
}

/// Write a frame header.
pub fn write_frame<W: Write>(
    writer: &mut W,
    kind: FrameKind,
    start: u64,
    length: u64,
) -> Result<(), StreamError> {
    let mut buf = [0u8; FRAME_LEN];
    encode_frame(&mut buf, kind, start, length);
    writer.write_all(&buf)?;
    Ok(())
}

fn encode_frame(buf: &mut [u8; FRAME_LEN], kind: FrameKind, start: u64, length: u64) {
    buf[0..2].copy_from_slice(kind.magic());
    buf[2] = b' ';
    encode_hex(&mut buf[3..19], start);
    buf[19] = b' ';
    encode_hex(&mut buf[20..36], length);
    buf[36] = b'\r';
    buf[37] = b'\n';
}

fn encode_hex(out: &mut [u8], value: u64) {
    const HEX: &[u8; 16] = b"0123456789abcdef";
    for (i, byte) in out.iter_mut().enumerate() {
        *byte = HEX[((value >> ((15 - i) * 4)) & 0xf) as usize];
    }
}

fn decode_hex(field: &[u8]) -> Result<u64, StreamError> {
    let text = std::str::from_utf8(field)
        .map_err(|_| StreamError::format("non-ascii bytes in frame header"))?;
    u64::from_str_radix(text, 16)
        .map_err(|err| StreamError::format(format!("invalid frame field '{}' - {}", text, err)))
}

/// Read and decode a frame header from the current position.
pub fn read_frame<R: Read>(reader: &mut R) -> Result<Frame, StreamError> {
    let mut buf = [0u8; FRAME_LEN];
    read_exact(reader, &mut buf)?;
    parse_frame(&buf)
}

/// Decode a frame header from a raw buffer.
pub fn parse_frame(buf: &[u8; FRAME_LEN]) -> Result<Frame, StreamError> {
    let kind = FrameKind::from_magic(&buf[0..2]).ok_or_else(|| {
        StreamError::format(format!("unknown frame kind {:?}", &buf[0..2]))
    })?;
    if buf[2] != b' ' || buf[19] != b' ' || &buf[36..38] != b"\r\n" {
        return Err(StreamError::format("malformed frame header"));
    }
    let start = decode_hex(&buf[3..19])?;
    let length = decode_hex(&buf[20..36])?;
    Ok(Frame { kind, start, length })
}

/// Write the payload terminator.
pub fn write_terminator<W: Write>(writer: &mut W) -> Result<(), StreamError> {
    writer.write_all(TERM)?;
    Ok(())
}

/// Read the payload terminator and assert it matches.
pub fn read_terminator<R: Read>(reader: &mut R) -> Result<(), StreamError> {
    let mut buf = [0u8; TERM.len()];
    read_exact(reader, &mut buf)?;
    if &buf != TERM {
        return Err(StreamError::format(format!(
            "bad payload terminator {:?}",
            buf
        )));
    }
    Ok(())
}

// A short read inside a frame means the file was cut off, which is a
// format error rather than an I/O failure.
pub(crate) fn read_exact<R: Read>(reader: &mut R, buf: &mut [u8]) -> Result<(), StreamError> {
    match reader.read_exact(buf) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => Err(StreamError::format(
            format!("truncated stream ({} bytes expected)", buf.len()),
        )),
        Err(err) => Err(err.into()),
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn frame_header_roundtrip() -> Result<(), StreamError> {
        let mut buf = Vec::new();
        write_frame(&mut buf, FrameKind::Data, 0x1000, 0xabcdef)?;
        assert_eq!(buf.len(), FRAME_LEN);
        let frame = read_frame(&mut &buf[..])?;
        assert_eq!(frame.kind, FrameKind::Data);
        assert_eq!(frame.start, 0x1000);
        assert_eq!(frame.length, 0xabcdef);
        Ok(())
    }

    #[test]
    fn rejects_unknown_kind() {
        let mut buf = Vec::new();
        write_frame(&mut buf, FrameKind::Zero, 0, 512).unwrap();
        buf[0] = b'X';
        assert!(matches!(
            read_frame(&mut &buf[..]),
            Err(StreamError::Format(_))
        ));
    }

    #[test]
    fn rejects_truncated_header() {
        let mut buf = Vec::new();
        write_frame(&mut buf, FrameKind::Stop, 0, 0).unwrap();
        buf.truncate(10);
        assert!(matches!(
            read_frame(&mut &buf[..]),
            Err(StreamError::Format(_))
        ));
    }
}
