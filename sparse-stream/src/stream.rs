//! Sparse stream writer and reader.

use std::io::{Read, Seek, SeekFrom, Write};

use serde::{Deserialize, Serialize};

use crate::format::{self, Frame, FrameKind, FRAME_LEN, TERM};
use crate::metadata::{self, Metadata};
use crate::StreamError;

/// One entry per DATA frame in the compression trailer: the payload
/// size as stored in the file. Chunked frames record each chunk
/// individually, in write order.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(untagged)]
pub enum TrailerEntry {
    Size(u64),
    Chunks(Vec<u64>),
}

impl TrailerEntry {
    /// Total bytes this DATA payload occupies in the file.
    pub fn stored_size(&self) -> u64 {
        match self {
            TrailerEntry::Size(size) => *size,
            TrailerEntry::Chunks(sizes) => sizes.iter().sum(),
        }
    }

    /// Per-chunk stored sizes in write order.
    pub fn chunk_sizes(&self) -> Vec<u64> {
        match self {
            TrailerEntry::Size(size) => vec![*size],
            TrailerEntry::Chunks(sizes) => sizes.clone(),
        }
    }
}

/// Writes a sparse stream front to back. The writer is append-only,
/// callers are responsible for frame ordering (META first, STOP last).
pub struct SparseStreamWriter<W: Write> {
    writer: W,
}

impl<W: Write> SparseStreamWriter<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    /// Emit the leading META frame with payload and terminator.
    pub fn write_metadata(&mut self, meta: &Metadata) -> Result<(), StreamError> {
        let payload = metadata::dump_metadata(meta)?;
        format::write_frame(&mut self.writer, FrameKind::Meta, 0, payload.len() as u64)?;
        self.writer.write_all(&payload)?;
        format::write_terminator(&mut self.writer)?;
        Ok(())
    }

    /// Emit a DATA frame header. The caller writes `length` logical
    /// bytes of payload (possibly compressed to fewer stored bytes)
    /// and then calls [`Self::finish_data`].
    pub fn write_data_header(&mut self, start: u64, length: u64) -> Result<(), StreamError> {
        format::write_frame(&mut self.writer, FrameKind::Data, start, length)
    }

    pub fn write_payload(&mut self, buf: &[u8]) -> Result<(), StreamError> {
        self.writer.write_all(buf)?;
        Ok(())
    }

    /// Terminate a DATA payload.
    pub fn finish_data(&mut self) -> Result<(), StreamError> {
        format::write_terminator(&mut self.writer)
    }

    pub fn write_zero(&mut self, start: u64, length: u64) -> Result<(), StreamError> {
        format::write_frame(&mut self.writer, FrameKind::Zero, start, length)
    }

    pub fn write_stop(&mut self) -> Result<(), StreamError> {
        format::write_frame(&mut self.writer, FrameKind::Stop, 0, 0)
    }

    /// Append the compression trailer after STOP.
    pub fn write_compression_trailer(&mut self, entries: &[TrailerEntry]) -> Result<(), StreamError> {
        let payload = serde_json::to_vec(entries)
            .map_err(|err| StreamError::format(format!("unable to encode trailer - {}", err)))?;
        self.writer.write_all(&payload)?;
        format::write_terminator(&mut self.writer)?;
        format::write_frame(&mut self.writer, FrameKind::Trailer, 0, payload.len() as u64)?;
        Ok(())
    }

    pub fn flush(&mut self) -> Result<(), StreamError> {
        self.writer.flush()?;
        Ok(())
    }

    pub fn into_inner(self) -> W {
        self.writer
    }

    pub fn get_mut(&mut self) -> &mut W {
        &mut self.writer
    }
}

/// Reads a sparse stream. Frame iteration is strictly forward, only
/// the trailer lookup seeks.
pub struct SparseStreamReader<R: Read + Seek> {
    reader: R,
}

impl<R: Read + Seek> SparseStreamReader<R> {
    pub fn new(reader: R) -> Self {
        Self { reader }
    }

    pub fn read_frame(&mut self) -> Result<Frame, StreamError> {
        format::read_frame(&mut self.reader)
    }

    /// Read the leading META frame including payload and terminator.
    pub fn read_metadata(&mut self) -> Result<Metadata, StreamError> {
        let frame = self.read_frame()?;
        if frame.kind != FrameKind::Meta {
            return Err(StreamError::format(format!(
                "expected meta frame, got {}",
                frame.kind
            )));
        }
        let mut payload = vec![0u8; frame.length as usize];
        format::read_exact(&mut self.reader, &mut payload)?;
        format::read_terminator(&mut self.reader)?;
        metadata::load_metadata(&payload)
    }

    pub fn read_payload(&mut self, buf: &mut [u8]) -> Result<(), StreamError> {
        format::read_exact(&mut self.reader, buf)
    }

    pub fn read_terminator(&mut self) -> Result<(), StreamError> {
        format::read_terminator(&mut self.reader)
    }

    /// Skip over `length` payload bytes plus terminator.
    pub fn skip_payload(&mut self, length: u64) -> Result<(), StreamError> {
        self.reader
            .seek(SeekFrom::Current(length as i64 + TERM.len() as i64))?;
        Ok(())
    }

    pub fn position(&mut self) -> Result<u64, StreamError> {
        Ok(self.reader.stream_position()?)
    }

    pub fn seek_to(&mut self, pos: u64) -> Result<(), StreamError> {
        self.reader.seek(SeekFrom::Start(pos))?;
        Ok(())
    }

    /// Read the compression trailer from end-of-file, restoring the
    /// current position afterwards.
    ///
    /// Backup emits the trailer last because the stream is written
    /// front to back without backtracking; restore can seek.
    pub fn read_compression_trailer(&mut self) -> Result<Vec<TrailerEntry>, StreamError> {
        let pos = self.reader.stream_position()?;

        self.reader.seek(SeekFrom::End(-(FRAME_LEN as i64)))?;
        let frame = self.read_frame()?;
        if frame.kind != FrameKind::Trailer {
            return Err(StreamError::format(format!(
                "expected trailer frame at end of file, got {}",
                frame.kind
            )));
        }

        let tail = FRAME_LEN as i64 + TERM.len() as i64 + frame.length as i64;
        self.reader.seek(SeekFrom::End(-tail))?;
        let mut payload = vec![0u8; frame.length as usize];
        format::read_exact(&mut self.reader, &mut payload)?;
        format::read_terminator(&mut self.reader)?;

        let entries = serde_json::from_slice(&payload)
            .map_err(|err| StreamError::format(format!("invalid trailer payload - {}", err)))?;

        self.reader.seek(SeekFrom::Start(pos))?;
        Ok(entries)
    }

    pub fn into_inner(self) -> R {
        self.reader
    }

    pub fn get_mut(&mut self) -> &mut R {
        &mut self.reader
    }
}
