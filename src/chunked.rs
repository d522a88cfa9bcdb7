//! Chunked reads and writes with optional per-chunk compression.
//!
//! A single NBD request is bounded by the negotiated maximum request
//! size, so long extents are moved in chunks of that size (the last
//! chunk shorter). Each chunk compresses independently; the stored
//! sizes go into the stream trailer so restore knows how many bytes to
//! consume per chunk before decompressing.

use std::io::{Read, Seek, Write};

use anyhow::{bail, format_err, Error};

use nbd_io::BlockDevice;
use sparse_stream::stream::{SparseStreamReader, SparseStreamWriter, TrailerEntry};
use sparse_stream::Frame;

use crate::extents::Extent;
use crate::tools::signals;

/// Iterate `(offset, length)` chunks of at most `max` bytes.
fn chunks(offset: u64, length: u64, max: u64) -> impl Iterator<Item = (u64, u64)> {
    let mut remaining = length;
    let mut position = offset;
    std::iter::from_fn(move || {
        if remaining == 0 {
            return None;
        }
        let step = remaining.min(max);
        let chunk = (position, step);
        position += step;
        remaining -= step;
        Some(chunk)
    })
}

/// Read one data extent from the device and emit it as a DATA frame.
///
/// The frame header always carries the original length; when
/// compressing, the returned trailer entry records what was actually
/// stored.
pub fn backup_extent<W: Write>(
    device: &mut dyn BlockDevice,
    writer: &mut SparseStreamWriter<W>,
    extent: &Extent,
    compress: bool,
) -> Result<Option<TrailerEntry>, Error> {
    writer.write_data_header(extent.offset, extent.length)?;

    let max = device.max_request_size();
    let mut stored_sizes = Vec::new();

    for (chunk_offset, chunk_length) in chunks(extent.offset, extent.length, max) {
        signals::check()?;
        let mut buf = vec![0u8; chunk_length as usize];
        device.read_at(&mut buf, chunk_offset).map_err(|err| {
            format_err!(
                "unable to read disk at offset {} ({} bytes) - {}",
                chunk_offset,
                chunk_length,
                err
            )
        })?;

        if compress {
            let compressed = lz4_flex::compress(&buf);
            writer.write_payload(&compressed)?;
            stored_sizes.push(compressed.len() as u64);
        } else {
            writer.write_payload(&buf)?;
        }
    }
    writer.finish_data()?;

    if !compress {
        return Ok(None);
    }
    Ok(Some(if stored_sizes.len() == 1 {
        TrailerEntry::Size(stored_sizes[0])
    } else {
        TrailerEntry::Chunks(stored_sizes)
    }))
}

/// Replay one DATA frame onto the device. For compressed streams the
/// trailer entry tells how many stored bytes make up each chunk; the
/// original chunk size falls out of the decompression.
pub fn restore_data_frame<R: Read + Seek>(
    reader: &mut SparseStreamReader<R>,
    device: &mut dyn BlockDevice,
    frame: &Frame,
    trailer_entry: Option<&TrailerEntry>,
) -> Result<(), Error> {
    match trailer_entry {
        None => {
            let max = device.max_request_size();
            for (chunk_offset, chunk_length) in chunks(frame.start, frame.length, max) {
                signals::check()?;
                let mut buf = vec![0u8; chunk_length as usize];
                reader.read_payload(&mut buf)?;
                write_chunked(device, &buf, chunk_offset)?;
            }
        }
        Some(entry) => {
            let mut offset = frame.start;
            let mut remaining = frame.length as usize;
            for stored in entry.chunk_sizes() {
                signals::check()?;
                let mut compressed = vec![0u8; stored as usize];
                reader.read_payload(&mut compressed)?;
                let chunk = lz4_flex::decompress(&compressed, remaining)
                    .map_err(|err| format_err!("unable to decompress data block - {}", err))?;
                write_chunked(device, &chunk, offset)?;
                offset += chunk.len() as u64;
                remaining -= chunk.len();
            }
            if remaining != 0 {
                bail!(
                    "compressed data block ended {} bytes short of frame length {}",
                    remaining,
                    frame.length
                );
            }
        }
    }
    reader.read_terminator()?;
    Ok(())
}

/// Zero a range on the device, split by its maximum request size.
pub fn zero_range(device: &mut dyn BlockDevice, start: u64, length: u64) -> Result<(), Error> {
    let max = device.max_request_size();
    for (chunk_offset, chunk_length) in chunks(start, length, max) {
        signals::check()?;
        device.write_zeroes(chunk_offset, chunk_length)?;
    }
    Ok(())
}

/// The restore device may negotiate a smaller request bound than the
/// backup side used, split writes again if needed.
fn write_chunked(device: &mut dyn BlockDevice, buf: &[u8], offset: u64) -> Result<(), Error> {
    let max = device.max_request_size() as usize;
    let mut written = 0usize;
    while written < buf.len() {
        let step = (buf.len() - written).min(max);
        device
            .write_at(&buf[written..written + step], offset + written as u64)
            .map_err(|err| {
                format_err!(
                    "unable to write disk at offset {} - {}",
                    offset + written as u64,
                    err
                )
            })?;
        written += step;
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn chunk_iteration() {
        let all: Vec<_> = chunks(0, 10 << 20, 4 << 20).collect();
        assert_eq!(
            all,
            vec![(0, 4 << 20), (4 << 20, 4 << 20), (8 << 20, 2 << 20)]
        );
        let single: Vec<_> = chunks(4096, 100, 4 << 20).collect();
        assert_eq!(single, vec![(4096, 100)]);
    }
}
