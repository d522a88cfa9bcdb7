//! Block map for instant recovery.
//!
//! A single prescan over an uncompressed full or copy stream yields a
//! translation table from guest offsets to stream offsets. The map is
//! ordered by `original_offset`, so lookups are a binary search.

use std::io::{Read, Seek};

use crate::format::{FrameKind, FRAME_LEN};
use crate::stream::SparseStreamReader;
use crate::StreamError;

/// One DATA or ZERO frame of the scanned stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockMapEntry {
    /// Guest offset this block starts at.
    pub original_offset: u64,
    /// Guest offset of the following block (`original_offset + length`).
    pub next_original_offset: u64,
    pub length: u64,
    /// File position of the payload, directly after the frame header.
    pub stream_offset: u64,
    pub data: bool,
    /// File position of the next DATA/ZERO frame header, None for the
    /// last block.
    pub next_block_offset: Option<u64>,
}

#[derive(Debug)]
pub struct BlockMap {
    entries: Vec<BlockMapEntry>,
    virtual_size: u64,
}

impl BlockMap {
    /// Prescan the stream from the current position (directly after the
    /// metadata header) up to STOP.
    pub fn build<R: Read + Seek>(
        reader: &mut SparseStreamReader<R>,
    ) -> Result<BlockMap, StreamError> {
        let mut entries: Vec<BlockMapEntry> = Vec::new();

        loop {
            let header_pos = reader.position()?;
            let frame = reader.read_frame()?;
            match frame.kind {
                FrameKind::Stop => break,
                FrameKind::Data | FrameKind::Zero => {
                    if let Some(last) = entries.last_mut() {
                        last.next_block_offset = Some(header_pos);
                    }
                    entries.push(BlockMapEntry {
                        original_offset: frame.start,
                        next_original_offset: frame.start + frame.length,
                        length: frame.length,
                        stream_offset: header_pos + FRAME_LEN as u64,
                        data: frame.kind == FrameKind::Data,
                        next_block_offset: None,
                    });
                    if frame.kind == FrameKind::Data {
                        reader.skip_payload(frame.length)?;
                    }
                }
                kind => {
                    return Err(StreamError::format(format!(
                        "unexpected {} frame while scanning stream",
                        kind
                    )))
                }
            }
        }

        if entries.is_empty() {
            return Err(StreamError::format("stream contains no blocks"));
        }

        let virtual_size = entries.iter().map(|entry| entry.length).sum();
        Ok(BlockMap {
            entries,
            virtual_size,
        })
    }

    /// Advertised export size, the sum of all block lengths.
    pub fn virtual_size(&self) -> u64 {
        self.virtual_size
    }

    pub fn entries(&self) -> &[BlockMapEntry] {
        &self.entries
    }

    /// Smallest block length, the upper bound for a blocksize filter
    /// that keeps reads from crossing block boundaries.
    pub fn min_block_length(&self) -> u64 {
        self.entries
            .iter()
            .map(|entry| entry.length)
            .min()
            .unwrap_or(0)
    }

    /// Find the block with the largest `original_offset <= offset`.
    pub fn find(&self, offset: u64) -> Option<&BlockMapEntry> {
        if offset >= self.virtual_size {
            return None;
        }
        let idx = self
            .entries
            .partition_point(|entry| entry.original_offset <= offset);
        self.entries.get(idx.checked_sub(1)?)
    }
}

#[cfg(test)]
mod test {
    use std::io::Cursor;

    use super::*;
    use crate::metadata::{Metadata, STREAM_VERSION};
    use crate::stream::SparseStreamWriter;

    fn build_stream() -> Vec<u8> {
        let meta = Metadata {
            virtual_size: 12288,
            data_size: 8192,
            date: String::new(),
            disk_name: "vda".to_string(),
            disk_format: "raw".to_string(),
            checkpoint_name: "virtsparse.0".to_string(),
            compressed: false,
            compression_method: None,
            parent_checkpoint: None,
            incremental: false,
            stream_version: STREAM_VERSION,
        };
        let mut writer = SparseStreamWriter::new(Vec::new());
        writer.write_metadata(&meta).unwrap();
        writer.write_data_header(0, 4096).unwrap();
        writer.write_payload(&[0x11u8; 4096]).unwrap();
        writer.finish_data().unwrap();
        writer.write_zero(4096, 4096).unwrap();
        writer.write_data_header(8192, 4096).unwrap();
        writer.write_payload(&[0x22u8; 4096]).unwrap();
        writer.finish_data().unwrap();
        writer.write_stop().unwrap();
        writer.into_inner()
    }

    #[test]
    fn prescan_builds_ordered_map() {
        let raw = build_stream();
        let mut reader = SparseStreamReader::new(Cursor::new(raw));
        reader.read_metadata().unwrap();
        let map = BlockMap::build(&mut reader).unwrap();

        assert_eq!(map.entries().len(), 3);
        assert_eq!(map.virtual_size(), 12288);
        assert_eq!(map.min_block_length(), 4096);

        let entries = map.entries();
        assert!(entries[0].data);
        assert!(!entries[1].data);
        assert!(entries[2].data);
        assert_eq!(entries[0].next_original_offset, entries[1].original_offset);
        assert_eq!(entries[1].next_original_offset, entries[2].original_offset);
        assert!(entries[0].next_block_offset.is_some());
        assert_eq!(entries[2].next_block_offset, None);

        // zero frames have no payload, the next header follows directly
        assert_eq!(
            entries[1].next_block_offset.unwrap(),
            entries[1].stream_offset
        );
    }

    #[test]
    fn find_is_a_floor_lookup() {
        let raw = build_stream();
        let mut reader = SparseStreamReader::new(Cursor::new(raw));
        reader.read_metadata().unwrap();
        let map = BlockMap::build(&mut reader).unwrap();

        assert_eq!(map.find(0).unwrap().original_offset, 0);
        assert_eq!(map.find(4095).unwrap().original_offset, 0);
        assert_eq!(map.find(4096).unwrap().original_offset, 4096);
        assert_eq!(map.find(12287).unwrap().original_offset, 8192);
        assert!(map.find(12288).is_none());
    }
}
