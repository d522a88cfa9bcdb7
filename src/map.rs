//! Instant recovery: serve a backup file as a read-only block device.
//!
//! A single prescan translates the stream into a block map; reads
//! against the export binary-search the map and either come straight
//! from the backing file or are zero-filled. All per-export state
//! lives in the [`MappedDisk`] handle the NBD server owns, there are
//! no process globals.

use std::fs::File;
use std::io::BufReader;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};

use anyhow::{bail, format_err, Error};
use log::info;

use nbd_io::{Export, NbdError};
use sparse_stream::{BlockMap, Metadata, SparseStreamReader};

use crate::JobError;

/// Smallest advertised request size; matches the guest sector size.
const MIN_BLOCK_SIZE: u32 = 512;

pub struct MappedDisk {
    file: File,
    path: PathBuf,
    map: BlockMap,
    meta: Metadata,
    export_name: String,
    /// Upper bound for a single read, kept at or below the smallest
    /// block so reads cannot cross block boundaries.
    max_read: u32,
}

impl MappedDisk {
    /// Prescan `path` and build the export handle. Only uncompressed
    /// full or copy streams can be mapped.
    pub fn open(path: &Path, export_name: &str, block_size: u32) -> Result<Self, Error> {
        let file =
            File::open(path).map_err(|err| format_err!("unable to open {:?} - {}", path, err))?;
        let mut reader = SparseStreamReader::new(BufReader::new(file));
        let meta = reader.read_metadata()?;

        if meta.compressed {
            return Err(JobError::CompressionUnsupportedForMapping.into());
        }
        if meta.incremental {
            bail!("only full or copy streams can be mapped");
        }

        let map = BlockMap::build(&mut reader)?;

        let smallest = map.min_block_length().min(u32::MAX as u64) as u32;
        let max_read = block_size.min(smallest).max(MIN_BLOCK_SIZE);

        info!(
            "mapped {:?}: {} blocks, {} bytes, max request size {}",
            path,
            map.entries().len(),
            map.virtual_size(),
            max_read
        );

        let file = reader.into_inner().into_inner();
        Ok(Self {
            file,
            path: path.to_path_buf(),
            map,
            meta,
            export_name: export_name.to_string(),
            max_read,
        })
    }

    pub fn metadata(&self) -> &Metadata {
        &self.meta
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Translate a guest read to the backing file.
    fn read_mapped(&self, buf: &mut [u8], offset: u64) -> Result<(), JobError> {
        let length = buf.len() as u64;
        let block = self
            .map
            .find(offset)
            .ok_or(JobError::UnexpectedBlockRange { offset, length })?;

        let delta = offset - block.original_offset;
        if delta + length > block.length {
            // the blocksize filter keeps well-behaved clients below
            // the smallest block, anything else is refused
            return Err(JobError::UnexpectedBlockRange { offset, length });
        }

        if !block.data {
            buf.fill(0);
            return Ok(());
        }

        let file_offset = block.stream_offset + delta;
        self.file
            .read_exact_at(buf, file_offset)
            .map_err(|_| JobError::UnexpectedBlockRange { offset, length })
    }
}

impl Export for MappedDisk {
    fn name(&self) -> &str {
        &self.export_name
    }

    fn size(&self) -> u64 {
        self.map.virtual_size()
    }

    fn block_sizes(&self) -> (u32, u32, u32) {
        (MIN_BLOCK_SIZE, self.max_read, self.max_read)
    }

    fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<(), NbdError> {
        self.read_mapped(buf, offset)
            .map_err(|err| NbdError::Protocol(err.to_string()))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use sparse_stream::{SparseStreamWriter, STREAM_VERSION};
    use std::io::Write;

    fn write_test_stream(path: &Path) {
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
        let file = File::create(path).unwrap();
        let mut writer = SparseStreamWriter::new(file);
        writer.write_metadata(&meta).unwrap();
        writer.write_data_header(0, 4096).unwrap();
        writer.write_payload(&[0x11u8; 4096]).unwrap();
        writer.finish_data().unwrap();
        writer.write_zero(4096, 4096).unwrap();
        writer.write_data_header(8192, 4096).unwrap();
        writer.write_payload(&[0x22u8; 4096]).unwrap();
        writer.finish_data().unwrap();
        writer.write_stop().unwrap();
        writer.into_inner().flush().unwrap();
    }

    #[test]
    fn reads_translate_through_the_map() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vda.full.data");
        write_test_stream(&path);

        let disk = MappedDisk::open(&path, "vda", 4096).unwrap();
        assert_eq!(disk.size(), 12288);

        let mut buf = vec![0u8; 4096];
        disk.read_mapped(&mut buf, 0).unwrap();
        assert!(buf.iter().all(|byte| *byte == 0x11));

        disk.read_mapped(&mut buf, 4096).unwrap();
        assert!(buf.iter().all(|byte| *byte == 0));

        disk.read_mapped(&mut buf, 8192).unwrap();
        assert!(buf.iter().all(|byte| *byte == 0x22));

        // partial read inside a block keeps the offset arithmetic
        let mut small = vec![0u8; 100];
        disk.read_mapped(&mut small, 8192 + 96).unwrap();
        assert!(small.iter().all(|byte| *byte == 0x22));
    }

    #[test]
    fn cross_block_reads_are_refused() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vda.full.data");
        write_test_stream(&path);

        let disk = MappedDisk::open(&path, "vda", 8192).unwrap();
        let mut buf = vec![0u8; 8192];
        let err = disk.read_mapped(&mut buf, 4000).unwrap_err();
        assert!(matches!(err, JobError::UnexpectedBlockRange { .. }));
    }
}
