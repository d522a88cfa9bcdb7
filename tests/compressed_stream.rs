use std::fs::File;
use std::io::BufReader;

use anyhow::Error;

use nbd_io::{MemDevice, RawExtent, STATE_HOLE, STATE_ZERO};
use sparse_stream::{FrameKind, Metadata, SparseStreamReader, TrailerEntry, STREAM_VERSION};
use virtsparse::backup::write_stream;
use virtsparse::extents::{query_extents, thin_backup_size};
use virtsparse::restore::restore_stream_file;

fn metadata(virtual_size: u64, data_size: u64) -> Metadata {
    Metadata {
        virtual_size,
        data_size,
        date: String::new(),
        disk_name: "vda".to_string(),
        disk_format: "qcow2".to_string(),
        checkpoint_name: "virtsparse.0".to_string(),
        compressed: true,
        compression_method: Some("lz4".to_string()),
        parent_checkpoint: None,
        incremental: false,
        stream_version: STREAM_VERSION,
    }
}

/// A 10 MiB data extent with a 4 MiB request bound compresses into one
/// DATA frame of three chunks; the trailer records the chunk sizes and
/// the restore reproduces the source.
#[test]
fn chunked_compressed_data_block() -> Result<(), Error> {
    const MIB: usize = 1024 * 1024;
    let dir = tempfile::tempdir()?;

    let mut source = MemDevice::new(10 * MIB, 4 * MIB as u64);
    // compressible but not trivial content
    for chunk in 0..10 {
        source.fill(chunk * MIB, MIB, chunk as u8);
    }
    source.set_extents(vec![RawExtent {
        length: 10 * MIB as u64,
        flags: 0,
    }]);

    let extents = query_extents(&mut source, false)?;
    assert_eq!(thin_backup_size(&extents), 10 * MIB as u64);

    let path = dir.path().join("vda.full.data");
    let meta = metadata(10 * MIB as u64, 10 * MIB as u64);
    let written = write_stream(&mut source, &extents, &meta, true, &path)?;
    // compression must pay off on this content
    assert!(written < 10 * MIB as u64);

    // one DATA frame with the original length, trailer carries three
    // chunk sizes that add up to the stored payload
    let mut reader = SparseStreamReader::new(BufReader::new(File::open(&path)?));
    let parsed = reader.read_metadata()?;
    assert!(parsed.compressed);
    assert_eq!(parsed.compression_method.as_deref(), Some("lz4"));

    let trailer = reader.read_compression_trailer()?;
    assert_eq!(trailer.len(), 1);
    let chunks = match &trailer[0] {
        TrailerEntry::Chunks(sizes) => sizes.clone(),
        TrailerEntry::Size(_) => panic!("chunked frame must record per-chunk sizes"),
    };
    assert_eq!(chunks.len(), 3);

    let frame = reader.read_frame()?;
    assert_eq!(frame.kind, FrameKind::Data);
    assert_eq!(frame.start, 0);
    assert_eq!(frame.length, 10 * MIB as u64);

    // the stored payload occupies exactly the trailer sum
    let stored: u64 = chunks.iter().sum();
    reader.skip_payload(stored)?;
    assert_eq!(reader.read_frame()?.kind, FrameKind::Stop);

    let mut target = MemDevice::new(10 * MIB, 4 * MIB as u64);
    restore_stream_file(&path, &mut target)?;
    assert_eq!(source.contents(), target.contents());

    Ok(())
}

/// A short data extent stays unchunked: the trailer entry is a plain
/// size.
#[test]
fn unchunked_compressed_data_block() -> Result<(), Error> {
    let dir = tempfile::tempdir()?;

    let mut source = MemDevice::new(65536, 4 * 1024 * 1024);
    source.fill(0, 4096, 0x5a);
    source.set_extents(vec![
        RawExtent {
            length: 4096,
            flags: 0,
        },
        RawExtent {
            length: 61440,
            flags: STATE_HOLE | STATE_ZERO,
        },
    ]);

    let extents = query_extents(&mut source, false)?;
    let path = dir.path().join("vda.full.data");
    let meta = metadata(65536, 4096);
    write_stream(&mut source, &extents, &meta, true, &path)?;

    let mut reader = SparseStreamReader::new(BufReader::new(File::open(&path)?));
    reader.read_metadata()?;
    let trailer = reader.read_compression_trailer()?;
    assert_eq!(trailer.len(), 1);
    assert!(matches!(trailer[0], TrailerEntry::Size(_)));

    // restore decompresses using the trailer, the target may even use
    // a smaller request bound than the backup did
    let mut target = MemDevice::new(65536, 1024);
    restore_stream_file(&path, &mut target)?;
    assert_eq!(source.contents(), target.contents());

    Ok(())
}
