use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use anyhow::Error;

use nbd_io::{MemDevice, RawExtent, STATE_HOLE, STATE_ZERO};
use sparse_stream::{FrameKind, Metadata, SparseStreamReader, STREAM_VERSION};
use virtsparse::backup::{write_raw, write_stream};
use virtsparse::extents::{query_extents, thin_backup_size};
use virtsparse::restore::restore_stream_file;

fn metadata(virtual_size: u64, data_size: u64, compressed: bool, incremental: bool) -> Metadata {
    Metadata {
        virtual_size,
        data_size,
        date: String::new(),
        disk_name: "vda".to_string(),
        disk_format: "qcow2".to_string(),
        checkpoint_name: "virtsparse.0".to_string(),
        compressed,
        compression_method: compressed.then(|| "lz4".to_string()),
        parent_checkpoint: incremental.then(|| "virtsparse.0".to_string()),
        incremental,
        stream_version: STREAM_VERSION,
    }
}

/// Sum over all DATA/ZERO frames of an uncompressed stream.
fn frame_sums(path: &Path) -> Result<(u64, u64), Error> {
    let mut reader = SparseStreamReader::new(BufReader::new(File::open(path)?));
    reader.read_metadata()?;
    let mut data = 0u64;
    let mut zero = 0u64;
    loop {
        let frame = reader.read_frame()?;
        match frame.kind {
            FrameKind::Data => {
                data += frame.length;
                reader.skip_payload(frame.length)?;
            }
            FrameKind::Zero => zero += frame.length,
            FrameKind::Stop => break,
            kind => panic!("unexpected {} frame", kind),
        }
    }
    Ok((data, zero))
}

/// A 64 KiB disk with one 4 KiB data extent: the stream carries the
/// data block, the zero frame and nothing else; the raw output is a
/// full size image.
#[test]
fn stream_and_raw_of_the_same_disk() -> Result<(), Error> {
    let dir = tempfile::tempdir()?;

    let mut device = MemDevice::new(65536, 4 * 1024 * 1024);
    device.fill(0, 4096, 0xab);
    device.set_extents(vec![
        RawExtent {
            length: 4096,
            flags: 0,
        },
        RawExtent {
            length: 61440,
            flags: STATE_HOLE | STATE_ZERO,
        },
    ]);

    let extents = query_extents(&mut device, false)?;
    assert_eq!(thin_backup_size(&extents), 4096);

    // raw image: data at native offset, zero elsewhere
    let raw_path = dir.path().join("vda.copy.data.partial");
    let written = write_raw(&mut device, &extents, &raw_path)?;
    assert_eq!(written, 65536);
    let raw = std::fs::read(&raw_path)?;
    assert_eq!(raw.len(), 65536);
    assert!(raw[..4096].iter().all(|byte| *byte == 0xab));
    assert!(raw[4096..].iter().all(|byte| *byte == 0));

    // sparse stream: META + DATA(0,4096) + ZERO(4096,61440) + STOP
    let stream_path = dir.path().join("vda.full.data");
    let meta = metadata(65536, 4096, false, false);
    write_stream(&mut device, &extents, &meta, false, &stream_path)?;

    let mut reader = SparseStreamReader::new(BufReader::new(File::open(&stream_path)?));
    let parsed = reader.read_metadata()?;
    assert_eq!(parsed.virtual_size, 65536);
    assert_eq!(parsed.data_size, 4096);
    assert!(!parsed.incremental);

    let frame = reader.read_frame()?;
    assert_eq!(
        (frame.kind, frame.start, frame.length),
        (FrameKind::Data, 0, 4096)
    );
    let mut payload = vec![0u8; 4096];
    reader.read_payload(&mut payload)?;
    reader.read_terminator()?;
    assert!(payload.iter().all(|byte| *byte == 0xab));

    let frame = reader.read_frame()?;
    assert_eq!(
        (frame.kind, frame.start, frame.length),
        (FrameKind::Zero, 4096, 61440)
    );
    assert_eq!(reader.read_frame()?.kind, FrameKind::Stop);

    // full/copy invariant: data + zero cover the whole disk
    let (data, zero) = frame_sums(&stream_path)?;
    assert_eq!(data, parsed.data_size);
    assert_eq!(data + zero, parsed.virtual_size);

    Ok(())
}

/// Restoring a full stream yields the original content for data
/// regions and zeroes for holes.
#[test]
fn restore_reproduces_the_source() -> Result<(), Error> {
    let dir = tempfile::tempdir()?;

    let mut source = MemDevice::new(131072, 8192);
    source.fill(0, 4096, 0x11);
    source.fill(65536, 8192, 0x22);
    source.set_extents(vec![
        RawExtent {
            length: 4096,
            flags: 0,
        },
        RawExtent {
            length: 61440,
            flags: STATE_HOLE | STATE_ZERO,
        },
        RawExtent {
            length: 8192,
            flags: 0,
        },
        RawExtent {
            length: 57344,
            flags: STATE_HOLE | STATE_ZERO,
        },
    ]);

    let extents = query_extents(&mut source, false)?;
    let path = dir.path().join("vda.full.data");
    let meta = metadata(131072, thin_backup_size(&extents), false, false);
    write_stream(&mut source, &extents, &meta, false, &path)?;

    let mut target = MemDevice::new(131072, 8192);
    // dirty the target to prove zero frames take effect
    target.fill(65536, 4096, 0xff);
    let replayed = restore_stream_file(&path, &mut target)?;
    assert_eq!(replayed.data_size, meta.data_size);

    assert_eq!(source.contents(), target.contents());
    Ok(())
}

/// A size mismatch between metadata and the actual data frames is
/// fatal.
#[test]
fn restore_rejects_size_mismatch() -> Result<(), Error> {
    let dir = tempfile::tempdir()?;

    let mut device = MemDevice::new(65536, 8192);
    device.set_extents(vec![RawExtent {
        length: 65536,
        flags: 0,
    }]);
    let extents = query_extents(&mut device, false)?;

    // metadata lies about the data size
    let path = dir.path().join("vda.full.data");
    let meta = metadata(65536, 4096, false, false);
    write_stream(&mut device, &extents, &meta, false, &path)?;

    let mut target = MemDevice::new(65536, 8192);
    let err = restore_stream_file(&path, &mut target).unwrap_err();
    assert!(matches!(
        err.downcast_ref::<virtsparse::JobError>(),
        Some(virtsparse::JobError::RestoreSizeMismatch { .. })
    ));
    Ok(())
}
