use std::path::Path;

use anyhow::Error;

use nbd_io::{MemDevice, RawExtent, STATE_DIRTY, STATE_HOLE, STATE_ZERO};
use sparse_stream::{Metadata, STREAM_VERSION};
use virtsparse::backup::write_stream;
use virtsparse::extents::{query_extents, thin_backup_size};
use virtsparse::restore::{self, Action, RestoreOptions};

const SIZE: usize = 262144;
const MAX_REQUEST: u64 = 65536;

fn metadata(
    data_size: u64,
    checkpoint: &str,
    parent: Option<&str>,
    incremental: bool,
) -> Metadata {
    Metadata {
        virtual_size: SIZE as u64,
        data_size,
        date: String::new(),
        disk_name: "vda".to_string(),
        // raw sources restore through a plain file, no qemu required
        disk_format: "raw".to_string(),
        checkpoint_name: checkpoint.to_string(),
        compressed: false,
        compression_method: None,
        parent_checkpoint: parent.map(String::from),
        incremental,
        stream_version: STREAM_VERSION,
    }
}

fn options(input: &Path, output: &Path) -> RestoreOptions {
    RestoreOptions {
        action: Action::Restore,
        input: input.to_path_buf(),
        output: output.to_path_buf(),
        until: None,
        sequence: Vec::new(),
        disk: None,
        socketfile: output.join("restore.sock"),
        raw: false,
    }
}

/// Write a full plus two incrementals and restore the whole chain
/// through the directory scanner.
fn build_backup_set(device: &mut MemDevice, dir: &Path) -> Result<Vec<Vec<u8>>, Error> {
    let mut states = Vec::new();

    device.fill(0, 8192, 0x10);
    device.set_extents(vec![
        RawExtent {
            length: 8192,
            flags: 0,
        },
        RawExtent {
            length: (SIZE - 8192) as u64,
            flags: STATE_HOLE | STATE_ZERO,
        },
    ]);
    let extents = query_extents(device, false)?;
    let meta = metadata(thin_backup_size(&extents), "virtsparse.0", None, false);
    write_stream(device, &extents, &meta, false, &dir.join("vda.full.data"))?;
    states.push(device.contents().to_vec());

    for (index, offset) in [(1u64, 16384u64), (2, 32768)] {
        device.fill(offset as usize, 4096, 0x20 + index as u8);
        device.set_extents(vec![
            RawExtent {
                length: offset,
                flags: 0,
            },
            RawExtent {
                length: 4096,
                flags: STATE_DIRTY,
            },
            RawExtent {
                length: SIZE as u64 - offset - 4096,
                flags: 0,
            },
        ]);
        let extents = query_extents(device, true)?;
        let name = format!("virtsparse.{}", index);
        let parent = format!("virtsparse.{}", index - 1);
        let meta = metadata(thin_backup_size(&extents), &name, Some(&parent), true);
        write_stream(
            device,
            &extents,
            &meta,
            false,
            &dir.join(format!("vda.inc.{}.data", name)),
        )?;
        states.push(device.contents().to_vec());
    }

    Ok(states)
}

#[test]
fn scanned_chain_restores_to_latest() -> Result<(), Error> {
    let input = tempfile::tempdir()?;
    let output = tempfile::tempdir()?;

    let mut device = MemDevice::new(SIZE, MAX_REQUEST);
    let states = build_backup_set(&mut device, input.path())?;

    restore::run(&options(input.path(), output.path()))?;

    let restored = std::fs::read(output.path().join("vda"))?;
    assert_eq!(restored, *states.last().unwrap());
    Ok(())
}

#[test]
fn until_checkpoint_stops_the_chain() -> Result<(), Error> {
    let input = tempfile::tempdir()?;
    let output = tempfile::tempdir()?;

    let mut device = MemDevice::new(SIZE, MAX_REQUEST);
    let states = build_backup_set(&mut device, input.path())?;

    let mut opts = options(input.path(), output.path());
    opts.until = Some("virtsparse.1".to_string());
    restore::run(&opts)?;

    // the second incremental must not be applied
    let restored = std::fs::read(output.path().join("vda"))?;
    assert_eq!(restored, states[1]);
    Ok(())
}

#[test]
fn explicit_sequence_must_start_with_a_base() -> Result<(), Error> {
    let input = tempfile::tempdir()?;
    let output = tempfile::tempdir()?;

    let mut device = MemDevice::new(SIZE, MAX_REQUEST);
    build_backup_set(&mut device, input.path())?;

    let mut opts = options(input.path(), output.path());
    opts.sequence = vec!["vda.inc.virtsparse.1.data".to_string()];
    let err = restore::run(&opts).unwrap_err();
    assert!(err.to_string().contains("full or copy"));
    Ok(())
}

#[test]
fn dump_action_walks_all_streams() -> Result<(), Error> {
    let input = tempfile::tempdir()?;
    let output = tempfile::tempdir()?;

    let mut device = MemDevice::new(SIZE, MAX_REQUEST);
    build_backup_set(&mut device, input.path())?;

    let mut opts = options(input.path(), output.path());
    opts.action = Action::Dump;
    restore::run(&opts)?;
    Ok(())
}
