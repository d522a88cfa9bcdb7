//! Per-disk backup worker.

use std::fs::File;
use std::io::BufWriter;
use std::os::unix::fs::FileExt;
use std::path::Path;

use anyhow::{format_err, Context, Error};
use log::info;

use nbd_io::{BlockDevice, NbdClient};
use sparse_stream::{Metadata, SparseStreamWriter, STREAM_VERSION};

use crate::checkpoint::CheckpointSpec;
use crate::chunked;
use crate::extents::{self, Extent, ALLOCATION_CONTEXT};
use crate::host::DiskEndpoint;
use crate::tools::{self, signals};
use crate::{data_file_name, Level, StreamType};

use super::BackupOptions;

pub struct DiskJob {
    pub disk: crate::host::DiskInfo,
    pub endpoint: DiskEndpoint,
}

pub struct DiskSummary {
    pub target: String,
    /// Sum of data extent lengths.
    pub thin_size: u64,
    /// Bytes written to the output file.
    pub written: u64,
}

/// Back up one disk to its stream or raw image. Owns the NBD
/// connection and the output file; on success the `.partial` file is
/// renamed into place.
pub fn backup_disk(
    job: &DiskJob,
    opts: &BackupOptions,
    spec: &CheckpointSpec,
    ident: &str,
) -> Result<DiskSummary, Error> {
    let incremental = opts.level.is_incremental();

    let context = if incremental {
        job.endpoint
            .dirty_context
            .clone()
            .ok_or_else(|| format_err!("no dirty bitmap context for disk {}", job.disk.target))?
    } else {
        ALLOCATION_CONTEXT.to_string()
    };

    let mut client = NbdClient::connect(
        &job.endpoint.socket,
        &job.endpoint.export,
        Some(context.as_str()),
    )
    .with_context(|| format!("disk {}", job.disk.target))?;

    let extent_list = extents::query_extents(&mut client, incremental)
        .with_context(|| format!("unable to query extents for disk {}", job.disk.target))?;
    let thin_size = extents::thin_backup_size(&extent_list);

    let file_name = data_file_name(&job.disk.target, opts.level, ident);
    let final_path = opts.output.join(&file_name);
    let partial_path = opts
        .output
        .join(format!("{}{}", file_name, tools::PARTIAL_SUFFIX));

    info!(
        "disk {}: {} bytes virtual, {} bytes thin -> {}",
        job.disk.target,
        client.size(),
        thin_size,
        file_name
    );

    let checkpoint_name = match opts.level {
        Level::Full | Level::Inc => spec.name.clone(),
        Level::Copy => String::new(),
        Level::Diff => ident.to_string(),
    };

    let written = match opts.stream_type {
        StreamType::Stream => {
            let meta = Metadata {
                virtual_size: client.size(),
                data_size: thin_size,
                date: tools::rfc3339_now(),
                disk_name: job.disk.target.clone(),
                disk_format: job.disk.format.clone(),
                checkpoint_name,
                compressed: opts.compress,
                compression_method: opts.compress.then(|| "lz4".to_string()),
                parent_checkpoint: spec.parent.clone(),
                incremental,
                stream_version: STREAM_VERSION,
            };
            write_stream(&mut client, &extent_list, &meta, opts.compress, &partial_path)?
        }
        StreamType::Raw => write_raw(&mut client, &extent_list, &partial_path)?,
    };

    std::fs::rename(&partial_path, &final_path).map_err(|err| {
        format_err!(
            "unable to rename {:?} to {:?} - {}",
            partial_path,
            final_path,
            err
        )
    })?;

    client.disconnect()?;

    Ok(DiskSummary {
        target: job.disk.target.clone(),
        thin_size,
        written,
    })
}

/// Serialize one disk into a sparse stream file.
pub fn write_stream(
    device: &mut dyn BlockDevice,
    extent_list: &[Extent],
    meta: &Metadata,
    compress: bool,
    path: &Path,
) -> Result<u64, Error> {
    let file = File::create(path)
        .map_err(|err| format_err!("unable to create {:?} - {}", path, err))?;
    let mut writer = SparseStreamWriter::new(BufWriter::new(file));

    writer.write_metadata(meta)?;

    let mut trailer = Vec::new();
    for extent in extent_list {
        signals::check()?;
        if extent.data {
            if let Some(entry) = chunked::backup_extent(device, &mut writer, extent, compress)? {
                trailer.push(entry);
            }
        } else if !meta.incremental {
            // incremental streams omit holes entirely
            writer.write_zero(extent.offset, extent.length)?;
        }
    }

    writer.write_stop()?;
    if compress {
        writer.write_compression_trailer(&trailer)?;
    }
    writer.flush()?;

    let file = writer
        .into_inner()
        .into_inner()
        .map_err(|err| format_err!("unable to flush stream - {}", err))?;
    file.sync_all()?;
    Ok(file.metadata()?.len())
}

/// Raw output: a full-size image with data written at its native
/// offsets, holes skipped.
pub fn write_raw(
    device: &mut dyn BlockDevice,
    extent_list: &[Extent],
    path: &Path,
) -> Result<u64, Error> {
    let file = File::create(path)
        .map_err(|err| format_err!("unable to create {:?} - {}", path, err))?;
    let size = device.size();
    file.set_len(size)?;

    let max = device.max_request_size();
    for extent in extent_list {
        if !extent.data {
            continue;
        }
        let mut remaining = extent.length;
        let mut offset = extent.offset;
        while remaining > 0 {
            signals::check()?;
            let step = remaining.min(max);
            let mut buf = vec![0u8; step as usize];
            device.read_at(&mut buf, offset)?;
            file.write_all_at(&buf, offset)?;
            offset += step;
            remaining -= step;
        }
    }

    file.sync_all()?;
    Ok(size)
}
