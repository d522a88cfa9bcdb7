//! Restore pipeline.
//!
//! Replays a chain of sparse streams (one full or copy base plus any
//! number of incrementals) onto a freshly created destination image,
//! writing through an NBD endpoint. The chain walker stops early when
//! the `--until` checkpoint has been applied.

use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};

use anyhow::{bail, format_err, Context, Error};
use log::{info, warn};

use nbd_io::{BlockDevice, FileDevice, NbdClient};
use sparse_stream::{FrameKind, Metadata, SparseStreamReader};

use crate::host::qemu::{self, QemuNbdProcess};
use crate::tools::signals;
use crate::{chunked, JobError, Level};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// Print stream contents instead of restoring.
    Dump,
    Restore,
}

impl std::str::FromStr for Action {
    type Err = Error;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "dump" => Ok(Action::Dump),
            "restore" => Ok(Action::Restore),
            other => bail!("invalid action '{}'", other),
        }
    }
}

pub struct RestoreOptions {
    pub action: Action,
    pub input: PathBuf,
    pub output: PathBuf,
    pub until: Option<String>,
    /// Explicit comma separated chain, overrides directory scanning.
    pub sequence: Vec<String>,
    /// Restore only this disk.
    pub disk: Option<String>,
    pub socketfile: PathBuf,
    /// Force a raw destination image.
    pub raw: bool,
}

struct DiskChain {
    target: String,
    files: Vec<PathBuf>,
}

pub fn run(opts: &RestoreOptions) -> Result<(), Error> {
    let chains = gather_chains(opts)?;
    if chains.is_empty() {
        bail!("no backup files found in {:?}", opts.input);
    }

    if opts.action == Action::Dump {
        for chain in &chains {
            for file in &chain.files {
                dump_stream(file)?;
            }
        }
        return Ok(());
    }

    crate::tools::create_target_dir(&opts.output)?;

    for chain in &chains {
        restore_chain(chain, opts)
            .with_context(|| format!("unable to restore disk {}", chain.target))?;
    }

    copy_vmconfig(&opts.input, &opts.output);
    Ok(())
}

/// Collect the per-disk file chains, either from an explicit sequence
/// or by scanning the input directory.
fn gather_chains(opts: &RestoreOptions) -> Result<Vec<DiskChain>, Error> {
    if !opts.sequence.is_empty() {
        let files: Vec<PathBuf> = opts
            .sequence
            .iter()
            .map(|name| opts.input.join(name))
            .collect();
        let (target, level, _) = parse_data_file_name(
            files[0]
                .file_name()
                .map(|name| name.to_string_lossy().to_string())
                .unwrap_or_default()
                .as_str(),
        )
        .ok_or_else(|| format_err!("'{}' is not a backup data file", opts.sequence[0]))?;
        if !matches!(level, Level::Full | Level::Copy) {
            bail!("restore sequence must start with a full or copy backup");
        }
        return Ok(vec![DiskChain { target, files }]);
    }

    let mut chains: Vec<DiskChain> = Vec::new();
    let mut entries: Vec<(String, Level, String, PathBuf)> = Vec::new();

    for entry in std::fs::read_dir(&opts.input)
        .with_context(|| format!("unable to read {:?}", opts.input))?
    {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().to_string();
        if let Some((target, level, ident)) = parse_data_file_name(&name) {
            entries.push((target, level, ident, entry.path()));
        }
    }

    let mut targets: Vec<String> = entries
        .iter()
        .map(|(target, ..)| target.clone())
        .collect();
    targets.sort();
    targets.dedup();

    for target in targets {
        if let Some(filter) = &opts.disk {
            if filter != &target {
                continue;
            }
        }

        let mut base: Option<PathBuf> = None;
        let mut increments: Vec<(u64, PathBuf)> = Vec::new();
        for (entry_target, level, ident, path) in &entries {
            if entry_target != &target {
                continue;
            }
            match level {
                Level::Full | Level::Copy => {
                    if let Some(existing) = &base {
                        bail!(
                            "disk {} has two base backups ({:?} and {:?})",
                            target,
                            existing,
                            path
                        );
                    }
                    base = Some(path.clone());
                }
                Level::Inc => {
                    // chain position is encoded in the checkpoint name
                    let index = ident
                        .rsplit('.')
                        .next()
                        .and_then(|raw| raw.parse::<u64>().ok())
                        .ok_or_else(|| {
                            format_err!("unable to order incremental backup {:?}", path)
                        })?;
                    increments.push((index, path.clone()));
                }
                // differential streams are not part of a chain, replay
                // them with an explicit --sequence
                Level::Diff => {
                    warn!("ignoring differential backup {:?} during scan", path);
                }
            }
        }

        let base = base
            .ok_or_else(|| format_err!("no full or copy backup found for disk {}", target))?;
        increments.sort_by_key(|(index, _)| *index);

        let mut files = vec![base];
        files.extend(increments.into_iter().map(|(_, path)| path));
        chains.push(DiskChain { target, files });
    }

    Ok(chains)
}

/// Split `<target>.<level>[.<ident>].data` into its parts.
fn parse_data_file_name(name: &str) -> Option<(String, Level, String)> {
    let stem = name.strip_suffix(".data")?;
    let (target, rest) = stem.split_once('.')?;
    let (level_str, ident) = match rest.split_once('.') {
        Some((level, ident)) => (level, ident.to_string()),
        None => (rest, String::new()),
    };
    let level: Level = level_str.parse().ok()?;
    Some((target.to_string(), level, ident))
}

fn restore_chain(chain: &DiskChain, opts: &RestoreOptions) -> Result<(), Error> {
    let base_meta = read_stream_metadata(&chain.files[0])?;

    let format = if opts.raw || base_meta.disk_format == "raw" {
        "raw"
    } else {
        "qcow2"
    };
    let image_path = opts.output.join(&chain.target);

    info!(
        "restoring disk {} to {:?} ({} bytes, format {})",
        chain.target,
        image_path,
        base_meta.virtual_size,
        format
    );

    if format == "raw" {
        let mut device = FileDevice::create(&image_path, base_meta.virtual_size)?;
        replay_files(chain, opts, &base_meta, &mut device)?;
        device.flush()?;
        return Ok(());
    }

    qemu::create_image(&image_path, format, base_meta.virtual_size)?;
    let mut writer_process =
        QemuNbdProcess::writer(&image_path, format, &chain.target, &opts.socketfile)?;

    let result = (|| -> Result<(), Error> {
        let mut device = NbdClient::connect(&opts.socketfile, &chain.target, None)?;
        replay_files(chain, opts, &base_meta, &mut device)?;
        device.flush()?;
        device.disconnect()?;
        Ok(())
    })();

    writer_process.kill();
    result
}

fn replay_files(
    chain: &DiskChain,
    opts: &RestoreOptions,
    base_meta: &Metadata,
    device: &mut dyn BlockDevice,
) -> Result<(), Error> {
    for path in &chain.files {
        signals::check()?;
        let meta = restore_stream_file(path, device)
            .with_context(|| format!("unable to replay {:?}", path))?;

        if meta.disk_name != base_meta.disk_name || meta.virtual_size != base_meta.virtual_size {
            bail!(
                "stream {:?} does not belong to disk {} ({} bytes)",
                path,
                base_meta.disk_name,
                base_meta.virtual_size
            );
        }

        if let Some(until) = &opts.until {
            if &meta.checkpoint_name == until {
                info!("checkpoint '{}' reached, stopping chain", until);
                break;
            }
        }
    }
    Ok(())
}

/// Replay a single stream file onto the device. Returns the stream's
/// metadata so the chain walker can check identity and `--until`.
pub fn restore_stream_file(path: &Path, device: &mut dyn BlockDevice) -> Result<Metadata, Error> {
    let file =
        File::open(path).map_err(|err| format_err!("unable to open {:?} - {}", path, err))?;
    let mut reader = SparseStreamReader::new(BufReader::new(file));
    let meta = reader.read_metadata()?;

    if meta.data_size == 0 {
        // nothing changed since the parent checkpoint
        return Ok(meta);
    }

    let trailer = if meta.compressed {
        Some(reader.read_compression_trailer()?)
    } else {
        None
    };

    let mut data_block = 0usize;
    let mut restored = 0u64;
    loop {
        signals::check()?;
        let frame = reader.read_frame()?;
        match frame.kind {
            FrameKind::Data => {
                let entry = match &trailer {
                    Some(entries) => Some(entries.get(data_block).ok_or_else(|| {
                        format_err!("missing trailer entry for data block {}", data_block)
                    })?),
                    None => None,
                };
                chunked::restore_data_frame(&mut reader, device, &frame, entry)
                    .with_context(|| format!("data block at offset {}", frame.start))?;
                restored += frame.length;
                data_block += 1;
            }
            FrameKind::Zero => {
                chunked::zero_range(device, frame.start, frame.length)
                    .with_context(|| format!("zero block at offset {}", frame.start))?;
            }
            FrameKind::Stop => break,
            kind => bail!("unexpected {} frame in stream body", kind),
        }
    }

    if restored != meta.data_size {
        return Err(JobError::RestoreSizeMismatch {
            expected: meta.data_size,
            actual: restored,
        }
        .into());
    }

    Ok(meta)
}

fn read_stream_metadata(path: &Path) -> Result<Metadata, Error> {
    let file =
        File::open(path).map_err(|err| format_err!("unable to open {:?} - {}", path, err))?;
    let mut reader = SparseStreamReader::new(BufReader::new(file));
    Ok(reader.read_metadata()?)
}

/// Print metadata and frame list of one stream.
fn dump_stream(path: &Path) -> Result<(), Error> {
    let file =
        File::open(path).map_err(|err| format_err!("unable to open {:?} - {}", path, err))?;
    let mut reader = SparseStreamReader::new(BufReader::new(file));
    let meta = reader.read_metadata()?;

    println!("{:?}:", path);
    println!(
        "  disk {} format {} virtual size {} data size {}",
        meta.disk_name, meta.disk_format, meta.virtual_size, meta.data_size
    );
    println!(
        "  checkpoint '{}' parent {:?} incremental {} compressed {}",
        meta.checkpoint_name, meta.parent_checkpoint, meta.incremental, meta.compressed
    );

    // compressed payloads occupy their stored size, not the frame
    // length
    let trailer = if meta.compressed && meta.data_size > 0 {
        Some(reader.read_compression_trailer()?)
    } else {
        None
    };

    let mut data_block = 0usize;
    loop {
        let frame = reader.read_frame()?;
        match frame.kind {
            FrameKind::Data => {
                println!("  data  {:>16} +{}", frame.start, frame.length);
                let stored = match &trailer {
                    Some(entries) => entries
                        .get(data_block)
                        .ok_or_else(|| {
                            format_err!("missing trailer entry for data block {}", data_block)
                        })?
                        .stored_size(),
                    None => frame.length,
                };
                reader.skip_payload(stored)?;
                data_block += 1;
            }
            FrameKind::Zero => println!("  zero  {:>16} +{}", frame.start, frame.length),
            FrameKind::Stop => break,
            kind => bail!("unexpected {} frame in stream body", kind),
        }
    }
    println!("  stop");
    Ok(())
}

/// Carry the newest domain config over next to the restored images.
fn copy_vmconfig(input: &Path, output: &Path) {
    let mut newest: Option<(std::time::SystemTime, PathBuf)> = None;
    if let Ok(entries) = std::fs::read_dir(input) {
        for entry in entries.flatten() {
            let name = entry.file_name().to_string_lossy().to_string();
            if !name.starts_with("vmconfig.") || !name.ends_with(".xml") {
                continue;
            }
            if let Ok(modified) = entry.metadata().and_then(|meta| meta.modified()) {
                if newest.as_ref().map(|(time, _)| modified > *time).unwrap_or(true) {
                    newest = Some((modified, entry.path()));
                }
            }
        }
    }
    if let Some((_, path)) = newest {
        let target = output.join(path.file_name().unwrap_or_default());
        if let Err(err) = std::fs::copy(&path, &target) {
            warn!("unable to copy domain config {:?}: {}", path, err);
        }
    }
}
