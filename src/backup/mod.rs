//! Backup pipeline.
//!
//! The coordinator validates the chain state, starts the host backup
//! job and hands one job per disk to a bounded worker pool. Workers
//! own their NBD connection and writer exclusively and communicate
//! only through their result; the chain file is touched by the
//! coordinator alone, after every worker finished.

mod disk_worker;

use std::path::PathBuf;

use anyhow::{bail, Context, Error};
use log::{info, warn};

use crate::checkpoint::CheckpointChain;
use crate::host::{DiskInfo, HostControl};
use crate::tools::{self, signals, worker_pool, RunLog};
use crate::{JobError, Level, StreamType};

pub use disk_worker::{write_raw, write_stream, DiskSummary};

pub struct BackupOptions {
    pub domain: String,
    pub output: PathBuf,
    pub level: Level,
    pub stream_type: StreamType,
    pub include: Vec<String>,
    pub exclude: Vec<String>,
    pub compress: bool,
    pub worker: Option<usize>,
    /// Back up raw format disks too (full and copy only).
    pub backup_raw_disks: bool,
    pub socketfile: PathBuf,
    pub scratchdir: PathBuf,
    pub strict: bool,
    pub start_only: bool,
    pub kill_only: bool,
    pub print_only: bool,
}

/// Run a backup job. Returns the process exit code.
pub fn run(host: &mut dyn HostControl, opts: &BackupOptions) -> Result<i32, Error> {
    tools::create_target_dir(&opts.output)?;

    if opts.kill_only {
        info!("stopping backup job of domain '{}'", opts.domain);
        host.stop_backup()?;
        return Ok(0);
    }

    let disks = select_disks(host, opts)?;
    if opts.print_only {
        for disk in &disks {
            println!("{}\t{}\t{}", disk.target, disk.format, disk.path.display());
        }
        return Ok(0);
    }

    let mut chain = CheckpointChain::load(&opts.output, host.domain())?;

    preflight(host, opts, &chain)?;

    if opts.level == Level::Full {
        wipe_chain(host, &mut chain)?;
    }

    let timestamp = tools::epoch_secs();
    let spec = chain.checkpoint_for(opts.level)?;
    let ident = match opts.level {
        Level::Full | Level::Copy => opts.level.to_string(),
        Level::Inc => spec.name.clone(),
        Level::Diff => timestamp.to_string(),
    };

    let mut run_log = RunLog::create(&opts.output, opts.level)?;
    run_log.log(format!(
        "starting {} backup of domain '{}' ({} disks, compress: {})",
        opts.level,
        opts.domain,
        disks.len(),
        opts.compress
    ));

    let endpoints = host
        .begin_backup(&disks, &opts.socketfile, &spec, opts.level)
        .context("unable to start backup job")?;

    if opts.start_only {
        info!(
            "backup job started, exports ready on {:?}; not writing any data",
            opts.socketfile
        );
        return Ok(0);
    }

    let jobs: Vec<disk_worker::DiskJob> = disks
        .into_iter()
        .map(|disk| {
            let endpoint = endpoints
                .iter()
                .find(|endpoint| endpoint.target == disk.target)
                .cloned()
                .ok_or_else(|| anyhow::format_err!("no endpoint for disk {}", disk.target))?;
            Ok(disk_worker::DiskJob { disk, endpoint })
        })
        .collect::<Result<_, Error>>()?;

    let threads = opts.worker.unwrap_or(jobs.len()).clamp(1, jobs.len());
    info!("processing {} disks with {} workers", jobs.len(), threads);

    let result = worker_pool::run_parallel("disk worker", threads, jobs, |job| {
        disk_worker::backup_disk(&job, opts, &spec, &ident)
    });

    let summaries = match result {
        Ok(summaries) => summaries,
        Err(err) => {
            run_log.log(format!("backup failed: {:#}", err));
            if let Err(stop_err) = host.stop_backup() {
                warn!("cleanup failed: {:#}", stop_err);
            }
            return Err(err);
        }
    };

    for summary in &summaries {
        run_log.log(format!(
            "disk {}: {} bytes thin, {} bytes written",
            summary.target, summary.thin_size, summary.written
        ));
    }

    save_artifacts(host, opts, &spec, &ident, &mut run_log);

    host.stop_backup()?;

    if spec.append {
        chain
            .append(spec.name.clone())
            .context("backup succeeded but checkpoint chain update failed")?;
    }

    let warnings = signals::warnings();
    run_log.log(format!("backup finished, {} warnings", warnings));
    if warnings > 0 && opts.strict {
        return Ok(2);
    }
    Ok(0)
}

/// Disk list filtered by include/exclude and raw format policy.
fn select_disks(host: &mut dyn HostControl, opts: &BackupOptions) -> Result<Vec<DiskInfo>, Error> {
    let mut disks = host.disks()?;

    if !opts.include.is_empty() {
        disks.retain(|disk| opts.include.iter().any(|name| name == &disk.target));
    }
    if !opts.exclude.is_empty() {
        disks.retain(|disk| !opts.exclude.iter().any(|name| name == &disk.target));
    }

    disks.retain(|disk| {
        if disk.format != "raw" {
            return true;
        }
        if !opts.backup_raw_disks {
            warn!(
                "skipping raw disk {}, use --raw to include it",
                disk.target
            );
            signals::count_warning();
            return false;
        }
        if opts.level.is_incremental() {
            // raw images have no persistent bitmaps
            warn!(
                "skipping raw disk {}: no dirty tracking across backups",
                disk.target
            );
            signals::count_warning();
            return false;
        }
        true
    });

    if disks.is_empty() {
        bail!("no disks to backup for domain '{}'", opts.domain);
    }
    Ok(disks)
}

fn preflight(
    host: &mut dyn HostControl,
    opts: &BackupOptions,
    chain: &CheckpointChain,
) -> Result<(), Error> {
    if opts.stream_type == StreamType::Raw && opts.level.is_incremental() {
        // raw output cannot represent unchanged regions
        bail!("backup type 'raw' is not supported for level '{}'", opts.level);
    }

    if opts.level.is_incremental() {
        if let Some(partial) = tools::find_partial_file(&opts.output)? {
            return Err(JobError::PartialBackupPresent(partial).into());
        }
        if chain.is_empty() {
            return Err(JobError::NoCheckpoints.into());
        }
    }

    if matches!(opts.level, Level::Full | Level::Inc) {
        let host_checkpoints = host.list_checkpoints()?;
        CheckpointChain::validate_foreign(&host_checkpoints)?;

        if opts.level == Level::Inc {
            redefine_missing(host, opts, chain, &host_checkpoints)?;
        }
    }

    Ok(())
}

/// Re-register chain checkpoints the host lost (migrated or redefined
/// domain) from the XML dumps of previous runs.
fn redefine_missing(
    host: &mut dyn HostControl,
    opts: &BackupOptions,
    chain: &CheckpointChain,
    host_checkpoints: &[String],
) -> Result<(), Error> {
    for name in chain.names() {
        if host_checkpoints.iter().any(|existing| existing == name) {
            continue;
        }
        info!("re-registering checkpoint '{}' on host", name);
        let dump = opts.output.join("checkpoints").join(format!("{}.xml", name));
        let xml = std::fs::read_to_string(&dump)
            .map_err(|_| JobError::RedefineCheckpoint(name.clone()))?;
        host.redefine_checkpoint(name, &xml)?;
    }
    Ok(())
}

/// Delete the previous chain, host side first. Also removes prefixed
/// leftovers of interrupted runs so new names cannot collide.
fn wipe_chain(host: &mut dyn HostControl, chain: &mut CheckpointChain) -> Result<(), Error> {
    let mut names: Vec<String> = chain.names().to_vec();
    for name in host.list_checkpoints()? {
        if name.starts_with(&format!("{}.", crate::CHECKPOINT_PREFIX)) && !names.contains(&name) {
            names.push(name);
        }
    }
    for name in names {
        if let Err(err) = host.delete_checkpoint(&name) {
            warn!("unable to delete checkpoint '{}': {:#}", name, err);
            signals::count_warning();
        }
    }
    chain.clear()
}

/// Auxiliary backup set content: domain config, checkpoint
/// definitions, firmware images. Failures here degrade the set but do
/// not fail the backup.
fn save_artifacts(
    host: &mut dyn HostControl,
    opts: &BackupOptions,
    spec: &crate::checkpoint::CheckpointSpec,
    ident: &str,
    run_log: &mut RunLog,
) {
    match host.dump_config() {
        Ok(config) => {
            let path = opts.output.join(format!("vmconfig.{}.xml", ident));
            if let Err(err) = std::fs::write(&path, config) {
                warn!("unable to save domain config: {}", err);
                signals::count_warning();
            }
        }
        Err(err) => {
            warn!("unable to dump domain config: {:#}", err);
            signals::count_warning();
        }
    }

    if spec.create {
        let dir = opts.output.join("checkpoints");
        let result = tools::create_target_dir(&dir).and_then(|_| {
            let xml = host.checkpoint_xml(&spec.name)?;
            std::fs::write(dir.join(format!("{}.xml", spec.name)), xml)?;
            Ok(())
        });
        if let Err(err) = result {
            warn!("unable to dump checkpoint definition: {:#}", err);
            signals::count_warning();
        }
    }

    match host.firmware() {
        Ok(firmware) => {
            for (kind, path) in [("loader", firmware.loader), ("nvram", firmware.nvram)] {
                let Some(path) = path else { continue };
                let target = opts.output.join(format!("{}.{}", kind, ident));
                if let Err(err) = std::fs::copy(&path, &target) {
                    warn!("unable to copy {} {:?}: {}", kind, path, err);
                    signals::count_warning();
                } else {
                    run_log.log(format!("saved {} image {:?}", kind, path));
                }
            }
        }
        Err(err) => {
            warn!("unable to read firmware configuration: {:#}", err);
            signals::count_warning();
        }
    }
}
