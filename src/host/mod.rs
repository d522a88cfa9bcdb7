//! Host control plane.
//!
//! The pipelines only consume the [`HostControl`] capability; the
//! implementations shell out to the platform tooling: [`virsh`] drives
//! a live libvirt domain (pull-mode backup job, checkpoint objects),
//! [`qemu`] handles shut-off domains by exporting their images with
//! qemu-nbd and keeping dirty bitmaps directly in the qcow2 files.

use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::process::Command;

use anyhow::{bail, Error};

use crate::checkpoint::CheckpointSpec;
use crate::Level;

pub mod qemu;
pub mod virsh;

/// One guest disk eligible for backup.
#[derive(Debug, Clone)]
pub struct DiskInfo {
    /// Target device name (`vda`, `sdb`, ...), the stable disk
    /// identity used in file names and export names.
    pub target: String,
    /// Driver format (`qcow2`, `raw`).
    pub format: String,
    /// Backing image path on the host.
    pub path: PathBuf,
}

/// Where a disk worker finds its NBD export after `begin_backup`.
#[derive(Debug, Clone)]
pub struct DiskEndpoint {
    pub target: String,
    pub socket: PathBuf,
    pub export: String,
    /// Dirty bitmap context to query for incremental levels.
    pub dirty_context: Option<String>,
}

/// Firmware images referenced by the domain definition.
#[derive(Debug, Clone, Default)]
pub struct Firmware {
    pub loader: Option<PathBuf>,
    pub nvram: Option<PathBuf>,
}

/// Control plane capability the backup pipeline consumes.
pub trait HostControl {
    fn domain(&self) -> &str;

    /// Disks of the domain, in definition order.
    fn disks(&mut self) -> Result<Vec<DiskInfo>, Error>;

    /// Complete domain configuration (XML), copied into the backup set.
    fn dump_config(&mut self) -> Result<String, Error>;

    /// Firmware images referenced by the domain (loader, nvram).
    fn firmware(&mut self) -> Result<Firmware, Error> {
        Ok(Firmware::default())
    }

    fn list_checkpoints(&mut self) -> Result<Vec<String>, Error>;

    fn delete_checkpoint(&mut self, name: &str) -> Result<(), Error>;

    /// Checkpoint definition (XML) for the backup set dump.
    fn checkpoint_xml(&mut self, name: &str) -> Result<String, Error>;

    /// Re-register a checkpoint from a dumped definition, used when
    /// the domain lost its checkpoint metadata (e.g. after migration).
    fn redefine_checkpoint(&mut self, name: &str, xml: &str) -> Result<(), Error>;

    /// Start the backup job: export every disk over NBD on `socket`,
    /// create the new checkpoint when `spec.create` is set and arm the
    /// dirty bitmap context for incremental levels.
    fn begin_backup(
        &mut self,
        disks: &[DiskInfo],
        socket: &Path,
        spec: &CheckpointSpec,
        level: Level,
    ) -> Result<Vec<DiskEndpoint>, Error>;

    /// Stop the backup job, releasing the NBD exports. Also the
    /// cleanup path on error and SIGINT.
    fn stop_backup(&mut self) -> Result<(), Error>;
}

/// Run a host tool, returning stdout. Non-zero exit is an error
/// carrying the tool's stderr.
pub(crate) fn run_tool<I, S>(tool: &str, args: I) -> Result<String, Error>
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let output = Command::new(tool)
        .args(args)
        .output()
        .map_err(|err| anyhow::format_err!("unable to execute {} - {}", tool, err))?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        bail!("{} failed: {}", tool, stderr.trim());
    }
    Ok(String::from_utf8_lossy(&output.stdout).to_string())
}
