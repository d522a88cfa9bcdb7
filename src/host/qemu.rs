//! Shut-off domain support and restore targets via the qemu tools.
//!
//! Without a running domain there is no backup job: every disk image
//! is exported by its own qemu-nbd process instead, and checkpoints
//! are plain persistent dirty bitmaps kept inside the qcow2 images
//! (`qemu-img bitmap`). The restore pipeline reuses the process
//! handling here for its writer endpoint.

use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};

use anyhow::{bail, format_err, Context, Error};
use log::{debug, warn};
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;

use crate::checkpoint::CheckpointSpec;
use crate::extents::dirty_bitmap_context;
use crate::host::{run_tool, DiskEndpoint, DiskInfo, Firmware, HostControl};
use crate::host::virsh::VirshControl;
use crate::Level;

/// A spawned qemu-nbd exporting one image on a unix socket.
pub struct QemuNbdProcess {
    child: Child,
    socket: PathBuf,
}

impl QemuNbdProcess {
    /// Export `path` read-only, optionally arming a dirty bitmap
    /// context.
    pub fn export(
        path: &Path,
        format: &str,
        export: &str,
        socket: &Path,
        bitmap: Option<&str>,
    ) -> Result<Self, Error> {
        let mut cmd = Command::new("qemu-nbd");
        cmd.arg("--read-only")
            .arg("--persistent")
            .arg("--format")
            .arg(format)
            .arg("--export-name")
            .arg(export)
            .arg("--socket")
            .arg(socket);
        if let Some(bitmap) = bitmap {
            cmd.arg("--bitmap").arg(bitmap);
        }
        cmd.arg(path);
        Self::spawn(cmd, socket)
    }

    /// Export `path` writable, the restore destination.
    pub fn writer(path: &Path, format: &str, export: &str, socket: &Path) -> Result<Self, Error> {
        let mut cmd = Command::new("qemu-nbd");
        cmd.arg("--persistent")
            .arg("--discard=unmap")
            .arg("--format")
            .arg(format)
            .arg("--export-name")
            .arg(export)
            .arg("--socket")
            .arg(socket)
            .arg(path);
        Self::spawn(cmd, socket)
    }

    fn spawn(mut cmd: Command, socket: &Path) -> Result<Self, Error> {
        debug!("spawning {:?}", cmd);
        let child = cmd
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|err| format_err!("unable to spawn qemu-nbd - {}", err))?;
        Ok(Self {
            child,
            socket: socket.to_path_buf(),
        })
    }

    pub fn socket(&self) -> &Path {
        &self.socket
    }

    /// Terminate the export process and remove its socket.
    pub fn kill(&mut self) {
        let pid = Pid::from_raw(self.child.id() as i32);
        if let Err(err) = kill(pid, Signal::SIGTERM) {
            debug!("unable to terminate qemu-nbd ({}): {}", pid, err);
        }
        let _ = self.child.wait();
        let _ = std::fs::remove_file(&self.socket);
    }
}

impl Drop for QemuNbdProcess {
    fn drop(&mut self) {
        self.kill();
    }
}

/// Create a destination image for restore.
pub fn create_image(path: &Path, format: &str, size: u64) -> Result<(), Error> {
    run_tool(
        "qemu-img",
        [
            "create".as_ref(),
            "-f".as_ref(),
            format.as_ref(),
            path.as_os_str(),
            size.to_string().as_ref(),
        ],
    )
    .with_context(|| format!("unable to create image {:?}", path))?;
    Ok(())
}

fn bitmap_op(op: &str, image: &Path, name: &str) -> Result<(), Error> {
    run_tool(
        "qemu-img",
        [
            "bitmap".as_ref(),
            op.as_ref(),
            image.as_os_str(),
            name.as_ref(),
        ],
    )?;
    Ok(())
}

/// Persistent bitmaps present in a qcow2 image.
pub fn list_bitmaps(image: &Path) -> Result<Vec<String>, Error> {
    let output = run_tool(
        "qemu-img",
        [
            "info".as_ref(),
            "--output=json".as_ref(),
            image.as_os_str(),
        ],
    )?;
    let info: serde_json::Value = serde_json::from_str(&output)
        .map_err(|err| format_err!("unable to parse qemu-img info - {}", err))?;
    let mut names = Vec::new();
    if let Some(bitmaps) = info
        .pointer("/format-specific/data/bitmaps")
        .and_then(|v| v.as_array())
    {
        for bitmap in bitmaps {
            if let Some(name) = bitmap.get("name").and_then(|v| v.as_str()) {
                names.push(name.to_string());
            }
        }
    }
    Ok(names)
}

/// Control plane for shut-off domains. Disk discovery still goes
/// through the domain definition, everything else is qemu tooling.
pub struct QemuHost {
    inner: VirshControl,
    disks: Vec<DiskInfo>,
    exports: Vec<QemuNbdProcess>,
}

impl QemuHost {
    pub fn new(domain: &str, scratch: &Path) -> Self {
        Self {
            inner: VirshControl::new(domain, scratch),
            disks: Vec::new(),
            exports: Vec::new(),
        }
    }

    fn qcow2_disks(&self) -> impl Iterator<Item = &DiskInfo> {
        self.disks.iter().filter(|disk| disk.format == "qcow2")
    }

    fn per_disk_socket(socket: &Path, target: &str) -> PathBuf {
        let mut os = socket.as_os_str().to_owned();
        os.push(".");
        os.push(target);
        PathBuf::from(os)
    }
}

impl HostControl for QemuHost {
    fn domain(&self) -> &str {
        self.inner.domain()
    }

    fn disks(&mut self) -> Result<Vec<DiskInfo>, Error> {
        let disks = self.inner.disks()?;
        self.disks = disks.clone();
        Ok(disks)
    }

    fn dump_config(&mut self) -> Result<String, Error> {
        self.inner.dump_config()
    }

    fn firmware(&mut self) -> Result<Firmware, Error> {
        self.inner.firmware()
    }

    fn list_checkpoints(&mut self) -> Result<Vec<String>, Error> {
        // bitmaps live in the images; the first qcow2 disk is
        // authoritative, the backup keeps them in lockstep
        match self.qcow2_disks().next() {
            Some(disk) => list_bitmaps(&disk.path),
            None => Ok(Vec::new()),
        }
    }

    fn delete_checkpoint(&mut self, name: &str) -> Result<(), Error> {
        for disk in self.disks.clone() {
            if disk.format != "qcow2" {
                continue;
            }
            if let Err(err) = bitmap_op("--remove", &disk.path, name) {
                warn!("unable to remove bitmap '{}' from {}: {}", name, disk.target, err);
            }
        }
        Ok(())
    }

    fn checkpoint_xml(&mut self, name: &str) -> Result<String, Error> {
        // no libvirt checkpoint object exists for an offline backup
        Ok(format!(
            "<domaincheckpoint>\n  <name>{}</name>\n</domaincheckpoint>\n",
            name
        ))
    }

    fn redefine_checkpoint(&mut self, _name: &str, _xml: &str) -> Result<(), Error> {
        // bitmaps are persistent in the images, nothing to redefine
        Ok(())
    }

    fn begin_backup(
        &mut self,
        disks: &[DiskInfo],
        socket: &Path,
        spec: &CheckpointSpec,
        level: Level,
    ) -> Result<Vec<DiskEndpoint>, Error> {
        if self.disks.is_empty() {
            self.disks = disks.to_vec();
        }

        if spec.create {
            for disk in disks {
                if disk.format != "qcow2" {
                    continue;
                }
                bitmap_op("--add", &disk.path, &spec.name).with_context(|| {
                    format!("unable to create bitmap '{}' on {}", spec.name, disk.target)
                })?;
            }
        }

        // changes since the parent checkpoint are tracked in the
        // bitmap named after it
        let query_bitmap = if level.is_incremental() {
            match &spec.parent {
                Some(parent) => Some(parent.clone()),
                None => bail!("incremental backup without parent checkpoint"),
            }
        } else {
            None
        };

        let mut endpoints = Vec::new();
        for disk in disks {
            let disk_socket = Self::per_disk_socket(socket, &disk.target);
            let export = QemuNbdProcess::export(
                &disk.path,
                &disk.format,
                &disk.target,
                &disk_socket,
                query_bitmap.as_deref(),
            )?;
            self.exports.push(export);
            endpoints.push(DiskEndpoint {
                target: disk.target.clone(),
                socket: disk_socket,
                export: disk.target.clone(),
                dirty_context: query_bitmap.as_deref().map(dirty_bitmap_context),
            });
        }
        Ok(endpoints)
    }

    fn stop_backup(&mut self) -> Result<(), Error> {
        for mut export in self.exports.drain(..) {
            export.kill();
        }
        Ok(())
    }
}
