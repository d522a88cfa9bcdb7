//! Live domain control via virsh.
//!
//! Uses the pull-mode backup job: `backup-begin` exports all disks on
//! one unix socket, the per-disk dirty bitmap context is named after
//! the disk (`backup-<target>`).

use std::path::{Path, PathBuf};

use anyhow::{bail, format_err, Context, Error};
use lazy_static::lazy_static;
use log::{debug, warn};
use regex::Regex;

use crate::checkpoint::CheckpointSpec;
use crate::extents::dirty_bitmap_context;
use crate::host::{run_tool, DiskEndpoint, DiskInfo, Firmware, HostControl};
use crate::{JobError, Level};

lazy_static! {
    static ref DISK_BLOCK: Regex =
        Regex::new(r"(?s)<disk[^>]*device='disk'[^>]*>.*?</disk>").unwrap();
    static ref SOURCE_FILE: Regex = Regex::new(r"<source (?:file|dev)='([^']+)'").unwrap();
    static ref TARGET_DEV: Regex = Regex::new(r"<target[^>]*dev='([^']+)'").unwrap();
    static ref DRIVER_TYPE: Regex = Regex::new(r"<driver[^>]*type='([^']+)'").unwrap();
    static ref LOADER: Regex = Regex::new(r"<loader[^>]*>([^<]+)</loader>").unwrap();
    static ref NVRAM: Regex = Regex::new(r"<nvram[^>]*>([^<]+)</nvram>").unwrap();
}

pub struct VirshControl {
    domain: String,
    scratch: PathBuf,
    job_active: bool,
    config: Option<String>,
}

impl VirshControl {
    pub fn new(domain: &str, scratch: &Path) -> Self {
        Self {
            domain: domain.to_string(),
            scratch: scratch.to_path_buf(),
            job_active: false,
            config: None,
        }
    }

    fn virsh(&self, subcommand: &str, args: &[&str]) -> Result<String, Error> {
        let mut full: Vec<&str> = vec![subcommand, &self.domain];
        full.extend_from_slice(args);
        run_tool("virsh", full)
    }

    fn config(&mut self) -> Result<&str, Error> {
        if self.config.is_none() {
            let xml = run_tool("virsh", ["dumpxml", self.domain.as_str(), "--security-info"])
                .with_context(|| format!("unable to dump domain '{}'", self.domain))?;
            self.config = Some(xml);
        }
        Ok(self.config.as_deref().unwrap())
    }

    fn backup_xml(disks: &[DiskInfo], socket: &Path, parent: Option<&str>) -> String {
        let mut xml = String::from("<domainbackup mode='pull'>\n");
        if let Some(parent) = parent {
            xml.push_str(&format!("  <incremental>{}</incremental>\n", parent));
        }
        xml.push_str(&format!(
            "  <server transport='unix' socket='{}'/>\n  <disks>\n",
            socket.display()
        ));
        for disk in disks {
            xml.push_str(&format!(
                "    <disk name='{}' backup='yes' type='unix' exportname='{}'/>\n",
                disk.target, disk.target
            ));
        }
        xml.push_str("  </disks>\n</domainbackup>\n");
        xml
    }

    fn checkpoint_create_xml(name: &str, disks: &[DiskInfo]) -> String {
        let mut xml = format!("<domaincheckpoint>\n  <name>{}</name>\n  <disks>\n", name);
        for disk in disks {
            xml.push_str(&format!(
                "    <disk name='{}' checkpoint='bitmap'/>\n",
                disk.target
            ));
        }
        xml.push_str("  </disks>\n</domaincheckpoint>\n");
        xml
    }

    fn write_scratch(&self, name: &str, content: &str) -> Result<PathBuf, Error> {
        let path = self.scratch.join(name);
        std::fs::write(&path, content)
            .map_err(|err| format_err!("unable to write {:?} - {}", path, err))?;
        Ok(path)
    }
}

impl HostControl for VirshControl {
    fn domain(&self) -> &str {
        &self.domain
    }

    fn disks(&mut self) -> Result<Vec<DiskInfo>, Error> {
        let config = self.config()?.to_string();
        let mut disks = Vec::new();
        for block in DISK_BLOCK.find_iter(&config) {
            let block = block.as_str();
            let target = match TARGET_DEV.captures(block) {
                Some(caps) => caps[1].to_string(),
                None => continue,
            };
            let path = match SOURCE_FILE.captures(block) {
                Some(caps) => PathBuf::from(&caps[1]),
                // media-less device
                None => {
                    debug!("disk {} has no source, skipping", target);
                    continue;
                }
            };
            let format = DRIVER_TYPE
                .captures(block)
                .map(|caps| caps[1].to_string())
                .unwrap_or_else(|| "raw".to_string());
            disks.push(DiskInfo {
                target,
                format,
                path,
            });
        }
        if disks.is_empty() {
            bail!("domain '{}' has no disks to backup", self.domain);
        }
        Ok(disks)
    }

    fn dump_config(&mut self) -> Result<String, Error> {
        Ok(self.config()?.to_string())
    }

    fn firmware(&mut self) -> Result<Firmware, Error> {
        let config = self.config()?;
        Ok(Firmware {
            loader: LOADER
                .captures(config)
                .map(|caps| PathBuf::from(caps[1].trim())),
            nvram: NVRAM
                .captures(config)
                .map(|caps| PathBuf::from(caps[1].trim())),
        })
    }

    fn list_checkpoints(&mut self) -> Result<Vec<String>, Error> {
        let output = self.virsh("checkpoint-list", &["--name"])?;
        Ok(output
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(String::from)
            .collect())
    }

    fn delete_checkpoint(&mut self, name: &str) -> Result<(), Error> {
        self.virsh("checkpoint-delete", &[name])?;
        Ok(())
    }

    fn checkpoint_xml(&mut self, name: &str) -> Result<String, Error> {
        self.virsh("checkpoint-dumpxml", &[name])
    }

    fn redefine_checkpoint(&mut self, name: &str, xml: &str) -> Result<(), Error> {
        let path = self.write_scratch(&format!("checkpoint.{}.xml", name), xml)?;
        let path = path.to_string_lossy().to_string();
        self.virsh("checkpoint-create", &[path.as_str(), "--redefine"])
            .map_err(|err| {
                warn!("checkpoint redefine failed: {}", err);
                JobError::RedefineCheckpoint(name.to_string()).into()
            })
            .map(|_| ())
    }

    fn begin_backup(
        &mut self,
        disks: &[DiskInfo],
        socket: &Path,
        spec: &CheckpointSpec,
        level: Level,
    ) -> Result<Vec<DiskEndpoint>, Error> {
        let backup_path =
            self.write_scratch("backup.xml", &Self::backup_xml(disks, socket, spec.parent.as_deref()))?;

        let mut args: Vec<String> = vec![backup_path.to_string_lossy().to_string()];
        if spec.create {
            let checkpoint_path = self.write_scratch(
                "checkpoint.xml",
                &Self::checkpoint_create_xml(&spec.name, disks),
            )?;
            args.push(checkpoint_path.to_string_lossy().to_string());
        }

        let args: Vec<&str> = args.iter().map(String::as_str).collect();
        self.virsh("backup-begin", &args)
            .with_context(|| format!("unable to start backup job for '{}'", self.domain))?;
        self.job_active = true;

        Ok(disks
            .iter()
            .map(|disk| DiskEndpoint {
                target: disk.target.clone(),
                socket: socket.to_path_buf(),
                export: disk.target.clone(),
                // the backup job exposes one bitmap per disk
                dirty_context: level
                    .is_incremental()
                    .then(|| dirty_bitmap_context(&format!("backup-{}", disk.target))),
            })
            .collect())
    }

    fn stop_backup(&mut self) -> Result<(), Error> {
        if !self.job_active {
            return Ok(());
        }
        self.job_active = false;
        if let Err(err) = self.virsh("domjobabort", &[]) {
            warn!("unable to abort backup job: {}", err);
        }
        Ok(())
    }
}

impl Drop for VirshControl {
    fn drop(&mut self) {
        let _ = self.stop_backup();
    }
}
