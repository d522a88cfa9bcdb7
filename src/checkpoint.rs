//! Checkpoint chain management.
//!
//! The chain is an append-only log of checkpoint names persisted as a
//! JSON array in `<domain>.cpt` next to the backup data. Index i is
//! the checkpoint's position, the parent of entry i is entry i-1. A
//! full backup wipes the chain before starting a new one; copy and
//! diff never touch it.

use std::path::{Path, PathBuf};

use anyhow::{format_err, Context, Error};

use crate::tools;
use crate::{JobError, Level, CHECKPOINT_PREFIX};

/// Checkpoint identity of one backup run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckpointSpec {
    /// Checkpoint created for this run. Empty for copy and diff, which
    /// leave the chain untouched.
    pub name: String,
    /// Parent checkpoint recorded in the stream metadata.
    pub parent: Option<String>,
    /// Create `name` on the host before the backup starts.
    pub create: bool,
    /// Append `name` to the chain once the backup succeeded.
    pub append: bool,
}

#[derive(Debug)]
pub struct CheckpointChain {
    path: PathBuf,
    names: Vec<String>,
}

impl CheckpointChain {
    /// Load `<domain>.cpt` from the backup directory, empty if absent.
    /// A corrupt chain file is fatal, the user has to intervene.
    pub fn load(dir: &Path, domain: &str) -> Result<Self, Error> {
        let path = dir.join(format!("{}.cpt", domain));
        let names = match std::fs::read(&path) {
            Ok(raw) => serde_json::from_slice(&raw)
                .map_err(|err| format_err!("corrupt checkpoint chain {:?} - {}", path, err))?,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(err) => return Err(err).context(format!("unable to read {:?}", path)),
        };
        Ok(Self { path, names })
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    pub fn last(&self) -> Option<&str> {
        self.names.last().map(String::as_str)
    }

    /// Next checkpoint name, unique as long as full backups wipe the
    /// chain before starting.
    pub fn next_name(&self) -> String {
        format!("{}.{}", CHECKPOINT_PREFIX, self.names.len())
    }

    /// Persist an appended checkpoint. Called by the coordinator only,
    /// after all disk workers finished.
    pub fn append(&mut self, name: String) -> Result<(), Error> {
        self.names.push(name);
        self.save()
    }

    /// Empty the chain before a new full backup.
    pub fn clear(&mut self) -> Result<(), Error> {
        self.names.clear();
        self.save()
    }

    fn save(&self) -> Result<(), Error> {
        let data = serde_json::to_vec(&self.names)?;
        tools::replace_file(&self.path, &data)
    }

    /// Checkpoint identity for a backup at `level`.
    pub fn checkpoint_for(&self, level: Level) -> Result<CheckpointSpec, Error> {
        match level {
            Level::Full => Ok(CheckpointSpec {
                name: self.next_name(),
                parent: None,
                create: true,
                append: true,
            }),
            Level::Copy => Ok(CheckpointSpec {
                name: String::new(),
                parent: None,
                create: false,
                append: false,
            }),
            Level::Inc => {
                let parent = self.last().ok_or(JobError::NoCheckpoints)?;
                Ok(CheckpointSpec {
                    name: self.next_name(),
                    parent: Some(parent.to_string()),
                    create: true,
                    append: true,
                })
            }
            Level::Diff => {
                // delta against the last checkpoint, no checkpoint of
                // its own and the chain is not extended; the stream
                // identifies itself by timestamp
                let parent = self.last().ok_or(JobError::NoCheckpoints)?;
                Ok(CheckpointSpec {
                    name: String::new(),
                    parent: Some(parent.to_string()),
                    create: false,
                    append: false,
                })
            }
        }
    }

    /// Refuse to operate when the host carries checkpoints some other
    /// tool created.
    pub fn validate_foreign(host_checkpoints: &[String]) -> Result<(), JobError> {
        for name in host_checkpoints {
            if !name.starts_with(&format!("{}.", CHECKPOINT_PREFIX)) {
                return Err(JobError::ForeignCheckpoint(name.clone()));
            }
        }
        Ok(())
    }
}
