//! Sparse stream backup, restore and instant recovery for libvirt/QEMU
//! disks exposed over NBD.

use std::path::PathBuf;

pub mod backup;
pub mod checkpoint;
pub mod chunked;
pub mod extents;
pub mod host;
pub mod map;
pub mod restore;
pub mod tools;

/// Prefix of every checkpoint this tool creates. Checkpoints on the
/// host not carrying it belong to someone else and block full and
/// incremental backups.
pub const CHECKPOINT_PREFIX: &str = "virtsparse";

/// Domain level errors of the backup, restore and map jobs. Everything
/// else travels as [`anyhow::Error`] with context.
#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error("restored data size {actual} does not match stream data size {expected}")]
    RestoreSizeMismatch { expected: u64, actual: u64 },
    #[error("host has foreign checkpoint '{0}', refusing to touch the chain")]
    ForeignCheckpoint(String),
    #[error("no checkpoints found, take a full backup first")]
    NoCheckpoints,
    #[error("partial backup file '{0}' found, last backup was interrupted")]
    PartialBackupPresent(PathBuf),
    #[error("host refused to redefine checkpoint '{0}'")]
    RedefineCheckpoint(String),
    #[error("read at {offset}+{length} crosses a block boundary")]
    UnexpectedBlockRange { offset: u64, length: u64 },
    #[error("compressed streams cannot be mapped")]
    CompressionUnsupportedForMapping,
}

/// Backup level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Level {
    /// Complete data, no checkpoint semantics.
    Copy,
    /// Complete data, wipes the chain and starts a new one.
    Full,
    /// Delta since the last checkpoint, extends the chain.
    Inc,
    /// Delta since the last checkpoint, chain untouched.
    Diff,
}

impl Level {
    /// Whether streams of this level carry only dirty ranges.
    pub fn is_incremental(self) -> bool {
        matches!(self, Level::Inc | Level::Diff)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Level::Copy => "copy",
            Level::Full => "full",
            Level::Inc => "inc",
            Level::Diff => "diff",
        }
    }
}

impl std::str::FromStr for Level {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "copy" => Ok(Level::Copy),
            "full" => Ok(Level::Full),
            "inc" => Ok(Level::Inc),
            "diff" => Ok(Level::Diff),
            other => anyhow::bail!("invalid backup level '{}'", other),
        }
    }
}

impl std::fmt::Display for Level {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Output format of a backup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamType {
    /// Sparse stream format.
    Stream,
    /// Plain full-size image, data written at its native offsets.
    Raw,
}

impl std::str::FromStr for StreamType {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "stream" => Ok(StreamType::Stream),
            "raw" => Ok(StreamType::Raw),
            other => anyhow::bail!("invalid backup type '{}'", other),
        }
    }
}

/// Name of the stream or raw image written for one disk.
///
/// Full and copy backups have a fixed name, incremental and
/// differential ones carry their identity (checkpoint name or unix
/// timestamp).
pub fn data_file_name(disk: &str, level: Level, ident: &str) -> String {
    match level {
        Level::Full | Level::Copy => format!("{}.{}.data", disk, level),
        Level::Inc | Level::Diff => format!("{}.{}.{}.data", disk, level, ident),
    }
}
