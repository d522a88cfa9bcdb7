//! Shared helpers for the job binaries.

use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{bail, format_err, Error};

pub mod signals;
pub mod worker_pool;

/// Marker suffix of files still being written.
pub const PARTIAL_SUFFIX: &str = ".partial";

/// Atomically replace `path`: write a temporary file next to it and
/// rename over the target, so readers never observe a torn write.
pub fn replace_file<P: AsRef<Path>>(path: P, data: &[u8]) -> Result<(), Error> {
    let path = path.as_ref();
    let tmp_path = {
        let mut os = path.as_os_str().to_owned();
        os.push(".tmp");
        PathBuf::from(os)
    };

    let mut file = File::create(&tmp_path)
        .map_err(|err| format_err!("unable to create {:?} - {}", tmp_path, err))?;
    file.write_all(data)?;
    file.sync_all()?;

    std::fs::rename(&tmp_path, path)
        .map_err(|err| format_err!("unable to rename {:?} to {:?} - {}", tmp_path, path, err))?;
    Ok(())
}

/// Create the target directory, refusing plain files in its place.
pub fn create_target_dir(path: &Path) -> Result<(), Error> {
    if path.exists() {
        if !path.is_dir() {
            bail!("specified target {:?} is a file, not a directory", path);
        }
        return Ok(());
    }
    std::fs::create_dir_all(path)
        .map_err(|err| format_err!("unable to create target directory {:?} - {}", path, err))
}

/// First `.partial` leftover below `dir`, if any.
pub fn find_partial_file(dir: &Path) -> Result<Option<PathBuf>, Error> {
    if !dir.exists() {
        return Ok(None);
    }
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name();
        if name.to_string_lossy().ends_with(PARTIAL_SUFFIX) {
            return Ok(Some(entry.path()));
        }
    }
    Ok(None)
}

pub fn epoch_secs() -> i64 {
    chrono::Utc::now().timestamp()
}

/// Human readable timestamp for stream metadata and log files.
pub fn rfc3339_now() -> String {
    chrono::Local::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true)
}

/// Per-run log written into the backup target directory, next to the
/// data files it describes. The process logger stays on stderr, this
/// records what happened to a particular backup set.
pub struct RunLog {
    file: File,
}

impl RunLog {
    pub fn create(dir: &Path, level: crate::Level) -> Result<Self, Error> {
        let name = format!("backup.{}.{}.log", level, epoch_secs());
        let file = File::create(dir.join(&name))?;
        Ok(Self { file })
    }

    pub fn log<S: AsRef<str>>(&mut self, msg: S) {
        let line = format!("{}: {}\n", rfc3339_now(), msg.as_ref());
        if let Err(err) = self.file.write_all(line.as_bytes()) {
            log::warn!("unable to write run log - {}", err);
        }
    }
}
