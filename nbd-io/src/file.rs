//! Block device over a local raw image file.

use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::os::unix::io::AsRawFd;
use std::path::Path;

use nix::unistd::{lseek, Whence};

use crate::{BlockDevice, NbdError, RawExtent, STATE_HOLE, STATE_ZERO};

/// Default request bound, matching what QEMU advertises for NBD.
const MAX_REQUEST_SIZE: u64 = 4 * 1024 * 1024;

/// A raw local disk image. Allocation extents are probed with
/// `SEEK_HOLE`/`SEEK_DATA`, so sparse files keep their holes across a
/// backup.
pub struct FileDevice {
    file: File,
    size: u64,
    writable: bool,
}

impl FileDevice {
    pub fn open(path: &Path) -> Result<Self, NbdError> {
        let file = File::open(path)?;
        let size = file.metadata()?.len();
        Ok(Self {
            file,
            size,
            writable: false,
        })
    }

    /// Open (creating if necessary) for restore, sized to `size`.
    pub fn create(path: &Path, size: u64) -> Result<Self, NbdError> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        file.set_len(size)?;
        Ok(Self {
            file,
            size,
            writable: true,
        })
    }
}

impl BlockDevice for FileDevice {
    fn size(&self) -> u64 {
        self.size
    }

    fn max_request_size(&self) -> u64 {
        MAX_REQUEST_SIZE
    }

    fn read_at(&mut self, buf: &mut [u8], offset: u64) -> Result<(), NbdError> {
        self.file.read_exact_at(buf, offset)?;
        Ok(())
    }

    fn write_at(&mut self, buf: &[u8], offset: u64) -> Result<(), NbdError> {
        self.file.write_all_at(buf, offset)?;
        Ok(())
    }

    fn write_zeroes(&mut self, offset: u64, length: u64) -> Result<(), NbdError> {
        // the file was created zeroed, nothing to do beyond bounds
        // checking when restoring into a fresh image
        if offset + length > self.size {
            return Err(NbdError::Protocol(format!(
                "zero range {}+{} beyond device end {}",
                offset, length, self.size
            )));
        }
        if !self.writable {
            return Err(NbdError::Protocol("device is read-only".into()));
        }
        Ok(())
    }

    fn extents(&mut self) -> Result<Vec<RawExtent>, NbdError> {
        let mut extents = Vec::new();
        let mut pos: i64 = 0;
        let end = self.size as i64;

        while pos < end {
            let data_start = match lseek(self.file.as_raw_fd(), pos, Whence::SeekData) {
                Ok(off) => off.min(end),
                // ENXIO: no more data past pos
                Err(nix::errno::Errno::ENXIO) => end,
                Err(err) => return Err(NbdError::Io(err.into())),
            };
            if data_start > pos {
                extents.push(RawExtent {
                    length: (data_start - pos) as u64,
                    flags: STATE_HOLE | STATE_ZERO,
                });
                pos = data_start;
            }
            if pos >= end {
                break;
            }
            let hole_start = match lseek(self.file.as_raw_fd(), pos, Whence::SeekHole) {
                Ok(off) => off.min(end),
                Err(nix::errno::Errno::ENXIO) => end,
                Err(err) => return Err(NbdError::Io(err.into())),
            };
            if hole_start > pos {
                extents.push(RawExtent {
                    length: (hole_start - pos) as u64,
                    flags: 0,
                });
                pos = hole_start;
            }
        }

        Ok(extents)
    }

    fn flush(&mut self) -> Result<(), NbdError> {
        if self.writable {
            self.file.sync_data()?;
        }
        Ok(())
    }
}
