//! Extent queries against a block device.

use anyhow::{bail, Error};

use nbd_io::{BlockDevice, STATE_DIRTY, STATE_HOLE};

/// Metadata context for allocation queries (full and copy backups).
pub const ALLOCATION_CONTEXT: &str = "base:allocation";

/// Metadata context exposing the dirty bitmap of a checkpoint.
pub fn dirty_bitmap_context(bitmap: &str) -> String {
    format!("qemu:dirty-bitmap:{}", bitmap)
}

/// A contiguous disk range sharing one state: allocated data (or
/// dirty, for incremental queries) versus hole.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Extent {
    pub offset: u64,
    pub length: u64,
    pub data: bool,
}

impl Extent {
    pub fn end(&self) -> u64 {
        self.offset + self.length
    }
}

/// Query the device's extent list and normalize it: consecutive
/// extents with the same state are coalesced, the result is sorted,
/// contiguous and covers `[0, virtual size)`.
///
/// `incremental` selects the flag interpretation: a dirty bitmap
/// context reports dirtiness in bit 0, an allocation context reports
/// holes in bit 0.
pub fn query_extents(device: &mut dyn BlockDevice, incremental: bool) -> Result<Vec<Extent>, Error> {
    let raw = device.extents()?;
    if raw.is_empty() {
        bail!("no extent information received for disk");
    }

    let size = device.size();
    let mut extents: Vec<Extent> = Vec::new();
    let mut offset = 0u64;

    for entry in raw {
        if offset >= size {
            break;
        }
        let length = entry.length.min(size - offset);
        let data = if incremental {
            entry.flags & STATE_DIRTY != 0
        } else {
            entry.flags & STATE_HOLE == 0
        };
        match extents.last_mut() {
            Some(last) if last.data == data => last.length += length,
            _ => extents.push(Extent {
                offset,
                length,
                data,
            }),
        }
        offset += length;
    }

    // servers report up to the last allocated byte, the remainder of
    // the disk is a hole (clean, for dirty bitmap queries)
    if offset < size {
        match extents.last_mut() {
            Some(last) if !last.data => last.length += size - offset,
            _ => extents.push(Extent {
                offset,
                length: size - offset,
                data: false,
            }),
        }
    }

    Ok(extents)
}

/// Sum of all data extent lengths, the thin size of the backup.
pub fn thin_backup_size(extents: &[Extent]) -> u64 {
    extents
        .iter()
        .filter(|extent| extent.data)
        .map(|extent| extent.length)
        .sum()
}

#[cfg(test)]
mod test {
    use super::*;
    use nbd_io::{MemDevice, RawExtent, STATE_ZERO};

    #[test]
    fn coalesces_and_covers_disk() {
        let mut device = MemDevice::new(65536, 4096);
        device.set_extents(vec![
            RawExtent {
                length: 4096,
                flags: 0,
            },
            RawExtent {
                length: 4096,
                flags: 0,
            },
            RawExtent {
                length: 8192,
                flags: STATE_HOLE | STATE_ZERO,
            },
        ]);

        let extents = query_extents(&mut device, false).unwrap();
        assert_eq!(
            extents,
            vec![
                Extent {
                    offset: 0,
                    length: 8192,
                    data: true
                },
                // tail hole padded to the disk end
                Extent {
                    offset: 8192,
                    length: 57344,
                    data: false
                },
            ]
        );
        assert_eq!(extents.last().unwrap().end(), 65536);
        assert_eq!(thin_backup_size(&extents), 8192);
    }

    #[test]
    fn dirty_bitmap_interpretation() {
        let mut device = MemDevice::new(16384, 4096);
        device.set_extents(vec![
            RawExtent {
                length: 4096,
                flags: 0,
            },
            RawExtent {
                length: 4096,
                flags: STATE_DIRTY,
            },
            RawExtent {
                length: 8192,
                flags: 0,
            },
        ]);

        let extents = query_extents(&mut device, true).unwrap();
        assert_eq!(extents.len(), 3);
        assert!(!extents[0].data);
        assert!(extents[1].data);
        assert!(!extents[2].data);
        assert_eq!(thin_backup_size(&extents), 4096);
    }

    #[test]
    fn empty_reply_is_an_error() {
        let mut device = MemDevice::new(4096, 4096);
        device.set_extents(Vec::new());
        assert!(query_extents(&mut device, false).is_err());
    }
}
