//! In-memory block device with an explicit extent map.
//!
//! Test double shared by the pipeline tests: the extent list is set up
//! by the test instead of being probed, so allocation and dirty-bitmap
//! behavior is fully scripted.

use crate::{BlockDevice, NbdError, RawExtent};

pub struct MemDevice {
    data: Vec<u8>,
    extents: Vec<RawExtent>,
    max_request_size: u64,
}

impl MemDevice {
    pub fn new(size: usize, max_request_size: u64) -> Self {
        Self {
            data: vec![0u8; size],
            extents: vec![RawExtent {
                length: size as u64,
                flags: 0,
            }],
            max_request_size,
        }
    }

    /// Replace the extent list returned by [`BlockDevice::extents`].
    pub fn set_extents(&mut self, extents: Vec<RawExtent>) {
        self.extents = extents;
    }

    /// Fill a range with a byte value.
    pub fn fill(&mut self, offset: usize, length: usize, value: u8) {
        self.data[offset..offset + length].fill(value);
    }

    pub fn contents(&self) -> &[u8] {
        &self.data
    }
}

impl BlockDevice for MemDevice {
    fn size(&self) -> u64 {
        self.data.len() as u64
    }

    fn max_request_size(&self) -> u64 {
        self.max_request_size
    }

    fn read_at(&mut self, buf: &mut [u8], offset: u64) -> Result<(), NbdError> {
        let offset = offset as usize;
        if offset + buf.len() > self.data.len() {
            return Err(NbdError::Protocol(format!(
                "read {}+{} beyond device end {}",
                offset,
                buf.len(),
                self.data.len()
            )));
        }
        buf.copy_from_slice(&self.data[offset..offset + buf.len()]);
        Ok(())
    }

    fn write_at(&mut self, buf: &[u8], offset: u64) -> Result<(), NbdError> {
        let offset = offset as usize;
        if offset + buf.len() > self.data.len() {
            return Err(NbdError::Protocol(format!(
                "write {}+{} beyond device end {}",
                offset,
                buf.len(),
                self.data.len()
            )));
        }
        self.data[offset..offset + buf.len()].copy_from_slice(buf);
        Ok(())
    }

    fn write_zeroes(&mut self, offset: u64, length: u64) -> Result<(), NbdError> {
        let offset = offset as usize;
        let length = length as usize;
        if offset + length > self.data.len() {
            return Err(NbdError::Protocol(format!(
                "zero {}+{} beyond device end {}",
                offset,
                length,
                self.data.len()
            )));
        }
        self.data[offset..offset + length].fill(0);
        Ok(())
    }

    fn extents(&mut self) -> Result<Vec<RawExtent>, NbdError> {
        Ok(self.extents.clone())
    }
}
