//! Block device plumbing.
//!
//! The backup and restore pipelines never talk wire protocols
//! directly, they consume the [`BlockDevice`] capability. The concrete
//! implementations live here: a blocking NBD client ([`client`]), a
//! plain file device ([`file`]) and an in-memory device used by tests
//! ([`mem`]). The [`server`] module is the NBD export side used for
//! instant recovery.

pub mod client;
pub mod file;
pub mod mem;
pub mod protocol;
pub mod server;

pub use client::NbdClient;
pub use file::FileDevice;
pub use mem::MemDevice;
pub use server::{Export, NbdServer};

/// Errors of the NBD transport and the device implementations.
#[derive(Debug, thiserror::Error)]
pub enum NbdError {
    /// Retries exceeded or a non-retryable connect failure.
    #[error("unable to connect NBD endpoint: {0}")]
    Connect(String),
    #[error("NBD protocol error: {0}")]
    Protocol(String),
    /// The server answered a command with an errno.
    #[error("NBD server returned errno {errno} for {command}")]
    Command { command: &'static str, errno: u32 },
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// One extent as reported by a metadata context query, front to back.
///
/// Flag semantics depend on the queried context: `base:allocation`
/// sets [`STATE_HOLE`]/[`STATE_ZERO`], a dirty bitmap context sets
/// [`STATE_DIRTY`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawExtent {
    pub length: u64,
    pub flags: u32,
}

/// `base:allocation` flag: extent is unallocated.
pub const STATE_HOLE: u32 = 1 << 0;
/// `base:allocation` flag: extent reads as zeroes.
pub const STATE_ZERO: u32 = 1 << 1;
/// Dirty bitmap flag: extent changed since the checkpoint.
pub const STATE_DIRTY: u32 = 1 << 0;

/// Capability consumed by the pipelines: positioned reads and writes,
/// zero propagation and extent queries against one virtual disk.
pub trait BlockDevice {
    /// Virtual size of the disk in bytes.
    fn size(&self) -> u64;

    /// Upper bound for a single read or write request. Longer spans
    /// must be chunked by the caller.
    fn max_request_size(&self) -> u64;

    fn read_at(&mut self, buf: &mut [u8], offset: u64) -> Result<(), NbdError>;

    fn write_at(&mut self, buf: &[u8], offset: u64) -> Result<(), NbdError>;

    fn write_zeroes(&mut self, offset: u64, length: u64) -> Result<(), NbdError>;

    /// Query the extent list for the connection's metadata context,
    /// covering `[0, size)` front to back.
    fn extents(&mut self) -> Result<Vec<RawExtent>, NbdError>;

    fn flush(&mut self) -> Result<(), NbdError> {
        Ok(())
    }
}
