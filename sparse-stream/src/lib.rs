//! Sparse stream format
//!
//! A backup stream is a sequence of fixed-width frames. The first frame
//! carries a JSON metadata payload, followed by any number of DATA and ZERO
//! frames, and exactly one STOP frame. Compressed streams append a trailer
//! after STOP recording the compressed size of every DATA payload, so a
//! restore can tell how many bytes to consume before decompressing.

pub mod block_map;
pub mod format;
pub mod metadata;
pub mod stream;

pub use block_map::{BlockMap, BlockMapEntry};
pub use format::{Frame, FrameKind, FRAME_LEN, TERM};
pub use metadata::{Metadata, STREAM_VERSION};
pub use stream::{SparseStreamReader, SparseStreamWriter, TrailerEntry};

/// Errors raised while encoding or decoding a sparse stream.
#[derive(Debug, thiserror::Error)]
pub enum StreamError {
    /// Malformed frame, bad terminator, unknown kind or truncated payload.
    #[error("invalid stream format: {0}")]
    Format(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl StreamError {
    pub(crate) fn format<T: std::fmt::Display>(msg: T) -> Self {
        StreamError::Format(msg.to_string())
    }
}
