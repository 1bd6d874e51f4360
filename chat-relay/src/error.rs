use std::io;

use thiserror::Error;

/// Errors produced by the relay core.
///
/// Every variant is contained within the connection that produced it; none of
/// them should ever take down the server or another participant's handler.
#[derive(Debug, Error)]
pub enum RelayError {
    /// A peer declared a frame longer than the configured maximum.
    #[error("frame of {len} bytes exceeds the {max} byte limit")]
    FrameTooLarge { len: usize, max: usize },

    /// The stream ended (or failed) before a complete frame was available.
    #[error("connection closed")]
    ConnectionClosed,

    /// Writing to a peer failed, timed out, or the session was already closed.
    #[error("write failed: {0}")]
    WriteFailed(#[source] io::Error),

    #[error("nickname '{name}' is already in use")]
    DuplicateName { name: String },

    #[error("nickname must be 1-{max} bytes of UTF-8 text")]
    InvalidName { max: usize },
}

pub type RelayResult<T> = Result<T, RelayError>;
