//! # Framing Errors
//!
//! Errors raised while delimiting the byte stream into frames. Every one of
//! them is fatal to the connection that produced it: once framing is lost
//! there is no way to find the next message boundary.

use thiserror::Error;

/// Result type for frame-level operations.
pub type FrameResult<T> = Result<T, FrameError>;

/// Frame decoding failures.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
    /// Length prefix larger than the configured ceiling.
    #[error("frame length {len} exceeds maximum {max}")]
    Oversized { len: usize, max: usize },

    /// Length prefix of zero; every frame carries at least a code byte.
    #[error("frame length is zero")]
    Empty,

    /// A handshake frame did not carry the code the sequence requires.
    #[error("expected message code {expected}, got {actual}")]
    UnexpectedCode { expected: u8, actual: u8 },

    /// Bytes were buffered past a frame after which the stream must be idle.
    #[error("{0} unexpected bytes buffered after handshake frame")]
    TrailingBytes(usize),

    /// Outgoing payload does not fit in a u32 length prefix.
    #[error("payload of {0} bytes cannot be framed")]
    PayloadTooLarge(usize),
}
