//! # Frame Envelope
//!
//! Purpose: Represent one delimited protocol message and write it back onto
//! the wire.
//!
//! ## Wire Layout
//!
//! ```text
//! +-----------------+---------+------------------+
//! | length:4B (BE)  | code:1B | payload:length-1 |
//! +-----------------+---------+------------------+
//! ```
//!
//! `length` counts the code byte plus the payload, so the smallest legal
//! frame is five bytes long with `length == 1`.

use bytes::{BufMut, Bytes, BytesMut};

use crate::codes::{describe_code, MessageCode};
use crate::error::{FrameError, FrameResult};

/// Size of the big-endian length prefix.
pub const LENGTH_PREFIX_SIZE: usize = 4;

/// Size of the prefix plus the code byte.
pub const HEADER_SIZE: usize = LENGTH_PREFIX_SIZE + 1;

/// One framed message: a code byte and an opaque payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Raw message code; may be unknown to this library.
    pub code: u8,
    /// Payload bytes following the code.
    pub payload: Bytes,
}

impl Frame {
    /// Builds a frame from a known code and payload.
    pub fn new(code: MessageCode, payload: impl Into<Bytes>) -> Self {
        Frame {
            code: code.as_u8(),
            payload: payload.into(),
        }
    }

    /// Builds a payload-free frame, e.g. a ping or the TLS upgrade marker.
    pub fn empty(code: MessageCode) -> Self {
        Frame {
            code: code.as_u8(),
            payload: Bytes::new(),
        }
    }

    /// Builds a frame from a raw code byte.
    pub fn from_raw(code: u8, payload: impl Into<Bytes>) -> Self {
        Frame {
            code,
            payload: payload.into(),
        }
    }

    /// Returns the known code, if any.
    pub fn message_code(&self) -> Option<MessageCode> {
        MessageCode::from_u8(self.code)
    }

    /// True when the frame carries `code`.
    pub fn is(&self, code: MessageCode) -> bool {
        self.code == code.as_u8()
    }

    /// True when the payload is zero-length.
    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }

    /// Number of bytes this frame occupies on the wire.
    pub fn encoded_len(&self) -> usize {
        HEADER_SIZE + self.payload.len()
    }

    /// Appends the wire form of this frame to `out`.
    pub fn encode_to(&self, out: &mut BytesMut) -> FrameResult<()> {
        let len = u32::try_from(self.payload.len() + 1)
            .map_err(|_| FrameError::PayloadTooLarge(self.payload.len()))?;
        out.reserve(self.encoded_len());
        out.put_u32(len);
        out.put_u8(self.code);
        out.extend_from_slice(&self.payload);
        Ok(())
    }

    /// Returns the wire form of this frame as a fresh buffer.
    pub fn to_bytes(&self) -> FrameResult<Bytes> {
        let mut out = BytesMut::with_capacity(self.encoded_len());
        self.encode_to(&mut out)?;
        Ok(out.freeze())
    }

    /// Short description for logs: code name and payload size.
    pub fn describe(&self) -> String {
        format!("{} [{}B]", describe_code(self.code), self.payload.len())
    }
}
