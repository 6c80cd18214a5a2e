//! # Stream Framer
//!
//! Purpose: Turn a raw byte stream into discrete frames, however the bytes
//! were split across socket reads.
//!
//! ## Design Principles
//! 1. **Accumulate, Then Split**: Reads land in one `BytesMut`; complete
//!    frames are split off the front without copying the payload.
//! 2. **Restartable**: `next_frame` returns `Ok(None)` when it needs more
//!    bytes and picks up exactly where it stopped on the next call.
//! 3. **Pipelining**: One read holding N frames yields N frames, in order.
//! 4. **Fail Fast**: A corrupt length prefix is an error, never a guess.
//!
//! ## Usage
//!
//! ```
//! use rkv_common::{Framer, Frame, MessageCode};
//!
//! let mut framer = Framer::new();
//! let bytes = Frame::empty(MessageCode::PingResp).to_bytes().unwrap();
//!
//! framer.extend(&bytes[..2]);
//! assert!(framer.next_frame().unwrap().is_none());
//!
//! framer.extend(&bytes[2..]);
//! let frame = framer.next_frame().unwrap().unwrap();
//! assert!(frame.is(MessageCode::PingResp));
//! ```

use bytes::{Buf, BytesMut};

use crate::error::{FrameError, FrameResult};
use crate::frame::{Frame, LENGTH_PREFIX_SIZE};

/// Default ceiling for `length` (code byte plus payload): 64 MiB.
pub const DEFAULT_MAX_FRAME_LEN: usize = 64 * 1024 * 1024;

/// Initial accumulation buffer capacity.
const INITIAL_CAPACITY: usize = 8 * 1024;

/// Length-prefixed frame decoder with an internal read buffer.
#[derive(Debug)]
pub struct Framer {
    buffer: BytesMut,
    max_frame_len: usize,
}

impl Framer {
    /// Creates a framer with the default frame ceiling.
    pub fn new() -> Self {
        Self::with_max_frame_len(DEFAULT_MAX_FRAME_LEN)
    }

    /// Creates a framer that rejects frames longer than `max_frame_len`.
    pub fn with_max_frame_len(max_frame_len: usize) -> Self {
        Framer {
            buffer: BytesMut::with_capacity(INITIAL_CAPACITY),
            max_frame_len,
        }
    }

    /// Configured frame ceiling.
    pub fn max_frame_len(&self) -> usize {
        self.max_frame_len
    }

    /// Appends raw bytes read from the stream.
    pub fn extend(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Accumulation buffer, for reading straight into it with `read_buf`.
    pub fn buffer_mut(&mut self) -> &mut BytesMut {
        &mut self.buffer
    }

    /// Extracts the next complete frame.
    ///
    /// Returns `Ok(None)` when the buffer holds only part of a frame.
    pub fn next_frame(&mut self) -> FrameResult<Option<Frame>> {
        if self.buffer.len() < LENGTH_PREFIX_SIZE {
            return Ok(None);
        }

        let mut prefix = [0u8; LENGTH_PREFIX_SIZE];
        prefix.copy_from_slice(&self.buffer[..LENGTH_PREFIX_SIZE]);
        let len = u32::from_be_bytes(prefix) as usize;

        if len == 0 {
            return Err(FrameError::Empty);
        }
        if len > self.max_frame_len {
            return Err(FrameError::Oversized {
                len,
                max: self.max_frame_len,
            });
        }

        let total = LENGTH_PREFIX_SIZE + len;
        if self.buffer.len() < total {
            // Grow once for the rest of this frame instead of per read.
            self.buffer.reserve(total - self.buffer.len());
            return Ok(None);
        }

        self.buffer.advance(LENGTH_PREFIX_SIZE);
        let code = self.buffer.get_u8();
        let payload = self.buffer.split_to(len - 1).freeze();
        Ok(Some(Frame { code, payload }))
    }

    /// Extracts every complete frame currently buffered, in arrival order.
    pub fn drain(&mut self) -> FrameResult<Vec<Frame>> {
        let mut frames = Vec::new();
        while let Some(frame) = self.next_frame()? {
            frames.push(frame);
        }
        Ok(frames)
    }

    /// Appends `data` and extracts every frame it completes.
    pub fn push(&mut self, data: &[u8]) -> FrameResult<Vec<Frame>> {
        self.extend(data);
        self.drain()
    }

    /// Number of buffered bytes not yet returned as frames.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// True when no partial frame is pending.
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Drops any buffered bytes.
    pub fn clear(&mut self) {
        self.buffer.clear();
    }
}

impl Default for Framer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codes::MessageCode;
    use bytes::Bytes;
    use proptest::prelude::*;

    fn wire(frames: &[Frame]) -> Vec<u8> {
        let mut out = BytesMut::new();
        for frame in frames {
            frame.encode_to(&mut out).unwrap();
        }
        out.to_vec()
    }

    fn sample_frames() -> Vec<Frame> {
        vec![
            Frame::new(MessageCode::ListKeysResp, Bytes::from_static(b"first")),
            Frame::empty(MessageCode::PingResp),
            Frame::new(MessageCode::GetResp, Bytes::from(vec![7u8; 300])),
        ]
    }

    #[test]
    fn waits_for_length_prefix() {
        let mut framer = Framer::new();
        framer.extend(&[0, 0]);
        assert_eq!(framer.next_frame().unwrap(), None);
        assert_eq!(framer.buffered(), 2);
    }

    #[test]
    fn waits_for_payload() {
        let mut framer = Framer::new();
        framer.extend(&[0, 0, 0, 4, 9, b'a']);
        assert_eq!(framer.next_frame().unwrap(), None);
        framer.extend(b"bc");
        let frame = framer.next_frame().unwrap().unwrap();
        assert_eq!(frame.code, 9);
        assert_eq!(&frame.payload[..], b"abc");
        assert!(framer.is_empty());
    }

    #[test]
    fn splits_pipelined_frames_in_one_pass() {
        let frames = sample_frames();
        let mut framer = Framer::new();
        let decoded = framer.push(&wire(&frames)).unwrap();
        assert_eq!(decoded, frames);
        assert!(framer.is_empty());
    }

    #[test]
    fn keeps_trailing_partial_frame() {
        let frames = sample_frames();
        let mut bytes = wire(&frames);
        bytes.extend_from_slice(&[0, 0, 0, 9, 10]);
        let mut framer = Framer::new();
        assert_eq!(framer.push(&bytes).unwrap().len(), 3);
        assert_eq!(framer.buffered(), 5);
    }

    #[test]
    fn one_byte_at_a_time() {
        let frames = sample_frames();
        let mut framer = Framer::new();
        let mut decoded = Vec::new();
        for byte in wire(&frames) {
            decoded.extend(framer.push(&[byte]).unwrap());
        }
        assert_eq!(decoded, frames);
    }

    #[test]
    fn rejects_zero_length() {
        let mut framer = Framer::new();
        framer.extend(&[0, 0, 0, 0]);
        assert_eq!(framer.next_frame(), Err(FrameError::Empty));
    }

    #[test]
    fn rejects_oversized_length() {
        let mut framer = Framer::with_max_frame_len(16);
        framer.extend(&[0, 0, 0, 17]);
        assert_eq!(
            framer.next_frame(),
            Err(FrameError::Oversized { len: 17, max: 16 })
        );
    }

    #[test]
    fn rejects_garbage_prefix_before_payload_arrives() {
        let mut framer = Framer::new();
        framer.extend(&[0xff, 0xff, 0xff, 0xff]);
        assert!(matches!(
            framer.next_frame(),
            Err(FrameError::Oversized { .. })
        ));
    }

    #[test]
    fn clear_discards_partial_frame() {
        let mut framer = Framer::new();
        framer.extend(&[0, 0, 0, 3, 1]);
        framer.clear();
        assert!(framer.is_empty());
        assert_eq!(framer.next_frame().unwrap(), None);
    }

    fn arb_frame() -> impl Strategy<Value = Frame> {
        (any::<u8>(), prop::collection::vec(any::<u8>(), 0..64))
            .prop_map(|(code, payload)| Frame::from_raw(code, payload))
    }

    proptest! {
        #[test]
        fn split_reads_match_single_read(
            frames in prop::collection::vec(arb_frame(), 1..8),
            cuts in prop::collection::vec(any::<prop::sample::Index>(), 0..12),
        ) {
            let bytes = wire(&frames);

            let mut whole = Framer::new();
            let expected = whole.push(&bytes).unwrap();
            prop_assert_eq!(&expected, &frames);

            let mut points: Vec<usize> = cuts.iter().map(|c| c.index(bytes.len() + 1)).collect();
            points.push(0);
            points.push(bytes.len());
            points.sort_unstable();
            points.dedup();

            let mut framer = Framer::new();
            let mut decoded = Vec::new();
            for window in points.windows(2) {
                decoded.extend(framer.push(&bytes[window[0]..window[1]]).unwrap());
            }
            prop_assert_eq!(decoded, expected);
            prop_assert!(framer.is_empty());
        }

        #[test]
        fn n_frames_in_one_buffer_yield_n(frames in prop::collection::vec(arb_frame(), 1..16)) {
            let mut framer = Framer::new();
            let decoded = framer.push(&wire(&frames)).unwrap();
            prop_assert_eq!(decoded.len(), frames.len());
        }
    }
}
