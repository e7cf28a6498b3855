//! Length-prefixed frame codec.
//!
//! `FRAME = u32_be length || body`, `body = encode((msg_type: u8, payload))`.
//! Unlike ZMTP's flag-byte multipart framing, a Junction frame is always one
//! complete `(msg_type, payload)` unit — there is no on-wire multipart
//! concept — so the decoder only needs to track "how many more body bytes
//! are we waiting for", not fragment/continuation state.
//!
//! Grounded on the stateful, fragmentation-aware decode loop pattern (fast
//! path zero-copy on a single segment, slow path reassembly through a
//! `SegmentedBuffer`) used by this codebase's earlier protocol decoders.

use bytes::{Bytes, BytesMut};
use junction_core::buffer::SegmentedBuffer;
use thiserror::Error;

/// Maximum frame body size accepted from the wire, guarding against a
/// corrupt or malicious length prefix causing unbounded buffering.
pub const MAX_FRAME_LEN: u32 = 64 * 1024 * 1024;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FrameError {
    #[error("frame length {0} exceeds the {1} byte limit")]
    TooLarge(u32, u32),
}

const LEN_PREFIX: usize = 4;

enum DecodeState {
    ReadingLength,
    ReadingBody { len: usize },
}

/// Incremental frame decoder, fed arbitrary-sized reads and yielding
/// complete frame bodies (still containing `(msg_type, payload)` encoded,
/// undecoded) as they become available.
pub struct FrameDecoder {
    state: DecodeState,
    staging: SegmentedBuffer,
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self {
            state: DecodeState::ReadingLength,
            staging: SegmentedBuffer::new(),
        }
    }

    /// Feed newly-read bytes into the decoder.
    pub fn feed(&mut self, chunk: Bytes) {
        self.staging.push(chunk);
    }

    /// Pull the next complete frame body, if the staging buffer holds one.
    pub fn poll(&mut self) -> Result<Option<Bytes>, FrameError> {
        loop {
            match self.state {
                DecodeState::ReadingLength => {
                    if self.staging.len() < LEN_PREFIX {
                        return Ok(None);
                    }
                    let mut header = [0u8; LEN_PREFIX];
                    self.staging.copy_prefix(LEN_PREFIX, &mut header);
                    self.staging.advance(LEN_PREFIX);
                    let len = u32::from_be_bytes(header);
                    if len > MAX_FRAME_LEN {
                        return Err(FrameError::TooLarge(len, MAX_FRAME_LEN));
                    }
                    self.state = DecodeState::ReadingBody { len: len as usize };
                }
                DecodeState::ReadingBody { len } => {
                    if self.staging.len() < len {
                        return Ok(None);
                    }
                    let body = self.staging.take_bytes(len).expect("checked length above");
                    self.state = DecodeState::ReadingLength;
                    return Ok(Some(body));
                }
            }
        }
    }
}

/// Encode one frame: length prefix followed by `body`.
pub fn encode_frame(body: &[u8]) -> BytesMut {
    let mut out = BytesMut::with_capacity(LEN_PREFIX + body.len());
    out.extend_from_slice(&(body.len() as u32).to_be_bytes());
    out.extend_from_slice(body);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_a_single_frame() {
        let framed = encode_frame(b"hello");
        let mut decoder = FrameDecoder::new();
        decoder.feed(framed.freeze());
        let body = decoder.poll().unwrap().unwrap();
        assert_eq!(&body[..], b"hello");
        assert_eq!(decoder.poll().unwrap(), None);
    }

    #[test]
    fn handles_split_reads() {
        let framed = encode_frame(b"hello world");
        let bytes = framed.freeze();
        let mut decoder = FrameDecoder::new();

        decoder.feed(bytes.slice(0..2));
        assert_eq!(decoder.poll().unwrap(), None);

        decoder.feed(bytes.slice(2..));
        let body = decoder.poll().unwrap().unwrap();
        assert_eq!(&body[..], b"hello world");
    }

    #[test]
    fn rejects_oversized_length_prefix() {
        let mut decoder = FrameDecoder::new();
        let mut header = BytesMut::new();
        header.extend_from_slice(&(MAX_FRAME_LEN + 1).to_be_bytes());
        decoder.feed(header.freeze());
        assert_eq!(
            decoder.poll(),
            Err(FrameError::TooLarge(MAX_FRAME_LEN + 1, MAX_FRAME_LEN))
        );
    }

    #[test]
    fn two_frames_back_to_back() {
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&encode_frame(b"one"));
        buf.extend_from_slice(&encode_frame(b"two"));

        let mut decoder = FrameDecoder::new();
        decoder.feed(buf.freeze());
        assert_eq!(&decoder.poll().unwrap().unwrap()[..], b"one");
        assert_eq!(&decoder.poll().unwrap().unwrap()[..], b"two");
        assert_eq!(decoder.poll().unwrap(), None);
    }
}
