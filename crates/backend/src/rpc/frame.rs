//! Length-prefixed frames with a continuation flag.
//!
//! Every frame on the wire is a five byte header followed by the payload:
//!
//! ```text
//! +-------------------+----------+--------------------+
//! | length: u32 (BE)  | flags u8 | payload (length)   |
//! +-------------------+----------+--------------------+
//! ```
//!
//! Bit 0 of `flags` is the "more frames follow" marker used to stitch
//! multipart messages together. All other bits must be zero.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

/// Default upper bound for a single frame payload (16 MiB).
pub const DEFAULT_MAX_FRAME_LENGTH: usize = 16 * 1024 * 1024;

const HEADER_LEN: usize = 5;
const FLAG_MORE: u8 = 0x01;

/// One unit of transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
  pub payload: Bytes,
  /// More frames of the same multipart message follow this one
  pub more: bool,
}

impl Frame {
  pub fn new(payload: impl Into<Bytes>, more: bool) -> Self {
    Self {
      payload: payload.into(),
      more,
    }
  }

  /// A frame that terminates its multipart message.
  pub fn last(payload: impl Into<Bytes>) -> Self {
    Self::new(payload, false)
  }
}

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
  #[error("Frame of {len} bytes exceeds the {max} byte limit")]
  TooLarge { len: usize, max: usize },
  #[error("Unknown frame flags: {0:#04x}")]
  BadFlags(u8),
  #[error("IO error: {0}")]
  Io(#[from] std::io::Error),
}

/// Codec turning a byte stream into [`Frame`]s and back.
#[derive(Debug, Clone)]
pub struct FrameCodec {
  max_length: usize,
}

impl FrameCodec {
  pub fn new() -> Self {
    Self::with_max_length(DEFAULT_MAX_FRAME_LENGTH)
  }

  pub fn with_max_length(max_length: usize) -> Self {
    Self { max_length }
  }

  pub fn max_length(&self) -> usize {
    self.max_length
  }
}

impl Default for FrameCodec {
  fn default() -> Self {
    Self::new()
  }
}

impl Decoder for FrameCodec {
  type Item = Frame;
  type Error = FrameError;

  fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, FrameError> {
    if src.len() < HEADER_LEN {
      return Ok(None);
    }

    let len = u32::from_be_bytes([src[0], src[1], src[2], src[3]]) as usize;
    if len > self.max_length {
      return Err(FrameError::TooLarge {
        len,
        max: self.max_length,
      });
    }

    let flags = src[4];
    if flags & !FLAG_MORE != 0 {
      return Err(FrameError::BadFlags(flags));
    }

    if src.len() < HEADER_LEN + len {
      src.reserve(HEADER_LEN + len - src.len());
      return Ok(None);
    }

    src.advance(HEADER_LEN);
    let payload = src.split_to(len).freeze();

    Ok(Some(Frame {
      payload,
      more: flags & FLAG_MORE != 0,
    }))
  }
}

impl Encoder<Frame> for FrameCodec {
  type Error = FrameError;

  fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), FrameError> {
    let len = frame.payload.len();
    if len > self.max_length {
      return Err(FrameError::TooLarge {
        len,
        max: self.max_length,
      });
    }

    dst.reserve(HEADER_LEN + len);
    dst.put_u32(len as u32);
    dst.put_u8(if frame.more { FLAG_MORE } else { 0 });
    dst.extend_from_slice(&frame.payload);
    Ok(())
  }
}
