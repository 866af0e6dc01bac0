//! Multipart messages: ordered frames sent and received as one unit.

use bytes::Bytes;
use serde::{Serialize, de::DeserializeOwned};

use super::{ChannelError, Frame, pack, unpack};

/// An ordered sequence of frame payloads.
///
/// Parts are either packed with the canonical binary format
/// ([`Multipart::pack`]) or carried verbatim ([`Multipart::raw`]) for
/// payloads that are already serialized.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Multipart {
  parts: Vec<Bytes>,
}

impl Multipart {
  pub fn new() -> Self {
    Self::default()
  }

  /// Append a packed value.
  pub fn pack<T: Serialize + ?Sized>(mut self, value: &T) -> Result<Self, ChannelError> {
    self.parts.push(pack(value)?);
    Ok(self)
  }

  /// Append bytes verbatim.
  pub fn raw(mut self, bytes: impl Into<Bytes>) -> Self {
    self.parts.push(bytes.into());
    self
  }

  pub fn push_raw(&mut self, bytes: impl Into<Bytes>) {
    self.parts.push(bytes.into());
  }

  pub fn len(&self) -> usize {
    self.parts.len()
  }

  pub fn is_empty(&self) -> bool {
    self.parts.is_empty()
  }

  pub fn parts(&self) -> &[Bytes] {
    &self.parts
  }

  /// Decode the part at `index`.
  pub fn unpack<T: DeserializeOwned>(&self, index: usize) -> Result<T, ChannelError> {
    unpack(self.part(index)?)
  }

  /// The part at `index` without decoding. Cheap: `Bytes` is reference counted.
  pub fn raw_at(&self, index: usize) -> Result<Bytes, ChannelError> {
    self.part(index).cloned()
  }

  fn part(&self, index: usize) -> Result<&Bytes, ChannelError> {
    self.parts.get(index).ok_or_else(|| {
      ChannelError::CorruptPayload(format!("missing frame {} of {}", index + 1, self.parts.len()))
    })
  }

  /// Frames for the wire: every frame but the last carries the more flag.
  pub fn into_frames(self) -> impl Iterator<Item = Frame> {
    let last = self.parts.len().saturating_sub(1);
    self
      .parts
      .into_iter()
      .enumerate()
      .map(move |(i, payload)| Frame::new(payload, i < last))
  }
}

impl FromIterator<Bytes> for Multipart {
  fn from_iter<I: IntoIterator<Item = Bytes>>(iter: I) -> Self {
    Self {
      parts: iter.into_iter().collect(),
    }
  }
}

/// Types that can be decoded from a complete multipart message.
///
/// Decoding is all-or-nothing: a single undecodable part fails the whole
/// message.
pub trait FromMultipart: Sized {
  fn from_multipart(message: &Multipart) -> Result<Self, ChannelError>;
}

macro_rules! impl_from_multipart {
  ($len:expr; $($name:ident : $idx:tt),+) => {
    impl<$($name: DeserializeOwned),+> FromMultipart for ($($name,)+) {
      fn from_multipart(message: &Multipart) -> Result<Self, ChannelError> {
        if message.len() != $len {
          return Err(ChannelError::CorruptPayload(format!(
            "expected {} frames, got {}",
            $len,
            message.len()
          )));
        }
        Ok(($(message.unpack::<$name>($idx)?,)+))
      }
    }
  };
}

impl_from_multipart!(1; A: 0);
impl_from_multipart!(2; A: 0, B: 1);
impl_from_multipart!(3; A: 0, B: 1, C: 2);
impl_from_multipart!(4; A: 0, B: 1, C: 2, D: 3);
