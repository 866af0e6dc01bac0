//! Wire-level RPC: frames, multipart messages and the worker command set.
//!
//! # Layers
//!
//! ```text
//! RpcCommand  (heartbeat | terminate | invoke | chunk | error | choke)
//!     │  to_multipart / from_multipart
//! Multipart   (ordered frames, bincode-packed or raw)
//!     │  Channel::send_multi / recv_multi
//! Frame       (u32 length + more flag + payload)
//!     │  FrameCodec
//! byte stream (TCP)
//! ```
//!
//! Transport and decode failures are handled here: sends report `false`,
//! receives return a [`ChannelError`]. Nothing in this module panics on bad
//! input from the peer.

use bytes::Bytes;
use serde::{Serialize, de::DeserializeOwned};

pub mod channel;
pub mod frame;
pub mod message;
pub mod multipart;

pub use channel::Channel;
pub use frame::{Frame, FrameCodec, FrameError};
pub use message::{Kind, RpcCommand};
pub use multipart::{FromMultipart, Multipart};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ChannelError {
  #[error("Transport failure: {0}")]
  Transport(String),
  #[error("Corrupted payload: {0}")]
  CorruptPayload(String),
  #[error("Unable to encode value: {0}")]
  Encode(String),
  #[error("Channel closed by peer")]
  Closed,
}

impl From<FrameError> for ChannelError {
  fn from(err: FrameError) -> Self {
    match err {
      FrameError::Io(e) => ChannelError::Transport(e.to_string()),
      other => ChannelError::CorruptPayload(other.to_string()),
    }
  }
}

/// Encode a value with the canonical binary format.
pub fn pack<T: Serialize + ?Sized>(value: &T) -> Result<Bytes, ChannelError> {
  bincode::serialize(value)
    .map(Bytes::from)
    .map_err(|e| ChannelError::Encode(e.to_string()))
}

/// Decode a value previously encoded with [`pack`].
pub fn unpack<T: DeserializeOwned>(frame: &[u8]) -> Result<T, ChannelError> {
  bincode::deserialize(frame).map_err(|e| ChannelError::CorruptPayload(e.to_string()))
}
