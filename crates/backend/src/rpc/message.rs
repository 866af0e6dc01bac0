//! The worker RPC vocabulary.
//!
//! | kind      | fields                        | direction        |
//! |-----------|-------------------------------|------------------|
//! | heartbeat | -                             | worker -> engine |
//! | terminate | -                             | engine -> worker |
//! | invoke    | event: string, payload: bytes | engine -> worker |
//! | chunk     | payload: bytes                | both             |
//! | error     | code: i32, message: string    | worker -> engine |
//! | choke     | -                             | worker -> engine |
//!
//! The kind tag is always the first frame and decides how the remaining
//! frames are parsed.

use std::fmt;

use bytes::Bytes;

use super::{ChannelError, Multipart};

/// Discriminant of an [`RpcCommand`] on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Kind {
  Heartbeat,
  Terminate,
  Invoke,
  Chunk,
  Error,
  Choke,
}

impl Kind {
  pub const ALL: [Kind; 6] = [
    Kind::Heartbeat,
    Kind::Terminate,
    Kind::Invoke,
    Kind::Chunk,
    Kind::Error,
    Kind::Choke,
  ];

  pub fn tag(self) -> u32 {
    match self {
      Kind::Heartbeat => 1,
      Kind::Terminate => 2,
      Kind::Invoke => 3,
      Kind::Chunk => 4,
      Kind::Error => 5,
      Kind::Choke => 6,
    }
  }

  pub fn from_tag(tag: u32) -> Option<Kind> {
    Self::ALL.into_iter().find(|kind| kind.tag() == tag)
  }

  pub fn as_str(self) -> &'static str {
    match self {
      Kind::Heartbeat => "heartbeat",
      Kind::Terminate => "terminate",
      Kind::Invoke => "invoke",
      Kind::Chunk => "chunk",
      Kind::Error => "error",
      Kind::Choke => "choke",
    }
  }
}

impl fmt::Display for Kind {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

/// A command exchanged between an engine and its workers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RpcCommand {
  Heartbeat,
  Terminate,
  Invoke { event: String, payload: Bytes },
  Chunk { payload: Bytes },
  Error { code: i32, message: String },
  Choke,
}

impl RpcCommand {
  pub fn invoke(event: impl Into<String>, payload: impl Into<Bytes>) -> Self {
    Self::Invoke {
      event: event.into(),
      payload: payload.into(),
    }
  }

  pub fn chunk(payload: impl Into<Bytes>) -> Self {
    Self::Chunk {
      payload: payload.into(),
    }
  }

  pub fn error(code: i32, message: impl Into<String>) -> Self {
    Self::Error {
      code,
      message: message.into(),
    }
  }

  pub fn kind(&self) -> Kind {
    match self {
      Self::Heartbeat => Kind::Heartbeat,
      Self::Terminate => Kind::Terminate,
      Self::Invoke { .. } => Kind::Invoke,
      Self::Chunk { .. } => Kind::Chunk,
      Self::Error { .. } => Kind::Error,
      Self::Choke => Kind::Choke,
    }
  }

  /// Encode into frames. Byte payloads are carried raw, without re-encoding.
  pub fn to_multipart(&self) -> Result<Multipart, ChannelError> {
    let head = Multipart::new().pack(&self.kind().tag())?;

    Ok(match self {
      Self::Heartbeat | Self::Terminate | Self::Choke => head,
      Self::Invoke { event, payload } => head.pack(event.as_str())?.raw(payload.clone()),
      Self::Chunk { payload } => head.raw(payload.clone()),
      Self::Error { code, message } => head.pack(code)?.pack(message.as_str())?,
    })
  }

  pub fn from_multipart(message: &Multipart) -> Result<Self, ChannelError> {
    let tag: u32 = message.unpack(0)?;
    let kind = Kind::from_tag(tag).ok_or_else(|| ChannelError::CorruptPayload(format!("unknown message kind {tag}")))?;

    let expect = |frames: usize| {
      if message.len() == frames {
        Ok(())
      } else {
        Err(ChannelError::CorruptPayload(format!(
          "{kind} expects {frames} frames, got {}",
          message.len()
        )))
      }
    };

    match kind {
      Kind::Heartbeat => expect(1).map(|_| Self::Heartbeat),
      Kind::Terminate => expect(1).map(|_| Self::Terminate),
      Kind::Choke => expect(1).map(|_| Self::Choke),
      Kind::Invoke => {
        expect(3)?;
        Ok(Self::Invoke {
          event: message.unpack(1)?,
          payload: message.raw_at(2)?,
        })
      }
      Kind::Chunk => {
        expect(2)?;
        Ok(Self::Chunk {
          payload: message.raw_at(1)?,
        })
      }
      Kind::Error => {
        expect(3)?;
        Ok(Self::Error {
          code: message.unpack(1)?,
          message: message.unpack(2)?,
        })
      }
    }
  }
}
