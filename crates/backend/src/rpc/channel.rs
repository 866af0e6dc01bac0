//! A framed, typed channel over any async byte stream.

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use serde::{Serialize, de::DeserializeOwned};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::Framed;
use tracing::{trace, warn};

use super::{ChannelError, Frame, FrameCodec, FromMultipart, Multipart, RpcCommand, pack, unpack};

/// Typed send/receive on top of [`FrameCodec`].
///
/// Sends make exactly one attempt and report failure as `false` after
/// logging it; the caller decides whether to retry. Receives return
/// [`ChannelError::CorruptPayload`] for undecodable frames without closing
/// the underlying stream.
///
/// `recv_multi` (and everything built on it) is cancel safe: frames of a
/// partially received multipart message are kept in the channel and picked
/// up by the next call.
pub struct Channel<S> {
  framed: Framed<S, FrameCodec>,
  partial: Multipart,
}

impl<S> Channel<S>
where
  S: AsyncRead + AsyncWrite + Unpin,
{
  pub fn new(stream: S) -> Self {
    Self::with_codec(stream, FrameCodec::new())
  }

  pub fn with_codec(stream: S, codec: FrameCodec) -> Self {
    Self {
      framed: Framed::new(stream, codec),
      partial: Multipart::new(),
    }
  }

  pub fn get_ref(&self) -> &S {
    self.framed.get_ref()
  }

  /// Pack `value` and send it as a single frame.
  pub async fn send<T: Serialize + ?Sized>(&mut self, value: &T, more: bool) -> bool {
    match pack(value) {
      Ok(bytes) => self.send_raw(bytes, more).await,
      Err(e) => {
        warn!(error = %e, "Unable to pack a frame");
        false
      }
    }
  }

  /// Send already serialized bytes verbatim.
  pub async fn send_raw(&mut self, bytes: impl Into<Bytes>, more: bool) -> bool {
    match self.framed.send(Frame::new(bytes, more)).await {
      Ok(()) => true,
      Err(e) => {
        warn!(error = %e, "Unable to send a frame");
        false
      }
    }
  }

  /// Send every part of `message`, flushing once at the end.
  ///
  /// An empty message trivially succeeds.
  pub async fn send_multi(&mut self, message: Multipart) -> bool {
    if message.is_empty() {
      return true;
    }

    for frame in message.into_frames() {
      if let Err(e) = self.framed.feed(frame).await {
        warn!(error = %e, "Unable to send a multipart message");
        return false;
      }
    }

    match self.framed.flush().await {
      Ok(()) => true,
      Err(e) => {
        warn!(error = %e, "Unable to flush a multipart message");
        false
      }
    }
  }

  pub async fn send_command(&mut self, command: &RpcCommand) -> bool {
    trace!(kind = %command.kind(), "Sending command");
    match command.to_multipart() {
      Ok(message) => self.send_multi(message).await,
      Err(e) => {
        warn!(kind = %command.kind(), error = %e, "Unable to encode a command");
        false
      }
    }
  }

  /// Wait for the next frame.
  pub async fn recv_raw(&mut self) -> Result<Frame, ChannelError> {
    match self.framed.next().await {
      Some(Ok(frame)) => Ok(frame),
      Some(Err(e)) => {
        self.partial = Multipart::new();
        Err(e.into())
      }
      None => Err(ChannelError::Closed),
    }
  }

  /// Wait for the next frame and decode it.
  pub async fn recv<T: DeserializeOwned>(&mut self) -> Result<T, ChannelError> {
    let frame = self.recv_raw().await?;
    unpack(&frame.payload).inspect_err(|e| warn!(error = %e, "Corrupted object"))
  }

  /// Receive frames until one arrives without the more flag.
  pub async fn recv_multi(&mut self) -> Result<Multipart, ChannelError> {
    loop {
      let frame = self.recv_raw().await?;
      self.partial.push_raw(frame.payload);
      if !frame.more {
        return Ok(std::mem::take(&mut self.partial));
      }
    }
  }

  /// Receive a multipart message and decode every part of it.
  pub async fn recv_tuple<T: FromMultipart>(&mut self) -> Result<T, ChannelError> {
    let message = self.recv_multi().await?;
    T::from_multipart(&message).inspect_err(|e| warn!(error = %e, "Corrupted multipart message"))
  }

  pub async fn recv_command(&mut self) -> Result<RpcCommand, ChannelError> {
    let message = self.recv_multi().await?;
    RpcCommand::from_multipart(&message).inspect_err(|e| warn!(error = %e, "Corrupted command"))
  }
}

#[cfg(test)]
mod tests {
  use tokio::io::duplex;

  use super::*;

  #[tokio::test]
  async fn test_command_round_trip_over_stream() {
    let (a, b) = duplex(1024);
    let mut left = Channel::new(a);
    let mut right = Channel::new(b);

    assert!(left.send_command(&RpcCommand::invoke("run", &b"payload"[..])).await);
    assert!(left.send_command(&RpcCommand::Choke).await);

    assert_eq!(
      right.recv_command().await.unwrap(),
      RpcCommand::invoke("run", &b"payload"[..])
    );
    assert_eq!(right.recv_command().await.unwrap(), RpcCommand::Choke);
  }

  #[tokio::test]
  async fn test_send_and_recv_single_values() {
    let (a, b) = duplex(1024);
    let mut left = Channel::new(a);
    let mut right = Channel::new(b);

    assert!(left.send(&42u64, false).await);
    assert!(left.send_raw(&b"raw"[..], false).await);

    assert_eq!(right.recv::<u64>().await.unwrap(), 42);
    assert_eq!(right.recv_raw().await.unwrap().payload.as_ref(), b"raw");
  }

  #[tokio::test]
  async fn test_empty_multipart_sends_nothing() {
    let (a, b) = duplex(1024);
    let mut left = Channel::new(a);
    let mut right = Channel::new(b);

    assert!(left.send_multi(Multipart::new()).await);
    assert!(left.send(&1u8, false).await);
    assert_eq!(right.recv::<u8>().await.unwrap(), 1);
  }

  #[tokio::test]
  async fn test_corrupt_frame_keeps_channel_usable() {
    let (a, b) = duplex(1024);
    let mut left = Channel::new(a);
    let mut right = Channel::new(b);

    assert!(left.send_raw(&b"\x01"[..], false).await);
    assert!(left.send(&"after", false).await);

    assert!(matches!(right.recv::<String>().await, Err(ChannelError::CorruptPayload(_))));
    assert_eq!(right.recv::<String>().await.unwrap(), "after");
  }

  #[tokio::test]
  async fn test_recv_tuple() {
    let (a, b) = duplex(1024);
    let mut left = Channel::new(a);
    let mut right = Channel::new(b);

    let message = Multipart::new().pack("driver").unwrap().pack(&5u32).unwrap();
    assert!(left.send_multi(message).await);

    let (driver, count): (String, u32) = right.recv_tuple().await.unwrap();
    assert_eq!(driver, "driver");
    assert_eq!(count, 5);
  }

  #[tokio::test]
  async fn test_recv_after_peer_closed() {
    let (a, b) = duplex(1024);
    drop(a);
    let mut right = Channel::new(b);

    assert_eq!(right.recv_raw().await.unwrap_err(), ChannelError::Closed);
  }

  #[tokio::test]
  async fn test_send_to_closed_peer_reports_failure() {
    let (a, b) = duplex(16);
    drop(b);
    let mut left = Channel::new(a);

    assert!(!left.send_command(&RpcCommand::Heartbeat).await);
  }
}
