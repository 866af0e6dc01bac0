//! Control and publication sockets.
//!
//! # Control
//!
//! Newline-delimited JSON over TCP, answered by the core. Requests on one
//! connection run concurrently and replies are written as they finish, so
//! a push waiting on a worker does not block a `stats` sent after it.
//! Clients correlate replies through the request `"id"`.
//!
//! # Publication
//!
//! Every subscriber receives every recorded result as a multipart message
//! (see [`Publication`]). Subscribers that fall behind lose the oldest
//! publications rather than slowing the core down.

use std::{io, net::SocketAddr};

use bytes::BytesMut;
use futures::{SinkExt, StreamExt, stream::FuturesUnordered};
use tokio::{
  net::{TcpListener, TcpStream},
  sync::broadcast::{self, error::RecvError},
};
use tokio_util::{
  codec::{Decoder, Encoder, Framed, LinesCodec, LinesCodecError},
  sync::CancellationToken,
};
use tracing::{debug, error, info, trace, warn};

use crate::{
  core::CoreHandle,
  ipc::{ControlError, IpcError, Publication, render_reply},
  rpc::Channel,
};

/// Longest accepted control line
const MAX_LINE: usize = 1 << 20;

// ============================================================================
// Server
// ============================================================================

/// Both sockets, bound and ready to accept.
pub struct Server {
  control: TcpListener,
  publish: TcpListener,
  core: CoreHandle,
}

impl Server {
  pub async fn bind(control: &str, publish: &str, core: CoreHandle) -> Result<Self, IpcError> {
    let control = TcpListener::bind(control)
      .await
      .map_err(|e| IpcError::Connection(format!("control socket {control}: {e}")))?;
    let publish = TcpListener::bind(publish)
      .await
      .map_err(|e| IpcError::Connection(format!("publish socket {publish}: {e}")))?;

    Ok(Self { control, publish, core })
  }

  pub fn control_addr(&self) -> Result<SocketAddr, IpcError> {
    Ok(self.control.local_addr()?)
  }

  pub fn publish_addr(&self) -> Result<SocketAddr, IpcError> {
    Ok(self.publish.local_addr()?)
  }

  /// Accept connections until cancelled.
  pub async fn run(self, cancel: CancellationToken) -> Result<(), IpcError> {
    info!(
      control = ?self.control.local_addr().ok(),
      publish = ?self.publish.local_addr().ok(),
      "Server listening"
    );

    loop {
      tokio::select! {
        biased;

        _ = cancel.cancelled() => {
          info!("Server shutting down (cancelled)");
          break;
        }

        result = self.control.accept() => match result {
          Ok((stream, peer)) => {
            debug!(%peer, "Control client connected");
            let core = self.core.clone();
            let cancel = cancel.child_token();
            tokio::spawn(async move {
              if let Err(e) = handle_control(stream, core, cancel).await {
                debug!(%peer, error = %e, "Control connection ended with an error");
              }
            });
          }
          Err(e) => error!("Accept error: {}", e),
        },

        result = self.publish.accept() => match result {
          Ok((stream, peer)) => {
            debug!(%peer, "Subscriber connected");
            tokio::spawn(handle_subscriber(stream, self.core.subscribe(), cancel.child_token()));
          }
          Err(e) => error!("Accept error: {}", e),
        },
      }
    }

    Ok(())
  }
}

// ============================================================================
// Control Codec
// ============================================================================

/// [`LinesCodec`] that yields unreadable lines as rejections instead of
/// failing the stream, so the lines after them are still read.
struct ControlCodec {
  lines: LinesCodec,
}

impl ControlCodec {
  fn new() -> Self {
    Self {
      lines: LinesCodec::new_with_max_length(MAX_LINE),
    }
  }
}

fn recover_line(
  decoded: Result<Option<String>, LinesCodecError>,
) -> Result<Option<Result<String, ControlError>>, LinesCodecError> {
  match decoded {
    Ok(line) => Ok(line.map(Ok)),
    // The codec skips the rest of the line on its own
    Err(LinesCodecError::MaxLineLengthExceeded) => Ok(Some(Err(ControlError::InvalidRequest(format!(
      "line longer than {MAX_LINE} bytes"
    ))))),
    Err(LinesCodecError::Io(e)) if e.kind() == io::ErrorKind::InvalidData => Ok(Some(Err(
      ControlError::InvalidRequest("line is not valid UTF-8".to_string()),
    ))),
    Err(e) => Err(e),
  }
}

impl Decoder for ControlCodec {
  type Item = Result<String, ControlError>;
  type Error = LinesCodecError;

  fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
    recover_line(self.lines.decode(buf))
  }

  fn decode_eof(&mut self, buf: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
    recover_line(self.lines.decode_eof(buf))
  }
}

impl Encoder<String> for ControlCodec {
  type Error = LinesCodecError;

  fn encode(&mut self, line: String, buf: &mut BytesMut) -> Result<(), Self::Error> {
    self.lines.encode(line, buf)
  }
}

// ============================================================================
// Connection Handlers
// ============================================================================

/// Serve one control connection.
///
/// Every line gets exactly one reply, unreadable ones included. Reading
/// stops at EOF but the connection stays open until every request read so
/// far has been answered.
async fn handle_control(stream: TcpStream, core: CoreHandle, cancel: CancellationToken) -> Result<(), IpcError> {
  let framed = Framed::new(stream, ControlCodec::new());
  let (mut sink, mut lines) = framed.split();
  let mut inflight = FuturesUnordered::new();
  let mut reading = true;
  let mut handled = 0u64;

  loop {
    if !reading && inflight.is_empty() {
      break;
    }

    tokio::select! {
      biased;

      _ = cancel.cancelled() => break,

      Some(reply) = inflight.next(), if !inflight.is_empty() => {
        sink.send(serde_json::to_string(&reply)?).await?;
        handled += 1;
      }

      line = lines.next(), if reading => match line {
        Some(Ok(decoded)) => {
          let decoded = decoded.map(|line| line.trim().to_string());
          match &decoded {
            Ok(line) if line.is_empty() => continue,
            Ok(line) => trace!(line = %line, "Control request"),
            Err(e) => debug!(error = %e, "Unreadable control line"),
          }
          let core = core.clone();
          inflight.push(async move {
            match decoded {
              Ok(line) => core.handle_line(&line).await,
              Err(rejection) => render_reply(None, Err(rejection)),
            }
          });
        }
        Some(Err(e)) => {
          warn!(error = %e, "Error reading from control client");
          reading = false;
        }
        None => reading = false,
      },
    }
  }

  debug!(requests_handled = handled, "Control client disconnected");
  Ok(())
}

async fn handle_subscriber(
  stream: TcpStream,
  mut publications: broadcast::Receiver<Publication>,
  cancel: CancellationToken,
) {
  let mut channel = Channel::new(stream);

  loop {
    let publication = tokio::select! {
      biased;

      _ = cancel.cancelled() => break,

      received = publications.recv() => match received {
        Ok(publication) => publication,
        Err(RecvError::Lagged(skipped)) => {
          warn!(skipped, "Subscriber is lagging, publications dropped");
          continue;
        }
        Err(RecvError::Closed) => break,
      },
    };

    let message = match publication.to_multipart() {
      Ok(message) => message,
      Err(e) => {
        warn!(driver = %publication.driver, error = %e, "Unable to encode publication");
        continue;
      }
    };

    if !channel.send_multi(message).await {
      break;
    }
  }

  debug!("Subscriber disconnected");
}
