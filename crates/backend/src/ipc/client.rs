use std::{
  collections::HashMap,
  sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
  },
};

use futures::{SinkExt, StreamExt};
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::{
  net::{TcpStream, ToSocketAddrs},
  sync::{mpsc, oneshot},
};
use tokio_util::codec::{Framed, LinesCodec};
use tracing::{debug, error, warn};

use super::{
  IpcError,
  protocol::{
    Action, DropReply, ListReply, PastReply, Publication, PushReply, Request, RouteReply, StatsReply,
  },
};
use crate::rpc::{Channel, ChannelError};

type FramedStream = Framed<TcpStream, LinesCodec>;

struct OutboundRequest {
  request: Request,
  response_tx: oneshot::Sender<Result<Value, IpcError>>,
}

// ============================================================================
// Control Client
// ============================================================================

/// Client for the control socket.
///
/// Requests are multiplexed over one connection and matched to replies by
/// id, so a slow `push` does not hold up other requests.
#[derive(Clone)]
pub struct ControlClient {
  request_tx: mpsc::Sender<OutboundRequest>,
  counter: Arc<AtomicU64>,
}

impl ControlClient {
  pub async fn connect(addr: impl ToSocketAddrs) -> Result<Self, IpcError> {
    let stream = TcpStream::connect(addr)
      .await
      .map_err(|e| IpcError::Connection(e.to_string()))?;
    let framed = Framed::new(stream, LinesCodec::new());
    let (sink, read_stream) = framed.split();

    let (request_tx, request_rx) = mpsc::channel(64);
    tokio::spawn(Self::multiplexer(sink, read_stream, request_rx));

    Ok(Self {
      request_tx,
      counter: Arc::new(AtomicU64::new(1)),
    })
  }

  async fn multiplexer(
    mut sink: futures::stream::SplitSink<FramedStream, String>,
    mut stream: futures::stream::SplitStream<FramedStream>,
    mut request_rx: mpsc::Receiver<OutboundRequest>,
  ) {
    let mut pending: HashMap<u64, oneshot::Sender<Result<Value, IpcError>>> = HashMap::new();

    loop {
      tokio::select! {
        Some(outbound) = request_rx.recv() => {
          let Some(id) = outbound.request.id.as_ref().and_then(Value::as_u64) else {
            let _ = outbound.response_tx.send(Err(IpcError::Serde("request without a numeric id".into())));
            continue;
          };

          match serde_json::to_string(&outbound.request) {
            Ok(json) => {
              pending.insert(id, outbound.response_tx);
              if let Err(e) = sink.send(json).await {
                error!("failed to send request: {e}");
                if let Some(tx) = pending.remove(&id) {
                  let _ = tx.send(Err(IpcError::Connection(e.to_string())));
                }
              }
            }
            Err(e) => {
              let _ = outbound.response_tx.send(Err(IpcError::Serde(e.to_string())));
            }
          }
        }

        result = stream.next() => {
          match result {
            Some(Ok(line)) => match serde_json::from_str::<Value>(&line) {
              Ok(reply) => {
                let Some(id) = reply.get("id").and_then(Value::as_u64) else {
                  warn!("received reply without id: {line}");
                  continue;
                };
                match pending.remove(&id) {
                  Some(tx) => {
                    let _ = tx.send(into_result(reply));
                  }
                  None => warn!("received reply for unknown request id: {id}"),
                }
              }
              Err(e) => error!("failed to parse reply: {e}"),
            },
            Some(Err(e)) => {
              error!("connection error: {e}");
              break;
            }
            None => {
              debug!("connection closed");
              break;
            }
          }
        }
      }
    }

    for (_, tx) in pending {
      let _ = tx.send(Err(IpcError::Connection("connection closed".into())));
    }

    debug!("multiplexer exited");
  }

  /// Send an action and wait for its raw reply.
  pub async fn request(&self, action: Action) -> Result<Value, IpcError> {
    let id = self.counter.fetch_add(1, Ordering::Relaxed);
    let (response_tx, response_rx) = oneshot::channel();

    let outbound = OutboundRequest {
      request: Request::new(action).with_id(id),
      response_tx,
    };

    self.request_tx.send(outbound).await.map_err(|_| IpcError::Shutdown)?;
    response_rx.await.map_err(|_| IpcError::Shutdown)?
  }

  async fn call<T: DeserializeOwned>(&self, action: Action) -> Result<T, IpcError> {
    let reply = self.request(action).await?;
    Ok(serde_json::from_value(reply)?)
  }

  /// Run a job and wait for its result.
  pub async fn push(&self, engine: &str, method: &str, args: Value) -> Result<PushReply, IpcError> {
    self
      .call(Action::Push {
        engine: engine.to_string(),
        method: method.to_string(),
        args,
      })
      .await
  }

  pub async fn drop_engine(&self, engine: &str) -> Result<DropReply, IpcError> {
    self
      .call(Action::Drop {
        engine: engine.to_string(),
      })
      .await
  }

  pub async fn past(&self, driver_id: &str) -> Result<PastReply, IpcError> {
    self
      .call(Action::Past {
        driver_id: driver_id.to_string(),
      })
      .await
  }

  pub async fn stats(&self) -> Result<StatsReply, IpcError> {
    self.call(Action::Stats).await
  }

  pub async fn list(&self) -> Result<ListReply, IpcError> {
    self.call(Action::List).await
  }

  pub async fn route(&self, group: &str, key: Option<&str>) -> Result<RouteReply, IpcError> {
    self
      .call(Action::Route {
        group: group.to_string(),
        key: key.map(str::to_string),
      })
      .await
  }
}

/// Turn `{"error": kind, "message": ...}` replies into errors.
fn into_result(mut reply: Value) -> Result<Value, IpcError> {
  if let Some(object) = reply.as_object_mut() {
    object.remove("id");
    if let Some(Value::String(kind)) = object.get("error") {
      let message = object
        .get("message")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
      return Err(IpcError::Remote {
        kind: kind.clone(),
        message,
      });
    }
  }
  Ok(reply)
}

// ============================================================================
// Subscriber
// ============================================================================

/// Reads results from the publication socket.
pub struct Subscriber {
  channel: Channel<TcpStream>,
}

impl Subscriber {
  pub async fn connect(addr: impl ToSocketAddrs) -> Result<Self, IpcError> {
    let stream = TcpStream::connect(addr)
      .await
      .map_err(|e| IpcError::Connection(e.to_string()))?;
    Ok(Self {
      channel: Channel::new(stream),
    })
  }

  /// Wait for the next publication. Undecodable messages are skipped.
  pub async fn next(&mut self) -> Result<Publication, IpcError> {
    loop {
      let message = match self.channel.recv_multi().await {
        Ok(message) => message,
        Err(ChannelError::Closed) => return Err(IpcError::Shutdown),
        Err(ChannelError::CorruptPayload(e)) => {
          warn!(error = %e, "Skipping corrupt publication");
          continue;
        }
        Err(e) => return Err(IpcError::Connection(e.to_string())),
      };

      match Publication::from_multipart(&message) {
        Ok(publication) => return Ok(publication),
        Err(e) => warn!(error = %e, "Skipping corrupt publication"),
      }
    }
  }
}
