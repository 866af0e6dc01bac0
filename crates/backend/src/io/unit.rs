//! Sessions: the point where accepted connections enter the engine runtime.

use std::sync::{
  Arc,
  atomic::{AtomicU64, Ordering},
};

use tokio::{net::TcpStream, runtime::Handle, sync::mpsc};
use tracing::{debug, trace, warn};

use crate::rpc::{Channel, ChannelError, RpcCommand};

/// Identifies one attached connection for its whole lifetime.
pub type SessionId = u64;

/// Receives the commands of attached sessions.
///
/// `connect` is called once per session before any `dispatch`, and
/// `disconnect` exactly once after the last one. Commands pushed into the
/// receiver returned by `connect` are written back to the peer; dropping its
/// sender closes the session.
pub trait Dispatch: Send + Sync {
  fn name(&self) -> &str;
  fn connect(&self, session: SessionId) -> mpsc::UnboundedReceiver<RpcCommand>;
  fn dispatch(&self, session: SessionId, command: RpcCommand);
  fn disconnect(&self, session: SessionId);
}

/// Takes ownership of a freshly accepted connection.
pub trait Attach: Send + Sync {
  fn attach(&self, stream: std::net::TcpStream, prototype: Arc<dyn Dispatch>);
}

/// Runs sessions on the runtime it was created on.
#[derive(Debug)]
pub struct ExecutionUnit {
  handle: Handle,
  next_session: AtomicU64,
}

impl ExecutionUnit {
  pub fn new(handle: Handle) -> Self {
    Self {
      handle,
      next_session: AtomicU64::new(1),
    }
  }

  /// Unit bound to the runtime of the caller.
  ///
  /// Panics outside of a Tokio runtime.
  pub fn current() -> Self {
    Self::new(Handle::current())
  }
}

impl Attach for ExecutionUnit {
  fn attach(&self, stream: std::net::TcpStream, prototype: Arc<dyn Dispatch>) {
    let session = self.next_session.fetch_add(1, Ordering::Relaxed);
    self.handle.spawn(run_session(stream, prototype, session));
  }
}

async fn run_session(stream: std::net::TcpStream, prototype: Arc<dyn Dispatch>, session: SessionId) {
  let peer = stream.peer_addr().ok();

  // The stream was accepted by another runtime; register it with this one.
  let stream = match TcpStream::from_std(stream) {
    Ok(stream) => stream,
    Err(e) => {
      warn!(service = prototype.name(), session, error = %e, "Unable to attach connection");
      return;
    }
  };

  let mut outbound = prototype.connect(session);
  let mut channel = Channel::new(stream);
  debug!(service = prototype.name(), session, peer = ?peer, "Session attached");

  loop {
    tokio::select! {
      command = outbound.recv() => match command {
        Some(command) => {
          let last = matches!(command, RpcCommand::Terminate);
          if !channel.send_command(&command).await || last {
            break;
          }
        }
        None => {
          trace!(service = prototype.name(), session, "Session released by dispatcher");
          break;
        }
      },

      inbound = channel.recv_command() => match inbound {
        Ok(command) => prototype.dispatch(session, command),
        Err(ChannelError::CorruptPayload(_)) => continue,
        Err(e) => {
          debug!(service = prototype.name(), session, error = %e, "Session closed");
          break;
        }
      },
    }
  }

  prototype.disconnect(session);
}
