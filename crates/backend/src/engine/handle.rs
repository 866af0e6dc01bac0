//! Engine handles and the session-facing dispatcher.

use std::{
  net::SocketAddr,
  sync::{
    Arc,
    atomic::{AtomicUsize, Ordering},
  },
};

use tokio::sync::mpsc;
use tracing::trace;

use super::{
  EngineError,
  message::{EngineMessage, JobRequest},
};
use crate::{
  io::{Dispatch, SessionId},
  rpc::RpcCommand,
};

// ============================================================================
// Engine Stats
// ============================================================================

/// Counters published by the engine task after every message.
#[derive(Debug, Default)]
pub struct EngineStats {
  queued: AtomicUsize,
  busy: AtomicUsize,
  workers: AtomicUsize,
}

impl EngineStats {
  pub(super) fn store(&self, queued: usize, busy: usize, workers: usize) {
    self.queued.store(queued, Ordering::Relaxed);
    self.busy.store(busy, Ordering::Relaxed);
    self.workers.store(workers, Ordering::Relaxed);
  }
}

// ============================================================================
// Engine Handle
// ============================================================================

/// Handle to a running engine.
///
/// Cheap to clone. Sending never blocks: the engine queue is unbounded and
/// the engine applies its own `queue_limit` to jobs.
#[derive(Clone, Debug)]
pub struct EngineHandle {
  name: Arc<str>,
  tx: mpsc::UnboundedSender<EngineMessage>,
  stats: Arc<EngineStats>,
  endpoints: Arc<[SocketAddr]>,
}

impl EngineHandle {
  pub(super) fn new(
    name: &str,
    tx: mpsc::UnboundedSender<EngineMessage>,
    stats: Arc<EngineStats>,
    endpoints: Vec<SocketAddr>,
  ) -> Self {
    Self {
      name: Arc::from(name),
      tx,
      stats,
      endpoints: Arc::from(endpoints),
    }
  }

  pub fn name(&self) -> &str {
    &self.name
  }

  pub fn enqueue(&self, job: JobRequest) -> Result<(), EngineError> {
    self
      .tx
      .send(EngineMessage::Enqueue(job))
      .map_err(|_| EngineError::Stopped(self.name.to_string()))
  }

  /// Ask the engine to stop. Returns immediately.
  pub fn shutdown(&self) {
    let _ = self.tx.send(EngineMessage::Shutdown);
  }

  pub fn is_stopped(&self) -> bool {
    self.tx.is_closed()
  }

  /// Jobs waiting for a worker
  pub fn queue_depth(&self) -> usize {
    self.stats.queued.load(Ordering::Relaxed)
  }

  /// Jobs running on a worker
  pub fn busy(&self) -> usize {
    self.stats.busy.load(Ordering::Relaxed)
  }

  pub fn workers(&self) -> usize {
    self.stats.workers.load(Ordering::Relaxed)
  }

  /// Where workers connect to
  pub fn endpoints(&self) -> &[SocketAddr] {
    &self.endpoints
  }

  /// Listener port, if the engine is listening.
  pub fn port(&self) -> Option<u16> {
    self.endpoints.first().map(SocketAddr::port)
  }
}

// ============================================================================
// Session Dispatcher
// ============================================================================

/// Forwards worker session events into the engine queue.
pub(super) struct EngineDispatch {
  name: String,
  tx: mpsc::UnboundedSender<EngineMessage>,
}

impl EngineDispatch {
  pub(super) fn new(name: &str, tx: mpsc::UnboundedSender<EngineMessage>) -> Self {
    Self {
      name: name.to_string(),
      tx,
    }
  }

  fn forward(&self, message: EngineMessage) {
    if self.tx.send(message).is_err() {
      trace!(engine = %self.name, "Engine gone, dropping session event");
    }
  }
}

impl Dispatch for EngineDispatch {
  fn name(&self) -> &str {
    &self.name
  }

  fn connect(&self, session: SessionId) -> mpsc::UnboundedReceiver<RpcCommand> {
    let (outbound, rx) = mpsc::unbounded_channel();
    // If the engine is gone the sender is dropped here and the session closes at once.
    self.forward(EngineMessage::WorkerAttached { session, outbound });
    rx
  }

  fn dispatch(&self, session: SessionId, command: RpcCommand) {
    self.forward(EngineMessage::WorkerCommand { session, command });
  }

  fn disconnect(&self, session: SessionId) {
    self.forward(EngineMessage::WorkerDetached { session });
  }
}
