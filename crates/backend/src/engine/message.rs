//! Engine message types.
//!
//! The core talks to an engine through [`EngineMessage`]s and hears back
//! through [`JobOutcome`]s. Worker sessions feed the same engine queue, so
//! the engine task is the only owner of its workers and jobs.

use bytes::Bytes;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::{io::SessionId, rpc::RpcCommand};

/// Correlates a job across the core, the engine and its result.
pub type Ticket = Uuid;

/// Codes of aborts raised by the engine itself.
///
/// Codes reported by workers are passed through untouched.
pub mod codes {
  pub const QUEUE_FULL: i32 = 1;
  pub const WORKER_LOST: i32 = 2;
  pub const HEARTBEAT_TIMEOUT: i32 = 3;
  pub const ENGINE_STOPPED: i32 = 4;
}

// ============================================================================
// Core -> Engine
// ============================================================================

/// A job to run on one worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobRequest {
  pub ticket: Ticket,
  pub method: String,
  pub payload: Bytes,
}

#[derive(Debug)]
pub enum EngineMessage {
  Enqueue(JobRequest),
  /// Abort every job and ask every worker to terminate
  Shutdown,

  // Worker sessions
  WorkerAttached {
    session: SessionId,
    outbound: mpsc::UnboundedSender<RpcCommand>,
  },
  WorkerCommand {
    session: SessionId,
    command: RpcCommand,
  },
  WorkerDetached {
    session: SessionId,
  },
}

// ============================================================================
// Engine -> Core
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
  /// Concatenated chunks of a choked job
  Completed(Bytes),
  Aborted { code: i32, message: String },
}

impl Outcome {
  pub fn aborted(code: i32, message: impl Into<String>) -> Self {
    Self::Aborted {
      code,
      message: message.into(),
    }
  }
}

/// Terminal state of a job, reported exactly once per ticket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobOutcome {
  pub engine: String,
  pub ticket: Ticket,
  pub outcome: Outcome,
}
