//! Engine-side view of one attached worker.

use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};
use tokio::sync::mpsc;

use super::message::{JobRequest, Ticket};
use crate::{io::SessionId, rpc::RpcCommand};

/// A job running on a worker, with the chunks received so far.
#[derive(Debug)]
pub struct Assignment {
  pub ticket: Ticket,
  pub method: String,
  body: BytesMut,
}

#[derive(Debug)]
pub struct Worker {
  session: SessionId,
  outbound: mpsc::UnboundedSender<RpcCommand>,
  job: Option<Assignment>,
  last_seen: Instant,
}

impl Worker {
  pub fn new(session: SessionId, outbound: mpsc::UnboundedSender<RpcCommand>) -> Self {
    Self {
      session,
      outbound,
      job: None,
      last_seen: Instant::now(),
    }
  }

  pub fn session(&self) -> SessionId {
    self.session
  }

  pub fn is_idle(&self) -> bool {
    self.job.is_none()
  }

  pub fn job(&self) -> Option<&Assignment> {
    self.job.as_ref()
  }

  /// Queue a command for the session. `false` once the session is gone.
  pub fn send(&self, command: RpcCommand) -> bool {
    self.outbound.send(command).is_ok()
  }

  pub fn touch(&mut self) {
    self.last_seen = Instant::now();
  }

  pub fn is_expired(&self, now: Instant, timeout: Duration) -> bool {
    now.saturating_duration_since(self.last_seen) > timeout
  }

  /// Send `job` to the worker. Gives the job back when the session is gone.
  pub fn assign(&mut self, job: JobRequest) -> Result<(), JobRequest> {
    let command = RpcCommand::invoke(job.method.clone(), job.payload.clone());
    if !self.send(command) {
      return Err(job);
    }

    self.job = Some(Assignment {
      ticket: job.ticket,
      method: job.method,
      body: BytesMut::new(),
    });
    Ok(())
  }

  /// Append a chunk to the running job. `false` when idle.
  pub fn push_chunk(&mut self, payload: &[u8]) -> bool {
    match self.job.as_mut() {
      Some(assignment) => {
        assignment.body.extend_from_slice(payload);
        true
      }
      None => false,
    }
  }

  /// End the running job, returning its ticket and collected body.
  pub fn finish(&mut self) -> Option<(Ticket, Bytes)> {
    self
      .job
      .take()
      .map(|assignment| (assignment.ticket, assignment.body.freeze()))
  }
}
