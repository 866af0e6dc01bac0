//! Worker process supervision interface.

use std::net::SocketAddr;

use tracing::debug;

/// Starts and stops worker processes for engines.
///
/// Engines never wait on a supervisor: a spawned worker simply shows up
/// later as a new session on one of `endpoints`.
pub trait Supervisor: Send + Sync {
  /// A job is waiting and no worker of `engine` is idle.
  fn spawn(&self, engine: &str, endpoints: &[SocketAddr]);

  /// `engine` is going away; its workers have been asked to terminate.
  fn terminate(&self, engine: &str);
}

/// Leaves worker processes to be managed externally.
#[derive(Debug, Default, Clone, Copy)]
pub struct ExternalSupervisor;

impl Supervisor for ExternalSupervisor {
  fn spawn(&self, engine: &str, endpoints: &[SocketAddr]) {
    debug!(engine, endpoints = ?endpoints, "Waiting for an external worker");
  }

  fn terminate(&self, engine: &str) {
    debug!(engine, "Engine workers released");
  }
}
