//! Jobs: one invocation of a driver's method on an engine.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde_json::{Value, json};
use tracing::debug;
use uuid::Uuid;

use crate::engine::{EngineError, EngineHandle, JobRequest, Ticket};

/// Result published when a worker's answer is not valid JSON.
pub const UNPARSABLE_RESULT: &str = "unable to parse the json";

/// `"{engine}/{method}"`
pub fn driver_id(engine: &str, method: &str) -> String {
  format!("{engine}/{method}")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
  Created,
  Enqueued,
  Completed,
  Aborted,
}

#[derive(Debug, Clone)]
pub struct Job {
  ticket: Ticket,
  engine: String,
  method: String,
  driver: String,
  args: Value,
  created: DateTime<Utc>,
  state: JobState,
}

impl Job {
  pub fn new(engine: &str, method: &str, args: Value) -> Self {
    Self {
      ticket: Uuid::new_v4(),
      engine: engine.to_string(),
      method: method.to_string(),
      driver: driver_id(engine, method),
      args,
      created: Utc::now(),
      state: JobState::Created,
    }
  }

  pub fn ticket(&self) -> Ticket {
    self.ticket
  }

  pub fn engine(&self) -> &str {
    &self.engine
  }

  pub fn method(&self) -> &str {
    &self.method
  }

  pub fn driver(&self) -> &str {
    &self.driver
  }

  pub fn created(&self) -> DateTime<Utc> {
    self.created
  }

  pub fn state(&self) -> JobState {
    self.state
  }

  /// Send the job to `engine` as an invocation of its method.
  pub fn enqueue(&mut self, engine: &EngineHandle) -> Result<(), EngineError> {
    engine.enqueue(JobRequest {
      ticket: self.ticket,
      method: self.method.clone(),
      payload: Bytes::from(self.args.to_string()),
    })?;

    self.state = JobState::Enqueued;
    debug!(ticket = %self.ticket, driver = %self.driver, "Job enqueued");
    Ok(())
  }

  /// Complete the job with the worker's answer.
  ///
  /// The answer must be a JSON document; anything else turns into an error
  /// result instead of being dropped.
  pub fn respond(&mut self, chunk: &[u8]) -> Value {
    self.state = JobState::Completed;

    match serde_json::from_slice(chunk) {
      Ok(value) => value,
      Err(e) => {
        debug!(ticket = %self.ticket, driver = %self.driver, error = %e, "Worker answer is not JSON");
        json!({ "error": UNPARSABLE_RESULT })
      }
    }
  }

  /// Abort the job. Always produces an error result.
  pub fn abort(&mut self, code: i32, message: &str) -> Value {
    self.state = JobState::Aborted;
    json!({ "error": message, "code": code })
  }
}
