//! Control-plane and publication wire types.
//!
//! # Control
//!
//! One JSON object per line in both directions. Requests carry an
//! `"action"`, an optional `"id"` echoed on the reply and optional
//! `"credentials"`:
//!
//! ```text
//! {"id": 1, "action": "push", "engine": "echo", "method": "run", "args": {}}
//! {"id": 1, "ticket": "...", "driver": "echo/run", "result": {...}}
//! {"id": 2, "action": "past", "driver_id": "nope"}
//! {"id": 2, "error": "NoHistory", "message": "No history for driver nope"}
//! ```
//!
//! # Publication
//!
//! Every result is published as a two-frame message: the bincode-packed
//! driver id followed by the raw JSON result.

use std::{collections::BTreeMap, net::SocketAddr};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use uuid::Uuid;

use crate::{
  core::history::HistoryEntry,
  engine::EngineError,
  routing::RoutingError,
  rpc::{ChannelError, Multipart},
};

// ============================================================================
// Requests
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
  pub username: String,
  pub signature: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Action {
  Push {
    engine: String,
    method: String,
    #[serde(default = "empty_args")]
    args: Value,
  },
  Drop {
    engine: String,
  },
  Past {
    driver_id: String,
  },
  Stats,
  List,
  Route {
    group: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    key: Option<String>,
  },
}

fn empty_args() -> Value {
  Value::Object(Map::new())
}

impl Action {
  pub const NAMES: [&'static str; 6] = ["push", "drop", "past", "stats", "list", "route"];

  pub fn name(&self) -> &'static str {
    match self {
      Action::Push { .. } => "push",
      Action::Drop { .. } => "drop",
      Action::Past { .. } => "past",
      Action::Stats => "stats",
      Action::List => "list",
      Action::Route { .. } => "route",
    }
  }
}

#[serde_with::skip_serializing_none]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
  pub id: Option<Value>,
  pub credentials: Option<Credentials>,
  #[serde(flatten)]
  pub action: Action,
}

impl Request {
  pub fn new(action: Action) -> Self {
    Self {
      id: None,
      credentials: None,
      action,
    }
  }

  pub fn with_id(mut self, id: impl Into<Value>) -> Self {
    self.id = Some(id.into());
    self
  }

  /// Decode one control line.
  ///
  /// A rejected line still yields the request id when one could be read,
  /// so the error reply can be correlated.
  pub fn parse(line: &str) -> Result<Self, Rejection> {
    let value: Value = serde_json::from_str(line).map_err(|e| Rejection {
      id: None,
      error: ControlError::InvalidRequest(e.to_string()),
    })?;

    let Some(object) = value.as_object() else {
      return Err(Rejection {
        id: None,
        error: ControlError::InvalidRequest("request must be a JSON object".to_string()),
      });
    };

    let id = object.get("id").cloned();
    let reject = |error| Rejection { id: id.clone(), error };

    let action = match object.get("action") {
      Some(Value::String(action)) => action,
      Some(_) => return Err(reject(ControlError::InvalidRequest("action must be a string".to_string()))),
      None => return Err(reject(ControlError::InvalidRequest("missing action".to_string()))),
    };

    if !Action::NAMES.contains(&action.as_str()) {
      return Err(reject(ControlError::UnknownCommand(action.clone())));
    }

    serde_json::from_value(value.clone()).map_err(|e| reject(ControlError::InvalidRequest(e.to_string())))
  }
}

/// A control line that could not be turned into a [`Request`].
#[derive(Debug, Clone, PartialEq)]
pub struct Rejection {
  pub id: Option<Value>,
  pub error: ControlError,
}

// ============================================================================
// Errors
// ============================================================================

/// Every failure a control request can end with. Sent back as a reply,
/// never as a dropped connection.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ControlError {
  #[error("Invalid request: {0}")]
  InvalidRequest(String),
  #[error("Unknown command: {0}")]
  UnknownCommand(String),
  #[error("Unknown engine: {0}")]
  UnknownEngine(String),
  #[error("No history for driver {0}")]
  NoHistory(String),
  #[error("Unable to start engine: {0}")]
  BindFailure(String),
  #[error("Engine stopped: {0}")]
  EngineStopped(String),
  #[error(transparent)]
  Routing(#[from] RoutingError),
  #[error("Unauthorized: {0}")]
  Unauthorized(String),
  #[error("The daemon is shutting down")]
  Shutdown,
  #[error("Internal error: {0}")]
  Internal(String),
}

impl ControlError {
  /// Stable name used in the `"error"` field of replies.
  pub fn kind(&self) -> &'static str {
    match self {
      ControlError::InvalidRequest(_) => "InvalidRequest",
      ControlError::UnknownCommand(_) => "UnknownCommand",
      ControlError::UnknownEngine(_) => "UnknownEngine",
      ControlError::NoHistory(_) => "NoHistory",
      ControlError::BindFailure(_) => "BindFailure",
      ControlError::EngineStopped(_) => "EngineStopped",
      ControlError::Routing(RoutingError::UnknownGroup(_)) => "UnknownGroup",
      ControlError::Routing(RoutingError::NoBackendsAvailable) => "NoBackendsAvailable",
      ControlError::Unauthorized(_) => "Unauthorized",
      ControlError::Shutdown => "Shutdown",
      ControlError::Internal(_) => "Internal",
    }
  }
}

impl From<EngineError> for ControlError {
  fn from(err: EngineError) -> Self {
    match err {
      EngineError::Stopped(name) => ControlError::EngineStopped(name),
      EngineError::Bind(e) => ControlError::BindFailure(e.to_string()),
    }
  }
}

// ============================================================================
// Replies
// ============================================================================

/// Build the reply line for a request outcome.
pub fn render_reply(id: Option<&Value>, result: Result<Value, ControlError>) -> Value {
  let mut body = match result {
    Ok(Value::Object(map)) => map,
    Ok(other) => {
      let mut map = Map::new();
      map.insert("result".to_string(), other);
      map
    }
    Err(e) => {
      let mut map = Map::new();
      map.insert("error".to_string(), json!(e.kind()));
      map.insert("message".to_string(), json!(e.to_string()));
      map
    }
  };

  if let Some(id) = id {
    body.insert("id".to_string(), id.clone());
  }

  Value::Object(body)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PushReply {
  pub ticket: Uuid,
  pub driver: String,
  pub result: Value,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DropReply {
  pub ok: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PastReply {
  pub entries: Vec<HistoryEntry>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatsReply {
  /// Running engines
  pub engines: Vec<String>,
  pub queue_depths: BTreeMap<String, usize>,
  pub workers: BTreeMap<String, usize>,
  pub pending_jobs: usize,
  pub histories: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListReply {
  /// Configured engines
  pub engines: Vec<String>,
  /// Running engines and the endpoints their workers connect to
  pub running: BTreeMap<String, Vec<SocketAddr>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteReply {
  pub backend: String,
}

// ============================================================================
// Publication
// ============================================================================

/// A result recorded for a driver.
#[derive(Debug, Clone, PartialEq)]
pub struct Publication {
  pub driver: String,
  pub result: Value,
}

impl Publication {
  pub fn to_multipart(&self) -> Result<Multipart, ChannelError> {
    let body = serde_json::to_vec(&self.result).map_err(|e| ChannelError::Encode(e.to_string()))?;
    Ok(Multipart::new().pack(self.driver.as_str())?.raw(body))
  }

  pub fn from_multipart(message: &Multipart) -> Result<Self, ChannelError> {
    if message.len() != 2 {
      return Err(ChannelError::CorruptPayload(format!(
        "publication expects 2 frames, got {}",
        message.len()
      )));
    }

    let driver: String = message.unpack(0)?;
    let body = message.raw_at(1)?;
    let result = serde_json::from_slice(&body).map_err(|e| ChannelError::CorruptPayload(e.to_string()))?;
    Ok(Self { driver, result })
  }
}
