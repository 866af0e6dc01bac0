//! Control-plane protocol and clients.

pub mod client;
pub mod protocol;

pub use client::{ControlClient, Subscriber};
pub use protocol::*;

#[derive(Debug, Clone, thiserror::Error)]
pub enum IpcError {
  #[error("Ser/de error: {0}")]
  Serde(String),
  #[error("{kind}: {message}")]
  Remote { kind: String, message: String },
  #[error("IO error: {0}")]
  Io(String),
  #[error("Server shutdown")]
  Shutdown,
  #[error("Connection error: {0}")]
  Connection(String),
  #[error("Codec error: {0}")]
  Codec(String),
}

impl From<serde_json::Error> for IpcError {
  fn from(err: serde_json::Error) -> Self {
    IpcError::Serde(err.to_string())
  }
}

impl From<std::io::Error> for IpcError {
  fn from(err: std::io::Error) -> Self {
    IpcError::Io(err.to_string())
  }
}

impl From<tokio_util::codec::LinesCodecError> for IpcError {
  fn from(err: tokio_util::codec::LinesCodecError) -> Self {
    IpcError::Codec(err.to_string())
  }
}
