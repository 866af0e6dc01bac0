//! Connection-accepting actor for a single service.
//!
//! # Lifecycle
//!
//! ```text
//! idle ──run()──► active ──terminate()──► idle
//! ```
//!
//! `run` takes a port from the [`PortMapper`], binds a listener and starts a
//! [`Chamber`] running the accept loop. Every accepted connection is handed
//! to [`Attach::attach`] together with the service prototype; that call is
//! the only place where a connection crosses from the chamber into the
//! runtime that serves it. `terminate` cancels the loop, stops the chamber
//! without waiting and returns the port to the mapper, so a later `run`
//! binds a fresh listener.

use std::{
  net::{IpAddr, SocketAddr, TcpListener as StdListener, ToSocketAddrs},
  sync::Arc,
};

use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{
  chamber::Chamber,
  mapper::{MapperError, PortMapper},
  unit::{Attach, Dispatch},
};
use crate::domain::config::NetworkConfig;

#[derive(Debug, thiserror::Error)]
pub enum ActorError {
  #[error("Service {0} is already active")]
  AlreadyActive(String),
  #[error("Service {0} is not active")]
  NotActive(String),
  #[error("Unable to bind {endpoint}: {message}")]
  BindFailure { endpoint: String, message: String },
  #[error(transparent)]
  Mapper(#[from] MapperError),
  #[error("Unable to start the accept runtime: {0}")]
  Chamber(#[source] std::io::Error),
}

struct Active {
  chamber: Chamber,
  cancel: CancellationToken,
  local: SocketAddr,
}

/// Accepts connections for one named service.
pub struct Actor {
  name: String,
  network: NetworkConfig,
  mapper: Arc<PortMapper>,
  unit: Arc<dyn Attach>,
  prototype: Arc<dyn Dispatch>,
  active: Option<Active>,
}

impl Actor {
  pub fn new(
    network: NetworkConfig,
    mapper: Arc<PortMapper>,
    unit: Arc<dyn Attach>,
    prototype: Arc<dyn Dispatch>,
  ) -> Self {
    Self {
      name: prototype.name().to_string(),
      network,
      mapper,
      unit,
      prototype,
      active: None,
    }
  }

  pub fn name(&self) -> &str {
    &self.name
  }

  pub fn is_active(&self) -> bool {
    self.active.is_some()
  }

  /// Bind and start accepting.
  pub fn run(&mut self) -> Result<(), ActorError> {
    if self.is_active() {
      return Err(ActorError::AlreadyActive(self.name.clone()));
    }

    let port = self.mapper.assign(&self.name)?;

    let (listener, local) = match self.bind(port) {
      Ok(bound) => bound,
      Err(e) => {
        self.mapper.retain(&self.name);
        return Err(e);
      }
    };

    let chamber = match Chamber::new(&self.name, self.network.chamber_threads) {
      Ok(chamber) => chamber,
      Err(e) => {
        self.mapper.retain(&self.name);
        return Err(ActorError::Chamber(e));
      }
    };

    let cancel = CancellationToken::new();
    chamber.spawn(accept_loop(
      listener,
      cancel.clone(),
      Arc::clone(&self.unit),
      Arc::clone(&self.prototype),
    ));

    info!(service = %self.name, address = %local, "Listening");

    self.active = Some(Active { chamber, cancel, local });
    Ok(())
  }

  fn bind(&self, port: u16) -> Result<(StdListener, SocketAddr), ActorError> {
    let ip: IpAddr = self.network.endpoint.parse().map_err(|e: std::net::AddrParseError| ActorError::BindFailure {
      endpoint: format!("{}:{port}", self.network.endpoint),
      message: e.to_string(),
    })?;

    let listener = StdListener::bind(SocketAddr::new(ip, port)).map_err(|e| self.bind_failure(port, &e))?;
    listener.set_nonblocking(true).map_err(|e| self.bind_failure(port, &e))?;
    let local = listener.local_addr().map_err(|e| self.bind_failure(port, &e))?;
    Ok((listener, local))
  }

  fn bind_failure(&self, port: u16, e: &std::io::Error) -> ActorError {
    ActorError::BindFailure {
      endpoint: format!("{}:{port}", self.network.endpoint),
      message: e.to_string(),
    }
  }

  /// Stop accepting. In-flight sessions are left alone.
  pub fn terminate(&mut self) -> Result<(), ActorError> {
    let Some(mut active) = self.active.take() else {
      return Err(ActorError::NotActive(self.name.clone()));
    };

    active.cancel.cancel();
    active.chamber.shutdown();
    self.mapper.retain(&self.name);

    info!(service = %self.name, address = %active.local, "Stopped listening");
    Ok(())
  }

  /// Addresses peers can reach this service on. Empty while idle.
  pub fn endpoints(&self) -> Vec<SocketAddr> {
    let Some(active) = &self.active else {
      return Vec::new();
    };

    if !active.local.ip().is_unspecified() {
      return vec![active.local];
    }

    match (self.network.hostname.as_str(), active.local.port()).to_socket_addrs() {
      Ok(addrs) => addrs.collect(),
      Err(e) => {
        warn!(service = %self.name, hostname = %self.network.hostname, error = %e, "Unable to resolve endpoints");
        Vec::new()
      }
    }
  }
}

impl Drop for Actor {
  fn drop(&mut self) {
    if self.is_active() {
      let _ = self.terminate();
    }
  }
}

async fn accept_loop(
  listener: StdListener,
  cancel: CancellationToken,
  unit: Arc<dyn Attach>,
  prototype: Arc<dyn Dispatch>,
) {
  let listener = match TcpListener::from_std(listener) {
    Ok(listener) => listener,
    Err(e) => {
      error!(service = prototype.name(), error = %e, "Unable to register listener");
      return;
    }
  };

  loop {
    tokio::select! {
      biased;

      _ = cancel.cancelled() => {
        debug!(service = prototype.name(), "Accept loop cancelled");
        break;
      }

      result = listener.accept() => match result {
        Ok((stream, peer)) => {
          debug!(service = prototype.name(), peer = %peer, "Accepted connection");
          match stream.into_std() {
            Ok(stream) => unit.attach(stream, Arc::clone(&prototype)),
            Err(e) => warn!(service = prototype.name(), error = %e, "Unable to hand over connection"),
          }
        }
        Err(e) => {
          warn!(service = prototype.name(), error = %e, "Accept failed");
        }
      }
    }
  }
}
