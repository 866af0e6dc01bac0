//! Test helpers for core integration tests.
//!
//! Provides `CoreTestContext`, which runs a [`Core`] against a temporary
//! state directory, and scripted workers that connect to its engines over
//! real TCP sessions.

use std::{collections::BTreeMap, net::SocketAddr, sync::Arc, time::Duration};

use serde_json::{Value, json};
use tempfile::TempDir;
use tokio::{net::TcpStream, task::JoinHandle};
use tokio_util::sync::CancellationToken;

use crate::{
  core::{Core, CoreHandle, CoreOptions},
  domain::config::{Config, DriverConfig, EngineConfig, NetworkConfig},
  ipc::{Action, ControlError, ListReply, Request},
  rpc::{Channel, RpcCommand},
  security::Verifier,
};

pub const WAIT: Duration = Duration::from_secs(5);

/// How a scripted worker answers invocations.
#[derive(Debug, Clone, Copy)]
pub enum Behavior {
  /// Answer with the invocation payload
  Echo,
  /// Answer with fixed bytes
  Raw(&'static [u8]),
  /// Fail every invocation
  Fail(i32, &'static str),
}

pub struct CoreTestContext {
  /// Holds the recovery manifest
  pub state_dir: Arc<TempDir>,
  pub handle: CoreHandle,
  pub cancel: CancellationToken,
  task: JoinHandle<()>,
}

impl CoreTestContext {
  pub async fn new() -> Self {
    let state_dir = Arc::new(TempDir::new().expect("create state dir"));
    Self::start(test_config(&state_dir), state_dir, None).await
  }

  pub async fn with_verifier(verifier: Arc<dyn Verifier>) -> Self {
    let state_dir = Arc::new(TempDir::new().expect("create state dir"));
    Self::start(test_config(&state_dir), state_dir, Some(verifier)).await
  }

  pub async fn start(config: Config, state_dir: Arc<TempDir>, verifier: Option<Arc<dyn Verifier>>) -> Self {
    Self::start_with_path(config, None, state_dir, verifier).await
  }

  pub async fn start_with_path(
    config: Config,
    config_path: Option<std::path::PathBuf>,
    state_dir: Arc<TempDir>,
    verifier: Option<Arc<dyn Verifier>>,
  ) -> Self {
    let mut options = CoreOptions::new(config);
    options.config_path = config_path;
    if let Some(verifier) = verifier {
      options.verifier = verifier;
    }

    let cancel = CancellationToken::new();
    let (core, handle) = Core::new(options, cancel.clone());
    let task = tokio::spawn(core.run());

    Self {
      state_dir,
      handle,
      cancel,
      task,
    }
  }

  pub async fn request(&self, action: Action) -> Result<Value, ControlError> {
    tokio::time::timeout(WAIT, self.handle.request(Request::new(action)))
      .await
      .expect("control request timed out")
  }

  /// Send a push in the background. It resolves once a worker answers.
  pub fn push(&self, engine: &str, method: &str, args: Value) -> JoinHandle<Result<Value, ControlError>> {
    let handle = self.handle.clone();
    let action = Action::Push {
      engine: engine.to_string(),
      method: method.to_string(),
      args,
    };
    tokio::spawn(async move { handle.request(Request::new(action)).await })
  }

  /// Push and serve the job with a fresh worker.
  pub async fn push_with(&self, engine: &str, method: &str, args: Value, behavior: Behavior) -> Value {
    let request = self.push(engine, method, args);
    let addr = self.endpoint(engine).await;
    spawn_worker(addr, behavior).await;

    tokio::time::timeout(WAIT, request)
      .await
      .expect("push timed out")
      .expect("push task panicked")
      .expect("push failed")
  }

  pub async fn list(&self) -> ListReply {
    serde_json::from_value(self.request(Action::List).await.expect("list")).expect("list reply")
  }

  /// Wait for `engine` to be running and return its first endpoint.
  pub async fn endpoint(&self, engine: &str) -> SocketAddr {
    for _ in 0..250 {
      if let Some(addr) = self.list().await.running.get(engine).and_then(|addrs| addrs.first()) {
        return *addr;
      }
      tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("engine {engine} never started");
  }

  /// Cancel the core and wait for it to finish shutting down.
  pub async fn stop(self) -> Arc<TempDir> {
    self.cancel.cancel();
    tokio::time::timeout(WAIT, self.task)
      .await
      .expect("core did not stop")
      .expect("core panicked");
    self.state_dir
  }

  pub async fn wait_for_exit(self) {
    tokio::time::timeout(WAIT, self.task)
      .await
      .expect("core did not stop")
      .expect("core panicked");
  }
}

/// Loopback-only config with an `echo` engine.
pub fn test_config(state_dir: &TempDir) -> Config {
  let mut config = Config {
    network: NetworkConfig {
      endpoint: "127.0.0.1".to_string(),
      hostname: "127.0.0.1".to_string(),
      ..NetworkConfig::default()
    },
    ..Config::default()
  };
  config.core.state_dir = Some(state_dir.path().to_path_buf());
  config.engines.insert("echo".to_string(), EngineConfig::default());
  config.groups.insert(
    "storage".to_string(),
    BTreeMap::from([("alpha".to_string(), 1), ("beta".to_string(), 3)]),
  );
  config
}

/// Add a recurring driver on a new `ticker` engine.
pub fn with_ticker(mut config: Config, interval_ms: u64) -> Config {
  config.engines.insert(
    "ticker".to_string(),
    EngineConfig {
      drivers: vec![DriverConfig {
        method: "tick".to_string(),
        interval_ms,
        args: json!({ "tick": true }),
      }],
      ..EngineConfig::default()
    },
  );
  config
}

/// Connect a scripted worker to `addr`. It runs until terminated or
/// disconnected.
pub async fn spawn_worker(addr: SocketAddr, behavior: Behavior) -> JoinHandle<()> {
  let stream = TcpStream::connect(addr).await.expect("connect worker");
  let mut channel = Channel::new(stream);

  tokio::spawn(async move {
    loop {
      let payload = match channel.recv_command().await {
        Ok(RpcCommand::Invoke { payload, .. }) => payload,
        Ok(RpcCommand::Terminate) | Err(_) => return,
        Ok(_) => continue,
      };

      let replies = match behavior {
        Behavior::Echo => vec![RpcCommand::chunk(payload), RpcCommand::Choke],
        Behavior::Raw(body) => vec![RpcCommand::chunk(body), RpcCommand::Choke],
        Behavior::Fail(code, message) => vec![RpcCommand::error(code, message)],
      };

      for reply in &replies {
        if !channel.send_command(reply).await {
          return;
        }
      }
    }
  })
}
