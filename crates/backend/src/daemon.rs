//! Daemon lifecycle.
//!
//! # Architecture
//!
//! ```text
//! Daemon
//!   ├── Server (control + publish sockets, one task per connection)
//!   ├── signal forwarder (SIGINT/TERM/QUIT, SIGHUP, SIGUSR1)
//!   └── Core
//!         ├── Drivers (recurring pushes)
//!         └── Engine (per configured engine, started on demand)
//!               └── Actor ── Chamber (accepts worker sessions)
//! ```
//!
//! # Lifecycle
//!
//! 1. Create master `CancellationToken`
//! 2. Start the core, which recovers engines from its manifest
//! 3. Bind the control and publish sockets
//! 4. Forward process signals to the core
//! 5. Run until the core terminates or the server fails
//! 6. Cancel everything and wait for the core to shut its engines down

use std::path::PathBuf;

use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::{
  core::{Core, CoreOptions, CoreSignal, signals},
  dirs,
  domain::config::{Config, ConfigError},
  ipc::IpcError,
  server::Server,
};

#[derive(Debug, thiserror::Error)]
pub enum DaemonError {
  #[error(transparent)]
  Config(#[from] ConfigError),
  #[error(transparent)]
  Ipc(#[from] IpcError),
}

// ============================================================================
// Configuration
// ============================================================================

/// Daemon runtime configuration.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
  /// Config file re-read on reload. Unset = default location
  pub config_path: Option<PathBuf>,
  /// Base directory for the manifest and logs
  pub data_dir: PathBuf,
  /// Run attached to the terminal (logs to stderr)
  pub foreground: bool,
  pub config: Config,
}

impl RuntimeConfig {
  pub fn load(config_path: Option<PathBuf>) -> Result<Self, ConfigError> {
    let config = match &config_path {
      Some(path) => Config::load(path)?,
      None => Config::load_default()?,
    };

    Ok(Self {
      config_path,
      data_dir: dirs::default_data_dir(),
      foreground: false,
      config,
    })
  }
}

// ============================================================================
// Daemon
// ============================================================================

pub struct Daemon {
  runtime_config: RuntimeConfig,
}

impl Daemon {
  pub fn new(runtime_config: RuntimeConfig) -> Self {
    Self { runtime_config }
  }

  /// Spawn a detached daemon process using the current executable.
  ///
  /// This re-executes the current binary with `daemon --background`,
  /// ensuring a clean process with its own Tokio runtime.
  pub fn spawn_detached(config_path: Option<&PathBuf>) -> std::io::Result<u32> {
    use std::process::{Command, Stdio};

    let exe = std::env::current_exe()?;
    let mut command = Command::new(&exe);
    command.arg("daemon").arg("--background");
    if let Some(path) = config_path {
      command.arg("--config").arg(path);
    }

    let child = command
      .stdin(Stdio::null())
      .stdout(Stdio::null())
      .stderr(Stdio::null())
      .spawn()?;

    info!("Spawned daemon process with PID {}", child.id());
    Ok(child.id())
  }

  /// Run the daemon until it is told to terminate.
  pub async fn run(self) -> Result<(), DaemonError> {
    let RuntimeConfig {
      config_path,
      data_dir,
      foreground,
      config,
    } = self.runtime_config;

    info!("Starting drover daemon");
    info!(data_dir = ?data_dir, state_dir = ?config.state_dir(), foreground, "Directories");

    // Master cancellation token - propagates to all children
    let cancel = CancellationToken::new();

    let mut options = CoreOptions::new(config.clone());
    options.config_path = config_path;
    let (core, handle) = Core::new(options, cancel.child_token());
    let mut core_task = tokio::spawn(core.run());

    let server = match Server::bind(&config.core.control, &config.core.publish, handle.clone()).await {
      Ok(server) => server,
      Err(e) => {
        error!(error = %e, "Unable to bind the daemon sockets");
        handle.signal(CoreSignal::Terminate);
        let _ = core_task.await;
        return Err(e.into());
      }
    };
    let mut server_task = tokio::spawn(server.run(cancel.child_token()));

    let signal_task = {
      let handle = handle.clone();
      let cancel = cancel.child_token();
      tokio::spawn(async move {
        if let Err(e) = signals::forward(handle, cancel).await {
          warn!("Failed to listen for signals: {}", e);
        }
      })
    };

    let mut core_done = false;
    tokio::select! {
      _ = &mut core_task => {
        core_done = true;
      }
      result = &mut server_task => match result {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!(error = %e, "Server error"),
        Err(e) => error!(error = %e, "Server task failed"),
      },
    }

    info!("Shutting down...");
    cancel.cancel();

    if !core_done {
      let _ = core_task.await;
    }
    let _ = signal_task.await;

    info!("Daemon shutdown complete");
    Ok(())
  }
}
