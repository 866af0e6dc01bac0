//! Lifecycle signals.
//!
//! | signal                   | transition  |
//! |--------------------------|-------------|
//! | SIGINT, SIGTERM, SIGQUIT | `Terminate` |
//! | SIGHUP                   | `Reload`    |
//! | SIGUSR1                  | `Purge`     |

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::CoreHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoreSignal {
  /// Stop the core and shut every engine down
  Terminate,
  /// Re-read the configuration and rebuild engines, groups and drivers
  Reload,
  /// Forget every history
  Purge,
}

/// Forward process signals to the core until cancelled or terminated.
#[cfg(unix)]
pub async fn forward(core: CoreHandle, cancel: CancellationToken) -> std::io::Result<()> {
  use tokio::signal::unix::{SignalKind, signal};

  let mut sigint = signal(SignalKind::interrupt())?;
  let mut sigterm = signal(SignalKind::terminate())?;
  let mut sigquit = signal(SignalKind::quit())?;
  let mut sighup = signal(SignalKind::hangup())?;
  let mut sigusr1 = signal(SignalKind::user_defined1())?;

  loop {
    let transition = tokio::select! {
      biased;

      _ = cancel.cancelled() => return Ok(()),
      _ = sigint.recv() => CoreSignal::Terminate,
      _ = sigterm.recv() => CoreSignal::Terminate,
      _ = sigquit.recv() => CoreSignal::Terminate,
      _ = sighup.recv() => CoreSignal::Reload,
      _ = sigusr1.recv() => CoreSignal::Purge,
    };

    info!(signal = ?transition, "Received signal");
    if !core.signal(transition) {
      warn!("Core is gone, no longer forwarding signals");
      return Ok(());
    }
    if transition == CoreSignal::Terminate {
      return Ok(());
    }
  }
}

/// Only ctrl-c is available here; it terminates.
#[cfg(not(unix))]
pub async fn forward(core: CoreHandle, cancel: CancellationToken) -> std::io::Result<()> {
  tokio::select! {
    _ = cancel.cancelled() => Ok(()),
    result = tokio::signal::ctrl_c() => {
      result?;
      info!("Received ctrl-c");
      if !core.signal(CoreSignal::Terminate) {
        warn!("Core is gone");
      }
      Ok(())
    }
  }
}
