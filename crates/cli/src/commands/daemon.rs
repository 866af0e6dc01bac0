//! Daemon command

use anyhow::{Context, Result};
use drover::{Daemon, RuntimeConfig};
use tracing::info;

use super::Target;

/// Start the daemon, detached unless asked to stay in the foreground
pub async fn cmd_daemon(target: &Target, foreground: bool, background: bool) -> Result<()> {
  if !foreground && !background {
    let pid = Daemon::spawn_detached(target.config.as_ref()).context("Failed to spawn daemon")?;
    println!("Daemon started (PID {pid})");
    return Ok(());
  }

  let mut runtime_config = RuntimeConfig::load(target.config.clone()).context("Failed to load config")?;
  runtime_config.foreground = foreground;
  if let Some(control) = &target.control {
    runtime_config.config.core.control = control.clone();
  }

  info!("Starting drover daemon");
  Daemon::new(runtime_config)
    .run()
    .await
    .context("Failed to run daemon")?;

  Ok(())
}
