//! CLI command implementations

use std::path::PathBuf;

use anyhow::{Context, Result};
use drover::{config::Config, ipc::ControlClient};

mod control;
mod daemon;
mod subscribe;

pub use control::{cmd_drop, cmd_list, cmd_past, cmd_push, cmd_route, cmd_stats};
pub use daemon::cmd_daemon;
pub use subscribe::cmd_subscribe;

/// Where the daemon lives, from flags and the config file.
pub struct Target {
  pub config: Option<PathBuf>,
  pub control: Option<String>,
}

impl Target {
  pub fn load_config(&self) -> Result<Config> {
    let config = match &self.config {
      Some(path) => Config::load(path)?,
      None => Config::load_default()?,
    };
    Ok(config)
  }

  pub async fn connect(&self) -> Result<ControlClient> {
    let addr = match &self.control {
      Some(addr) => addr.clone(),
      None => self.load_config()?.core.control,
    };

    ControlClient::connect(addr.as_str())
      .await
      .with_context(|| format!("Failed to connect to daemon at {addr}"))
  }
}
