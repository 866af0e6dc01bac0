//! Daemon configuration.
//!
//! Loaded from `{config_dir}/config.toml` (see [`crate::dirs`]). Every section
//! is optional and falls back to its defaults, so an empty file is a valid
//! configuration that serves no engines.

use std::{
  collections::BTreeMap,
  path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};

use crate::dirs;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
  #[error("Unable to read config {path:?}: {source}")]
  Io {
    path: PathBuf,
    #[source]
    source: std::io::Error,
  },
  #[error("Invalid config {path:?}: {source}")]
  Parse {
    path: PathBuf,
    #[source]
    source: toml::de::Error,
  },
  #[error("Invalid config: {0}")]
  Invalid(String),
}

// ============================================================================
// Network
// ============================================================================

/// Where engine actors listen for worker connections.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
  /// Bind address for engine actors
  pub endpoint: String,

  /// Advertised host name, used when `endpoint` is a wildcard address
  pub hostname: String,

  /// Inclusive port range for the port mapper. Unset = OS-assigned ports
  #[serde(skip_serializing_if = "Option::is_none")]
  pub ports: Option<(u16, u16)>,

  /// Worker threads of every actor's accept runtime (0 = one per CPU)
  pub chamber_threads: usize,
}

impl Default for NetworkConfig {
  fn default() -> Self {
    Self {
      endpoint: "0.0.0.0".to_string(),
      hostname: "localhost".to_string(),
      ports: None,
      chamber_threads: 1,
    }
  }
}

// ============================================================================
// Core
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoreConfig {
  /// Control socket (newline-delimited JSON requests)
  pub control: String,

  /// Publication socket
  pub publish: String,

  /// Entries kept per driver history (0 = unbounded)
  pub history_limit: usize,

  /// Directory of the recovery manifest. Default: data dir
  #[serde(skip_serializing_if = "Option::is_none")]
  pub state_dir: Option<PathBuf>,

  /// Users allowed to send control requests, read at startup. Empty = anyone
  #[serde(skip_serializing_if = "Vec::is_empty")]
  pub users: Vec<String>,
}

impl Default for CoreConfig {
  fn default() -> Self {
    Self {
      control: "127.0.0.1:5000".to_string(),
      publish: "127.0.0.1:5001".to_string(),
      history_limit: 1000,
      state_dir: None,
      users: Vec::new(),
    }
  }
}

// ============================================================================
// Daemon
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
  /// Log level: "off", "error", "warn", "info", "debug", "trace"
  pub log_level: String,

  /// Log file rotation: "daily", "hourly", "never"
  pub log_rotation: String,
}

impl Default for DaemonConfig {
  fn default() -> Self {
    Self {
      log_level: "info".to_string(),
      log_rotation: "daily".to_string(),
    }
  }
}

// ============================================================================
// Engines
// ============================================================================

/// A named worker pool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
  /// Jobs waiting for a worker before new ones are rejected
  pub queue_limit: usize,

  /// Workers silent for longer than this are dropped
  pub heartbeat_timeout_secs: u64,

  /// Recurring jobs produced by the daemon itself
  pub drivers: Vec<DriverConfig>,
}

impl Default for EngineConfig {
  fn default() -> Self {
    Self {
      queue_limit: 1024,
      heartbeat_timeout_secs: 30,
      drivers: Vec::new(),
    }
  }
}

/// A recurring job: `method` is pushed to the engine every `interval_ms`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DriverConfig {
  pub method: String,
  pub interval_ms: u64,
  #[serde(default)]
  pub args: serde_json::Value,
}

// ============================================================================
// Main Configuration
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
  pub network: NetworkConfig,
  pub core: CoreConfig,
  pub daemon: DaemonConfig,
  pub engines: BTreeMap<String, EngineConfig>,
  /// Routing groups: `group -> backend -> weight`
  pub groups: BTreeMap<String, BTreeMap<String, u32>>,
}

impl Config {
  /// Load and validate a config file.
  pub fn load(path: &Path) -> Result<Self, ConfigError> {
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
      path: path.to_path_buf(),
      source,
    })?;

    Self::parse(&content).map_err(|e| match e {
      ConfigError::Parse { source, .. } => ConfigError::Parse {
        path: path.to_path_buf(),
        source,
      },
      other => other,
    })
  }

  /// Load the config file at the default location, or defaults when it is missing.
  pub fn load_default() -> Result<Self, ConfigError> {
    let path = dirs::default_config_path();
    if !path.exists() {
      return Ok(Self::default());
    }
    Self::load(&path)
  }

  pub fn parse(content: &str) -> Result<Self, ConfigError> {
    let config: Config = toml::from_str(content).map_err(|source| ConfigError::Parse {
      path: PathBuf::new(),
      source,
    })?;
    config.validate()?;
    Ok(config)
  }

  fn validate(&self) -> Result<(), ConfigError> {
    if let Some((low, high)) = self.network.ports
      && low > high
    {
      return Err(ConfigError::Invalid(format!("network.ports range {low}..={high} is empty")));
    }

    for (name, engine) in &self.engines {
      if name.is_empty() || name.contains('/') {
        return Err(ConfigError::Invalid(format!("engine name {name:?} must be non-empty and contain no '/'")));
      }
      for driver in &engine.drivers {
        if driver.interval_ms == 0 {
          return Err(ConfigError::Invalid(format!(
            "driver {name}/{} needs a positive interval_ms",
            driver.method
          )));
        }
      }
    }

    Ok(())
  }

  /// Directory holding the recovery manifest.
  pub fn state_dir(&self) -> PathBuf {
    self.core.state_dir.clone().unwrap_or_else(dirs::default_data_dir)
  }

  /// History bound, `None` when unbounded.
  pub fn history_limit(&self) -> Option<usize> {
    (self.core.history_limit > 0).then_some(self.core.history_limit)
  }
}
