//! Recovery manifest: which engines were running, and on which port.
//!
//! Rewritten whenever the engine set changes. On startup the recorded
//! ports are pinned so workers that survived a restart find their engine
//! where they left it.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

pub const MANIFEST_FILE: &str = "engines.json";

#[derive(Debug, thiserror::Error)]
pub enum RecoveryError {
  #[error("Manifest IO error: {0}")]
  Io(#[from] std::io::Error),
  #[error("Corrupted manifest: {0}")]
  Json(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestEntry {
  pub name: String,
  pub port: u16,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
  pub engines: Vec<ManifestEntry>,
}

#[derive(Debug, Clone)]
pub struct ManifestStore {
  path: PathBuf,
}

impl ManifestStore {
  pub fn new(state_dir: &Path) -> Self {
    Self {
      path: state_dir.join(MANIFEST_FILE),
    }
  }

  pub fn path(&self) -> &Path {
    &self.path
  }

  /// Read the manifest. A missing file is an empty manifest.
  pub fn load(&self) -> Result<Manifest, RecoveryError> {
    match std::fs::read(&self.path) {
      Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
      Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Manifest::default()),
      Err(e) => Err(e.into()),
    }
  }

  /// Replace the manifest atomically.
  pub fn save(&self, manifest: &Manifest) -> Result<(), RecoveryError> {
    if let Some(parent) = self.path.parent() {
      std::fs::create_dir_all(parent)?;
    }

    let tmp = self.path.with_extension("json.tmp");
    std::fs::write(&tmp, serde_json::to_vec_pretty(manifest)?)?;
    std::fs::rename(&tmp, &self.path)?;

    debug!(path = ?self.path, engines = manifest.engines.len(), "Saved recovery manifest");
    Ok(())
  }
}
