//! Consistent-hash routing of keys to named backend groups.

use std::{collections::BTreeMap, sync::Arc};

use dashmap::DashMap;
use tracing::info;

pub mod continuum;

pub use continuum::Continuum;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RoutingError {
  #[error("No backends available")]
  NoBackendsAvailable,
  #[error("Unknown routing group: {0}")]
  UnknownGroup(String),
}

/// Named continuum snapshots.
///
/// Each group is rebuilt as a whole and swapped in, so concurrent lookups
/// see either the old ring or the new one, never a partially built ring.
#[derive(Debug, Default)]
pub struct GroupRouter {
  groups: DashMap<String, Arc<Continuum>>,
}

impl GroupRouter {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn from_groups(groups: &BTreeMap<String, BTreeMap<String, u32>>) -> Self {
    let router = Self::new();
    router.replace_all(groups);
    router
  }

  /// Rebuild one group from its weights.
  pub fn update(&self, group: &str, weights: &BTreeMap<String, u32>) {
    let continuum = Arc::new(Continuum::new(weights));
    info!(group, backends = weights.len(), points = continuum.len(), "Rebuilt routing group");
    self.groups.insert(group.to_string(), continuum);
  }

  /// Replace the whole group set, dropping groups that are no longer listed.
  pub fn replace_all(&self, groups: &BTreeMap<String, BTreeMap<String, u32>>) {
    self.groups.retain(|name, _| groups.contains_key(name));
    for (name, weights) in groups {
      self.update(name, weights);
    }
  }

  pub fn remove(&self, group: &str) -> bool {
    self.groups.remove(group).is_some()
  }

  /// Current snapshot of a group.
  pub fn snapshot(&self, group: &str) -> Result<Arc<Continuum>, RoutingError> {
    self
      .groups
      .get(group)
      .map(|entry| Arc::clone(entry.value()))
      .ok_or_else(|| RoutingError::UnknownGroup(group.to_string()))
  }

  /// Pick a backend in `group`: by `key` when given, otherwise at random.
  pub fn route(&self, group: &str, key: Option<&str>) -> Result<String, RoutingError> {
    let continuum = self.snapshot(group)?;
    let backend = match key {
      Some(key) => continuum.get(key)?,
      None => continuum.get_random()?,
    };
    Ok(backend.to_string())
  }

  pub fn groups(&self) -> Vec<String> {
    let mut names: Vec<String> = self.groups.iter().map(|entry| entry.key().clone()).collect();
    names.sort();
    names
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn groups() -> BTreeMap<String, BTreeMap<String, u32>> {
    let mut storage = BTreeMap::new();
    storage.insert("node-a".to_string(), 1);
    storage.insert("node-b".to_string(), 1);

    let mut groups = BTreeMap::new();
    groups.insert("storage".to_string(), storage);
    groups.insert("empty".to_string(), BTreeMap::new());
    groups
  }

  #[test]
  fn test_route_keyed_and_keyless() {
    let router = GroupRouter::from_groups(&groups());

    let keyed = router.route("storage", Some("user:42")).unwrap();
    assert_eq!(router.route("storage", Some("user:42")).unwrap(), keyed);

    let any = router.route("storage", None).unwrap();
    assert!(any == "node-a" || any == "node-b");
  }

  #[test]
  fn test_route_errors() {
    let router = GroupRouter::from_groups(&groups());

    assert_eq!(
      router.route("missing", Some("k")).unwrap_err(),
      RoutingError::UnknownGroup("missing".to_string())
    );
    assert_eq!(router.route("empty", None).unwrap_err(), RoutingError::NoBackendsAvailable);
  }

  #[test]
  fn test_snapshot_survives_rebuild() {
    let router = GroupRouter::from_groups(&groups());
    let before = router.snapshot("storage").unwrap();

    let mut weights = BTreeMap::new();
    weights.insert("node-c".to_string(), 3);
    router.update("storage", &weights);

    assert_eq!(before.len(), 2);
    assert_eq!(router.snapshot("storage").unwrap().len(), 3);
    assert_eq!(router.route("storage", Some("k")).unwrap(), "node-c");
  }

  #[test]
  fn test_replace_all_drops_missing_groups() {
    let router = GroupRouter::from_groups(&groups());
    router.replace_all(&BTreeMap::new());
    assert!(router.groups().is_empty());
  }
}
