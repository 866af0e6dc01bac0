//! Port assignment for service listeners.

use std::{
  collections::{HashMap, VecDeque},
  sync::{Mutex, MutexGuard, PoisonError},
};

use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MapperError {
  #[error("No free ports left in {low}..={high}")]
  Exhausted { low: u16, high: u16 },
}

/// Hands out listener ports by service name.
///
/// With a range, ports come from a pool and go back to its tail when
/// released, so a service that restarts right away does not race the
/// previous listener for the same port. Without a range every service gets
/// port 0 and the OS picks an ephemeral one. Pinned ports (recorded by an
/// earlier run) are preferred whenever they are free.
#[derive(Debug)]
pub struct PortMapper {
  state: Mutex<MapperState>,
}

#[derive(Debug)]
struct MapperState {
  range: Option<(u16, u16)>,
  free: VecDeque<u16>,
  assigned: HashMap<String, u16>,
  pinned: HashMap<String, u16>,
}

impl MapperState {
  fn in_range(&self, port: u16) -> bool {
    self.range.is_some_and(|(low, high)| (low..=high).contains(&port))
  }

  fn in_use(&self, port: u16) -> bool {
    self.assigned.values().any(|&p| p == port)
  }
}

impl PortMapper {
  pub fn new(range: Option<(u16, u16)>) -> Self {
    let free = range.map(|(low, high)| (low..=high).collect()).unwrap_or_default();
    Self {
      state: Mutex::new(MapperState {
        range,
        free,
        assigned: HashMap::new(),
        pinned: HashMap::new(),
      }),
    }
  }

  /// No range: every assignment is port 0.
  pub fn ephemeral() -> Self {
    Self::new(None)
  }

  fn lock(&self) -> MutexGuard<'_, MapperState> {
    self.state.lock().unwrap_or_else(PoisonError::into_inner)
  }

  /// Port for `name`. Assigning a name that already holds a port returns it again.
  pub fn assign(&self, name: &str) -> Result<u16, MapperError> {
    let mut state = self.lock();

    if let Some(&port) = state.assigned.get(name) {
      return Ok(port);
    }

    if let Some(&pinned) = state.pinned.get(name)
      && !state.in_use(pinned)
    {
      state.free.retain(|&p| p != pinned);
      state.assigned.insert(name.to_string(), pinned);
      debug!(service = name, port = pinned, "Assigned pinned port");
      return Ok(pinned);
    }

    let Some((low, high)) = state.range else {
      return Ok(0);
    };

    let port = state.free.pop_front().ok_or(MapperError::Exhausted { low, high })?;
    state.assigned.insert(name.to_string(), port);
    debug!(service = name, port, "Assigned port");
    Ok(port)
  }

  /// Give the port held by `name` back to the pool.
  pub fn retain(&self, name: &str) -> Option<u16> {
    let mut state = self.lock();
    let port = state.assigned.remove(name)?;

    if state.in_range(port) && !state.free.contains(&port) {
      state.free.push_back(port);
    }

    debug!(service = name, port, "Released port");
    Some(port)
  }

  /// Prefer `port` the next time `name` is assigned.
  pub fn pin(&self, name: &str, port: u16) {
    let mut state = self.lock();

    if port == 0 {
      return;
    }

    if state.range.is_some() && !state.in_range(port) {
      warn!(service = name, port, "Pinned port lies outside of the configured range");
    }

    state.pinned.insert(name.to_string(), port);
  }

  /// Port currently held by `name`.
  pub fn port_of(&self, name: &str) -> Option<u16> {
    self.lock().assigned.get(name).copied()
  }
}

impl Default for PortMapper {
  fn default() -> Self {
    Self::ephemeral()
  }
}
