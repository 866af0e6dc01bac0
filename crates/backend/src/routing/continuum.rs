//! Weighted consistent-hash ring (ketama style).
//!
//! Every backend contributes `weight` points to a `u32` ring. A key maps to
//! the first point at or after its own hash, wrapping around to the start
//! of the ring.

use std::{collections::BTreeMap, sync::Mutex};

use rand::{Rng, SeedableRng, rngs::StdRng};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use super::RoutingError;

/// Position on the ring.
pub type Point = u32;

/// Upper bound on rehash attempts for one replica before giving up on it.
const MAX_REHASH_ATTEMPTS: u32 = 64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Element {
  pub point: Point,
  pub backend: String,
}

/// Immutable ring built from a `{backend -> weight}` map.
///
/// Rebuilding produces a new instance; lookups only need `&self`, so a
/// continuum can be shared behind an `Arc` and swapped as a whole.
#[derive(Debug)]
pub struct Continuum {
  elements: Vec<Element>,
  rng: Mutex<StdRng>,
}

impl Continuum {
  /// Build the ring.
  ///
  /// Collisions are resolved by rehashing the replica with an attempt
  /// suffix, so every backend keeps exactly `weight` points.
  pub fn new(weights: &BTreeMap<String, u32>) -> Self {
    let mut ring: BTreeMap<Point, String> = BTreeMap::new();

    for (backend, &weight) in weights {
      for replica in 0..weight {
        let base = format!("{backend}-{replica}");
        let mut point = hash(&base);
        let mut attempt = 0;

        while ring.contains_key(&point) {
          attempt += 1;
          if attempt > MAX_REHASH_ATTEMPTS {
            break;
          }
          point = hash(&format!("{base}#{attempt}"));
        }

        if attempt > MAX_REHASH_ATTEMPTS {
          warn!(backend = %backend, replica, "Unable to place replica on the continuum");
          continue;
        }

        if attempt > 0 {
          debug!(backend = %backend, replica, attempt, "Rehashed colliding continuum point");
        }

        ring.insert(point, backend.clone());
      }
    }

    // BTreeMap iteration is already sorted by point.
    let elements = ring
      .into_iter()
      .map(|(point, backend)| Element { point, backend })
      .collect();

    Self {
      elements,
      rng: Mutex::new(StdRng::from_os_rng()),
    }
  }

  /// Build a ring whose keyless lookups use a fixed seed.
  pub fn with_seed(weights: &BTreeMap<String, u32>, seed: u64) -> Self {
    let mut continuum = Self::new(weights);
    continuum.rng = Mutex::new(StdRng::seed_from_u64(seed));
    continuum
  }

  pub fn len(&self) -> usize {
    self.elements.len()
  }

  pub fn is_empty(&self) -> bool {
    self.elements.is_empty()
  }

  pub fn elements(&self) -> &[Element] {
    &self.elements
  }

  /// Backend responsible for `key`. Deterministic for a given ring.
  pub fn get(&self, key: &str) -> Result<&str, RoutingError> {
    self.lookup(hash(key))
  }

  /// Backend for a uniformly random point, i.e. chosen proportionally to weight.
  pub fn get_random(&self) -> Result<&str, RoutingError> {
    if self.is_empty() {
      return Err(RoutingError::NoBackendsAvailable);
    }

    let point: Point = match self.rng.lock() {
      Ok(mut rng) => rng.random(),
      Err(poisoned) => poisoned.into_inner().random(),
    };

    self.lookup(point)
  }

  fn lookup(&self, point: Point) -> Result<&str, RoutingError> {
    if self.elements.is_empty() {
      return Err(RoutingError::NoBackendsAvailable);
    }

    let index = self.elements.partition_point(|element| element.point < point);
    let element = self.elements.get(index).unwrap_or(&self.elements[0]);

    Ok(element.backend.as_str())
  }
}

/// Ring position of an arbitrary string: the first four bytes of its SHA-256.
pub fn hash(value: &str) -> Point {
  let digest = Sha256::digest(value.as_bytes());
  u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]])
}
