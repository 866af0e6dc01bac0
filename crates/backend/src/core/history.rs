//! Per-driver result history.

use std::collections::{HashMap, VecDeque};

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Unix time in seconds with sub-second precision.
pub type Timestamp = f64;

/// One recorded result, serialized as `[timestamp, result]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry(pub Timestamp, pub Value);

impl HistoryEntry {
  pub fn timestamp(&self) -> Timestamp {
    self.0
  }

  pub fn result(&self) -> &Value {
    &self.1
  }
}

/// Results of one driver in chronological order.
///
/// Timestamps never decrease: an entry stamped earlier than its predecessor
/// (clock step back) takes the predecessor's timestamp. With a limit the
/// oldest entries are evicted first.
#[derive(Debug, Clone, Default)]
pub struct History {
  entries: VecDeque<HistoryEntry>,
  limit: Option<usize>,
}

impl History {
  pub fn new(limit: Option<usize>) -> Self {
    Self {
      entries: VecDeque::new(),
      limit,
    }
  }

  pub fn push(&mut self, timestamp: Timestamp, result: Value) {
    let timestamp = match self.entries.back() {
      Some(last) if last.0 > timestamp => last.0,
      _ => timestamp,
    };

    self.entries.push_back(HistoryEntry(timestamp, result));
    self.trim();
  }

  /// Change the bound, evicting the oldest entries beyond it.
  pub fn set_limit(&mut self, limit: Option<usize>) {
    self.limit = limit;
    self.trim();
  }

  fn trim(&mut self) {
    if let Some(limit) = self.limit {
      while self.entries.len() > limit {
        self.entries.pop_front();
      }
    }
  }

  pub fn len(&self) -> usize {
    self.entries.len()
  }

  pub fn is_empty(&self) -> bool {
    self.entries.is_empty()
  }

  pub fn entries(&self) -> Vec<HistoryEntry> {
    self.entries.iter().cloned().collect()
  }
}

/// Every history, keyed by driver id. Histories are created on first record.
#[derive(Debug, Default)]
pub struct Histories {
  map: HashMap<String, History>,
  limit: Option<usize>,
}

impl Histories {
  pub fn new(limit: Option<usize>) -> Self {
    Self {
      map: HashMap::new(),
      limit,
    }
  }

  pub fn record(&mut self, driver: &str, timestamp: Timestamp, result: Value) {
    let limit = self.limit;
    self
      .map
      .entry(driver.to_string())
      .or_insert_with(|| History::new(limit))
      .push(timestamp, result);
  }

  pub fn get(&self, driver: &str) -> Option<&History> {
    self.map.get(driver)
  }

  /// Rebound every history, existing ones included.
  pub fn set_limit(&mut self, limit: Option<usize>) {
    self.limit = limit;
    for history in self.map.values_mut() {
      history.set_limit(limit);
    }
  }

  pub fn clear(&mut self) {
    self.map.clear();
  }

  pub fn len(&self) -> usize {
    self.map.len()
  }

  pub fn is_empty(&self) -> bool {
    self.map.is_empty()
  }
}
