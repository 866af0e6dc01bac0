//! Recurring drivers: jobs the daemon pushes to itself on a timer.

use std::{collections::BTreeMap, time::Duration};

use serde_json::Value;
use tokio::{
  sync::mpsc,
  time::{Instant, MissedTickBehavior, interval_at},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::domain::config::EngineConfig;

/// One firing of a recurring driver.
#[derive(Debug, Clone, PartialEq)]
pub struct DriverTick {
  pub engine: String,
  pub method: String,
  pub args: Value,
}

/// Timer tasks for every configured driver.
///
/// Each rebuild cancels the previous generation of timers, so a reload
/// never leaves stale drivers behind.
pub struct Drivers {
  parent: CancellationToken,
  generation: CancellationToken,
  tx: mpsc::UnboundedSender<DriverTick>,
  count: usize,
}

impl Drivers {
  pub fn new(parent: CancellationToken) -> (Self, mpsc::UnboundedReceiver<DriverTick>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let generation = parent.child_token();
    (
      Self {
        parent,
        generation,
        tx,
        count: 0,
      },
      rx,
    )
  }

  pub fn rebuild(&mut self, engines: &BTreeMap<String, EngineConfig>) {
    self.stop();
    self.generation = self.parent.child_token();

    for (engine, config) in engines {
      for driver in &config.drivers {
        let tick = DriverTick {
          engine: engine.clone(),
          method: driver.method.clone(),
          args: driver.args.clone(),
        };
        let period = Duration::from_millis(driver.interval_ms.max(1));
        tokio::spawn(run_driver(tick, period, self.generation.clone(), self.tx.clone()));
        self.count += 1;
      }
    }

    if self.count > 0 {
      info!(drivers = self.count, "Recurring drivers scheduled");
    }
  }

  pub fn stop(&mut self) {
    self.generation.cancel();
    self.count = 0;
  }

  pub fn len(&self) -> usize {
    self.count
  }

  pub fn is_empty(&self) -> bool {
    self.count == 0
  }
}

async fn run_driver(
  tick: DriverTick,
  period: Duration,
  cancel: CancellationToken,
  tx: mpsc::UnboundedSender<DriverTick>,
) {
  let mut interval = interval_at(Instant::now() + period, period);
  interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

  loop {
    tokio::select! {
      biased;

      _ = cancel.cancelled() => break,

      _ = interval.tick() => {
        if tx.send(tick.clone()).is_err() {
          break;
        }
      }
    }
  }

  debug!(engine = %tick.engine, method = %tick.method, "Driver stopped");
}
