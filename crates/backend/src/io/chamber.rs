//! A dedicated runtime that keeps accept loops off the main runtime.

use std::future::Future;

use tokio::{
  runtime::{Builder, Handle, Runtime},
  task::JoinHandle,
};
use tracing::debug;

/// Named multi-threaded Tokio runtime owned by one service.
///
/// Shutdown never waits for running tasks, so a chamber can be stopped
/// from inside another runtime.
#[derive(Debug)]
pub struct Chamber {
  name: String,
  runtime: Option<Runtime>,
}

impl Chamber {
  /// `threads == 0` runs one worker thread per CPU.
  pub fn new(name: &str, threads: usize) -> std::io::Result<Self> {
    let threads = if threads == 0 { num_cpus::get() } else { threads };
    let runtime = Builder::new_multi_thread()
      .worker_threads(threads)
      .thread_name(format!("chamber-{name}"))
      .enable_all()
      .build()?;

    debug!(chamber = name, threads, "Started chamber");

    Ok(Self {
      name: name.to_string(),
      runtime: Some(runtime),
    })
  }

  pub fn name(&self) -> &str {
    &self.name
  }

  pub fn handle(&self) -> Option<&Handle> {
    self.runtime.as_ref().map(Runtime::handle)
  }

  /// Spawn onto the chamber; `None` once it has been shut down.
  pub fn spawn<F>(&self, future: F) -> Option<JoinHandle<F::Output>>
  where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
  {
    self.runtime.as_ref().map(|runtime| runtime.spawn(future))
  }

  pub fn is_running(&self) -> bool {
    self.runtime.is_some()
  }

  pub fn shutdown(&mut self) {
    if let Some(runtime) = self.runtime.take() {
      runtime.shutdown_background();
      debug!(chamber = %self.name, "Stopped chamber");
    }
  }
}

impl Drop for Chamber {
  fn drop(&mut self) {
    self.shutdown();
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[tokio::test]
  async fn test_spawn_and_shutdown_from_async_context() {
    let mut chamber = Chamber::new("test", 1).unwrap();
    let task = chamber.spawn(async { 40 + 2 }).unwrap();
    assert_eq!(task.await.unwrap(), 42);

    chamber.shutdown();
    assert!(!chamber.is_running());
    assert!(chamber.spawn(async {}).is_none());
  }

  #[test]
  fn test_drop_outside_runtime() {
    let chamber = Chamber::new("drop", 2).unwrap();
    assert_eq!(chamber.name(), "drop");
    assert!(chamber.handle().is_some());
    drop(chamber);
  }
}
