//! Lifecycle tests: signals, recurring drivers and recovery across
//! restarts.

#[cfg(test)]
mod tests {
  use std::{sync::Arc, time::Duration};

  use pretty_assertions::assert_eq;
  use serde_json::json;
  use tempfile::TempDir;

  use crate::{
    core::{
      CoreSignal,
      __tests__::helpers::{Behavior, CoreTestContext, WAIT, spawn_worker, test_config, with_ticker},
      recovery::ManifestStore,
    },
    ipc::{Action, ControlError, PastReply, Request},
  };

  // ==========================================================================
  // Signals
  // ==========================================================================

  #[tokio::test]
  async fn test_purge_forgets_histories() {
    let ctx = CoreTestContext::new().await;
    ctx.push_with("echo", "run", json!({}), Behavior::Echo).await;

    assert!(ctx.handle.signal(CoreSignal::Purge));

    let result = ctx
      .request(Action::Past {
        driver_id: "echo/run".to_string(),
      })
      .await;
    assert_eq!(result, Err(ControlError::NoHistory("echo/run".to_string())));

    ctx.stop().await;
  }

  #[tokio::test]
  async fn test_terminate_stops_core() {
    let ctx = CoreTestContext::new().await;
    let handle = ctx.handle.clone();

    assert!(handle.signal(CoreSignal::Terminate));
    ctx.wait_for_exit().await;

    assert_eq!(
      handle.request(Request::new(Action::Stats)).await,
      Err(ControlError::Shutdown)
    );
    assert!(!handle.signal(CoreSignal::Purge));
  }

  #[tokio::test]
  async fn test_pending_push_gets_shutdown_reply() {
    let ctx = CoreTestContext::new().await;

    // No worker ever connects, so the job stays pending
    let push = ctx.push("echo", "run", json!({}));
    ctx.endpoint("echo").await;
    ctx.stop().await;

    let result = tokio::time::timeout(WAIT, push).await.unwrap().unwrap();
    assert_eq!(result, Err(ControlError::Shutdown));
  }

  #[tokio::test]
  async fn test_reload_drops_unconfigured_engines() {
    let state_dir = Arc::new(TempDir::new().unwrap());
    let config_path = state_dir.path().join("config.toml");

    let ctx = CoreTestContext::start_with_path(
      test_config(&state_dir),
      Some(config_path.clone()),
      state_dir.clone(),
      None,
    )
    .await;
    ctx.push_with("echo", "run", json!({}), Behavior::Echo).await;
    assert_eq!(ctx.list().await.running.len(), 1);

    std::fs::write(
      &config_path,
      r#"
[network]
endpoint = "127.0.0.1"

[engines.other]

[groups.storage]
gamma = 1
"#,
    )
    .unwrap();
    assert!(ctx.handle.signal(CoreSignal::Reload));

    let list = ctx.list().await;
    assert_eq!(list.engines, vec!["other".to_string()]);
    assert!(list.running.is_empty());

    let backend = ctx
      .request(Action::Route {
        group: "storage".to_string(),
        key: None,
      })
      .await
      .unwrap();
    assert_eq!(backend["backend"], "gamma");

    let result = ctx
      .request(Action::Push {
        engine: "echo".to_string(),
        method: "run".to_string(),
        args: json!({}),
      })
      .await;
    assert_eq!(result, Err(ControlError::UnknownEngine("echo".to_string())));

    ctx.stop().await;
  }

  #[tokio::test]
  async fn test_reload_bounds_existing_histories() {
    let state_dir = Arc::new(TempDir::new().unwrap());
    let config_path = state_dir.path().join("config.toml");

    let mut config = test_config(&state_dir);
    config.core.history_limit = 0;
    let ctx = CoreTestContext::start_with_path(config, Some(config_path.clone()), state_dir.clone(), None).await;
    for n in 0..3 {
      ctx.push_with("echo", "run", json!({ "n": n }), Behavior::Echo).await;
    }

    std::fs::write(
      &config_path,
      r#"
[network]
endpoint = "127.0.0.1"

[core]
history_limit = 1

[engines.echo]
"#,
    )
    .unwrap();
    assert!(ctx.handle.signal(CoreSignal::Reload));

    let past = ctx
      .request(Action::Past {
        driver_id: "echo/run".to_string(),
      })
      .await
      .unwrap();
    let past: PastReply = serde_json::from_value(past).unwrap();
    let results: Vec<_> = past.entries.iter().map(|entry| entry.result().clone()).collect();
    assert_eq!(results, vec![json!({ "n": 2 })]);

    ctx.stop().await;
  }

  #[tokio::test]
  async fn test_failed_reload_keeps_configuration() {
    let state_dir = Arc::new(TempDir::new().unwrap());
    let config_path = state_dir.path().join("config.toml");
    std::fs::write(&config_path, "engines = 5").unwrap();

    let ctx =
      CoreTestContext::start_with_path(test_config(&state_dir), Some(config_path), state_dir.clone(), None).await;
    assert!(ctx.handle.signal(CoreSignal::Reload));

    assert_eq!(ctx.list().await.engines, vec!["echo".to_string()]);

    ctx.stop().await;
  }

  // ==========================================================================
  // Drivers
  // ==========================================================================

  #[tokio::test]
  async fn test_driver_results_are_published() {
    let state_dir = Arc::new(TempDir::new().unwrap());
    let config = with_ticker(test_config(&state_dir), 50);

    let ctx = CoreTestContext::start(config, state_dir, None).await;
    let mut publications = ctx.handle.subscribe();

    let addr = ctx.endpoint("ticker").await;
    spawn_worker(addr, Behavior::Echo).await;

    let publication = tokio::time::timeout(WAIT, publications.recv()).await.unwrap().unwrap();
    assert_eq!(publication.driver, "ticker/tick");
    assert_eq!(publication.result, json!({ "tick": true }));

    ctx.stop().await;
  }

  // ==========================================================================
  // Recovery
  // ==========================================================================

  #[tokio::test]
  async fn test_engines_recover_on_their_port() {
    let ctx = CoreTestContext::new().await;
    ctx.push_with("echo", "run", json!({}), Behavior::Echo).await;
    let before = ctx.endpoint("echo").await;

    let state_dir = ctx.stop().await;

    let manifest = ManifestStore::new(state_dir.path()).load().unwrap();
    assert_eq!(manifest.engines.len(), 1);
    assert_eq!(manifest.engines[0].name, "echo");
    assert_eq!(manifest.engines[0].port, before.port());

    // Let the old listener go away before rebinding its port
    tokio::time::sleep(Duration::from_millis(300)).await;

    let ctx = CoreTestContext::start(test_config(&state_dir), state_dir.clone(), None).await;
    let list = ctx.list().await;
    assert_eq!(list.running["echo"], vec![before]);

    // History is not part of recovery
    let result = ctx
      .request(Action::Past {
        driver_id: "echo/run".to_string(),
      })
      .await;
    assert!(matches!(result, Err(ControlError::NoHistory(_))));

    ctx.stop().await;
  }

  #[tokio::test]
  async fn test_unconfigured_engines_are_not_recovered() {
    let ctx = CoreTestContext::new().await;
    ctx.push_with("echo", "run", json!({}), Behavior::Echo).await;
    let state_dir = ctx.stop().await;

    let mut config = test_config(&state_dir);
    config.engines.clear();

    let ctx = CoreTestContext::start(config, state_dir.clone(), None).await;
    assert!(ctx.list().await.running.is_empty());

    let manifest = ManifestStore::new(state_dir.path()).load().unwrap();
    assert!(manifest.engines.is_empty());

    ctx.stop().await;
  }
}
