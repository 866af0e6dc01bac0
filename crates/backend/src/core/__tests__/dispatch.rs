//! Control request tests: push, drop, past, stats, list and route against
//! a running core with real engines and scripted workers.

#[cfg(test)]
mod tests {
  use std::sync::Arc;

  use pretty_assertions::assert_eq;
  use serde_json::json;
  use tempfile::TempDir;

  use crate::{
    core::{
      __tests__::helpers::{Behavior, CoreTestContext, test_config},
      job::UNPARSABLE_RESULT,
    },
    ipc::{Action, ControlError, Credentials, PastReply, PushReply, Request, StatsReply},
    routing::RoutingError,
    security::KnownUsers,
  };

  async fn stats(ctx: &CoreTestContext) -> StatsReply {
    serde_json::from_value(ctx.request(Action::Stats).await.unwrap()).unwrap()
  }

  async fn past(ctx: &CoreTestContext, driver_id: &str) -> Result<PastReply, ControlError> {
    ctx
      .request(Action::Past {
        driver_id: driver_id.to_string(),
      })
      .await
      .map(|value| serde_json::from_value(value).unwrap())
  }

  // ==========================================================================
  // Push
  // ==========================================================================

  #[tokio::test]
  async fn test_push_to_unknown_engine_has_no_side_effects() {
    let ctx = CoreTestContext::new().await;

    let result = ctx
      .request(Action::Push {
        engine: "x".to_string(),
        method: "run".to_string(),
        args: json!({}),
      })
      .await;
    assert_eq!(result, Err(ControlError::UnknownEngine("x".to_string())));

    let stats = stats(&ctx).await;
    assert!(stats.engines.is_empty());
    assert_eq!(stats.pending_jobs, 0);
    assert_eq!(stats.histories, 0);

    ctx.stop().await;
  }

  #[tokio::test]
  async fn test_push_round_trip_records_history() {
    let ctx = CoreTestContext::new().await;

    let reply = ctx.push_with("echo", "run", json!({ "n": 1 }), Behavior::Echo).await;
    let reply: PushReply = serde_json::from_value(reply).unwrap();
    assert_eq!(reply.driver, "echo/run");
    assert_eq!(reply.result, json!({ "n": 1 }));

    let reply = ctx.push_with("echo", "run", json!({ "n": 2 }), Behavior::Echo).await;
    assert_eq!(reply["result"], json!({ "n": 2 }));

    let history = past(&ctx, "echo/run").await.unwrap();
    let results: Vec<_> = history.entries.iter().map(|entry| entry.result().clone()).collect();
    assert_eq!(results, vec![json!({ "n": 1 }), json!({ "n": 2 })]);
    assert!(history.entries[0].timestamp() <= history.entries[1].timestamp());

    let stats = stats(&ctx).await;
    assert_eq!(stats.engines, vec!["echo".to_string()]);
    assert_eq!(stats.pending_jobs, 0);
    assert_eq!(stats.histories, 1);

    ctx.stop().await;
  }

  #[tokio::test]
  async fn test_unparsable_answer_becomes_error_result() {
    let ctx = CoreTestContext::new().await;

    let reply = ctx.push_with("echo", "run", json!({}), Behavior::Raw(b"not json")).await;
    assert_eq!(reply["result"], json!({ "error": UNPARSABLE_RESULT }));

    let history = past(&ctx, "echo/run").await.unwrap();
    assert_eq!(history.entries.len(), 1);

    ctx.stop().await;
  }

  #[tokio::test]
  async fn test_worker_error_is_recorded() {
    let ctx = CoreTestContext::new().await;

    let reply = ctx.push_with("echo", "fail", json!({}), Behavior::Fail(42, "boom")).await;
    assert_eq!(reply["result"], json!({ "error": "boom", "code": 42 }));

    let history = past(&ctx, "echo/fail").await.unwrap();
    assert_eq!(history.entries[0].result(), &json!({ "error": "boom", "code": 42 }));

    ctx.stop().await;
  }

  #[tokio::test]
  async fn test_published_results() {
    let ctx = CoreTestContext::new().await;
    let mut publications = ctx.handle.subscribe();

    ctx.push_with("echo", "run", json!({ "p": true }), Behavior::Echo).await;

    let publication = publications.recv().await.unwrap();
    assert_eq!(publication.driver, "echo/run");
    assert_eq!(publication.result, json!({ "p": true }));

    ctx.stop().await;
  }

  // ==========================================================================
  // Past / Drop
  // ==========================================================================

  #[tokio::test]
  async fn test_past_without_history() {
    let ctx = CoreTestContext::new().await;

    assert_eq!(
      past(&ctx, "nope").await,
      Err(ControlError::NoHistory("nope".to_string()))
    );

    ctx.stop().await;
  }

  #[tokio::test]
  async fn test_drop_engine() {
    let ctx = CoreTestContext::new().await;

    ctx.push_with("echo", "run", json!({}), Behavior::Echo).await;
    assert_eq!(stats(&ctx).await.engines.len(), 1);

    let reply = ctx
      .request(Action::Drop {
        engine: "echo".to_string(),
      })
      .await
      .unwrap();
    assert_eq!(reply, json!({ "ok": true }));
    assert!(stats(&ctx).await.engines.is_empty());

    // History outlives the engine
    assert!(past(&ctx, "echo/run").await.is_ok());

    let result = ctx
      .request(Action::Drop {
        engine: "echo".to_string(),
      })
      .await;
    assert_eq!(result, Err(ControlError::UnknownEngine("echo".to_string())));

    ctx.stop().await;
  }

  #[tokio::test]
  async fn test_push_after_drop_restarts_engine() {
    let ctx = CoreTestContext::new().await;

    ctx.push_with("echo", "run", json!({}), Behavior::Echo).await;
    ctx
      .request(Action::Drop {
        engine: "echo".to_string(),
      })
      .await
      .unwrap();

    let reply = ctx.push_with("echo", "run", json!({ "again": 1 }), Behavior::Echo).await;
    assert_eq!(reply["result"], json!({ "again": 1 }));

    ctx.stop().await;
  }

  // ==========================================================================
  // List / Route
  // ==========================================================================

  #[tokio::test]
  async fn test_list_configured_and_running() {
    let ctx = CoreTestContext::new().await;

    let list = ctx.list().await;
    assert_eq!(list.engines, vec!["echo".to_string()]);
    assert!(list.running.is_empty());

    ctx.push_with("echo", "run", json!({}), Behavior::Echo).await;
    let list = ctx.list().await;
    assert_eq!(list.running["echo"].len(), 1);

    ctx.stop().await;
  }

  #[tokio::test]
  async fn test_route() {
    let ctx = CoreTestContext::new().await;

    let reply = ctx
      .request(Action::Route {
        group: "storage".to_string(),
        key: Some("user:42".to_string()),
      })
      .await
      .unwrap();
    let backend = reply["backend"].as_str().unwrap().to_string();
    assert!(backend == "alpha" || backend == "beta");

    // Stable for the same key
    let again = ctx
      .request(Action::Route {
        group: "storage".to_string(),
        key: Some("user:42".to_string()),
      })
      .await
      .unwrap();
    assert_eq!(again["backend"], backend.as_str());

    let result = ctx
      .request(Action::Route {
        group: "missing".to_string(),
        key: None,
      })
      .await;
    assert_eq!(
      result,
      Err(ControlError::Routing(RoutingError::UnknownGroup("missing".to_string())))
    );

    assert_eq!(ctx.handle.router().route("storage", Some("user:42")).unwrap(), backend);

    ctx.stop().await;
  }

  // ==========================================================================
  // Raw lines / Verification
  // ==========================================================================

  #[tokio::test]
  async fn test_handle_line_errors() {
    let ctx = CoreTestContext::new().await;

    let reply = ctx.handle.handle_line(r#"{"id": 7, "action": "explode"}"#).await;
    assert_eq!(reply["id"], 7);
    assert_eq!(reply["error"], "UnknownCommand");

    let reply = ctx.handle.handle_line("{ nope").await;
    assert_eq!(reply["error"], "InvalidRequest");

    let reply = ctx.handle.handle_line(r#"{"id": "p", "action": "past", "driver_id": "a/b"}"#).await;
    assert_eq!(reply["id"], "p");
    assert_eq!(reply["error"], "NoHistory");

    let reply = ctx.handle.handle_line(r#"{"id": 1, "action": "stats"}"#).await;
    assert_eq!(reply["id"], 1);
    assert_eq!(reply["pending_jobs"], 0);

    ctx.stop().await;
  }

  #[tokio::test]
  async fn test_unknown_user_is_unauthorized() {
    let ctx = CoreTestContext::with_verifier(Arc::new(KnownUsers::new(["ops"]))).await;

    let result = ctx.handle.request(Request::new(Action::Stats)).await;
    assert!(matches!(result, Err(ControlError::Unauthorized(_))));

    let mut request = Request::new(Action::Stats);
    request.credentials = Some(Credentials {
      username: "ops".to_string(),
      signature: String::new(),
    });
    assert!(ctx.handle.request(request).await.is_ok());

    ctx.stop().await;
  }

  #[tokio::test]
  async fn test_configured_users_gate_requests() {
    let state_dir = Arc::new(TempDir::new().unwrap());
    let mut config = test_config(&state_dir);
    config.core.users = vec!["ops".to_string()];

    let ctx = CoreTestContext::start(config, state_dir, None).await;

    let result = ctx.handle.request(Request::new(Action::Stats)).await;
    assert_eq!(result, Err(ControlError::Unauthorized("credentials required".to_string())));

    let mut request = Request::new(Action::Stats);
    request.credentials = Some(Credentials {
      username: "ops".to_string(),
      signature: String::new(),
    });
    assert!(ctx.handle.request(request).await.is_ok());

    ctx.stop().await;
  }
}
