use bytes::Bytes;
use hyper::{Method, Request};
use serde_json::Value;

use crate::auth::require_internal;
use crate::context::AppContext;
use crate::error::ApiError;
use crate::handlers::sweep_response;
use crate::http::{ensure_method, ok_json, parse_optional_json_body, HandlerResult};
use crate::queue::{call_sibling, process_publishing_queue, SiblingPublisher, SweepRequest};

fn internal_token(ctx: &AppContext) -> Result<&str, ApiError> {
  ctx
    .config
    .internal_token
    .as_deref()
    .ok_or_else(|| ApiError::NotConfigured("Missing INTERNAL_API_TOKEN".to_string()))
}

/// Publishes due queue rows through the sibling publish function.
pub async fn process(ctx: &AppContext, req: Request<Bytes>) -> HandlerResult {
  ensure_method(req.method(), &[Method::GET, Method::POST])?;
  require_internal(&ctx.config, req.headers())?;

  let sweep: SweepRequest = parse_optional_json_body(req.body())?;
  let store = ctx.store()?;
  let publisher = SiblingPublisher {
    api_base_url: ctx.config.api_base_url()?.to_string(),
    internal_token: internal_token(ctx)?.to_string(),
  };
  let settings = &ctx.config.queue;

  let summary = process_publishing_queue(
    store,
    &publisher,
    settings,
    sweep.now(),
    sweep.limit(settings.batch_size),
  )
  .await?;

  tracing::info!(
    claimed = summary.claimed,
    reclaimed = summary.reclaimed,
    completed = summary.completed,
    retried = summary.retried,
    failed = summary.failed,
    "queue sweep finished"
  );
  sweep_response(&summary)
}

/// Cron entry point: runs the clip sweep, then the queue sweep, each through its
/// own function.
pub async fn auto(ctx: &AppContext, req: Request<Bytes>) -> HandlerResult {
  ensure_method(req.method(), &[Method::GET, Method::POST])?;
  require_internal(&ctx.config, req.headers())?;

  let sweep: Value = parse_optional_json_body::<Option<Value>>(req.body())?.unwrap_or_else(|| serde_json::json!({}));
  let api_base_url = ctx.config.api_base_url()?;
  let token = internal_token(ctx)?;

  let (clips, clips_error) = match call_sibling(api_base_url, "/api/clips/process", token, &sweep).await {
    Ok(reply) => (Some(reply), None),
    Err(err) => {
      tracing::warn!(error = %err.message, "clip sweep failed; continuing with queue sweep");
      (None, Some(err.message))
    }
  };

  let queue = call_sibling(api_base_url, "/api/queue/process", token, &sweep).await?;

  ok_json(serde_json::json!({
    "success": true,
    "clips": clips,
    "clipsError": clips_error,
    "queue": queue,
  }))
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::sync::Arc;

  use chrono::{Duration, Utc};
  use hyper::StatusCode;

  use crate::models::{Clip, ClipStatus, Platform, QueueEntry, QueueStatus};
  use crate::store::{MemoryStore, Store};
  use crate::test_support::{internal_headers, request, response_json, test_config, user_headers, MockServer, TEST_INTERNAL_TOKEN};

  fn queued(clip_id: &str, attempts: i32) -> QueueEntry {
    QueueEntry {
      id: 0,
      clip_id: clip_id.to_string(),
      user_id: "user-1".to_string(),
      platform: Platform::Tiktok,
      status: QueueStatus::Pending,
      attempts,
      max_attempts: 3,
      scheduled_for: Utc::now() - Duration::minutes(1),
      claim_token: None,
      claimed_at: None,
      last_error: None,
      platform_post_id: None,
    }
  }

  fn clip(id: &str) -> Clip {
    Clip {
      id: id.to_string(),
      user_id: "user-1".to_string(),
      title: None,
      video_url: None,
      caption: None,
      status: ClipStatus::Processing,
      score: Some(90.0),
      viral_metadata: None,
      last_error: None,
      created_at: Utc::now(),
    }
  }

  fn context(store: Arc<MemoryStore>, api_base_url: &str) -> AppContext {
    let mut config = test_config();
    config.api_base_url = Some(api_base_url.to_string());
    AppContext::new(config, Some(store as Arc<dyn Store>))
  }

  #[tokio::test]
  async fn publishes_due_rows_through_the_sibling() {
    let sibling = MockServer::start(vec![(200, r#"{"success":true,"postId":"demo_abc"}"#)]).await;
    let store = Arc::new(MemoryStore::new());
    store.insert_clip(clip("clip-1"));
    store.insert_queue_entry(queued("clip-1", 0));
    let ctx = context(store.clone(), &sibling.base_url);

    let req = request(Method::POST, "/api/queue/process", internal_headers(), "");
    let body = response_json(process(&ctx, req).await.unwrap()).await;
    assert_eq!(body["success"], true);
    assert_eq!(body["claimed"], 1);
    assert_eq!(body["completed"], 1);

    let entry = &store.queue_entries()[0];
    assert_eq!(entry.status, QueueStatus::Completed);
    assert_eq!(entry.platform_post_id.as_deref(), Some("demo_abc"));

    let sent = &sibling.requests()[0];
    assert_eq!(sent.path, "/api/publish");
    assert_eq!(sent.header("authorization"), Some(format!("Bearer {TEST_INTERNAL_TOKEN}")));
    assert_eq!(sent.json()["clipId"], "clip-1");
    assert_eq!(sent.json()["userId"], "user-1");
  }

  #[tokio::test]
  async fn exhausted_rows_fail_the_clip() {
    let sibling = MockServer::start(vec![(500, r#"{"success":false,"error":"No active tiktok connection"}"#)]).await;
    let store = Arc::new(MemoryStore::new());
    store.insert_clip(clip("clip-1"));
    store.insert_queue_entry(queued("clip-1", 2));
    let ctx = context(store.clone(), &sibling.base_url);

    let req = request(Method::GET, "/api/queue/process", internal_headers(), "");
    let body = response_json(process(&ctx, req).await.unwrap()).await;
    assert_eq!(body["failed"], 1);
    assert_eq!(body["lastError"], "No active tiktok connection");
    assert_eq!(store.queue_entries()[0].status, QueueStatus::Failed);
    assert_eq!(store.clip("clip-1").unwrap().status, ClipStatus::Failed);
  }

  #[tokio::test]
  async fn missing_api_base_url_is_not_configured() {
    let store = Arc::new(MemoryStore::new());
    let ctx = AppContext::new(test_config(), Some(store as Arc<dyn Store>));
    let req = request(Method::POST, "/api/queue/process", internal_headers(), "");
    assert_eq!(process(&ctx, req).await.unwrap_err().status(), StatusCode::NOT_IMPLEMENTED);

    let req = request(Method::POST, "/api/queue/process", user_headers("user-1"), "");
    assert_eq!(process(&ctx, req).await.unwrap_err().status(), StatusCode::UNAUTHORIZED);
  }

  #[tokio::test]
  async fn auto_runs_queue_sweep_even_when_clip_sweep_fails() {
    let sibling = MockServer::start(vec![
      (500, r#"{"success":false,"error":"scorer down"}"#),
      (200, r#"{"success":true,"claimed":0}"#),
    ])
    .await;
    let ctx = context(Arc::new(MemoryStore::new()), &sibling.base_url);

    let req = request(Method::POST, "/api/queue/auto", internal_headers(), r#"{"limit":3}"#);
    let body = response_json(auto(&ctx, req).await.unwrap()).await;
    assert_eq!(body["clipsError"], "scorer down");
    assert_eq!(body["queue"]["claimed"], 0);

    let sent = sibling.requests();
    assert_eq!(sent.len(), 2);
    assert_eq!(sent[0].path, "/api/clips/process");
    assert_eq!(sent[1].path, "/api/queue/process");
    assert_eq!(sent[1].json()["limit"], 3);
  }
}
