use bytes::Bytes;
use hyper::{Method, Request};
use serde::Deserialize;

use crate::auth::{authenticate, Caller};
use crate::context::AppContext;
use crate::error::ApiError;
use crate::http::{ensure_method, ok_json, parse_json_body, preflight_response, HandlerResult};
use crate::models::{ClipStatus, Platform};
use crate::providers::{instagram, tiktok};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PublishRequest {
  #[serde(default)]
  clip_id: Option<String>,
  #[serde(default)]
  platform: Option<String>,
  #[serde(default)]
  user_id: Option<String>,
  #[serde(default)]
  caption: Option<String>,
}

fn required(value: Option<String>, field: &str) -> Result<String, ApiError> {
  value
    .map(|v| v.trim().to_string())
    .filter(|v| !v.is_empty())
    .ok_or_else(|| ApiError::BadRequest(format!("{field} is required")))
}

pub async fn handle(ctx: &AppContext, req: Request<Bytes>) -> HandlerResult {
  if req.method() == Method::OPTIONS {
    return preflight_response();
  }
  ensure_method(req.method(), &[Method::POST])?;

  let caller = authenticate(&ctx.config, req.headers())?;
  let body: PublishRequest = parse_json_body(req.body())?;
  let clip_id = required(body.clip_id, "clipId")?;
  let raw_platform = required(body.platform, "platform")?;
  let platform = Platform::parse(&raw_platform)
    .ok_or_else(|| ApiError::BadRequest(format!("Unsupported platform: {raw_platform}")))?;
  if !platform.supports_publishing() {
    return Err(ApiError::BadRequest(format!("Publishing is not supported for {platform}")));
  }

  let user_id = match caller {
    Caller::User(id) => id,
    Caller::Internal => required(body.user_id, "userId")?,
  };

  let store = ctx.store()?;
  let clip = store
    .fetch_clip(&clip_id)
    .await?
    .ok_or_else(|| ApiError::NotFound("Clip not found".to_string()))?;
  if clip.user_id != user_id {
    return Err(ApiError::Forbidden("Clip belongs to another user".to_string()));
  }

  let connection = store
    .fetch_connection(&user_id, platform)
    .await?
    .filter(|c| c.is_active)
    .ok_or_else(|| ApiError::BadRequest(format!("No active {platform} connection")))?;

  let caption = body
    .caption
    .filter(|c| !c.trim().is_empty())
    .or_else(|| clip.caption.clone());

  let (post_id, demo) = match platform {
    Platform::Tiktok => {
      if !ctx.config.tiktok_demo_mode {
        return Err(ApiError::NotConfigured(
          "TikTok publishing is only available in demo mode (TIKTOK_DEMO_MODE)".to_string(),
        ));
      }
      (tiktok::demo_publish_id(), true)
    }
    Platform::Instagram => {
      let video_url = clip
        .video_url
        .as_deref()
        .filter(|u| !u.is_empty())
        .ok_or_else(|| ApiError::bad_request("Clip has no video_url"))?;
      let ig_user_id = connection
        .platform_user_id
        .as_deref()
        .ok_or_else(|| ApiError::bad_request("Instagram connection is missing its account id"))?;
      let media_id = instagram::publish_reel(
        &ctx.config.endpoints,
        ig_user_id,
        &connection.access_token,
        video_url,
        caption.as_deref(),
      )
      .await?;
      (media_id, false)
    }
    _ => return Err(ApiError::BadRequest(format!("Publishing is not supported for {platform}"))),
  };

  store.set_clip_status(&clip.id, ClipStatus::Published, None).await?;
  tracing::info!(clip_id = %clip.id, %platform, post_id = %post_id, demo, "clip published");

  ok_json(serde_json::json!({
    "success": true,
    "platform": platform,
    "postId": post_id,
    "demo": demo,
  }))
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::sync::Arc;

  use chrono::Utc;
  use hyper::StatusCode;

  use crate::models::{Clip, ConnectionUpsert};
  use crate::store::{MemoryStore, Store};
  use crate::test_support::{internal_headers, request, response_json, test_config, user_headers, MockServer};

  fn clip(id: &str, user_id: &str) -> Clip {
    Clip {
      id: id.to_string(),
      user_id: user_id.to_string(),
      title: Some("1v5 clutch".to_string()),
      video_url: Some("https://cdn.example.com/clutch.mp4".to_string()),
      caption: Some("unreal".to_string()),
      status: ClipStatus::Processing,
      score: Some(91.0),
      viral_metadata: None,
      last_error: None,
      created_at: Utc::now(),
    }
  }

  async fn connect(store: &MemoryStore, user_id: &str, platform: Platform, platform_user_id: Option<&str>) {
    store
      .upsert_connection(&ConnectionUpsert {
        user_id: user_id.to_string(),
        platform,
        access_token: "ig-token".to_string(),
        refresh_token: None,
        token_type: None,
        scope: None,
        expires_at: None,
        platform_user_id: platform_user_id.map(str::to_string),
        platform_username: None,
      })
      .await
      .unwrap();
  }

  fn setup() -> (Arc<MemoryStore>, AppContext) {
    let store = Arc::new(MemoryStore::new());
    store.insert_clip(clip("clip-1", "user-1"));
    let ctx = AppContext::new(test_config(), Some(store.clone() as Arc<dyn Store>));
    (store, ctx)
  }

  #[tokio::test]
  async fn tiktok_demo_publish_marks_clip_published() {
    let (store, ctx) = setup();
    connect(&store, "user-1", Platform::Tiktok, None).await;

    let req = request(
      Method::POST,
      "/api/publish",
      user_headers("user-1"),
      r#"{"clipId":"clip-1","platform":"tiktok"}"#,
    );
    let response = handle(&ctx, req).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = response_json(response).await;
    assert_eq!(body["demo"], true);
    assert!(body["postId"].as_str().unwrap().starts_with("demo_"));
    assert_eq!(store.clip("clip-1").unwrap().status, ClipStatus::Published);
  }

  #[tokio::test]
  async fn tiktok_without_demo_mode_is_not_implemented() {
    let (store, mut ctx) = setup();
    ctx.config.tiktok_demo_mode = false;
    connect(&store, "user-1", Platform::Tiktok, None).await;

    let req = request(
      Method::POST,
      "/api/publish",
      user_headers("user-1"),
      r#"{"clipId":"clip-1","platform":"tiktok"}"#,
    );
    assert_eq!(handle(&ctx, req).await.unwrap_err().status(), StatusCode::NOT_IMPLEMENTED);
    assert_eq!(store.clip("clip-1").unwrap().status, ClipStatus::Processing);
  }

  #[tokio::test]
  async fn internal_caller_publishes_reel_for_user() {
    let server = MockServer::start(vec![(200, r#"{"id":"container-7"}"#), (200, r#"{"id":"media-7"}"#)]).await;
    let (store, mut ctx) = setup();
    ctx.config.endpoints.instagram_graph_base = server.base_url.clone();
    connect(&store, "user-1", Platform::Instagram, Some("ig-42")).await;

    let req = request(
      Method::POST,
      "/api/publish",
      internal_headers(),
      r#"{"clipId":"clip-1","platform":"instagram","userId":"user-1"}"#,
    );
    let body = response_json(handle(&ctx, req).await.unwrap()).await;
    assert_eq!(body["postId"], "media-7");

    let requests = server.requests();
    assert_eq!(requests[0].path, "/v21.0/ig-42/media");
    assert_eq!(requests[0].json()["caption"], "unreal");
    assert_eq!(requests[0].header("authorization").as_deref(), Some("Bearer ig-token"));
  }

  #[tokio::test]
  async fn ownership_and_connection_are_enforced() {
    let (store, ctx) = setup();

    let req = request(
      Method::POST,
      "/api/publish",
      user_headers("user-1"),
      r#"{"clipId":"missing","platform":"tiktok"}"#,
    );
    assert_eq!(handle(&ctx, req).await.unwrap_err().status(), StatusCode::NOT_FOUND);

    let req = request(
      Method::POST,
      "/api/publish",
      user_headers("intruder"),
      r#"{"clipId":"clip-1","platform":"tiktok"}"#,
    );
    assert_eq!(handle(&ctx, req).await.unwrap_err().status(), StatusCode::FORBIDDEN);

    let req = request(
      Method::POST,
      "/api/publish",
      user_headers("user-1"),
      r#"{"clipId":"clip-1","platform":"tiktok"}"#,
    );
    let err = handle(&ctx, req).await.unwrap_err();
    assert_eq!(err.status(), StatusCode::BAD_REQUEST);
    assert_eq!(err.to_string(), "No active tiktok connection");

    let req = request(
      Method::POST,
      "/api/publish",
      user_headers("user-1"),
      r#"{"clipId":"clip-1","platform":"twitch"}"#,
    );
    assert_eq!(handle(&ctx, req).await.unwrap_err().status(), StatusCode::BAD_REQUEST);
    assert_eq!(store.clip("clip-1").unwrap().status, ClipStatus::Processing);
  }

  #[tokio::test]
  async fn internal_caller_must_name_the_user() {
    let (_store, ctx) = setup();
    let req = request(
      Method::POST,
      "/api/publish",
      internal_headers(),
      r#"{"clipId":"clip-1","platform":"tiktok"}"#,
    );
    assert_eq!(handle(&ctx, req).await.unwrap_err().status(), StatusCode::BAD_REQUEST);
  }
}
