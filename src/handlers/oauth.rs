use bytes::Bytes;
use chrono::Utc;
use hyper::{Method, Request};
use serde::Deserialize;

use crate::auth::{authenticate, authenticate_user, Caller};
use crate::context::AppContext;
use crate::error::ApiError;
use crate::http::{
  ensure_method, ok_json, parse_json_body, parse_optional_json_body, preflight_response, query_param,
  redirect_response, HandlerResult,
};
use crate::models::Platform;
use crate::oauth::{self, callback_redirect, decode_state, encode_state, sanitize_return_path};

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StartRequest {
  #[serde(default)]
  return_to: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ExchangeRequest {
  #[serde(default)]
  code: Option<String>,
  #[serde(default)]
  redirect_uri: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RefreshRequest {
  #[serde(default)]
  platform: Option<String>,
  #[serde(default)]
  user_id: Option<String>,
}

fn oauth_platform(value: Option<&str>) -> Result<Platform, ApiError> {
  let raw = value.map(str::trim).filter(|v| !v.is_empty()).ok_or_else(|| ApiError::bad_request("platform is required"))?;
  Platform::parse(raw)
    .filter(Platform::supports_oauth)
    .ok_or_else(|| ApiError::BadRequest(format!("Unsupported platform: {raw}")))
}

/// `?platform=..&action=start|callback|exchange|refresh`
pub async fn handle(ctx: &AppContext, req: Request<Bytes>) -> HandlerResult {
  if req.method() == Method::OPTIONS {
    return preflight_response();
  }

  let action = query_param(req.uri(), "action").unwrap_or_else(|| "start".to_string());
  let platform_param = query_param(req.uri(), "platform");

  match action.as_str() {
    "start" => start(ctx, oauth_platform(platform_param.as_deref())?, &req),
    "callback" => callback(ctx, oauth_platform(platform_param.as_deref())?, &req),
    "exchange" => exchange(ctx, oauth_platform(platform_param.as_deref())?, &req).await,
    "refresh" => refresh(ctx, platform_param, &req).await,
    other => Err(ApiError::BadRequest(format!("Unknown action: {other}"))),
  }
}

fn start(ctx: &AppContext, platform: Platform, req: &Request<Bytes>) -> HandlerResult {
  ensure_method(req.method(), &[Method::GET, Method::POST])?;

  let return_to = if req.method() == Method::GET {
    query_param(req.uri(), "returnTo")
  } else {
    parse_optional_json_body::<StartRequest>(req.body())?.return_to
  };
  let state = encode_state(&sanitize_return_path(return_to.as_deref()));
  let url = oauth::authorize_url(&ctx.config, platform, &state)?;

  tracing::info!(%platform, "oauth start");
  if req.method() == Method::GET {
    redirect_response(&url)
  } else {
    ok_json(serde_json::json!({"success": true, "url": url, "state": state}))
  }
}

fn callback(ctx: &AppContext, platform: Platform, req: &Request<Bytes>) -> HandlerResult {
  ensure_method(req.method(), &[Method::GET])?;

  let uri = req.uri();
  let return_to = decode_state(query_param(uri, "state").as_deref());
  let error = query_param(uri, "error").filter(|v| !v.is_empty());
  let code = query_param(uri, "code").filter(|v| !v.is_empty());

  let location = match (error, code) {
    (Some(error), _) => {
      tracing::info!(%platform, %error, "oauth callback reported an error");
      callback_redirect(&ctx.config.app_base_url, &return_to, platform, "error", &error)
    }
    (None, Some(code)) => callback_redirect(&ctx.config.app_base_url, &return_to, platform, "code", &code),
    (None, None) => return Err(ApiError::bad_request("Missing code or error")),
  };
  redirect_response(&location)
}

async fn exchange(ctx: &AppContext, platform: Platform, req: &Request<Bytes>) -> HandlerResult {
  ensure_method(req.method(), &[Method::POST])?;
  let user_id = authenticate_user(&ctx.config, req.headers())?;
  let body: ExchangeRequest = parse_json_body(req.body())?;
  let code = body
    .code
    .as_deref()
    .map(str::trim)
    .filter(|c| !c.is_empty())
    .ok_or_else(|| ApiError::bad_request("code is required"))?;
  let store = ctx.store()?;

  let redirect_uri = body.redirect_uri.as_deref().map(str::trim).filter(|v| !v.is_empty());
  let tokens = oauth::exchange_code(&ctx.config, platform, code, redirect_uri).await?;
  let connection = store
    .upsert_connection(&tokens.into_upsert(&user_id, platform, Utc::now()))
    .await?;

  tracing::info!(%platform, user_id = %user_id, "oauth connection saved");
  ok_json(serde_json::json!({"success": true, "connection": connection.summary()}))
}

async fn refresh(ctx: &AppContext, platform_param: Option<String>, req: &Request<Bytes>) -> HandlerResult {
  ensure_method(req.method(), &[Method::POST])?;
  let caller = authenticate(&ctx.config, req.headers())?;
  let body: RefreshRequest = parse_optional_json_body(req.body())?;
  let platform = oauth_platform(platform_param.as_deref().or(body.platform.as_deref()))?;

  let user_id = match caller {
    Caller::User(id) => id,
    Caller::Internal => body
      .user_id
      .map(|v| v.trim().to_string())
      .filter(|v| !v.is_empty())
      .ok_or_else(|| ApiError::bad_request("userId is required"))?,
  };

  let store = ctx.store()?;
  let connection = store
    .fetch_connection(&user_id, platform)
    .await?
    .ok_or_else(|| ApiError::NotFound(format!("No {platform} connection found")))?;

  let tokens = oauth::refresh(
    &ctx.config,
    platform,
    &connection.access_token,
    connection.refresh_token.as_deref(),
  )
  .await?;
  let updated = store
    .update_connection_tokens(&user_id, platform, &tokens.into_token_update(Utc::now()))
    .await?
    .ok_or_else(|| ApiError::NotFound(format!("No {platform} connection found")))?;

  tracing::info!(%platform, user_id = %user_id, "oauth token refreshed");
  ok_json(serde_json::json!({"success": true, "connection": updated.summary()}))
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::sync::Arc;

  use hyper::{HeaderMap, StatusCode};

  use crate::config::OAuthAppConfig;
  use crate::models::ConnectionUpsert;
  use crate::store::{MemoryStore, Store};
  use crate::test_support::{internal_headers, request, response_json, test_config, user_headers, MockServer};

  fn tiktok_app() -> OAuthAppConfig {
    OAuthAppConfig {
      client_id: "ck".to_string(),
      client_secret: "cs".to_string(),
      redirect_uri: "https://api.example.com/api/oauth?platform=tiktok&action=callback".to_string(),
    }
  }

  fn context(store: Arc<MemoryStore>) -> AppContext {
    let mut config = test_config();
    config.tiktok = Some(tiktok_app());
    AppContext::new(config, Some(store as Arc<dyn Store>))
  }

  fn location(response: &vercel_runtime::Response<vercel_runtime::ResponseBody>) -> String {
    response.headers().get("location").unwrap().to_str().unwrap().to_string()
  }

  fn state_from(url: &str) -> String {
    let parsed = url::Url::parse(url).unwrap();
    parsed.query_pairs().find(|(k, _)| k == "state").unwrap().1.into_owned()
  }

  #[tokio::test]
  async fn start_get_redirects_with_encoded_return_path() {
    let ctx = context(Arc::new(MemoryStore::new()));
    let req = request(
      Method::GET,
      "/api/oauth?platform=tiktok&action=start&returnTo=%2Fdashboard%2Fclips",
      HeaderMap::new(),
      "",
    );
    let response = handle(&ctx, req).await.unwrap();
    assert_eq!(response.status(), StatusCode::FOUND);

    let url = location(&response);
    assert!(url.starts_with("https://www.tiktok.com/v2/auth/authorize/"));
    assert_eq!(decode_state(Some(&state_from(&url))), "/dashboard/clips");
  }

  #[tokio::test]
  async fn start_post_rejects_offsite_return_path() {
    let ctx = context(Arc::new(MemoryStore::new()));
    let req = request(
      Method::POST,
      "/api/oauth?platform=tiktok&action=start",
      HeaderMap::new(),
      r#"{"returnTo":"https://evil.example/phish"}"#,
    );
    let response = handle(&ctx, req).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let body = response_json(response).await;
    assert_eq!(body["success"], true);
    let state = body["state"].as_str().unwrap();
    assert_eq!(decode_state(Some(state)), "/dashboard/connections");
    assert!(body["url"].as_str().unwrap().contains(state));
  }

  #[tokio::test]
  async fn start_without_client_config_is_not_configured() {
    let ctx = context(Arc::new(MemoryStore::new()));
    let req = request(Method::GET, "/api/oauth?platform=twitch&action=start", HeaderMap::new(), "");
    let err = handle(&ctx, req).await.unwrap_err();
    assert_eq!(err.status(), StatusCode::NOT_IMPLEMENTED);
  }

  #[tokio::test]
  async fn callback_redirects_error_and_code_to_the_dashboard() {
    let ctx = context(Arc::new(MemoryStore::new()));
    let state = encode_state("/settings?tab=connections");

    let req = request(
      Method::GET,
      &format!("/api/oauth?platform=tiktok&action=callback&error=access_denied&state={state}"),
      HeaderMap::new(),
      "",
    );
    let response = handle(&ctx, req).await.unwrap();
    assert_eq!(response.status(), StatusCode::FOUND);
    assert_eq!(
      location(&response),
      "https://app.example.com/settings?tab=connections&tiktok_error=access_denied"
    );

    let req = request(
      Method::GET,
      "/api/oauth?platform=tiktok&action=callback&code=abc123",
      HeaderMap::new(),
      "",
    );
    let response = handle(&ctx, req).await.unwrap();
    assert_eq!(
      location(&response),
      "https://app.example.com/dashboard/connections?tiktok_code=abc123"
    );

    let req = request(Method::GET, "/api/oauth?platform=tiktok&action=callback", HeaderMap::new(), "");
    let err = handle(&ctx, req).await.unwrap_err();
    assert_eq!(err.status(), StatusCode::BAD_REQUEST);
  }

  #[tokio::test]
  async fn exchange_saves_the_connection_without_leaking_tokens() {
    let server = MockServer::start(vec![(
      200,
      r#"{"access_token":"act.9","refresh_token":"rft.9","expires_in":86400,"open_id":"open-1","scope":"user.info.basic","token_type":"Bearer"}"#,
    )])
    .await;
    let store = Arc::new(MemoryStore::new());
    let mut ctx = context(store.clone());
    ctx.config.endpoints.tiktok_token_url = server.url("/v2/oauth/token/");

    let req = request(
      Method::POST,
      "/api/oauth?platform=tiktok&action=exchange",
      user_headers("user-7"),
      r#"{"code":"c-1"}"#,
    );
    let response = handle(&ctx, req).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = response_json(response).await;
    assert_eq!(body["connection"]["platformUserId"], "open-1");
    assert!(!body.to_string().contains("act.9"));

    let saved = store.fetch_connection("user-7", Platform::Tiktok).await.unwrap().unwrap();
    assert_eq!(saved.access_token, "act.9");
    assert_eq!(saved.refresh_token.as_deref(), Some("rft.9"));
    assert!(saved.expires_at.is_some());
  }

  #[tokio::test]
  async fn exchange_surfaces_provider_error_verbatim() {
    let server = MockServer::start(vec![(
      200,
      r#"{"error":"invalid_grant","error_description":"Code is expired."}"#,
    )])
    .await;
    let store = Arc::new(MemoryStore::new());
    let mut ctx = context(store.clone());
    ctx.config.endpoints.tiktok_token_url = server.url("/v2/oauth/token/");

    let req = request(
      Method::POST,
      "/api/oauth?platform=tiktok&action=exchange",
      user_headers("user-7"),
      r#"{"code":"stale"}"#,
    );
    let err = handle(&ctx, req).await.unwrap_err();
    assert_eq!(err.status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(err.to_string(), "Code is expired.");
    assert!(store.list_connections("user-7").await.unwrap().is_empty());
  }

  #[tokio::test]
  async fn exchange_requires_a_user_token() {
    let ctx = context(Arc::new(MemoryStore::new()));
    let req = request(
      Method::POST,
      "/api/oauth?platform=tiktok&action=exchange",
      HeaderMap::new(),
      r#"{"code":"c"}"#,
    );
    let err = handle(&ctx, req).await.unwrap_err();
    assert_eq!(err.status(), StatusCode::UNAUTHORIZED);
  }

  #[tokio::test]
  async fn refresh_reports_missing_connection_and_missing_refresh_token() {
    let store = Arc::new(MemoryStore::new());
    let ctx = context(store.clone());

    let req = request(
      Method::POST,
      "/api/oauth?platform=tiktok&action=refresh",
      user_headers("user-1"),
      "",
    );
    assert_eq!(handle(&ctx, req).await.unwrap_err().status(), StatusCode::NOT_FOUND);

    store
      .upsert_connection(&ConnectionUpsert {
        user_id: "user-1".to_string(),
        platform: Platform::Tiktok,
        access_token: "old".to_string(),
        refresh_token: None,
        token_type: None,
        scope: None,
        expires_at: None,
        platform_user_id: None,
        platform_username: None,
      })
      .await
      .unwrap();
    let req = request(
      Method::POST,
      "/api/oauth?action=refresh",
      internal_headers(),
      r#"{"platform":"tiktok","userId":"user-1"}"#,
    );
    assert_eq!(handle(&ctx, req).await.unwrap_err().status(), StatusCode::BAD_REQUEST);
  }

  #[tokio::test]
  async fn refresh_updates_stored_tokens() {
    let server = MockServer::start(vec![(
      200,
      r#"{"access_token":"new","refresh_token":"rft.2","expires_in":3600,"open_id":"o","token_type":"Bearer"}"#,
    )])
    .await;
    let store = Arc::new(MemoryStore::new());
    let mut ctx = context(store.clone());
    ctx.config.endpoints.tiktok_token_url = server.url("/v2/oauth/token/");
    store
      .upsert_connection(&ConnectionUpsert {
        user_id: "user-1".to_string(),
        platform: Platform::Tiktok,
        access_token: "old".to_string(),
        refresh_token: Some("rft.1".to_string()),
        token_type: None,
        scope: Some("user.info.basic".to_string()),
        expires_at: None,
        platform_user_id: None,
        platform_username: None,
      })
      .await
      .unwrap();

    let req = request(
      Method::POST,
      "/api/oauth?platform=tiktok&action=refresh",
      user_headers("user-1"),
      "",
    );
    assert_eq!(handle(&ctx, req).await.unwrap().status(), StatusCode::OK);

    let saved = store.fetch_connection("user-1", Platform::Tiktok).await.unwrap().unwrap();
    assert_eq!(saved.access_token, "new");
    assert_eq!(saved.refresh_token.as_deref(), Some("rft.2"));
    assert_eq!(saved.scope.as_deref(), Some("user.info.basic"));
    assert_eq!(
      server.requests()[0].form_value("refresh_token").as_deref(),
      Some("rft.1")
    );
  }

  #[tokio::test]
  async fn options_is_a_preflight_and_kick_is_rejected() {
    let ctx = context(Arc::new(MemoryStore::new()));
    let req = request(Method::OPTIONS, "/api/oauth?platform=tiktok", HeaderMap::new(), "");
    assert_eq!(handle(&ctx, req).await.unwrap().status(), StatusCode::NO_CONTENT);

    let req = request(Method::GET, "/api/oauth?platform=kick&action=start", HeaderMap::new(), "");
    assert_eq!(handle(&ctx, req).await.unwrap_err().status(), StatusCode::BAD_REQUEST);
  }
}
