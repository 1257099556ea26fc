use bytes::Bytes;
use chrono::{DateTime, Duration, Utc};
use hyper::{Method, Request};
use serde::Deserialize;

use crate::auth::authenticate_user;
use crate::context::AppContext;
use crate::error::ApiError;
use crate::http::{ok_json, parse_json_body, parse_optional_json_body, preflight_response, query_param, HandlerResult};
use crate::models::{ConnectionUpsert, Platform};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AuthData {
  #[serde(default)]
  access_token: Option<String>,
  #[serde(default)]
  refresh_token: Option<String>,
  #[serde(default)]
  expires_in: Option<i64>,
  #[serde(default)]
  expires_at: Option<DateTime<Utc>>,
  #[serde(default)]
  scope: Option<String>,
  #[serde(default)]
  token_type: Option<String>,
  #[serde(default)]
  platform_user_id: Option<String>,
  #[serde(default)]
  username: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SaveRequest {
  #[serde(default)]
  platform: Option<String>,
  #[serde(default)]
  auth_data: Option<AuthData>,
}

#[derive(Debug, Default, Deserialize)]
struct DeleteRequest {
  #[serde(default)]
  platform: Option<String>,
}

fn parse_platform(value: Option<&str>) -> Result<Platform, ApiError> {
  let raw = value
    .map(str::trim)
    .filter(|v| !v.is_empty())
    .ok_or_else(|| ApiError::bad_request("platform is required"))?;
  Platform::parse(raw).ok_or_else(|| ApiError::BadRequest(format!("Unsupported platform: {raw}")))
}

fn non_empty(value: Option<String>) -> Option<String> {
  value.map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

pub async fn handle(ctx: &AppContext, req: Request<Bytes>) -> HandlerResult {
  let method = req.method().clone();
  if method == Method::OPTIONS {
    return preflight_response();
  }

  let is_delete = method == Method::DELETE
    || (method == Method::POST && query_param(req.uri(), "action").as_deref() == Some("delete"));

  if is_delete {
    delete(ctx, &req).await
  } else if method == Method::POST {
    save(ctx, &req).await
  } else if method == Method::GET {
    list(ctx, &req).await
  } else {
    Err(ApiError::MethodNotAllowed)
  }
}

async fn save(ctx: &AppContext, req: &Request<Bytes>) -> HandlerResult {
  let user_id = authenticate_user(&ctx.config, req.headers())?;
  let body: SaveRequest = parse_json_body(req.body())?;
  let platform = parse_platform(body.platform.as_deref())?;
  let auth = body
    .auth_data
    .ok_or_else(|| ApiError::bad_request("authData is required"))?;
  let access_token =
    non_empty(auth.access_token).ok_or_else(|| ApiError::bad_request("authData.accessToken is required"))?;

  let now = Utc::now();
  let expires_at = auth.expires_at.or_else(|| {
    auth
      .expires_in
      .filter(|secs| *secs > 0)
      .and_then(|secs| now.checked_add_signed(Duration::seconds(secs)))
  });

  let store = ctx.store()?;
  let connection = store
    .upsert_connection(&ConnectionUpsert {
      user_id: user_id.clone(),
      platform,
      access_token,
      refresh_token: non_empty(auth.refresh_token),
      token_type: non_empty(auth.token_type).or_else(|| Some("Bearer".to_string())),
      scope: non_empty(auth.scope),
      expires_at,
      platform_user_id: non_empty(auth.platform_user_id),
      platform_username: non_empty(auth.username),
    })
    .await?;

  tracing::info!(%platform, user_id = %user_id, "connection saved");
  ok_json(serde_json::json!({"success": true, "connection": connection.summary()}))
}

async fn delete(ctx: &AppContext, req: &Request<Bytes>) -> HandlerResult {
  let user_id = authenticate_user(&ctx.config, req.headers())?;
  let body: DeleteRequest = parse_optional_json_body(req.body())?;
  let platform = parse_platform(body.platform.as_deref().or(query_param(req.uri(), "platform").as_deref()))?;

  let deleted = ctx.store()?.delete_connection(&user_id, platform).await?;
  tracing::info!(%platform, user_id = %user_id, deleted, "connection deleted");
  ok_json(serde_json::json!({"success": true, "deleted": deleted}))
}

async fn list(ctx: &AppContext, req: &Request<Bytes>) -> HandlerResult {
  let user_id = authenticate_user(&ctx.config, req.headers())?;
  let connections = ctx.store()?.list_connections(&user_id).await?;
  let summaries: Vec<_> = connections.iter().map(|c| c.summary()).collect();
  ok_json(serde_json::json!({"success": true, "connections": summaries}))
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::sync::Arc;

  use hyper::{HeaderMap, StatusCode};

  use crate::store::{MemoryStore, Store};
  use crate::test_support::{request, response_json, test_config, user_headers};

  fn context(store: Arc<MemoryStore>) -> AppContext {
    AppContext::new(test_config(), Some(store as Arc<dyn Store>))
  }

  #[tokio::test]
  async fn saving_kick_tokens_creates_one_row() {
    let store = Arc::new(MemoryStore::new());
    let ctx = context(store.clone());

    let req = request(
      Method::POST,
      "/api/connections",
      user_headers("user-1"),
      r#"{"platform":"kick","authData":{"accessToken":"tok123"}}"#,
    );
    let response = handle(&ctx, req).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let saved = store.fetch_connection("user-1", Platform::Kick).await.unwrap().unwrap();
    assert_eq!(saved.access_token, "tok123");
    assert_eq!(saved.refresh_token, None);
    assert!(saved.is_active);
  }

  #[tokio::test]
  async fn saving_twice_updates_instead_of_duplicating() {
    let store = Arc::new(MemoryStore::new());
    let ctx = context(store.clone());

    for (token, expires_in) in [("first", 60), ("second", 3600)] {
      let body = format!(
        r#"{{"platform":"twitch","authData":{{"accessToken":"{token}","refreshToken":"r-{token}","expiresIn":{expires_in},"username":"streamer"}}}}"#
      );
      let req = request(Method::POST, "/api/connections", user_headers("user-1"), &body);
      assert_eq!(handle(&ctx, req).await.unwrap().status(), StatusCode::OK);
    }

    let rows = store.list_connections("user-1").await.unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].access_token, "second");
    assert_eq!(rows[0].refresh_token.as_deref(), Some("r-second"));
    assert_eq!(rows[0].platform_username.as_deref(), Some("streamer"));
    assert!(rows[0].expires_at.unwrap() > Utc::now() + Duration::seconds(3000));
  }

  #[tokio::test]
  async fn save_validates_platform_and_access_token() {
    let ctx = context(Arc::new(MemoryStore::new()));

    let req = request(
      Method::POST,
      "/api/connections",
      user_headers("user-1"),
      r#"{"platform":"myspace","authData":{"accessToken":"t"}}"#,
    );
    assert_eq!(handle(&ctx, req).await.unwrap_err().status(), StatusCode::BAD_REQUEST);

    let req = request(
      Method::POST,
      "/api/connections",
      user_headers("user-1"),
      r#"{"platform":"kick","authData":{}}"#,
    );
    assert_eq!(handle(&ctx, req).await.unwrap_err().status(), StatusCode::BAD_REQUEST);
  }

  #[tokio::test]
  async fn deleting_a_missing_connection_still_succeeds() {
    let ctx = context(Arc::new(MemoryStore::new()));
    let req = request(
      Method::DELETE,
      "/api/connections",
      user_headers("user-1"),
      r#"{"platform":"youtube"}"#,
    );
    let response = handle(&ctx, req).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
      response_json(response).await,
      serde_json::json!({"success": true, "deleted": 0})
    );
  }

  #[tokio::test]
  async fn post_delete_action_removes_only_the_callers_row() {
    let store = Arc::new(MemoryStore::new());
    let ctx = context(store.clone());
    for user in ["user-1", "user-2"] {
      let req = request(
        Method::POST,
        "/api/connections",
        user_headers(user),
        r#"{"platform":"tiktok","authData":{"accessToken":"t"}}"#,
      );
      handle(&ctx, req).await.unwrap();
    }

    let req = request(
      Method::POST,
      "/api/connections?action=delete",
      user_headers("user-1"),
      r#"{"platform":"tiktok"}"#,
    );
    let body = response_json(handle(&ctx, req).await.unwrap()).await;
    assert_eq!(body["deleted"], 1);
    assert!(store.fetch_connection("user-1", Platform::Tiktok).await.unwrap().is_none());
    assert!(store.fetch_connection("user-2", Platform::Tiktok).await.unwrap().is_some());
  }

  #[tokio::test]
  async fn list_hides_token_material() {
    let ctx = context(Arc::new(MemoryStore::new()));
    let req = request(
      Method::POST,
      "/api/connections",
      user_headers("user-1"),
      r#"{"platform":"instagram","authData":{"accessToken":"secret-token","platformUserId":"ig-1"}}"#,
    );
    handle(&ctx, req).await.unwrap();

    let req = request(Method::GET, "/api/connections", user_headers("user-1"), "");
    let body = response_json(handle(&ctx, req).await.unwrap()).await;
    assert_eq!(body["connections"][0]["platform"], "instagram");
    assert_eq!(body["connections"][0]["platformUserId"], "ig-1");
    assert!(!body.to_string().contains("secret-token"));
  }

  #[tokio::test]
  async fn unauthenticated_and_unsupported_methods_are_rejected() {
    let ctx = context(Arc::new(MemoryStore::new()));
    let req = request(Method::GET, "/api/connections", HeaderMap::new(), "");
    assert_eq!(handle(&ctx, req).await.unwrap_err().status(), StatusCode::UNAUTHORIZED);

    let req = request(Method::PUT, "/api/connections", user_headers("user-1"), "{}");
    assert_eq!(handle(&ctx, req).await.unwrap_err().status(), StatusCode::METHOD_NOT_ALLOWED);

    let req = request(Method::OPTIONS, "/api/connections", HeaderMap::new(), "");
    assert_eq!(handle(&ctx, req).await.unwrap().status(), StatusCode::NO_CONTENT);
  }
}
