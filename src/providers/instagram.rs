use serde::Deserialize;
use serde_json::Value;

use crate::config::{OAuthAppConfig, ProviderEndpoints};
use crate::http_client::http_client_for_url;
use crate::oauth::OAuthTokens;
use crate::providers::{read_json, ProviderError};

const PROVIDER: &str = "instagram";

const GRAPH_VERSION: &str = "v21.0";

const SCOPES: &str = "instagram_business_basic,instagram_business_content_publish";

#[derive(Debug, Deserialize)]
struct ShortLivedToken {
  access_token: String,
  /// Numeric in practice; kept loose so a string id also parses.
  #[serde(default)]
  user_id: Option<Value>,
  #[serde(default)]
  permissions: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct LongLivedToken {
  access_token: String,
  #[serde(default)]
  token_type: Option<String>,
  #[serde(default)]
  expires_in: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct IdResponse {
  id: String,
}

fn id_to_string(value: &Value) -> Option<String> {
  match value {
    Value::String(s) if !s.is_empty() => Some(s.clone()),
    Value::Number(n) => Some(n.to_string()),
    _ => None,
  }
}

fn graph_url(endpoints: &ProviderEndpoints, path: &str) -> String {
  format!("{}/{}", endpoints.instagram_graph_base.trim_end_matches('/'), path)
}

pub fn build_authorize_url(
  app: &OAuthAppConfig,
  endpoints: &ProviderEndpoints,
  state: &str,
) -> Result<String, ProviderError> {
  let url = url::Url::parse_with_params(
    &endpoints.instagram_authorize_url,
    &[
      ("client_id", app.client_id.as_str()),
      ("redirect_uri", app.redirect_uri.as_str()),
      ("response_type", "code"),
      ("scope", SCOPES),
      ("state", state),
    ],
  )
  .map_err(|e| ProviderError::transport(PROVIDER, e))?;
  Ok(url.to_string())
}

async fn get_long_lived(
  url: &str,
  query: &[(&str, &str)],
) -> Result<LongLivedToken, ProviderError> {
  let client = http_client_for_url(url).map_err(|e| ProviderError::transport(PROVIDER, e))?;
  let response = client
    .get(url)
    .query(query)
    .send()
    .await
    .map_err(|e| ProviderError::transport(PROVIDER, e))?;
  read_json(PROVIDER, response).await
}

/// Code → short-lived token → long-lived (60 day) token.
pub async fn exchange_code(
  app: &OAuthAppConfig,
  endpoints: &ProviderEndpoints,
  code: &str,
  redirect_uri: &str,
) -> Result<OAuthTokens, ProviderError> {
  let url = endpoints.instagram_token_url.as_str();
  let client = http_client_for_url(url).map_err(|e| ProviderError::transport(PROVIDER, e))?;
  let response = client
    .post(url)
    .form(&[
      ("client_id", app.client_id.as_str()),
      ("client_secret", app.client_secret.as_str()),
      ("grant_type", "authorization_code"),
      ("redirect_uri", redirect_uri),
      ("code", code),
    ])
    .send()
    .await
    .map_err(|e| ProviderError::transport(PROVIDER, e))?;
  let short: ShortLivedToken = read_json(PROVIDER, response).await?;

  let long = get_long_lived(
    &graph_url(endpoints, "access_token"),
    &[
      ("grant_type", "ig_exchange_token"),
      ("client_secret", app.client_secret.as_str()),
      ("access_token", short.access_token.as_str()),
    ],
  )
  .await?;

  let scope = match short.permissions {
    Some(Value::Array(items)) => Some(
      items
        .iter()
        .filter_map(Value::as_str)
        .collect::<Vec<_>>()
        .join(","),
    ),
    Some(Value::String(s)) => Some(s),
    _ => None,
  };

  Ok(OAuthTokens {
    access_token: long.access_token,
    refresh_token: None,
    token_type: long.token_type,
    scope,
    expires_in_seconds: long.expires_in,
    platform_user_id: short.user_id.as_ref().and_then(id_to_string),
    platform_username: None,
  })
}

/// Long-lived tokens refresh themselves; there is no separate refresh token.
pub async fn refresh_long_lived_token(
  endpoints: &ProviderEndpoints,
  access_token: &str,
) -> Result<OAuthTokens, ProviderError> {
  let long = get_long_lived(
    &graph_url(endpoints, "refresh_access_token"),
    &[("grant_type", "ig_refresh_token"), ("access_token", access_token)],
  )
  .await?;

  Ok(OAuthTokens {
    access_token: long.access_token,
    refresh_token: None,
    token_type: long.token_type,
    scope: None,
    expires_in_seconds: long.expires_in,
    platform_user_id: None,
    platform_username: None,
  })
}

/// Creates a REELS container for `video_url` and publishes it. Returns the media id.
/// A failed publish leaves the container behind; it expires on Instagram's side.
pub async fn publish_reel(
  endpoints: &ProviderEndpoints,
  ig_user_id: &str,
  access_token: &str,
  video_url: &str,
  caption: Option<&str>,
) -> Result<String, ProviderError> {
  let media_url = graph_url(endpoints, &format!("{GRAPH_VERSION}/{ig_user_id}/media"));
  let client = http_client_for_url(&media_url).map_err(|e| ProviderError::transport(PROVIDER, e))?;

  let mut container = serde_json::json!({
    "media_type": "REELS",
    "video_url": video_url,
  });
  if let Some(caption) = caption {
    container["caption"] = Value::String(caption.to_string());
  }

  let response = client
    .post(&media_url)
    .bearer_auth(access_token)
    .json(&container)
    .send()
    .await
    .map_err(|e| ProviderError::transport(PROVIDER, e))?;
  let created: IdResponse = read_json(PROVIDER, response).await?;
  tracing::info!(container_id = %created.id, "instagram media container created");

  let publish_url = graph_url(endpoints, &format!("{GRAPH_VERSION}/{ig_user_id}/media_publish"));
  let response = client
    .post(&publish_url)
    .bearer_auth(access_token)
    .json(&serde_json::json!({ "creation_id": created.id }))
    .send()
    .await
    .map_err(|e| ProviderError::transport(PROVIDER, e))?;
  let published: IdResponse = read_json(PROVIDER, response).await?;

  Ok(published.id)
}
