use serde::Deserialize;

use crate::config::{OAuthAppConfig, ProviderEndpoints};
use crate::http_client::http_client_for_url;
use crate::oauth::OAuthTokens;
use crate::providers::{read_json, ProviderError};

const PROVIDER: &str = "tiktok";

const SCOPES: &str = "user.info.basic,video.publish,video.upload";

#[derive(Debug, Deserialize)]
struct TokenResponse {
  #[serde(default)]
  access_token: Option<String>,
  #[serde(default)]
  refresh_token: Option<String>,
  #[serde(default)]
  expires_in: Option<u64>,
  #[serde(default)]
  open_id: Option<String>,
  #[serde(default)]
  scope: Option<String>,
  #[serde(default)]
  token_type: Option<String>,
  #[serde(default)]
  error: Option<String>,
  #[serde(default)]
  error_description: Option<String>,
}

pub fn build_authorize_url(
  app: &OAuthAppConfig,
  endpoints: &ProviderEndpoints,
  state: &str,
) -> Result<String, ProviderError> {
  let url = url::Url::parse_with_params(
    &endpoints.tiktok_authorize_url,
    &[
      ("client_key", app.client_id.as_str()),
      ("scope", SCOPES),
      ("response_type", "code"),
      ("redirect_uri", app.redirect_uri.as_str()),
      ("state", state),
    ],
  )
  .map_err(|e| ProviderError::transport(PROVIDER, e))?;
  Ok(url.to_string())
}

async fn post_token_form(
  endpoints: &ProviderEndpoints,
  form: &[(&str, &str)],
) -> Result<OAuthTokens, ProviderError> {
  let url = endpoints.tiktok_token_url.as_str();
  let client = http_client_for_url(url).map_err(|e| ProviderError::transport(PROVIDER, e))?;
  let response = client
    .post(url)
    .header("cache-control", "no-cache")
    .form(form)
    .send()
    .await
    .map_err(|e| ProviderError::transport(PROVIDER, e))?;
  let status = response.status().as_u16();
  let token: TokenResponse = read_json(PROVIDER, response).await?;

  // TikTok reports OAuth failures in a 200 body.
  if let Some(error) = token.error.as_deref().filter(|e| !e.is_empty()) {
    let message = token
      .error_description
      .filter(|d| !d.trim().is_empty())
      .unwrap_or_else(|| error.to_string());
    return Err(ProviderError::new(PROVIDER, Some(status), message));
  }

  let access_token = token
    .access_token
    .filter(|t| !t.is_empty())
    .ok_or_else(|| ProviderError::new(PROVIDER, Some(status), "Token response missing access_token"))?;

  Ok(OAuthTokens {
    access_token,
    refresh_token: token.refresh_token,
    token_type: token.token_type,
    scope: token.scope,
    expires_in_seconds: token.expires_in,
    platform_user_id: token.open_id,
    platform_username: None,
  })
}

pub async fn exchange_code(
  app: &OAuthAppConfig,
  endpoints: &ProviderEndpoints,
  code: &str,
  redirect_uri: &str,
) -> Result<OAuthTokens, ProviderError> {
  post_token_form(
    endpoints,
    &[
      ("client_key", app.client_id.as_str()),
      ("client_secret", app.client_secret.as_str()),
      ("code", code),
      ("grant_type", "authorization_code"),
      ("redirect_uri", redirect_uri),
    ],
  )
  .await
}

pub async fn refresh_tokens(
  app: &OAuthAppConfig,
  endpoints: &ProviderEndpoints,
  refresh_token: &str,
) -> Result<OAuthTokens, ProviderError> {
  post_token_form(
    endpoints,
    &[
      ("client_key", app.client_id.as_str()),
      ("client_secret", app.client_secret.as_str()),
      ("grant_type", "refresh_token"),
      ("refresh_token", refresh_token),
    ],
  )
  .await
}

/// Demo-mode publish: nothing leaves the process.
pub fn demo_publish_id() -> String {
  format!("demo_{}", uuid::Uuid::new_v4().simple())
}
