use serde::Deserialize;

use crate::config::{OAuthAppConfig, ProviderEndpoints};
use crate::http_client::http_client_for_url;
use crate::oauth::OAuthTokens;
use crate::providers::{read_json, ProviderError};

const PROVIDER: &str = "twitch";

const SCOPES: &str = "user:read:email clips:edit";

#[derive(Debug, Deserialize)]
struct TokenResponse {
  access_token: String,
  #[serde(default)]
  refresh_token: Option<String>,
  #[serde(default)]
  expires_in: Option<u64>,
  #[serde(default)]
  scope: Vec<String>,
  #[serde(default)]
  token_type: Option<String>,
}

#[derive(Debug, Deserialize)]
struct HelixUsers {
  #[serde(default)]
  data: Vec<HelixUser>,
}

#[derive(Debug, Deserialize)]
struct HelixUser {
  id: String,
  login: String,
}

pub fn build_authorize_url(
  app: &OAuthAppConfig,
  endpoints: &ProviderEndpoints,
  state: &str,
) -> Result<String, ProviderError> {
  let url = url::Url::parse_with_params(
    &endpoints.twitch_authorize_url,
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

async fn post_token_form(
  endpoints: &ProviderEndpoints,
  form: &[(&str, &str)],
) -> Result<OAuthTokens, ProviderError> {
  let url = endpoints.twitch_token_url.as_str();
  let client = http_client_for_url(url).map_err(|e| ProviderError::transport(PROVIDER, e))?;
  let response = client
    .post(url)
    .form(form)
    .send()
    .await
    .map_err(|e| ProviderError::transport(PROVIDER, e))?;
  let token: TokenResponse = read_json(PROVIDER, response).await?;

  Ok(OAuthTokens {
    access_token: token.access_token,
    refresh_token: token.refresh_token,
    token_type: token.token_type,
    scope: (!token.scope.is_empty()).then(|| token.scope.join(" ")),
    expires_in_seconds: token.expires_in,
    platform_user_id: None,
    platform_username: None,
  })
}

pub async fn exchange_code(
  app: &OAuthAppConfig,
  endpoints: &ProviderEndpoints,
  code: &str,
  redirect_uri: &str,
) -> Result<OAuthTokens, ProviderError> {
  let mut tokens = post_token_form(
    endpoints,
    &[
      ("client_id", app.client_id.as_str()),
      ("client_secret", app.client_secret.as_str()),
      ("code", code),
      ("grant_type", "authorization_code"),
      ("redirect_uri", redirect_uri),
    ],
  )
  .await?;

  match fetch_current_user(app, endpoints, &tokens.access_token).await {
    Ok((id, login)) => {
      tokens.platform_user_id = Some(id);
      tokens.platform_username = Some(login);
    }
    Err(err) => tracing::warn!(error = %err, "twitch user lookup failed; saving connection without profile"),
  }
  Ok(tokens)
}

pub async fn refresh_tokens(
  app: &OAuthAppConfig,
  endpoints: &ProviderEndpoints,
  refresh_token: &str,
) -> Result<OAuthTokens, ProviderError> {
  post_token_form(
    endpoints,
    &[
      ("client_id", app.client_id.as_str()),
      ("client_secret", app.client_secret.as_str()),
      ("grant_type", "refresh_token"),
      ("refresh_token", refresh_token),
    ],
  )
  .await
}

/// Returns `(id, login)` of the user the token belongs to.
pub async fn fetch_current_user(
  app: &OAuthAppConfig,
  endpoints: &ProviderEndpoints,
  access_token: &str,
) -> Result<(String, String), ProviderError> {
  let url = format!("{}/users", endpoints.twitch_api_base.trim_end_matches('/'));
  let client = http_client_for_url(&url).map_err(|e| ProviderError::transport(PROVIDER, e))?;
  let response = client
    .get(&url)
    .bearer_auth(access_token)
    .header("client-id", &app.client_id)
    .send()
    .await
    .map_err(|e| ProviderError::transport(PROVIDER, e))?;
  let users: HelixUsers = read_json(PROVIDER, response).await?;

  users
    .data
    .into_iter()
    .next()
    .map(|u| (u.id, u.login))
    .ok_or_else(|| ProviderError::new(PROVIDER, None, "No Twitch user found for this token"))
}
