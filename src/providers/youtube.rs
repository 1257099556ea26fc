use oauth2::basic::BasicClient;
use oauth2::{
  AuthUrl, AuthorizationCode, ClientId, ClientSecret, CsrfToken, EndpointNotSet, EndpointSet,
  RedirectUrl, RefreshToken, Scope, TokenResponse, TokenUrl,
};

use crate::config::{OAuthAppConfig, ProviderEndpoints};
use crate::oauth::OAuthTokens;
use crate::providers::ProviderError;

const PROVIDER: &str = "youtube";

const SCOPES: [&str; 2] = [
  "https://www.googleapis.com/auth/youtube.readonly",
  "https://www.googleapis.com/auth/youtube.upload",
];

pub type YoutubeOAuthClient =
  BasicClient<EndpointSet, EndpointNotSet, EndpointNotSet, EndpointNotSet, EndpointSet>;

pub fn youtube_oauth_client(
  app: &OAuthAppConfig,
  endpoints: &ProviderEndpoints,
  redirect_uri: Option<&str>,
) -> Result<YoutubeOAuthClient, ProviderError> {
  let auth_url = AuthUrl::new(endpoints.google_auth_url.clone())
    .map_err(|e| ProviderError::transport(PROVIDER, e))?;
  let token_url = TokenUrl::new(endpoints.google_token_url.clone())
    .map_err(|e| ProviderError::transport(PROVIDER, e))?;
  let redirect_url = RedirectUrl::new(redirect_uri.unwrap_or(&app.redirect_uri).to_string())
    .map_err(|e| ProviderError::transport(PROVIDER, e))?;

  Ok(
    BasicClient::new(ClientId::new(app.client_id.clone()))
      .set_client_secret(ClientSecret::new(app.client_secret.clone()))
      .set_auth_uri(auth_url)
      .set_token_uri(token_url)
      .set_redirect_uri(redirect_url),
  )
}

pub fn build_authorize_url(client: &YoutubeOAuthClient, state: &str) -> String {
  let state = state.to_string();
  let mut request = client.authorize_url(|| CsrfToken::new(state));
  for scope in SCOPES {
    request = request.add_scope(Scope::new(scope.to_string()));
  }
  let (url, _csrf) = request
    .add_extra_param("access_type", "offline")
    .add_extra_param("prompt", "consent")
    .add_extra_param("include_granted_scopes", "true")
    .url();
  url.to_string()
}

fn oauth_http_client() -> Result<oauth2::reqwest::Client, ProviderError> {
  oauth2::reqwest::ClientBuilder::new()
    .redirect(oauth2::reqwest::redirect::Policy::none())
    .build()
    .map_err(|e| ProviderError::transport(PROVIDER, e))
}

fn tokens_from_response(token: &oauth2::basic::BasicTokenResponse) -> OAuthTokens {
  OAuthTokens {
    access_token: token.access_token().secret().to_string(),
    refresh_token: token.refresh_token().map(|t| t.secret().to_string()),
    token_type: Some(token.token_type().as_ref().to_string()),
    scope: token
      .scopes()
      .map(|scopes| scopes.iter().map(|s| s.as_str()).collect::<Vec<_>>().join(" ")),
    expires_in_seconds: token.expires_in().map(|d| d.as_secs()),
    platform_user_id: None,
    platform_username: None,
  }
}

pub async fn exchange_code_for_tokens(
  client: &YoutubeOAuthClient,
  code: &str,
) -> Result<OAuthTokens, ProviderError> {
  let http_client = oauth_http_client()?;
  let token = client
    .exchange_code(AuthorizationCode::new(code.to_string()))
    .request_async(&http_client)
    .await
    .map_err(|e| ProviderError::new(PROVIDER, None, e.to_string()))?;
  Ok(tokens_from_response(&token))
}

pub async fn refresh_tokens(
  client: &YoutubeOAuthClient,
  refresh_token: &str,
) -> Result<OAuthTokens, ProviderError> {
  let http_client = oauth_http_client()?;
  let token = client
    .exchange_refresh_token(&RefreshToken::new(refresh_token.to_string()))
    .request_async(&http_client)
    .await
    .map_err(|e| ProviderError::new(PROVIDER, None, e.to_string()))?;
  Ok(tokens_from_response(&token))
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn builds_google_authorize_url_with_offline_access() {
    let app = OAuthAppConfig {
      client_id: "id".to_string(),
      client_secret: "secret".to_string(),
      redirect_uri: "https://example.com/cb".to_string(),
    };
    let client = youtube_oauth_client(&app, &ProviderEndpoints::default(), None).unwrap();

    let url = build_authorize_url(&client, "state123");
    assert!(url.contains("accounts.google.com/o/oauth2/v2/auth"));
    assert!(url.contains("scope=https%3A%2F%2Fwww.googleapis.com%2Fauth%2Fyoutube.readonly"));
    assert!(url.contains("youtube.upload"));
    assert!(url.contains("access_type=offline"));
    assert!(url.contains("prompt=consent"));
    assert!(url.contains("state=state123"));
    assert!(url.contains("redirect_uri=https%3A%2F%2Fexample.com%2Fcb"));
  }
}
