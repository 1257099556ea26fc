use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Duration, Utc};

use crate::config::AppConfig;
use crate::error::ApiError;
use crate::models::{ConnectionUpsert, Platform, TokenUpdate};
use crate::providers::{instagram, tiktok, twitch, youtube, youtube_api};

pub const DEFAULT_RETURN_PATH: &str = "/dashboard/connections";

/// Tokens as returned by any provider, normalised.
#[derive(Debug, Clone, Default)]
pub struct OAuthTokens {
  pub access_token: String,
  pub refresh_token: Option<String>,
  pub token_type: Option<String>,
  pub scope: Option<String>,
  pub expires_in_seconds: Option<u64>,
  pub platform_user_id: Option<String>,
  pub platform_username: Option<String>,
}

impl OAuthTokens {
  pub fn expires_at(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let secs = i64::try_from(self.expires_in_seconds?).ok()?;
    now.checked_add_signed(Duration::seconds(secs))
  }

  pub fn into_upsert(self, user_id: &str, platform: Platform, now: DateTime<Utc>) -> ConnectionUpsert {
    let expires_at = self.expires_at(now);
    ConnectionUpsert {
      user_id: user_id.to_string(),
      platform,
      access_token: self.access_token,
      refresh_token: self.refresh_token,
      token_type: self.token_type,
      scope: self.scope,
      expires_at,
      platform_user_id: self.platform_user_id,
      platform_username: self.platform_username,
    }
  }

  pub fn into_token_update(self, now: DateTime<Utc>) -> TokenUpdate {
    let expires_at = self.expires_at(now);
    TokenUpdate {
      access_token: self.access_token,
      refresh_token: self.refresh_token,
      token_type: self.token_type,
      scope: self.scope,
      expires_at,
    }
  }
}

/// Only same-origin absolute paths survive; anything else falls back to the default.
pub fn sanitize_return_path(candidate: Option<&str>) -> String {
  match candidate.map(str::trim) {
    Some(path) if path.starts_with('/') && !path.starts_with("//") && !path.contains('\\') => {
      path.to_string()
    }
    _ => DEFAULT_RETURN_PATH.to_string(),
  }
}

pub fn encode_state(return_to: &str) -> String {
  let payload = serde_json::json!({ "r": return_to });
  URL_SAFE_NO_PAD.encode(payload.to_string())
}

/// Recovers the return path from `state`. Unreadable state yields the default path.
pub fn decode_state(state: Option<&str>) -> String {
  let return_to = state
    .map(|s| s.trim().trim_end_matches('='))
    .and_then(|s| URL_SAFE_NO_PAD.decode(s).ok())
    .and_then(|bytes| serde_json::from_slice::<serde_json::Value>(&bytes).ok())
    .and_then(|json| json.get("r").and_then(|r| r.as_str()).map(str::to_string));
  sanitize_return_path(return_to.as_deref())
}

/// `<app base><return path>?<platform>_<key>=<value>`, using `&` when the path
/// already has a query string.
pub fn callback_redirect(app_base_url: &str, return_to: &str, platform: Platform, key: &str, value: &str) -> String {
  let param: String = url::form_urlencoded::Serializer::new(String::new())
    .append_pair(&format!("{platform}_{key}"), value)
    .finish();
  let separator = if return_to.contains('?') { '&' } else { '?' };
  format!("{}{}{}{}", app_base_url.trim_end_matches('/'), return_to, separator, param)
}

pub fn authorize_url(config: &AppConfig, platform: Platform, state: &str) -> Result<String, ApiError> {
  let app = config.oauth_app(platform)?;
  let endpoints = &config.endpoints;
  let url = match platform {
    Platform::Youtube => {
      let client = youtube::youtube_oauth_client(app, endpoints, None)?;
      youtube::build_authorize_url(&client, state)
    }
    Platform::Tiktok => tiktok::build_authorize_url(app, endpoints, state)?,
    Platform::Twitch => twitch::build_authorize_url(app, endpoints, state)?,
    Platform::Instagram => instagram::build_authorize_url(app, endpoints, state)?,
    Platform::Kick => return Err(unsupported(platform)),
  };
  Ok(url)
}

pub async fn exchange_code(
  config: &AppConfig,
  platform: Platform,
  code: &str,
  redirect_uri: Option<&str>,
) -> Result<OAuthTokens, ApiError> {
  let app = config.oauth_app(platform)?;
  let endpoints = &config.endpoints;
  let redirect_uri = redirect_uri.unwrap_or(&app.redirect_uri);

  let tokens = match platform {
    Platform::Youtube => {
      let client = youtube::youtube_oauth_client(app, endpoints, Some(redirect_uri))?;
      let mut tokens = youtube::exchange_code_for_tokens(&client, code).await?;
      match youtube_api::fetch_my_channel(&tokens.access_token, &endpoints.youtube_api_base).await {
        Ok(channel) => {
          tokens.platform_user_id = Some(channel.channel_id);
          tokens.platform_username = channel.title;
        }
        Err(err) => tracing::warn!(error = %err, "youtube channel lookup failed; saving connection without profile"),
      }
      tokens
    }
    Platform::Tiktok => tiktok::exchange_code(app, endpoints, code, redirect_uri).await?,
    Platform::Twitch => twitch::exchange_code(app, endpoints, code, redirect_uri).await?,
    Platform::Instagram => instagram::exchange_code(app, endpoints, code, redirect_uri).await?,
    Platform::Kick => return Err(unsupported(platform)),
  };
  Ok(tokens)
}

/// Refreshes with `refresh_token`; Instagram refreshes the long-lived access token itself.
pub async fn refresh(
  config: &AppConfig,
  platform: Platform,
  access_token: &str,
  refresh_token: Option<&str>,
) -> Result<OAuthTokens, ApiError> {
  if platform == Platform::Instagram {
    config.oauth_app(platform)?;
    return Ok(instagram::refresh_long_lived_token(&config.endpoints, access_token).await?);
  }

  let refresh_token = refresh_token
    .filter(|t| !t.is_empty())
    .ok_or_else(|| ApiError::bad_request(format!("No refresh token stored for {platform}")))?;
  let app = config.oauth_app(platform)?;
  let endpoints = &config.endpoints;

  let tokens = match platform {
    Platform::Youtube => {
      let client = youtube::youtube_oauth_client(app, endpoints, None)?;
      youtube::refresh_tokens(&client, refresh_token).await?
    }
    Platform::Tiktok => tiktok::refresh_tokens(app, endpoints, refresh_token).await?,
    Platform::Twitch => twitch::refresh_tokens(app, endpoints, refresh_token).await?,
    Platform::Instagram | Platform::Kick => return Err(unsupported(platform)),
  };
  Ok(tokens)
}

fn unsupported(platform: Platform) -> ApiError {
  ApiError::bad_request(format!("OAuth is not supported for {platform}"))
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn state_round_trips_return_path() {
    let state = encode_state("/dashboard/clips?tab=new");
    assert!(!state.contains('='));
    assert_eq!(decode_state(Some(&state)), "/dashboard/clips?tab=new");
  }

  #[test]
  fn garbage_or_offsite_state_falls_back_to_default() {
    assert_eq!(decode_state(None), DEFAULT_RETURN_PATH);
    assert_eq!(decode_state(Some("%%%")), DEFAULT_RETURN_PATH);
    assert_eq!(decode_state(Some(&encode_state("https://evil.example"))), DEFAULT_RETURN_PATH);
    assert_eq!(decode_state(Some(&encode_state("//evil.example"))), DEFAULT_RETURN_PATH);
  }

  #[test]
  fn callback_redirect_appends_with_correct_separator() {
    assert_eq!(
      callback_redirect("https://app.example.com", "/dashboard/connections", Platform::Tiktok, "code", "a b&c"),
      "https://app.example.com/dashboard/connections?tiktok_code=a+b%26c"
    );
    assert_eq!(
      callback_redirect("https://app.example.com/", "/settings?tab=2", Platform::Twitch, "error", "access_denied"),
      "https://app.example.com/settings?tab=2&twitch_error=access_denied"
    );
  }

  #[test]
  fn expires_at_is_relative_to_now() {
    let now = Utc::now();
    let tokens = OAuthTokens {
      access_token: "a".to_string(),
      expires_in_seconds: Some(3600),
      ..OAuthTokens::default()
    };
    assert_eq!(tokens.expires_at(now), Some(now + Duration::seconds(3600)));
    assert_eq!(OAuthTokens::default().expires_at(now), None);
  }

  #[test]
  fn kick_has_no_authorize_url() {
    let err = authorize_url(&AppConfig::default(), Platform::Kick, "s").unwrap_err();
    assert!(matches!(err, ApiError::NotConfigured(_)));
  }
}
