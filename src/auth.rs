use hyper::HeaderMap;
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::Deserialize;

use crate::config::AppConfig;
use crate::error::ApiError;
use crate::http::bearer_token;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Caller {
  /// A signed-in dashboard user (Supabase JWT `sub`).
  User(String),
  /// Another function or cron holding `INTERNAL_API_TOKEN`.
  Internal,
}

#[derive(Debug, Deserialize)]
struct SupabaseClaims {
  sub: String,
}

pub fn is_internal(config: &AppConfig, headers: &HeaderMap) -> bool {
  match (config.internal_token.as_deref(), bearer_token(headers)) {
    (Some(expected), Some(provided)) => !expected.is_empty() && provided == expected,
    _ => false,
  }
}

pub fn require_internal(config: &AppConfig, headers: &HeaderMap) -> Result<(), ApiError> {
  if is_internal(config, headers) {
    Ok(())
  } else {
    Err(ApiError::Unauthorized)
  }
}

/// Verifies a Supabase access token (HS256, audience `authenticated`) and returns its user id.
pub fn authenticate_user(config: &AppConfig, headers: &HeaderMap) -> Result<String, ApiError> {
  let secret = config
    .jwt_secret
    .as_deref()
    .ok_or_else(|| ApiError::NotConfigured("Missing SUPABASE_JWT_SECRET".to_string()))?;
  let token = bearer_token(headers).ok_or(ApiError::Unauthorized)?;

  let mut validation = Validation::new(Algorithm::HS256);
  validation.set_audience(&["authenticated"]);

  let data = decode::<SupabaseClaims>(token, &DecodingKey::from_secret(secret.as_bytes()), &validation).map_err(|e| {
    tracing::debug!(error = %e, "rejected user token");
    ApiError::Unauthorized
  })?;

  let sub = data.claims.sub.trim();
  if sub.is_empty() {
    return Err(ApiError::Unauthorized);
  }
  Ok(sub.to_string())
}

/// Internal token first, then a user JWT.
pub fn authenticate(config: &AppConfig, headers: &HeaderMap) -> Result<Caller, ApiError> {
  if is_internal(config, headers) {
    return Ok(Caller::Internal);
  }
  authenticate_user(config, headers).map(Caller::User)
}
