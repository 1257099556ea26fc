pub mod instagram;
pub mod resend;
pub mod tiktok;
pub mod twitch;
pub mod youtube;
pub mod youtube_api;

use serde::de::DeserializeOwned;
use serde_json::Value;

#[derive(Debug, Clone)]
pub struct ProviderError {
  pub provider: &'static str,
  pub status: Option<u16>,
  pub message: String,
}

impl ProviderError {
  pub fn new(provider: &'static str, status: Option<u16>, message: impl Into<String>) -> Self {
    Self {
      provider,
      status,
      message: message.into(),
    }
  }

  pub fn transport(provider: &'static str, err: impl std::fmt::Display) -> Self {
    Self::new(provider, None, err.to_string())
  }
}

impl std::fmt::Display for ProviderError {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match self.status {
      Some(code) => write!(f, "{} error (status={}): {}", self.provider, code, self.message),
      None => write!(f, "{} error: {}", self.provider, self.message),
    }
  }
}

impl std::error::Error for ProviderError {}

/// Pulls the most specific human-readable message out of a provider error body.
fn error_message_from_body(body: &str) -> String {
  let Ok(json) = serde_json::from_str::<Value>(body) else {
    return body.trim().to_string();
  };

  let nested = json.get("error").and_then(|e| e.get("message")).and_then(Value::as_str);
  let candidates = [
    json.get("error_description").and_then(Value::as_str),
    nested,
    json.get("message").and_then(Value::as_str),
    json.get("error_message").and_then(Value::as_str),
    json.get("error").and_then(Value::as_str),
  ];

  let message = candidates
    .into_iter()
    .flatten()
    .map(str::trim)
    .find(|v| !v.is_empty())
    .map(str::to_string)
    .unwrap_or_else(|| body.trim().to_string());
  message
}

/// Reads a provider response, turning non-2xx statuses into a `ProviderError`
/// that carries the provider's own message.
pub(crate) async fn read_json<T: DeserializeOwned>(
  provider: &'static str,
  response: reqwest::Response,
) -> Result<T, ProviderError> {
  let status = response.status();
  let text = response
    .text()
    .await
    .map_err(|e| ProviderError::new(provider, Some(status.as_u16()), e.to_string()))?;

  if !status.is_success() {
    return Err(ProviderError::new(
      provider,
      Some(status.as_u16()),
      error_message_from_body(&text),
    ));
  }

  serde_json::from_str::<T>(&text).map_err(|e| {
    ProviderError::new(provider, Some(status.as_u16()), format!("invalid json response: {e}"))
  })
}
