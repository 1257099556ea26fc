use serde::{Deserialize, Serialize};

use crate::http_client::http_client_for_url;
use crate::providers::{read_json, ProviderError};

const PROVIDER: &str = "resend";

#[derive(Debug, Clone, Serialize)]
pub struct OutgoingEmail {
  pub from: String,
  pub to: Vec<String>,
  pub subject: String,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub html: Option<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub text: Option<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub reply_to: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SendResponse {
  id: String,
}

/// Sends one email; returns the Resend message id.
pub async fn send_email(api_base: &str, api_key: &str, email: &OutgoingEmail) -> Result<String, ProviderError> {
  let url = format!("{}/emails", api_base.trim_end_matches('/'));
  let client = http_client_for_url(&url).map_err(|e| ProviderError::transport(PROVIDER, e))?;
  let response = client
    .post(&url)
    .bearer_auth(api_key)
    .json(email)
    .send()
    .await
    .map_err(|e| ProviderError::transport(PROVIDER, e))?;
  let sent: SendResponse = read_json(PROVIDER, response).await?;
  Ok(sent.id)
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::test_support::MockServer;

  fn email() -> OutgoingEmail {
    OutgoingEmail {
      from: "hello@clipdeck.example".to_string(),
      to: vec!["fan@example.com".to_string()],
      subject: "You're in".to_string(),
      html: Some("<p>hi</p>".to_string()),
      text: None,
      reply_to: None,
    }
  }

  #[tokio::test]
  async fn posts_message_with_api_key() {
    let server = MockServer::start(vec![(200, r#"{"id":"49a3999c-0ce1-4ea6-ab68-afcd6dc2e794"}"#)]).await;

    let id = send_email(&server.base_url, "re_test", &email()).await.unwrap();
    assert_eq!(id, "49a3999c-0ce1-4ea6-ab68-afcd6dc2e794");

    let requests = server.requests();
    assert_eq!(requests[0].path, "/emails");
    assert_eq!(requests[0].header("authorization").as_deref(), Some("Bearer re_test"));
    let body = requests[0].json();
    assert_eq!(body["to"], serde_json::json!(["fan@example.com"]));
    assert!(body.get("text").is_none());
  }

  #[tokio::test]
  async fn validation_errors_keep_resend_message() {
    let server = MockServer::start(vec![(
      422,
      r#"{"statusCode":422,"name":"validation_error","message":"Invalid `to` field."}"#,
    )])
    .await;

    let err = send_email(&server.base_url, "re_test", &email()).await.unwrap_err();
    assert_eq!(err.status, Some(422));
    assert_eq!(err.message, "Invalid `to` field.");
  }
}
