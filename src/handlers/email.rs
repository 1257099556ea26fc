use bytes::Bytes;
use hyper::{Method, Request};
use serde::Deserialize;

use crate::auth::require_internal;
use crate::context::AppContext;
use crate::error::ApiError;
use crate::http::{ensure_method, ok_json, parse_json_body, preflight_response, HandlerResult};
use crate::providers::resend::{send_email, OutgoingEmail};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SendRequest {
  #[serde(default)]
  to: Option<String>,
  #[serde(default)]
  subject: Option<String>,
  #[serde(default)]
  html: Option<String>,
  #[serde(default)]
  text: Option<String>,
  #[serde(default)]
  reply_to: Option<String>,
}

fn present(value: Option<String>) -> Option<String> {
  value.filter(|v| !v.trim().is_empty())
}

/// Loose shape check: one `@` with something on both sides and a dot in the domain.
pub(crate) fn looks_like_email(value: &str) -> bool {
  let value = value.trim();
  match value.split_once('@') {
    Some((local, domain)) => {
      !local.is_empty()
        && !domain.contains('@')
        && domain.contains('.')
        && !domain.starts_with('.')
        && !domain.ends_with('.')
        && !value.contains(char::is_whitespace)
    }
    None => false,
  }
}

pub async fn handle(ctx: &AppContext, req: Request<Bytes>) -> HandlerResult {
  if req.method() == Method::OPTIONS {
    return preflight_response();
  }
  ensure_method(req.method(), &[Method::POST])?;
  require_internal(&ctx.config, req.headers())?;

  let body: SendRequest = parse_json_body(req.body())?;
  let to = present(body.to)
    .map(|v| v.trim().to_string())
    .filter(|v| looks_like_email(v))
    .ok_or_else(|| ApiError::bad_request("A valid 'to' address is required"))?;
  let subject = present(body.subject).ok_or_else(|| ApiError::bad_request("subject is required"))?;
  let html = present(body.html);
  let text = present(body.text);
  if html.is_none() && text.is_none() {
    return Err(ApiError::bad_request("html or text is required"));
  }

  let api_key = ctx
    .config
    .resend_api_key
    .as_deref()
    .ok_or_else(|| ApiError::NotConfigured("Missing RESEND_API_KEY".to_string()))?;

  let email = OutgoingEmail {
    from: ctx.config.email_from.clone(),
    to: vec![to],
    subject,
    html,
    text,
    reply_to: present(body.reply_to),
  };
  let id = send_email(&ctx.config.endpoints.resend_api_base, api_key, &email).await?;
  tracing::info!(email_id = %id, "email relayed");

  ok_json(serde_json::json!({"success": true, "id": id}))
}
