use bytes::Bytes;
use hyper::{Method, Request};
use serde::Deserialize;

use crate::context::AppContext;
use crate::error::ApiError;
use crate::handlers::email::looks_like_email;
use crate::http::{ok_json, parse_json_body, preflight_response, HandlerResult};
use crate::models::{JoinOutcome, WaitlistEntry, WaitlistJoin};
use crate::providers::resend::{send_email, OutgoingEmail};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct JoinRequest {
  #[serde(default)]
  email: Option<String>,
  #[serde(default)]
  name: Option<String>,
  #[serde(default)]
  referral_source: Option<String>,
}

fn trimmed(value: Option<String>) -> Option<String> {
  value.map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

pub async fn handle(ctx: &AppContext, req: Request<Bytes>) -> HandlerResult {
  let method = req.method();
  if method == Method::OPTIONS {
    preflight_response()
  } else if method == Method::POST {
    join(ctx, &req).await
  } else if method == Method::GET {
    status(ctx).await
  } else {
    Err(ApiError::MethodNotAllowed)
  }
}

async fn join(ctx: &AppContext, req: &Request<Bytes>) -> HandlerResult {
  let body: JoinRequest = parse_json_body(req.body())?;
  let email = trimmed(body.email)
    .map(|v| v.to_lowercase())
    .filter(|v| looks_like_email(v))
    .ok_or_else(|| ApiError::bad_request("A valid email is required"))?;

  let outcome = ctx
    .store()?
    .join_waitlist(&WaitlistJoin {
      email,
      name: trimmed(body.name),
      referral_source: trimmed(body.referral_source),
    })
    .await?;

  match outcome {
    JoinOutcome::AlreadyJoined(entry) => ok_json(serde_json::json!({
      "success": true,
      "alreadyJoined": true,
      "position": entry.position,
      "phase": entry.phase,
    })),
    JoinOutcome::Closed => Err(ApiError::Conflict("The waitlist is not open right now".to_string())),
    JoinOutcome::Full(phase) => Err(ApiError::Conflict(format!(
      "The {} phase is full ({} of {} spots taken)",
      phase.phase, phase.joined, phase.capacity
    ))),
    JoinOutcome::Joined(entry) => {
      tracing::info!(phase = %entry.phase, position = entry.position, "waitlist joined");
      send_confirmation(ctx, &entry).await;
      ok_json(serde_json::json!({
        "success": true,
        "alreadyJoined": false,
        "position": entry.position,
        "phase": entry.phase,
      }))
    }
  }
}

/// Best-effort; the join already succeeded.
async fn send_confirmation(ctx: &AppContext, entry: &WaitlistEntry) {
  let Some(api_key) = ctx.config.resend_api_key.as_deref() else {
    tracing::debug!("RESEND_API_KEY not set; skipping waitlist confirmation");
    return;
  };

  let greeting = entry
    .name
    .as_deref()
    .map(|name| format!("Hi {name},"))
    .unwrap_or_else(|| "Hi,".to_string());
  let text = format!(
    "{greeting}\n\nYou're on the ClipDeck waitlist for the {} phase at position #{}. We'll email you when your spot opens.\n",
    entry.phase, entry.position
  );
  let email = OutgoingEmail {
    from: ctx.config.email_from.clone(),
    to: vec![entry.email.clone()],
    subject: format!("You're #{} on the ClipDeck waitlist", entry.position),
    html: None,
    text: Some(text),
    reply_to: None,
  };

  if let Err(err) = send_email(&ctx.config.endpoints.resend_api_base, api_key, &email).await {
    tracing::warn!(error = %err, position = entry.position, "waitlist confirmation email failed");
  }
}

async fn status(ctx: &AppContext) -> HandlerResult {
  match ctx.store()?.fetch_open_launch_phase().await? {
    Some(phase) => ok_json(serde_json::json!({
      "success": true,
      "open": true,
      "phase": phase.phase,
      "capacity": phase.capacity,
      "joined": phase.joined,
      "remaining": phase.remaining(),
    })),
    None => ok_json(serde_json::json!({"success": true, "open": false})),
  }
}
