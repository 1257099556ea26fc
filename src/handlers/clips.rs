use bytes::Bytes;
use hyper::{Method, Request};
use serde::Deserialize;

use crate::auth::{authenticate_user, require_internal};
use crate::context::AppContext;
use crate::error::ApiError;
use crate::handlers::sweep_response;
use crate::http::{ensure_method, ok_json, parse_json_body, parse_optional_json_body, preflight_response, HandlerResult};
use crate::queue::{process_pending_clips, ClipScorer, HttpClipScorer, SweepRequest};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DeleteClipRequest {
  #[serde(default)]
  clip_id: Option<String>,
}

/// `POST|DELETE {clipId}` from the clip's owner.
pub async fn delete(ctx: &AppContext, req: Request<Bytes>) -> HandlerResult {
  if req.method() == Method::OPTIONS {
    return preflight_response();
  }
  ensure_method(req.method(), &[Method::POST, Method::DELETE])?;

  let user_id = authenticate_user(&ctx.config, req.headers())?;
  let body: DeleteClipRequest = parse_json_body(req.body())?;
  let clip_id = body
    .clip_id
    .map(|v| v.trim().to_string())
    .filter(|v| !v.is_empty())
    .ok_or_else(|| ApiError::bad_request("clipId is required"))?;

  let store = ctx.store()?;
  let clip = store
    .fetch_clip(&clip_id)
    .await?
    .ok_or_else(|| ApiError::NotFound("Clip not found".to_string()))?;
  if clip.user_id != user_id {
    return Err(ApiError::Forbidden("Clip belongs to another user".to_string()));
  }

  let deleted = store.delete_clip(&clip.id).await?;
  tracing::info!(clip_id = %clip.id, user_id = %user_id, deleted, "clip deleted");
  ok_json(serde_json::json!({"success": true, "deleted": deleted}))
}

/// Scores pending clips and queues the ones above threshold for publishing.
pub async fn process(ctx: &AppContext, req: Request<Bytes>) -> HandlerResult {
  ensure_method(req.method(), &[Method::GET, Method::POST])?;
  require_internal(&ctx.config, req.headers())?;

  let sweep: SweepRequest = parse_optional_json_body(req.body())?;
  let store = ctx.store()?;
  let settings = &ctx.config.queue;
  let scorer = ctx
    .config
    .clip_scorer_url
    .clone()
    .map(|url| HttpClipScorer { url });

  let summary = process_pending_clips(
    store,
    scorer.as_ref().map(|s| s as &dyn ClipScorer),
    settings,
    sweep.now(),
    sweep.limit(settings.batch_size),
  )
  .await?;

  tracing::info!(
    claimed = summary.claimed,
    reclaimed = summary.reclaimed,
    queued = summary.queued,
    below_threshold = summary.below_threshold,
    failed = summary.failed,
    deferred = summary.deferred,
    "clip sweep finished"
  );
  sweep_response(&summary)
}
