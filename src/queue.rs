use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::QueueSettings;
use crate::http_client::http_client_for_url;
use crate::models::{Clip, ClipSettlement, ClipStatus, NewQueueEntry, QueueEntry, QueueStatus};
use crate::providers::{read_json, ProviderError};
use crate::store::{Store, StoreError, CLAIM_EXPIRED};

const MAX_ERROR_LEN: usize = 2000;

/// Optional body accepted by every sweep (`GET` from cron sends none).
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SweepRequest {
  #[serde(default)]
  pub limit: Option<i64>,
  #[serde(default)]
  pub now_ms: Option<i64>,
}

impl SweepRequest {
  pub fn now(&self) -> DateTime<Utc> {
    self
      .now_ms
      .filter(|ms| *ms > 0)
      .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
      .unwrap_or_else(Utc::now)
  }

  pub fn limit(&self, default: usize) -> usize {
    self
      .limit
      .map(|l| l.clamp(1, 25) as usize)
      .unwrap_or(default)
  }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ClipScore {
  pub score: f64,
  pub viral_metadata: Option<Value>,
}

#[async_trait]
pub trait ClipScorer: Send + Sync {
  async fn score(&self, clip: &Clip) -> Result<ClipScore, ProviderError>;
}

#[async_trait]
pub trait ClipPublisher: Send + Sync {
  /// Returns the platform's post id, when it reports one.
  async fn publish(&self, entry: &QueueEntry) -> Result<Option<String>, ProviderError>;
}

/// POSTs a clip to the external scoring service.
pub struct HttpClipScorer {
  pub url: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ScorerResponse {
  score: f64,
  #[serde(default)]
  viral_metadata: Option<Value>,
}

#[async_trait]
impl ClipScorer for HttpClipScorer {
  async fn score(&self, clip: &Clip) -> Result<ClipScore, ProviderError> {
    let client = http_client_for_url(&self.url).map_err(|e| ProviderError::transport("scorer", e))?;
    let response = client
      .post(&self.url)
      .json(&serde_json::json!({
        "clipId": clip.id,
        "userId": clip.user_id,
        "title": clip.title,
        "videoUrl": clip.video_url,
        "caption": clip.caption,
      }))
      .send()
      .await
      .map_err(|e| ProviderError::transport("scorer", e))?;
    let parsed: ScorerResponse = read_json("scorer", response).await?;
    if !parsed.score.is_finite() {
      return Err(ProviderError::new("scorer", None, "Scorer returned a non-finite score"));
    }
    Ok(ClipScore {
      score: parsed.score,
      viral_metadata: parsed.viral_metadata,
    })
  }
}

/// Calls a sibling function over HTTP with the internal token.
pub async fn call_sibling(api_base_url: &str, path: &str, internal_token: &str, body: &Value) -> Result<Value, ProviderError> {
  let url = format!("{}{}", api_base_url.trim_end_matches('/'), path);
  let client = http_client_for_url(&url).map_err(|e| ProviderError::transport("sibling", e))?;
  let response = client
    .post(&url)
    .bearer_auth(internal_token)
    .json(body)
    .send()
    .await
    .map_err(|e| ProviderError::transport("sibling", e))?;
  read_json("sibling", response).await
}

/// Publishes through the sibling `/api/publish` function.
pub struct SiblingPublisher {
  pub api_base_url: String,
  pub internal_token: String,
}

#[async_trait]
impl ClipPublisher for SiblingPublisher {
  async fn publish(&self, entry: &QueueEntry) -> Result<Option<String>, ProviderError> {
    let reply = call_sibling(
      &self.api_base_url,
      "/api/publish",
      &self.internal_token,
      &serde_json::json!({
        "clipId": entry.clip_id,
        "platform": entry.platform,
        "userId": entry.user_id,
      }),
    )
    .await?;
    Ok(reply.get("postId").and_then(Value::as_str).map(str::to_string))
  }
}

pub fn retry_delay(attempts: i32) -> Duration {
  Duration::seconds(i64::from(attempts.max(1)).saturating_mul(60))
}

fn truncate_error(message: &str) -> String {
  if message.len() <= MAX_ERROR_LEN {
    return message.to_string();
  }
  let mut end = MAX_ERROR_LEN;
  while !message.is_char_boundary(end) {
    end -= 1;
  }
  message[..end].to_string()
}

#[derive(Debug, Default, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueSweepSummary {
  pub claimed: usize,
  pub reclaimed: u64,
  pub completed: usize,
  pub retried: usize,
  pub failed: usize,
  pub last_error: Option<String>,
}

pub async fn process_publishing_queue(
  store: &dyn Store,
  publisher: &dyn ClipPublisher,
  settings: &QueueSettings,
  now: DateTime<Utc>,
  limit: usize,
) -> Result<QueueSweepSummary, StoreError> {
  let claim_token = uuid::Uuid::new_v4().to_string();
  let stale_before = now - Duration::seconds(settings.lock_ttl_secs);

  let reclaimed = store.reclaim_stale_queue_entries(stale_before, now).await?;
  let mut summary = QueueSweepSummary {
    reclaimed: reclaimed.len() as u64,
    ..QueueSweepSummary::default()
  };

  for entry in reclaimed.iter().filter(|e| e.status == QueueStatus::Failed) {
    let message = entry.last_error.as_deref().unwrap_or(CLAIM_EXPIRED);
    store.fail_clip(&entry.clip_id, message).await?;
    summary.failed += 1;
    tracing::warn!(entry_id = entry.id, clip_id = %entry.clip_id, platform = %entry.platform, "publish claim expired on its final attempt");
  }

  let claimed = store.claim_due_queue_entries(&claim_token, now, limit).await?;
  summary.claimed = claimed.len();

  for entry in &claimed {
    match publisher.publish(entry).await {
      Ok(post_id) => {
        if store.complete_queue_entry(entry.id, &claim_token, post_id.as_deref()).await? {
          summary.completed += 1;
        } else {
          tracing::warn!(entry_id = entry.id, "queue entry claim lost before completion");
        }
      }
      Err(err) => {
        let message = truncate_error(&err.message);
        summary.last_error.get_or_insert_with(|| message.clone());

        if entry.attempts >= entry.max_attempts {
          if store.fail_queue_entry(entry.id, &claim_token, &message, None).await? {
            if !store.fail_clip(&entry.clip_id, &message).await? {
              tracing::info!(clip_id = %entry.clip_id, "clip already published; left as is");
            }
            summary.failed += 1;
          }
          tracing::warn!(entry_id = entry.id, clip_id = %entry.clip_id, platform = %entry.platform, error = %message, "publish failed permanently");
        } else {
          let retry_at = now + retry_delay(entry.attempts);
          if store
            .fail_queue_entry(entry.id, &claim_token, &message, Some(retry_at))
            .await?
          {
            summary.retried += 1;
          }
          tracing::info!(entry_id = entry.id, attempts = entry.attempts, %retry_at, error = %message, "publish failed; retry scheduled");
        }
      }
    }
  }

  Ok(summary)
}

#[derive(Debug, Default, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClipSweepSummary {
  pub claimed: usize,
  pub reclaimed: u64,
  pub queued: usize,
  pub below_threshold: usize,
  pub failed: usize,
  pub deferred: usize,
  pub last_error: Option<String>,
}

pub async fn process_pending_clips(
  store: &dyn Store,
  scorer: Option<&dyn ClipScorer>,
  settings: &QueueSettings,
  now: DateTime<Utc>,
  limit: usize,
) -> Result<ClipSweepSummary, StoreError> {
  let claim_token = uuid::Uuid::new_v4().to_string();
  let stale_before = now - Duration::seconds(settings.lock_ttl_secs);

  let reclaimed = store.reclaim_stale_clips(stale_before).await?;
  let claimed = store.claim_pending_clips(&claim_token, now, limit).await?;

  let mut summary = ClipSweepSummary {
    claimed: claimed.len(),
    reclaimed,
    ..ClipSweepSummary::default()
  };

  for clip in &claimed {
    let quota = store.consume_daily_clip_quota(&clip.user_id, now.date_naive()).await?;
    if !quota.allowed {
      store.release_clip(&clip.id, &claim_token).await?;
      summary.deferred += 1;
      tracing::info!(clip_id = %clip.id, used = quota.used, limit = quota.limit, "daily clip quota exhausted; clip deferred");
      continue;
    }

    let scored = match (clip.score, scorer) {
      (Some(score), _) => Ok(ClipScore {
        score,
        viral_metadata: clip.viral_metadata.clone(),
      }),
      (None, Some(scorer)) => scorer.score(clip).await,
      (None, None) => Err(ProviderError::new("scorer", None, "Missing CLIP_SCORER_URL")),
    };

    let settlement = match scored {
      Err(err) => {
        let message = truncate_error(&err.message);
        summary.last_error.get_or_insert_with(|| message.clone());
        summary.failed += 1;
        tracing::warn!(clip_id = %clip.id, error = %message, "clip scoring failed");
        ClipSettlement {
          status: ClipStatus::Failed,
          score: None,
          viral_metadata: None,
          last_error: Some(message),
        }
      }
      Ok(scored) if scored.score < settings.score_threshold => {
        summary.below_threshold += 1;
        ClipSettlement {
          status: ClipStatus::BelowThreshold,
          score: Some(scored.score),
          viral_metadata: scored.viral_metadata,
          last_error: None,
        }
      }
      Ok(scored) => {
        let connections = store.list_connections(&clip.user_id).await?;
        for connection in connections
          .iter()
          .filter(|c| c.is_active && c.platform.supports_publishing())
        {
          let added = store
            .enqueue_publication(&NewQueueEntry {
              clip_id: clip.id.clone(),
              user_id: clip.user_id.clone(),
              platform: connection.platform,
              max_attempts: settings.max_attempts,
              scheduled_for: now,
            })
            .await?;
          if added {
            summary.queued += 1;
          }
        }
        ClipSettlement {
          status: ClipStatus::Processing,
          score: Some(scored.score),
          viral_metadata: scored.viral_metadata,
          last_error: None,
        }
      }
    };

    if !store.settle_clip(&clip.id, &claim_token, &settlement).await? {
      tracing::warn!(clip_id = %clip.id, "clip claim lost before settlement");
    }
  }

  Ok(summary)
}
