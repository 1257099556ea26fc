mod memory;

pub use memory::MemoryStore;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use thiserror::Error;

use crate::models::{
  Clip, ClipSettlement, ClipStatus, Connection, ConnectionUpsert, JoinOutcome, LaunchPhase, NewQueueEntry,
  Platform, QueueEntry, TokenUpdate, WaitlistJoin,
};

#[derive(Debug, Error)]
pub enum StoreError {
  #[error("database error: {0}")]
  Database(#[from] sqlx::Error),
  /// A stored value no longer parses into its model type.
  #[error("corrupt row: {0}")]
  Corrupt(String),
}

/// `last_error` left on queue rows whose claim outlived the lock TTL.
pub const CLAIM_EXPIRED: &str = "claim expired";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuotaUsage {
  pub allowed: bool,
  pub used: i32,
  pub limit: i32,
}

/// Persistence seam shared by every handler. Claim-based methods only touch a row
/// while it is still held under the given claim token.
#[async_trait]
pub trait Store: Send + Sync {
  async fn upsert_connection(&self, upsert: &ConnectionUpsert) -> Result<Connection, StoreError>;

  async fn fetch_connection(&self, user_id: &str, platform: Platform) -> Result<Option<Connection>, StoreError>;

  async fn list_connections(&self, user_id: &str) -> Result<Vec<Connection>, StoreError>;

  /// Returns the number of rows removed (0 when nothing matched).
  async fn delete_connection(&self, user_id: &str, platform: Platform) -> Result<u64, StoreError>;

  async fn update_connection_tokens(
    &self,
    user_id: &str,
    platform: Platform,
    update: &TokenUpdate,
  ) -> Result<Option<Connection>, StoreError>;

  async fn fetch_clip(&self, clip_id: &str) -> Result<Option<Clip>, StoreError>;

  /// Removes the clip's queue rows, then the clip. Returns whether the clip existed.
  async fn delete_clip(&self, clip_id: &str) -> Result<bool, StoreError>;

  async fn set_clip_status(
    &self,
    clip_id: &str,
    status: ClipStatus,
    last_error: Option<&str>,
  ) -> Result<(), StoreError>;

  /// Marks the clip `failed` unless another platform already published it.
  /// Returns whether the clip changed.
  async fn fail_clip(&self, clip_id: &str, last_error: &str) -> Result<bool, StoreError>;

  /// Returns claimed-but-abandoned `processing` clips to `pending`.
  async fn reclaim_stale_clips(&self, stale_before: DateTime<Utc>) -> Result<u64, StoreError>;

  /// Claims the oldest `pending` clips, skipping owners whose daily quota for
  /// `now`'s UTC date is already used up.
  async fn claim_pending_clips(
    &self,
    claim_token: &str,
    now: DateTime<Utc>,
    limit: usize,
  ) -> Result<Vec<Clip>, StoreError>;

  async fn release_clip(&self, clip_id: &str, claim_token: &str) -> Result<bool, StoreError>;

  async fn settle_clip(
    &self,
    clip_id: &str,
    claim_token: &str,
    settlement: &ClipSettlement,
  ) -> Result<bool, StoreError>;

  /// Inserts unless a row for (clip, platform) exists. Returns whether a row was added.
  async fn enqueue_publication(&self, entry: &NewQueueEntry) -> Result<bool, StoreError>;

  /// Stale `processing` rows become `retrying` (due at `now`), or `failed` once
  /// their attempts are spent. Returns the rows as updated.
  async fn reclaim_stale_queue_entries(
    &self,
    stale_before: DateTime<Utc>,
    now: DateTime<Utc>,
  ) -> Result<Vec<QueueEntry>, StoreError>;

  /// Moves due `pending`/`retrying` rows into `processing`, counting one attempt each.
  async fn claim_due_queue_entries(
    &self,
    claim_token: &str,
    now: DateTime<Utc>,
    limit: usize,
  ) -> Result<Vec<QueueEntry>, StoreError>;

  async fn complete_queue_entry(
    &self,
    id: i64,
    claim_token: &str,
    platform_post_id: Option<&str>,
  ) -> Result<bool, StoreError>;

  /// `retry_at = Some(..)` schedules another attempt; `None` marks the row `failed`.
  async fn fail_queue_entry(
    &self,
    id: i64,
    claim_token: &str,
    error: &str,
    retry_at: Option<DateTime<Utc>>,
  ) -> Result<bool, StoreError>;

  /// Counts one clip against the owner's plan for `today`, resetting on a new day.
  async fn consume_daily_clip_quota(&self, user_id: &str, today: NaiveDate) -> Result<QuotaUsage, StoreError>;

  async fn fetch_open_launch_phase(&self) -> Result<Option<LaunchPhase>, StoreError>;

  async fn join_waitlist(&self, join: &WaitlistJoin) -> Result<JoinOutcome, StoreError>;
}
