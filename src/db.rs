use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::FromRow;
use tokio::sync::OnceCell;

use crate::models::{
  Clip, ClipSettlement, ClipStatus, Connection, ConnectionUpsert, JoinOutcome, LaunchPhase, NewQueueEntry, Plan,
  Platform, QueueEntry, QueueStatus, TokenUpdate, WaitlistEntry, WaitlistJoin,
};
use crate::store::{QuotaUsage, Store, StoreError, CLAIM_EXPIRED};

const CONNECTION_COLUMNS: &str = "id, user_id, platform, access_token, refresh_token, token_type, scope, \
  expires_at, platform_user_id, platform_username, is_active, created_at, updated_at";

const CLIP_COLUMNS: &str =
  "id, user_id, title, video_url, caption, status, score, viral_metadata, last_error, created_at";

const QUEUE_COLUMNS: &str = "id, clip_id, user_id, platform, status, attempts, max_attempts, scheduled_for, \
  claim_token, claimed_at, last_error, platform_post_id";

async fn ensure_schema(pool: &PgPool) -> Result<(), sqlx::Error> {
  // Idempotent; mirrors the tables the dashboard already owns.
  let statements = [
    r#"
      CREATE TABLE IF NOT EXISTS profiles (
        user_id TEXT PRIMARY KEY,
        email TEXT NULL,
        plan TEXT NOT NULL DEFAULT 'free',
        clips_today INT NOT NULL DEFAULT 0,
        clips_today_date DATE NULL,
        created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
        updated_at TIMESTAMPTZ NOT NULL DEFAULT now()
      )
    "#,
    r#"
      CREATE TABLE IF NOT EXISTS streaming_connections (
        id BIGSERIAL PRIMARY KEY,
        user_id TEXT NOT NULL,
        platform TEXT NOT NULL,
        access_token TEXT NOT NULL,
        refresh_token TEXT NULL,
        token_type TEXT NULL,
        scope TEXT NULL,
        expires_at TIMESTAMPTZ NULL,
        platform_user_id TEXT NULL,
        platform_username TEXT NULL,
        is_active BOOLEAN NOT NULL DEFAULT TRUE,
        created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
        updated_at TIMESTAMPTZ NOT NULL DEFAULT now(),
        UNIQUE (user_id, platform)
      )
    "#,
    r#"
      CREATE TABLE IF NOT EXISTS clips (
        id TEXT PRIMARY KEY DEFAULT gen_random_uuid()::text,
        user_id TEXT NOT NULL,
        title TEXT NULL,
        video_url TEXT NULL,
        caption TEXT NULL,
        status TEXT NOT NULL DEFAULT 'pending',
        score DOUBLE PRECISION NULL,
        viral_metadata TEXT NULL,
        claim_token TEXT NULL,
        claimed_at TIMESTAMPTZ NULL,
        last_error TEXT NULL,
        created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
        updated_at TIMESTAMPTZ NOT NULL DEFAULT now()
      )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_clips_status_created ON clips (status, created_at)",
    r#"
      CREATE TABLE IF NOT EXISTS publishing_queue (
        id BIGSERIAL PRIMARY KEY,
        clip_id TEXT NOT NULL,
        user_id TEXT NOT NULL,
        platform TEXT NOT NULL,
        status TEXT NOT NULL DEFAULT 'pending',
        attempts INT NOT NULL DEFAULT 0,
        max_attempts INT NOT NULL DEFAULT 3,
        scheduled_for TIMESTAMPTZ NOT NULL DEFAULT now(),
        claim_token TEXT NULL,
        claimed_at TIMESTAMPTZ NULL,
        last_error TEXT NULL,
        platform_post_id TEXT NULL,
        created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
        updated_at TIMESTAMPTZ NOT NULL DEFAULT now(),
        UNIQUE (clip_id, platform)
      )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_publishing_queue_due ON publishing_queue (status, scheduled_for)",
    r#"
      CREATE TABLE IF NOT EXISTS launch_phases (
        phase TEXT PRIMARY KEY,
        sort_order INT NOT NULL DEFAULT 0,
        capacity INT NOT NULL,
        joined INT NOT NULL DEFAULT 0,
        is_open BOOLEAN NOT NULL DEFAULT FALSE
      )
    "#,
    r#"
      CREATE TABLE IF NOT EXISTS waitlist (
        id BIGSERIAL PRIMARY KEY,
        email TEXT NOT NULL UNIQUE,
        name TEXT NULL,
        referral_source TEXT NULL,
        phase TEXT NOT NULL,
        position INT NOT NULL,
        created_at TIMESTAMPTZ NOT NULL DEFAULT now()
      )
    "#,
  ];

  for statement in statements {
    sqlx::query(statement).execute(pool).await?;
  }
  Ok(())
}

#[derive(Debug, FromRow)]
struct ConnectionRow {
  id: i64,
  user_id: String,
  platform: String,
  access_token: String,
  refresh_token: Option<String>,
  token_type: Option<String>,
  scope: Option<String>,
  expires_at: Option<DateTime<Utc>>,
  platform_user_id: Option<String>,
  platform_username: Option<String>,
  is_active: bool,
  created_at: DateTime<Utc>,
  updated_at: DateTime<Utc>,
}

fn parse_platform(value: &str) -> Result<Platform, StoreError> {
  Platform::parse(value).ok_or_else(|| StoreError::Corrupt(format!("unknown platform {value:?}")))
}

impl TryFrom<ConnectionRow> for Connection {
  type Error = StoreError;

  fn try_from(row: ConnectionRow) -> Result<Self, Self::Error> {
    Ok(Connection {
      id: row.id,
      platform: parse_platform(&row.platform)?,
      user_id: row.user_id,
      access_token: row.access_token,
      refresh_token: row.refresh_token,
      token_type: row.token_type,
      scope: row.scope,
      expires_at: row.expires_at,
      platform_user_id: row.platform_user_id,
      platform_username: row.platform_username,
      is_active: row.is_active,
      created_at: row.created_at,
      updated_at: row.updated_at,
    })
  }
}

#[derive(Debug, FromRow)]
struct ClipRow {
  id: String,
  user_id: String,
  title: Option<String>,
  video_url: Option<String>,
  caption: Option<String>,
  status: String,
  score: Option<f64>,
  viral_metadata: Option<String>,
  last_error: Option<String>,
  created_at: DateTime<Utc>,
}

impl TryFrom<ClipRow> for Clip {
  type Error = StoreError;

  fn try_from(row: ClipRow) -> Result<Self, Self::Error> {
    let status = ClipStatus::parse(&row.status)
      .ok_or_else(|| StoreError::Corrupt(format!("unknown clip status {:?}", row.status)))?;
    // Metadata is free-form; unreadable JSON is kept as a string instead of failing the row.
    let viral_metadata = row.viral_metadata.map(|raw| {
      serde_json::from_str::<serde_json::Value>(&raw).unwrap_or(serde_json::Value::String(raw))
    });
    Ok(Clip {
      id: row.id,
      user_id: row.user_id,
      title: row.title,
      video_url: row.video_url,
      caption: row.caption,
      status,
      score: row.score,
      viral_metadata,
      last_error: row.last_error,
      created_at: row.created_at,
    })
  }
}

#[derive(Debug, FromRow)]
struct QueueRow {
  id: i64,
  clip_id: String,
  user_id: String,
  platform: String,
  status: String,
  attempts: i32,
  max_attempts: i32,
  scheduled_for: DateTime<Utc>,
  claim_token: Option<String>,
  claimed_at: Option<DateTime<Utc>>,
  last_error: Option<String>,
  platform_post_id: Option<String>,
}

impl TryFrom<QueueRow> for QueueEntry {
  type Error = StoreError;

  fn try_from(row: QueueRow) -> Result<Self, Self::Error> {
    let status = QueueStatus::parse(&row.status)
      .ok_or_else(|| StoreError::Corrupt(format!("unknown queue status {:?}", row.status)))?;
    Ok(QueueEntry {
      id: row.id,
      platform: parse_platform(&row.platform)?,
      clip_id: row.clip_id,
      user_id: row.user_id,
      status,
      attempts: row.attempts,
      max_attempts: row.max_attempts,
      scheduled_for: row.scheduled_for,
      claim_token: row.claim_token,
      claimed_at: row.claimed_at,
      last_error: row.last_error,
      platform_post_id: row.platform_post_id,
    })
  }
}

#[derive(Debug, FromRow)]
struct LaunchPhaseRow {
  phase: String,
  sort_order: i32,
  capacity: i32,
  joined: i32,
  is_open: bool,
}

impl From<LaunchPhaseRow> for LaunchPhase {
  fn from(row: LaunchPhaseRow) -> Self {
    LaunchPhase {
      phase: row.phase,
      sort_order: row.sort_order,
      capacity: row.capacity,
      joined: row.joined,
      is_open: row.is_open,
    }
  }
}

#[derive(Debug, FromRow)]
struct WaitlistRow {
  id: i64,
  email: String,
  name: Option<String>,
  referral_source: Option<String>,
  phase: String,
  position: i32,
  created_at: DateTime<Utc>,
}

impl From<WaitlistRow> for WaitlistEntry {
  fn from(row: WaitlistRow) -> Self {
    WaitlistEntry {
      id: row.id,
      email: row.email,
      name: row.name,
      referral_source: row.referral_source,
      phase: row.phase,
      position: row.position,
      created_at: row.created_at,
    }
  }
}

fn convert_all<R, T>(rows: Vec<R>) -> Result<Vec<T>, StoreError>
where
  T: TryFrom<R, Error = StoreError>,
{
  rows.into_iter().map(T::try_from).collect()
}

fn metadata_text(value: &Option<serde_json::Value>) -> Option<String> {
  value.as_ref().map(|v| match v {
    serde_json::Value::String(s) => s.clone(),
    other => other.to_string(),
  })
}

/// Postgres-backed `Store`. The pool (and schema) are created on first use.
pub struct PgStore {
  url: String,
  pool: OnceCell<PgPool>,
}

impl PgStore {
  pub fn new(url: impl Into<String>) -> Self {
    Self {
      url: url.into(),
      pool: OnceCell::const_new(),
    }
  }

  async fn pool(&self) -> Result<&PgPool, StoreError> {
    self
      .pool
      .get_or_try_init(|| async {
        let pool = PgPoolOptions::new()
          .max_connections(5)
          .connect(&self.url)
          .await?;
        ensure_schema(&pool).await?;
        tracing::info!("postgres pool ready");
        Ok::<_, StoreError>(pool)
      })
      .await
  }
}

#[async_trait]
impl Store for PgStore {
  async fn upsert_connection(&self, upsert: &ConnectionUpsert) -> Result<Connection, StoreError> {
    let pool = self.pool().await?;
    let row: ConnectionRow = sqlx::query_as(&format!(
      r#"
        INSERT INTO streaming_connections
          (user_id, platform, access_token, refresh_token, token_type, scope, expires_at,
           platform_user_id, platform_username, is_active)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, TRUE)
        ON CONFLICT (user_id, platform) DO UPDATE SET
          access_token = EXCLUDED.access_token,
          refresh_token = EXCLUDED.refresh_token,
          token_type = EXCLUDED.token_type,
          scope = EXCLUDED.scope,
          expires_at = EXCLUDED.expires_at,
          platform_user_id = EXCLUDED.platform_user_id,
          platform_username = EXCLUDED.platform_username,
          is_active = TRUE,
          updated_at = now()
        RETURNING {CONNECTION_COLUMNS}
      "#
    ))
    .bind(&upsert.user_id)
    .bind(upsert.platform.as_str())
    .bind(&upsert.access_token)
    .bind(upsert.refresh_token.as_deref())
    .bind(upsert.token_type.as_deref())
    .bind(upsert.scope.as_deref())
    .bind(upsert.expires_at)
    .bind(upsert.platform_user_id.as_deref())
    .bind(upsert.platform_username.as_deref())
    .fetch_one(pool)
    .await?;

    row.try_into()
  }

  async fn fetch_connection(&self, user_id: &str, platform: Platform) -> Result<Option<Connection>, StoreError> {
    let pool = self.pool().await?;
    let row: Option<ConnectionRow> = sqlx::query_as(&format!(
      "SELECT {CONNECTION_COLUMNS} FROM streaming_connections WHERE user_id = $1 AND platform = $2 LIMIT 1"
    ))
    .bind(user_id)
    .bind(platform.as_str())
    .fetch_optional(pool)
    .await?;

    row.map(Connection::try_from).transpose()
  }

  async fn list_connections(&self, user_id: &str) -> Result<Vec<Connection>, StoreError> {
    let pool = self.pool().await?;
    let rows: Vec<ConnectionRow> = sqlx::query_as(&format!(
      "SELECT {CONNECTION_COLUMNS} FROM streaming_connections WHERE user_id = $1 ORDER BY platform"
    ))
    .bind(user_id)
    .fetch_all(pool)
    .await?;

    convert_all(rows)
  }

  async fn delete_connection(&self, user_id: &str, platform: Platform) -> Result<u64, StoreError> {
    let pool = self.pool().await?;
    let result = sqlx::query("DELETE FROM streaming_connections WHERE user_id = $1 AND platform = $2")
      .bind(user_id)
      .bind(platform.as_str())
      .execute(pool)
      .await?;
    Ok(result.rows_affected())
  }

  async fn update_connection_tokens(
    &self,
    user_id: &str,
    platform: Platform,
    update: &TokenUpdate,
  ) -> Result<Option<Connection>, StoreError> {
    let pool = self.pool().await?;
    let row: Option<ConnectionRow> = sqlx::query_as(&format!(
      r#"
        UPDATE streaming_connections SET
          access_token = $3,
          refresh_token = COALESCE($4, refresh_token),
          token_type = COALESCE($5, token_type),
          scope = COALESCE($6, scope),
          expires_at = $7,
          updated_at = now()
        WHERE user_id = $1 AND platform = $2
        RETURNING {CONNECTION_COLUMNS}
      "#
    ))
    .bind(user_id)
    .bind(platform.as_str())
    .bind(&update.access_token)
    .bind(update.refresh_token.as_deref())
    .bind(update.token_type.as_deref())
    .bind(update.scope.as_deref())
    .bind(update.expires_at)
    .fetch_optional(pool)
    .await?;

    row.map(Connection::try_from).transpose()
  }

  async fn fetch_clip(&self, clip_id: &str) -> Result<Option<Clip>, StoreError> {
    let pool = self.pool().await?;
    let row: Option<ClipRow> = sqlx::query_as(&format!("SELECT {CLIP_COLUMNS} FROM clips WHERE id = $1"))
      .bind(clip_id)
      .fetch_optional(pool)
      .await?;

    row.map(Clip::try_from).transpose()
  }

  async fn delete_clip(&self, clip_id: &str) -> Result<bool, StoreError> {
    let pool = self.pool().await?;
    let mut tx = pool.begin().await?;

    sqlx::query("DELETE FROM publishing_queue WHERE clip_id = $1")
      .bind(clip_id)
      .execute(&mut *tx)
      .await?;
    let result = sqlx::query("DELETE FROM clips WHERE id = $1")
      .bind(clip_id)
      .execute(&mut *tx)
      .await?;

    tx.commit().await?;
    Ok(result.rows_affected() > 0)
  }

  async fn set_clip_status(
    &self,
    clip_id: &str,
    status: ClipStatus,
    last_error: Option<&str>,
  ) -> Result<(), StoreError> {
    let pool = self.pool().await?;
    sqlx::query("UPDATE clips SET status = $2, last_error = $3, updated_at = now() WHERE id = $1")
      .bind(clip_id)
      .bind(status.as_str())
      .bind(last_error)
      .execute(pool)
      .await?;
    Ok(())
  }

  async fn fail_clip(&self, clip_id: &str, last_error: &str) -> Result<bool, StoreError> {
    let pool = self.pool().await?;
    let result = sqlx::query(
      "UPDATE clips SET status = 'failed', last_error = $2, updated_at = now() WHERE id = $1 AND status <> 'published'",
    )
    .bind(clip_id)
    .bind(last_error)
    .execute(pool)
    .await?;
    Ok(result.rows_affected() > 0)
  }

  async fn reclaim_stale_clips(&self, stale_before: DateTime<Utc>) -> Result<u64, StoreError> {
    let pool = self.pool().await?;
    let result = sqlx::query(
      r#"
        UPDATE clips
        SET status = 'pending', claim_token = NULL, claimed_at = NULL, updated_at = now()
        WHERE status = 'processing' AND claim_token IS NOT NULL AND claimed_at < $1
      "#,
    )
    .bind(stale_before)
    .execute(pool)
    .await?;
    Ok(result.rows_affected())
  }

  async fn claim_pending_clips(
    &self,
    claim_token: &str,
    now: DateTime<Utc>,
    limit: usize,
  ) -> Result<Vec<Clip>, StoreError> {
    let pool = self.pool().await?;
    let rows: Vec<ClipRow> = sqlx::query_as(&format!(
      r#"
        UPDATE clips c
        SET status = 'processing', claim_token = $1, claimed_at = $2, updated_at = now()
        FROM (
          SELECT p.id FROM clips p
          LEFT JOIN profiles pr ON pr.user_id = p.user_id
          WHERE p.status = 'pending'
            AND NOT COALESCE(pr.clips_today_date = $4 AND pr.clips_today >= {}, FALSE)
          ORDER BY p.created_at, p.id
          LIMIT $3
          FOR UPDATE OF p SKIP LOCKED
        ) due
        WHERE c.id = due.id
        RETURNING {}
      "#,
      plan_quota_sql("pr.plan"),
      prefixed("c", CLIP_COLUMNS)
    ))
    .bind(claim_token)
    .bind(now)
    .bind(limit as i64)
    .bind(now.date_naive())
    .fetch_all(pool)
    .await?;

    let mut clips: Vec<Clip> = convert_all(rows)?;
    clips.sort_by_key(|c| c.created_at);
    Ok(clips)
  }

  async fn release_clip(&self, clip_id: &str, claim_token: &str) -> Result<bool, StoreError> {
    let pool = self.pool().await?;
    let result = sqlx::query(
      r#"
        UPDATE clips
        SET status = 'pending', claim_token = NULL, claimed_at = NULL, updated_at = now()
        WHERE id = $1 AND claim_token = $2
      "#,
    )
    .bind(clip_id)
    .bind(claim_token)
    .execute(pool)
    .await?;
    Ok(result.rows_affected() > 0)
  }

  async fn settle_clip(
    &self,
    clip_id: &str,
    claim_token: &str,
    settlement: &ClipSettlement,
  ) -> Result<bool, StoreError> {
    let pool = self.pool().await?;
    let result = sqlx::query(
      r#"
        UPDATE clips SET
          status = $3,
          score = COALESCE($4, score),
          viral_metadata = COALESCE($5, viral_metadata),
          last_error = $6,
          claim_token = NULL,
          claimed_at = NULL,
          updated_at = now()
        WHERE id = $1 AND claim_token = $2
      "#,
    )
    .bind(clip_id)
    .bind(claim_token)
    .bind(settlement.status.as_str())
    .bind(settlement.score)
    .bind(metadata_text(&settlement.viral_metadata))
    .bind(settlement.last_error.as_deref())
    .execute(pool)
    .await?;
    Ok(result.rows_affected() > 0)
  }

  async fn enqueue_publication(&self, entry: &NewQueueEntry) -> Result<bool, StoreError> {
    let pool = self.pool().await?;
    let result = sqlx::query(
      r#"
        INSERT INTO publishing_queue (clip_id, user_id, platform, status, attempts, max_attempts, scheduled_for)
        VALUES ($1, $2, $3, 'pending', 0, $4, $5)
        ON CONFLICT (clip_id, platform) DO NOTHING
      "#,
    )
    .bind(&entry.clip_id)
    .bind(&entry.user_id)
    .bind(entry.platform.as_str())
    .bind(entry.max_attempts)
    .bind(entry.scheduled_for)
    .execute(pool)
    .await?;
    Ok(result.rows_affected() > 0)
  }

  async fn reclaim_stale_queue_entries(
    &self,
    stale_before: DateTime<Utc>,
    now: DateTime<Utc>,
  ) -> Result<Vec<QueueEntry>, StoreError> {
    let pool = self.pool().await?;
    let rows: Vec<QueueRow> = sqlx::query_as(&format!(
      r#"
        UPDATE publishing_queue SET
          status = CASE WHEN attempts >= max_attempts THEN 'failed' ELSE 'retrying' END,
          scheduled_for = $2,
          claim_token = NULL,
          claimed_at = NULL,
          last_error = $3,
          updated_at = now()
        WHERE status = 'processing' AND claimed_at < $1
        RETURNING {QUEUE_COLUMNS}
      "#
    ))
    .bind(stale_before)
    .bind(now)
    .bind(CLAIM_EXPIRED)
    .fetch_all(pool)
    .await?;
    convert_all(rows)
  }

  async fn claim_due_queue_entries(
    &self,
    claim_token: &str,
    now: DateTime<Utc>,
    limit: usize,
  ) -> Result<Vec<QueueEntry>, StoreError> {
    let pool = self.pool().await?;
    let rows: Vec<QueueRow> = sqlx::query_as(&format!(
      r#"
        UPDATE publishing_queue q
        SET status = 'processing', claim_token = $1, claimed_at = $2, attempts = q.attempts + 1, updated_at = now()
        FROM (
          SELECT id FROM publishing_queue
          WHERE status IN ('pending', 'retrying') AND scheduled_for <= $2
          ORDER BY scheduled_for, id
          LIMIT $3
          FOR UPDATE SKIP LOCKED
        ) due
        WHERE q.id = due.id
        RETURNING {}
      "#,
      prefixed("q", QUEUE_COLUMNS)
    ))
    .bind(claim_token)
    .bind(now)
    .bind(limit as i64)
    .fetch_all(pool)
    .await?;

    let mut entries: Vec<QueueEntry> = convert_all(rows)?;
    entries.sort_by_key(|e| (e.scheduled_for, e.id));
    Ok(entries)
  }

  async fn complete_queue_entry(
    &self,
    id: i64,
    claim_token: &str,
    platform_post_id: Option<&str>,
  ) -> Result<bool, StoreError> {
    let pool = self.pool().await?;
    let result = sqlx::query(
      r#"
        UPDATE publishing_queue SET
          status = 'completed',
          platform_post_id = $3,
          last_error = NULL,
          claim_token = NULL,
          claimed_at = NULL,
          updated_at = now()
        WHERE id = $1 AND status = 'processing' AND claim_token = $2
      "#,
    )
    .bind(id)
    .bind(claim_token)
    .bind(platform_post_id)
    .execute(pool)
    .await?;
    Ok(result.rows_affected() > 0)
  }

  async fn fail_queue_entry(
    &self,
    id: i64,
    claim_token: &str,
    error: &str,
    retry_at: Option<DateTime<Utc>>,
  ) -> Result<bool, StoreError> {
    let pool = self.pool().await?;
    let result = sqlx::query(
      r#"
        UPDATE publishing_queue SET
          status = CASE WHEN $4::timestamptz IS NULL THEN 'failed' ELSE 'retrying' END,
          scheduled_for = COALESCE($4, scheduled_for),
          last_error = $3,
          claim_token = NULL,
          claimed_at = NULL,
          updated_at = now()
        WHERE id = $1 AND status = 'processing' AND claim_token = $2
      "#,
    )
    .bind(id)
    .bind(claim_token)
    .bind(error)
    .bind(retry_at)
    .execute(pool)
    .await?;
    Ok(result.rows_affected() > 0)
  }

  async fn consume_daily_clip_quota(&self, user_id: &str, today: NaiveDate) -> Result<QuotaUsage, StoreError> {
    let pool = self.pool().await?;
    let mut tx = pool.begin().await?;

    sqlx::query("INSERT INTO profiles (user_id) VALUES ($1) ON CONFLICT (user_id) DO NOTHING")
      .bind(user_id)
      .execute(&mut *tx)
      .await?;

    let (plan, clips_today, clips_today_date): (String, i32, Option<NaiveDate>) = sqlx::query_as(
      "SELECT plan, clips_today, clips_today_date FROM profiles WHERE user_id = $1 FOR UPDATE",
    )
    .bind(user_id)
    .fetch_one(&mut *tx)
    .await?;

    let used = if clips_today_date == Some(today) { clips_today } else { 0 };
    let limit = Plan::parse(Some(&plan)).daily_clip_quota();
    if used >= limit {
      tx.rollback().await?;
      return Ok(QuotaUsage {
        allowed: false,
        used,
        limit,
      });
    }

    sqlx::query(
      "UPDATE profiles SET clips_today = $2, clips_today_date = $3, updated_at = now() WHERE user_id = $1",
    )
    .bind(user_id)
    .bind(used + 1)
    .bind(today)
    .execute(&mut *tx)
    .await?;

    tx.commit().await?;
    Ok(QuotaUsage {
      allowed: true,
      used: used + 1,
      limit,
    })
  }

  async fn fetch_open_launch_phase(&self) -> Result<Option<LaunchPhase>, StoreError> {
    let pool = self.pool().await?;
    let row: Option<LaunchPhaseRow> = sqlx::query_as(
      r#"
        SELECT phase, sort_order, capacity, joined, is_open
        FROM launch_phases
        WHERE is_open
        ORDER BY sort_order, phase
        LIMIT 1
      "#,
    )
    .fetch_optional(pool)
    .await?;
    Ok(row.map(LaunchPhase::from))
  }

  async fn join_waitlist(&self, join: &WaitlistJoin) -> Result<JoinOutcome, StoreError> {
    let pool = self.pool().await?;
    let mut tx = pool.begin().await?;

    let existing: Option<WaitlistRow> = sqlx::query_as(
      "SELECT id, email, name, referral_source, phase, position, created_at FROM waitlist WHERE email = $1",
    )
    .bind(&join.email)
    .fetch_optional(&mut *tx)
    .await?;
    if let Some(row) = existing {
      tx.rollback().await?;
      return Ok(JoinOutcome::AlreadyJoined(row.into()));
    }

    let phase: Option<LaunchPhaseRow> = sqlx::query_as(
      r#"
        SELECT phase, sort_order, capacity, joined, is_open
        FROM launch_phases
        WHERE is_open
        ORDER BY sort_order, phase
        LIMIT 1
        FOR UPDATE
      "#,
    )
    .fetch_optional(&mut *tx)
    .await?;
    let Some(phase) = phase.map(LaunchPhase::from) else {
      tx.rollback().await?;
      return Ok(JoinOutcome::Closed);
    };
    if phase.joined >= phase.capacity {
      tx.rollback().await?;
      return Ok(JoinOutcome::Full(phase));
    }

    let inserted: Option<WaitlistRow> = sqlx::query_as(
      r#"
        INSERT INTO waitlist (email, name, referral_source, phase, position)
        VALUES ($1, $2, $3, $4, $5)
        ON CONFLICT (email) DO NOTHING
        RETURNING id, email, name, referral_source, phase, position, created_at
      "#,
    )
    .bind(&join.email)
    .bind(join.name.as_deref())
    .bind(join.referral_source.as_deref())
    .bind(&phase.phase)
    .bind(phase.joined + 1)
    .fetch_optional(&mut *tx)
    .await?;

    let Some(inserted) = inserted else {
      // Lost a race with a concurrent join for the same address.
      tx.rollback().await?;
      let row: WaitlistRow = sqlx::query_as(
        "SELECT id, email, name, referral_source, phase, position, created_at FROM waitlist WHERE email = $1",
      )
      .bind(&join.email)
      .fetch_one(pool)
      .await?;
      return Ok(JoinOutcome::AlreadyJoined(row.into()));
    };

    sqlx::query("UPDATE launch_phases SET joined = joined + 1 WHERE phase = $1")
      .bind(&phase.phase)
      .execute(&mut *tx)
      .await?;

    tx.commit().await?;
    Ok(JoinOutcome::Joined(inserted.into()))
  }
}

/// `CASE` over the plan column yielding the daily clip quota; unknown plans count as free.
fn plan_quota_sql(column: &str) -> String {
  format!(
    "CASE lower(trim({column})) WHEN 'pro' THEN {} WHEN 'business' THEN {} ELSE {} END",
    Plan::Pro.daily_clip_quota(),
    Plan::Business.daily_clip_quota(),
    Plan::Free.daily_clip_quota(),
  )
}

fn prefixed(alias: &str, columns: &str) -> String {
  columns
    .split(',')
    .map(|c| format!("{alias}.{}", c.trim()))
    .collect::<Vec<_>>()
    .join(", ")
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn prefixed_qualifies_every_column() {
    assert_eq!(prefixed("q", "id, clip_id,  status"), "q.id, q.clip_id, q.status");
    assert!(prefixed("c", CLIP_COLUMNS).starts_with("c.id, c.user_id, c.title"));
  }

  #[test]
  fn plan_quota_sql_matches_plan_quotas() {
    assert_eq!(
      plan_quota_sql("pr.plan"),
      "CASE lower(trim(pr.plan)) WHEN 'pro' THEN 50 WHEN 'business' THEN 500 ELSE 5 END"
    );
  }

  #[test]
  fn queue_rows_with_unknown_platform_are_corrupt() {
    let row = QueueRow {
      id: 1,
      clip_id: "c".to_string(),
      user_id: "u".to_string(),
      platform: "myspace".to_string(),
      status: "pending".to_string(),
      attempts: 0,
      max_attempts: 3,
      scheduled_for: Utc::now(),
      claim_token: None,
      claimed_at: None,
      last_error: None,
      platform_post_id: None,
    };
    assert!(matches!(QueueEntry::try_from(row), Err(StoreError::Corrupt(_))));
  }

  #[test]
  fn unparseable_viral_metadata_is_kept_as_text() {
    let row = ClipRow {
      id: "c1".to_string(),
      user_id: "u".to_string(),
      title: None,
      video_url: None,
      caption: None,
      status: "pending".to_string(),
      score: None,
      viral_metadata: Some("not json".to_string()),
      last_error: None,
      created_at: Utc::now(),
    };
    let clip = Clip::try_from(row).unwrap();
    assert_eq!(clip.viral_metadata, Some(serde_json::Value::String("not json".to_string())));
  }
}
