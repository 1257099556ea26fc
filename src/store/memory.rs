use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};

use crate::models::{
  Clip, ClipSettlement, ClipStatus, Connection, ConnectionUpsert, JoinOutcome, LaunchPhase, NewQueueEntry, Plan,
  Platform, Profile, QueueEntry, QueueStatus, TokenUpdate, WaitlistEntry, WaitlistJoin,
};
use crate::store::{QuotaUsage, Store, StoreError, CLAIM_EXPIRED};

#[derive(Debug, Clone)]
struct ClipRecord {
  clip: Clip,
  claim_token: Option<String>,
  claimed_at: Option<DateTime<Utc>>,
}

#[derive(Default)]
struct State {
  next_id: i64,
  connections: Vec<Connection>,
  clips: Vec<ClipRecord>,
  queue: Vec<QueueEntry>,
  profiles: HashMap<String, Profile>,
  phases: Vec<LaunchPhase>,
  waitlist: Vec<WaitlistEntry>,
}

impl State {
  fn next_id(&mut self) -> i64 {
    self.next_id += 1;
    self.next_id
  }
}

/// In-process `Store` with the same claim semantics as Postgres. Used by tests and
/// local runs without a database.
#[derive(Default)]
pub struct MemoryStore {
  state: Mutex<State>,
}

impl MemoryStore {
  pub fn new() -> Self {
    Self::default()
  }

  fn lock(&self) -> MutexGuard<'_, State> {
    self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
  }

  pub fn insert_clip(&self, clip: Clip) {
    self.lock().clips.push(ClipRecord {
      clip,
      claim_token: None,
      claimed_at: None,
    });
  }

  pub fn insert_profile(&self, profile: Profile) {
    self.lock().profiles.insert(profile.user_id.clone(), profile);
  }

  pub fn insert_launch_phase(&self, phase: LaunchPhase) {
    self.lock().phases.push(phase);
  }

  pub fn insert_queue_entry(&self, mut entry: QueueEntry) -> i64 {
    let mut state = self.lock();
    entry.id = state.next_id();
    let id = entry.id;
    state.queue.push(entry);
    id
  }

  pub fn clip(&self, clip_id: &str) -> Option<Clip> {
    self.lock().clips.iter().find(|r| r.clip.id == clip_id).map(|r| r.clip.clone())
  }

  pub fn queue_entries(&self) -> Vec<QueueEntry> {
    self.lock().queue.clone()
  }

  pub fn profile(&self, user_id: &str) -> Option<Profile> {
    self.lock().profiles.get(user_id).cloned()
  }

  pub fn waitlist(&self) -> Vec<WaitlistEntry> {
    self.lock().waitlist.clone()
  }

  /// Backdates a clip claim so stale-claim recovery can be exercised.
  pub fn backdate_clip_claim(&self, clip_id: &str, claimed_at: DateTime<Utc>) {
    if let Some(record) = self.lock().clips.iter_mut().find(|r| r.clip.id == clip_id) {
      record.claimed_at = Some(claimed_at);
    }
  }
}

fn open_phase(phases: &mut [LaunchPhase]) -> Option<&mut LaunchPhase> {
  phases
    .iter_mut()
    .filter(|p| p.is_open)
    .min_by(|a, b| a.sort_order.cmp(&b.sort_order).then_with(|| a.phase.cmp(&b.phase)))
}

#[async_trait]
impl Store for MemoryStore {
  async fn upsert_connection(&self, upsert: &ConnectionUpsert) -> Result<Connection, StoreError> {
    let now = Utc::now();
    let mut state = self.lock();

    if let Some(existing) = state
      .connections
      .iter_mut()
      .find(|c| c.user_id == upsert.user_id && c.platform == upsert.platform)
    {
      existing.access_token = upsert.access_token.clone();
      existing.refresh_token = upsert.refresh_token.clone();
      existing.token_type = upsert.token_type.clone();
      existing.scope = upsert.scope.clone();
      existing.expires_at = upsert.expires_at;
      existing.platform_user_id = upsert.platform_user_id.clone();
      existing.platform_username = upsert.platform_username.clone();
      existing.is_active = true;
      existing.updated_at = now;
      return Ok(existing.clone());
    }

    let connection = Connection {
      id: state.next_id(),
      user_id: upsert.user_id.clone(),
      platform: upsert.platform,
      access_token: upsert.access_token.clone(),
      refresh_token: upsert.refresh_token.clone(),
      token_type: upsert.token_type.clone(),
      scope: upsert.scope.clone(),
      expires_at: upsert.expires_at,
      platform_user_id: upsert.platform_user_id.clone(),
      platform_username: upsert.platform_username.clone(),
      is_active: true,
      created_at: now,
      updated_at: now,
    };
    state.connections.push(connection.clone());
    Ok(connection)
  }

  async fn fetch_connection(&self, user_id: &str, platform: Platform) -> Result<Option<Connection>, StoreError> {
    Ok(
      self
        .lock()
        .connections
        .iter()
        .find(|c| c.user_id == user_id && c.platform == platform)
        .cloned(),
    )
  }

  async fn list_connections(&self, user_id: &str) -> Result<Vec<Connection>, StoreError> {
    Ok(
      self
        .lock()
        .connections
        .iter()
        .filter(|c| c.user_id == user_id)
        .cloned()
        .collect(),
    )
  }

  async fn delete_connection(&self, user_id: &str, platform: Platform) -> Result<u64, StoreError> {
    let mut state = self.lock();
    let before = state.connections.len();
    state
      .connections
      .retain(|c| !(c.user_id == user_id && c.platform == platform));
    Ok((before - state.connections.len()) as u64)
  }

  async fn update_connection_tokens(
    &self,
    user_id: &str,
    platform: Platform,
    update: &TokenUpdate,
  ) -> Result<Option<Connection>, StoreError> {
    let mut state = self.lock();
    let Some(connection) = state
      .connections
      .iter_mut()
      .find(|c| c.user_id == user_id && c.platform == platform)
    else {
      return Ok(None);
    };
    connection.access_token = update.access_token.clone();
    if update.refresh_token.is_some() {
      connection.refresh_token = update.refresh_token.clone();
    }
    if update.token_type.is_some() {
      connection.token_type = update.token_type.clone();
    }
    if update.scope.is_some() {
      connection.scope = update.scope.clone();
    }
    connection.expires_at = update.expires_at;
    connection.updated_at = Utc::now();
    Ok(Some(connection.clone()))
  }

  async fn fetch_clip(&self, clip_id: &str) -> Result<Option<Clip>, StoreError> {
    Ok(self.clip(clip_id))
  }

  async fn delete_clip(&self, clip_id: &str) -> Result<bool, StoreError> {
    let mut state = self.lock();
    state.queue.retain(|q| q.clip_id != clip_id);
    let before = state.clips.len();
    state.clips.retain(|r| r.clip.id != clip_id);
    Ok(state.clips.len() < before)
  }

  async fn set_clip_status(
    &self,
    clip_id: &str,
    status: ClipStatus,
    last_error: Option<&str>,
  ) -> Result<(), StoreError> {
    if let Some(record) = self.lock().clips.iter_mut().find(|r| r.clip.id == clip_id) {
      record.clip.status = status;
      record.clip.last_error = last_error.map(str::to_string);
    }
    Ok(())
  }

  async fn fail_clip(&self, clip_id: &str, last_error: &str) -> Result<bool, StoreError> {
    let mut state = self.lock();
    let Some(record) = state
      .clips
      .iter_mut()
      .find(|r| r.clip.id == clip_id && r.clip.status != ClipStatus::Published)
    else {
      return Ok(false);
    };
    record.clip.status = ClipStatus::Failed;
    record.clip.last_error = Some(last_error.to_string());
    Ok(true)
  }

  async fn reclaim_stale_clips(&self, stale_before: DateTime<Utc>) -> Result<u64, StoreError> {
    let mut reclaimed = 0;
    for record in self.lock().clips.iter_mut() {
      let stale = record.clip.status == ClipStatus::Processing
        && record.claim_token.is_some()
        && record.claimed_at.is_some_and(|at| at < stale_before);
      if stale {
        record.clip.status = ClipStatus::Pending;
        record.claim_token = None;
        record.claimed_at = None;
        reclaimed += 1;
      }
    }
    Ok(reclaimed)
  }

  async fn claim_pending_clips(
    &self,
    claim_token: &str,
    now: DateTime<Utc>,
    limit: usize,
  ) -> Result<Vec<Clip>, StoreError> {
    let mut state = self.lock();
    let today = now.date_naive();
    let exhausted: HashSet<String> = state
      .profiles
      .values()
      .filter(|p| p.quota_exhausted_on(today))
      .map(|p| p.user_id.clone())
      .collect();
    let mut pending: Vec<&mut ClipRecord> = state
      .clips
      .iter_mut()
      .filter(|r| r.clip.status == ClipStatus::Pending && !exhausted.contains(&r.clip.user_id))
      .collect();
    pending.sort_by_key(|r| r.clip.created_at);

    Ok(
      pending
        .into_iter()
        .take(limit)
        .map(|record| {
          record.clip.status = ClipStatus::Processing;
          record.claim_token = Some(claim_token.to_string());
          record.claimed_at = Some(now);
          record.clip.clone()
        })
        .collect(),
    )
  }

  async fn release_clip(&self, clip_id: &str, claim_token: &str) -> Result<bool, StoreError> {
    let mut state = self.lock();
    let Some(record) = state
      .clips
      .iter_mut()
      .find(|r| r.clip.id == clip_id && r.claim_token.as_deref() == Some(claim_token))
    else {
      return Ok(false);
    };
    record.clip.status = ClipStatus::Pending;
    record.claim_token = None;
    record.claimed_at = None;
    Ok(true)
  }

  async fn settle_clip(
    &self,
    clip_id: &str,
    claim_token: &str,
    settlement: &ClipSettlement,
  ) -> Result<bool, StoreError> {
    let mut state = self.lock();
    let Some(record) = state
      .clips
      .iter_mut()
      .find(|r| r.clip.id == clip_id && r.claim_token.as_deref() == Some(claim_token))
    else {
      return Ok(false);
    };
    record.clip.status = settlement.status;
    if settlement.score.is_some() {
      record.clip.score = settlement.score;
    }
    if settlement.viral_metadata.is_some() {
      record.clip.viral_metadata = settlement.viral_metadata.clone();
    }
    record.clip.last_error = settlement.last_error.clone();
    record.claim_token = None;
    record.claimed_at = None;
    Ok(true)
  }

  async fn enqueue_publication(&self, entry: &NewQueueEntry) -> Result<bool, StoreError> {
    let mut state = self.lock();
    if state
      .queue
      .iter()
      .any(|q| q.clip_id == entry.clip_id && q.platform == entry.platform)
    {
      return Ok(false);
    }
    let id = state.next_id();
    state.queue.push(QueueEntry {
      id,
      clip_id: entry.clip_id.clone(),
      user_id: entry.user_id.clone(),
      platform: entry.platform,
      status: QueueStatus::Pending,
      attempts: 0,
      max_attempts: entry.max_attempts,
      scheduled_for: entry.scheduled_for,
      claim_token: None,
      claimed_at: None,
      last_error: None,
      platform_post_id: None,
    });
    Ok(true)
  }

  async fn reclaim_stale_queue_entries(
    &self,
    stale_before: DateTime<Utc>,
    now: DateTime<Utc>,
  ) -> Result<Vec<QueueEntry>, StoreError> {
    let mut reclaimed = Vec::new();
    for entry in self.lock().queue.iter_mut() {
      let stale = entry.status == QueueStatus::Processing && entry.claimed_at.is_some_and(|at| at < stale_before);
      if !stale {
        continue;
      }
      entry.status = if entry.attempts >= entry.max_attempts {
        QueueStatus::Failed
      } else {
        QueueStatus::Retrying
      };
      entry.scheduled_for = now;
      entry.claim_token = None;
      entry.claimed_at = None;
      entry.last_error = Some(CLAIM_EXPIRED.to_string());
      reclaimed.push(entry.clone());
    }
    Ok(reclaimed)
  }

  async fn claim_due_queue_entries(
    &self,
    claim_token: &str,
    now: DateTime<Utc>,
    limit: usize,
  ) -> Result<Vec<QueueEntry>, StoreError> {
    let mut state = self.lock();
    let mut due: Vec<&mut QueueEntry> = state
      .queue
      .iter_mut()
      .filter(|q| matches!(q.status, QueueStatus::Pending | QueueStatus::Retrying) && q.scheduled_for <= now)
      .collect();
    due.sort_by_key(|q| (q.scheduled_for, q.id));

    Ok(
      due
        .into_iter()
        .take(limit)
        .map(|entry| {
          entry.status = QueueStatus::Processing;
          entry.attempts += 1;
          entry.claim_token = Some(claim_token.to_string());
          entry.claimed_at = Some(now);
          entry.clone()
        })
        .collect(),
    )
  }

  async fn complete_queue_entry(
    &self,
    id: i64,
    claim_token: &str,
    platform_post_id: Option<&str>,
  ) -> Result<bool, StoreError> {
    let mut state = self.lock();
    let Some(entry) = state
      .queue
      .iter_mut()
      .find(|q| q.id == id && q.status == QueueStatus::Processing && q.claim_token.as_deref() == Some(claim_token))
    else {
      return Ok(false);
    };
    entry.status = QueueStatus::Completed;
    entry.platform_post_id = platform_post_id.map(str::to_string);
    entry.last_error = None;
    entry.claim_token = None;
    entry.claimed_at = None;
    Ok(true)
  }

  async fn fail_queue_entry(
    &self,
    id: i64,
    claim_token: &str,
    error: &str,
    retry_at: Option<DateTime<Utc>>,
  ) -> Result<bool, StoreError> {
    let mut state = self.lock();
    let Some(entry) = state
      .queue
      .iter_mut()
      .find(|q| q.id == id && q.status == QueueStatus::Processing && q.claim_token.as_deref() == Some(claim_token))
    else {
      return Ok(false);
    };
    match retry_at {
      Some(at) => {
        entry.status = QueueStatus::Retrying;
        entry.scheduled_for = at;
      }
      None => entry.status = QueueStatus::Failed,
    }
    entry.last_error = Some(error.to_string());
    entry.claim_token = None;
    entry.claimed_at = None;
    Ok(true)
  }

  async fn consume_daily_clip_quota(&self, user_id: &str, today: NaiveDate) -> Result<QuotaUsage, StoreError> {
    let mut state = self.lock();
    let profile = state.profiles.entry(user_id.to_string()).or_insert_with(|| Profile {
      user_id: user_id.to_string(),
      email: None,
      plan: Plan::Free,
      clips_today: 0,
      clips_today_date: None,
    });

    let used = profile.clips_used_on(today);
    let limit = profile.plan.daily_clip_quota();
    if used >= limit {
      return Ok(QuotaUsage {
        allowed: false,
        used,
        limit,
      });
    }

    profile.clips_today = used + 1;
    profile.clips_today_date = Some(today);
    Ok(QuotaUsage {
      allowed: true,
      used: used + 1,
      limit,
    })
  }

  async fn fetch_open_launch_phase(&self) -> Result<Option<LaunchPhase>, StoreError> {
    Ok(open_phase(&mut self.lock().phases).cloned())
  }

  async fn join_waitlist(&self, join: &WaitlistJoin) -> Result<JoinOutcome, StoreError> {
    let mut state = self.lock();
    if let Some(existing) = state.waitlist.iter().find(|w| w.email == join.email) {
      return Ok(JoinOutcome::AlreadyJoined(existing.clone()));
    }

    let Some(phase) = open_phase(&mut state.phases) else {
      return Ok(JoinOutcome::Closed);
    };
    if phase.joined >= phase.capacity {
      return Ok(JoinOutcome::Full(phase.clone()));
    }
    phase.joined += 1;
    let position = phase.joined;
    let phase_name = phase.phase.clone();

    let entry = WaitlistEntry {
      id: state.next_id(),
      email: join.email.clone(),
      name: join.name.clone(),
      referral_source: join.referral_source.clone(),
      phase: phase_name,
      position,
      created_at: Utc::now(),
    };
    state.waitlist.push(entry.clone());
    Ok(JoinOutcome::Joined(entry))
  }
}
