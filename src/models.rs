use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
  Youtube,
  Tiktok,
  Twitch,
  Kick,
  Instagram,
}

impl Platform {
  pub const ALL: [Platform; 5] = [
    Platform::Youtube,
    Platform::Tiktok,
    Platform::Twitch,
    Platform::Kick,
    Platform::Instagram,
  ];

  pub fn as_str(&self) -> &'static str {
    match self {
      Platform::Youtube => "youtube",
      Platform::Tiktok => "tiktok",
      Platform::Twitch => "twitch",
      Platform::Kick => "kick",
      Platform::Instagram => "instagram",
    }
  }

  pub fn parse(value: &str) -> Option<Self> {
    let value = value.trim();
    Self::ALL
      .into_iter()
      .find(|p| p.as_str().eq_ignore_ascii_case(value))
  }

  /// Kick connections are saved from tokens the frontend already holds.
  pub fn supports_oauth(&self) -> bool {
    !matches!(self, Platform::Kick)
  }

  pub fn supports_publishing(&self) -> bool {
    matches!(self, Platform::Tiktok | Platform::Instagram)
  }
}

impl std::fmt::Display for Platform {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.write_str(self.as_str())
  }
}

#[derive(Debug, Clone)]
pub struct Connection {
  pub id: i64,
  pub user_id: String,
  pub platform: Platform,
  pub access_token: String,
  pub refresh_token: Option<String>,
  pub token_type: Option<String>,
  pub scope: Option<String>,
  pub expires_at: Option<DateTime<Utc>>,
  pub platform_user_id: Option<String>,
  pub platform_username: Option<String>,
  pub is_active: bool,
  pub created_at: DateTime<Utc>,
  pub updated_at: DateTime<Utc>,
}

impl Connection {
  /// Client-facing view; never includes token material.
  pub fn summary(&self) -> serde_json::Value {
    serde_json::json!({
      "platform": self.platform,
      "platformUserId": self.platform_user_id,
      "username": self.platform_username,
      "isActive": self.is_active,
      "scope": self.scope,
      "expiresAt": self.expires_at,
      "connectedAt": self.created_at,
      "updatedAt": self.updated_at,
    })
  }
}

/// Row written by a save or token exchange; keyed by (user_id, platform).
#[derive(Debug, Clone)]
pub struct ConnectionUpsert {
  pub user_id: String,
  pub platform: Platform,
  pub access_token: String,
  pub refresh_token: Option<String>,
  pub token_type: Option<String>,
  pub scope: Option<String>,
  pub expires_at: Option<DateTime<Utc>>,
  pub platform_user_id: Option<String>,
  pub platform_username: Option<String>,
}

#[derive(Debug, Clone)]
pub struct TokenUpdate {
  pub access_token: String,
  pub refresh_token: Option<String>,
  pub token_type: Option<String>,
  pub scope: Option<String>,
  pub expires_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClipStatus {
  Pending,
  Processing,
  Published,
  Failed,
  BelowThreshold,
}

impl ClipStatus {
  pub fn as_str(&self) -> &'static str {
    match self {
      ClipStatus::Pending => "pending",
      ClipStatus::Processing => "processing",
      ClipStatus::Published => "published",
      ClipStatus::Failed => "failed",
      ClipStatus::BelowThreshold => "below_threshold",
    }
  }

  pub fn parse(value: &str) -> Option<Self> {
    match value {
      "pending" => Some(ClipStatus::Pending),
      "processing" => Some(ClipStatus::Processing),
      "published" => Some(ClipStatus::Published),
      "failed" => Some(ClipStatus::Failed),
      "below_threshold" => Some(ClipStatus::BelowThreshold),
      _ => None,
    }
  }
}

#[derive(Debug, Clone)]
pub struct Clip {
  pub id: String,
  pub user_id: String,
  pub title: Option<String>,
  pub video_url: Option<String>,
  pub caption: Option<String>,
  pub status: ClipStatus,
  pub score: Option<f64>,
  pub viral_metadata: Option<serde_json::Value>,
  pub last_error: Option<String>,
  pub created_at: DateTime<Utc>,
}

/// Final state a sweep writes for a clip it claimed.
#[derive(Debug, Clone)]
pub struct ClipSettlement {
  pub status: ClipStatus,
  pub score: Option<f64>,
  pub viral_metadata: Option<serde_json::Value>,
  pub last_error: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueStatus {
  Pending,
  Processing,
  Retrying,
  Completed,
  Failed,
}

impl QueueStatus {
  pub fn as_str(&self) -> &'static str {
    match self {
      QueueStatus::Pending => "pending",
      QueueStatus::Processing => "processing",
      QueueStatus::Retrying => "retrying",
      QueueStatus::Completed => "completed",
      QueueStatus::Failed => "failed",
    }
  }

  pub fn parse(value: &str) -> Option<Self> {
    match value {
      "pending" => Some(QueueStatus::Pending),
      "processing" => Some(QueueStatus::Processing),
      "retrying" => Some(QueueStatus::Retrying),
      "completed" => Some(QueueStatus::Completed),
      "failed" => Some(QueueStatus::Failed),
      _ => None,
    }
  }
}

#[derive(Debug, Clone)]
pub struct QueueEntry {
  pub id: i64,
  pub clip_id: String,
  pub user_id: String,
  pub platform: Platform,
  pub status: QueueStatus,
  pub attempts: i32,
  pub max_attempts: i32,
  pub scheduled_for: DateTime<Utc>,
  pub claim_token: Option<String>,
  pub claimed_at: Option<DateTime<Utc>>,
  pub last_error: Option<String>,
  pub platform_post_id: Option<String>,
}

#[derive(Debug, Clone)]
pub struct NewQueueEntry {
  pub clip_id: String,
  pub user_id: String,
  pub platform: Platform,
  pub max_attempts: i32,
  pub scheduled_for: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Plan {
  Free,
  Pro,
  Business,
}

impl Plan {
  pub fn parse(value: Option<&str>) -> Self {
    match value.map(str::trim) {
      Some(v) if v.eq_ignore_ascii_case("pro") => Plan::Pro,
      Some(v) if v.eq_ignore_ascii_case("business") => Plan::Business,
      _ => Plan::Free,
    }
  }

  pub fn daily_clip_quota(&self) -> i32 {
    match self {
      Plan::Free => 5,
      Plan::Pro => 50,
      Plan::Business => 500,
    }
  }
}

#[derive(Debug, Clone)]
pub struct Profile {
  pub user_id: String,
  pub email: Option<String>,
  pub plan: Plan,
  pub clips_today: i32,
  pub clips_today_date: Option<NaiveDate>,
}

impl Profile {
  /// Clips already counted against `today`; a stale counter date means none.
  pub fn clips_used_on(&self, today: NaiveDate) -> i32 {
    if self.clips_today_date == Some(today) {
      self.clips_today
    } else {
      0
    }
  }

  pub fn quota_exhausted_on(&self, today: NaiveDate) -> bool {
    self.clips_used_on(today) >= self.plan.daily_clip_quota()
  }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WaitlistEntry {
  pub id: i64,
  pub email: String,
  pub name: Option<String>,
  pub referral_source: Option<String>,
  pub phase: String,
  pub position: i32,
  pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct WaitlistJoin {
  pub email: String,
  pub name: Option<String>,
  pub referral_source: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct LaunchPhase {
  pub phase: String,
  pub sort_order: i32,
  pub capacity: i32,
  pub joined: i32,
  pub is_open: bool,
}

impl LaunchPhase {
  pub fn remaining(&self) -> i32 {
    (self.capacity - self.joined).max(0)
  }
}

#[derive(Debug, Clone)]
pub enum JoinOutcome {
  Joined(WaitlistEntry),
  AlreadyJoined(WaitlistEntry),
  Full(LaunchPhase),
  Closed,
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn platform_parse_is_case_insensitive() {
    assert_eq!(Platform::parse(" TikTok "), Some(Platform::Tiktok));
    assert_eq!(Platform::parse("kick"), Some(Platform::Kick));
    assert_eq!(Platform::parse("myspace"), None);
  }

  #[test]
  fn unknown_plans_fall_back_to_free_quota() {
    assert_eq!(Plan::parse(Some("PRO")).daily_clip_quota(), 50);
    assert_eq!(Plan::parse(Some("enterprise")), Plan::Free);
    assert_eq!(Plan::parse(None).daily_clip_quota(), 5);
  }

  #[test]
  fn clip_status_round_trips_through_column_text() {
    for status in [
      ClipStatus::Pending,
      ClipStatus::Processing,
      ClipStatus::Published,
      ClipStatus::Failed,
      ClipStatus::BelowThreshold,
    ] {
      assert_eq!(ClipStatus::parse(status.as_str()), Some(status));
    }
  }
}
