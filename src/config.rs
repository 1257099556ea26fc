use crate::error::ApiError;
use crate::models::Platform;

const DEFAULT_APP_BASE_URL: &str = "http://localhost:3000";
const DEFAULT_EMAIL_FROM: &str = "onboarding@resend.dev";

/// Client credentials registered with one OAuth provider.
#[derive(Debug, Clone)]
pub struct OAuthAppConfig {
  pub client_id: String,
  pub client_secret: String,
  pub redirect_uri: String,
}

/// Third-party base URLs. Overridden in tests to point at a local server.
#[derive(Debug, Clone)]
pub struct ProviderEndpoints {
  pub google_auth_url: String,
  pub google_token_url: String,
  pub youtube_api_base: String,
  pub tiktok_authorize_url: String,
  pub tiktok_token_url: String,
  pub twitch_authorize_url: String,
  pub twitch_token_url: String,
  pub twitch_api_base: String,
  pub instagram_authorize_url: String,
  pub instagram_token_url: String,
  pub instagram_graph_base: String,
  pub resend_api_base: String,
}

impl Default for ProviderEndpoints {
  fn default() -> Self {
    Self {
      google_auth_url: "https://accounts.google.com/o/oauth2/v2/auth".to_string(),
      google_token_url: "https://oauth2.googleapis.com/token".to_string(),
      youtube_api_base: "https://youtube.googleapis.com/".to_string(),
      tiktok_authorize_url: "https://www.tiktok.com/v2/auth/authorize/".to_string(),
      tiktok_token_url: "https://open.tiktokapis.com/v2/oauth/token/".to_string(),
      twitch_authorize_url: "https://id.twitch.tv/oauth2/authorize".to_string(),
      twitch_token_url: "https://id.twitch.tv/oauth2/token".to_string(),
      twitch_api_base: "https://api.twitch.tv/helix".to_string(),
      instagram_authorize_url: "https://www.instagram.com/oauth/authorize".to_string(),
      instagram_token_url: "https://api.instagram.com/oauth/access_token".to_string(),
      instagram_graph_base: "https://graph.instagram.com".to_string(),
      resend_api_base: "https://api.resend.com".to_string(),
    }
  }
}

#[derive(Debug, Clone)]
pub struct QueueSettings {
  pub batch_size: usize,
  pub max_attempts: i32,
  pub lock_ttl_secs: i64,
  pub score_threshold: f64,
}

impl Default for QueueSettings {
  fn default() -> Self {
    Self {
      batch_size: 5,
      max_attempts: 3,
      lock_ttl_secs: 600,
      score_threshold: 70.0,
    }
  }
}

/// Everything a handler reads from its environment, resolved once at startup.
#[derive(Debug, Clone)]
pub struct AppConfig {
  pub internal_token: Option<String>,
  pub database_url: Option<String>,
  pub jwt_secret: Option<String>,
  pub app_base_url: String,
  pub api_base_url: Option<String>,
  pub cors_allow_origin: String,
  pub youtube: Option<OAuthAppConfig>,
  pub tiktok: Option<OAuthAppConfig>,
  pub twitch: Option<OAuthAppConfig>,
  pub instagram: Option<OAuthAppConfig>,
  pub resend_api_key: Option<String>,
  pub email_from: String,
  pub clip_scorer_url: Option<String>,
  pub tiktok_demo_mode: bool,
  pub queue: QueueSettings,
  pub endpoints: ProviderEndpoints,
}

impl Default for AppConfig {
  fn default() -> Self {
    Self::from_lookup(|_| None)
  }
}

fn non_empty(value: Option<String>) -> Option<String> {
  value.map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

fn parse_flag(value: Option<String>, default: bool) -> bool {
  match value.as_deref().map(str::trim) {
    Some(v) if v == "1" || v.eq_ignore_ascii_case("true") || v.eq_ignore_ascii_case("yes") => true,
    Some(v) if v == "0" || v.eq_ignore_ascii_case("false") || v.eq_ignore_ascii_case("no") => false,
    _ => default,
  }
}

impl AppConfig {
  pub fn from_env() -> Self {
    Self::from_lookup(|key| std::env::var(key).ok())
  }

  pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
    let get = |key: &str| non_empty(lookup(key));

    let oauth_app = |id_key: &str, prefix: &str| -> Option<OAuthAppConfig> {
      Some(OAuthAppConfig {
        client_id: get(id_key)?,
        client_secret: get(format!("{prefix}_CLIENT_SECRET").as_str())?,
        redirect_uri: get(format!("{prefix}_REDIRECT_URI").as_str())?,
      })
    };

    let defaults = QueueSettings::default();
    let queue = QueueSettings {
      batch_size: get("QUEUE_BATCH_SIZE")
        .and_then(|v| v.parse::<usize>().ok())
        .unwrap_or(defaults.batch_size)
        .clamp(1, 25),
      max_attempts: get("QUEUE_MAX_ATTEMPTS")
        .and_then(|v| v.parse::<i32>().ok())
        .unwrap_or(defaults.max_attempts)
        .clamp(1, 10),
      lock_ttl_secs: get("QUEUE_LOCK_TTL_SECS")
        .and_then(|v| v.parse::<i64>().ok())
        .unwrap_or(defaults.lock_ttl_secs)
        .clamp(60, 3600),
      score_threshold: get("CLIP_SCORE_THRESHOLD")
        .and_then(|v| v.parse::<f64>().ok())
        .filter(|v| v.is_finite())
        .unwrap_or(defaults.score_threshold),
    };

    Self {
      internal_token: get("INTERNAL_API_TOKEN"),
      database_url: get("SUPABASE_DB_URL").or_else(|| get("DATABASE_URL")),
      jwt_secret: get("SUPABASE_JWT_SECRET"),
      app_base_url: get("APP_BASE_URL")
        .map(|v| v.trim_end_matches('/').to_string())
        .unwrap_or_else(|| DEFAULT_APP_BASE_URL.to_string()),
      api_base_url: get("API_BASE_URL").map(|v| v.trim_end_matches('/').to_string()),
      cors_allow_origin: get("CORS_ALLOW_ORIGIN").unwrap_or_else(|| "*".to_string()),
      youtube: oauth_app("YOUTUBE_CLIENT_ID", "YOUTUBE"),
      tiktok: oauth_app("TIKTOK_CLIENT_KEY", "TIKTOK"),
      twitch: oauth_app("TWITCH_CLIENT_ID", "TWITCH"),
      instagram: oauth_app("INSTAGRAM_CLIENT_ID", "INSTAGRAM"),
      resend_api_key: get("RESEND_API_KEY"),
      email_from: get("EMAIL_FROM").unwrap_or_else(|| DEFAULT_EMAIL_FROM.to_string()),
      clip_scorer_url: get("CLIP_SCORER_URL"),
      tiktok_demo_mode: parse_flag(lookup("TIKTOK_DEMO_MODE"), true),
      queue,
      endpoints: ProviderEndpoints::default(),
    }
  }

  pub fn oauth_app(&self, platform: Platform) -> Result<&OAuthAppConfig, ApiError> {
    let app = match platform {
      Platform::Youtube => self.youtube.as_ref(),
      Platform::Tiktok => self.tiktok.as_ref(),
      Platform::Twitch => self.twitch.as_ref(),
      Platform::Instagram => self.instagram.as_ref(),
      Platform::Kick => None,
    };
    app.ok_or_else(|| {
      let id_key = match platform {
        Platform::Tiktok => "TIKTOK_CLIENT_KEY".to_string(),
        other => format!("{}_CLIENT_ID", other.as_str().to_ascii_uppercase()),
      };
      ApiError::NotConfigured(format!("Missing {platform} OAuth configuration ({id_key})"))
    })
  }

  pub fn api_base_url(&self) -> Result<&str, ApiError> {
    self
      .api_base_url
      .as_deref()
      .ok_or_else(|| ApiError::NotConfigured("Missing API_BASE_URL".to_string()))
  }
}
