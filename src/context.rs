use std::sync::Arc;

use crate::config::AppConfig;
use crate::db::PgStore;
use crate::error::ApiError;
use crate::store::Store;

/// What every handler receives: resolved configuration plus the store, when one
/// is configured.
#[derive(Clone)]
pub struct AppContext {
  pub config: AppConfig,
  store: Option<Arc<dyn Store>>,
}

impl AppContext {
  pub fn new(config: AppConfig, store: Option<Arc<dyn Store>>) -> Self {
    Self { config, store }
  }

  pub fn from_env() -> Self {
    let config = AppConfig::from_env();
    let store = config
      .database_url
      .clone()
      .map(|url| Arc::new(PgStore::new(url)) as Arc<dyn Store>);
    Self::new(config, store)
  }

  pub fn store(&self) -> Result<&dyn Store, ApiError> {
    self
      .store
      .as_deref()
      .ok_or_else(|| ApiError::NotConfigured("Missing SUPABASE_DB_URL (or DATABASE_URL)".to_string()))
  }
}
