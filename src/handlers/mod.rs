pub mod clips;
pub mod connections;
pub mod email;
pub mod oauth;
pub mod publish;
pub mod queue;
pub mod waitlist;

use serde::Serialize;

use crate::error::ApiError;
use crate::http::{ok_json, HandlerResult};

/// `{success: true, ...summary}` for a finished sweep.
pub(crate) fn sweep_response<T: Serialize>(summary: &T) -> HandlerResult {
  let mut body = serde_json::to_value(summary).map_err(|e| ApiError::Internal(e.to_string()))?;
  if let Some(map) = body.as_object_mut() {
    map.insert("success".to_string(), serde_json::Value::Bool(true));
  }
  ok_json(body)
}
