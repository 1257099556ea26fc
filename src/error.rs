use hyper::StatusCode;
use thiserror::Error;

use crate::providers::ProviderError;
use crate::store::StoreError;

/// Every way a handler can fail, mapped onto an HTTP status at the function boundary.
#[derive(Debug, Error)]
pub enum ApiError {
  #[error("{0}")]
  BadRequest(String),
  #[error("Unauthorized")]
  Unauthorized,
  #[error("{0}")]
  Forbidden(String),
  #[error("{0}")]
  NotFound(String),
  #[error("Method not allowed")]
  MethodNotAllowed,
  #[error("{0}")]
  Conflict(String),
  #[error("{0}")]
  NotConfigured(String),
  /// Provider failures keep the provider's own message.
  #[error("{}", .0.message)]
  Upstream(#[from] ProviderError),
  #[error("{0}")]
  Store(#[from] StoreError),
  #[error("{0}")]
  Internal(String),
}

impl ApiError {
  pub fn bad_request(message: impl Into<String>) -> Self {
    ApiError::BadRequest(message.into())
  }

  pub fn status(&self) -> StatusCode {
    match self {
      ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
      ApiError::Unauthorized => StatusCode::UNAUTHORIZED,
      ApiError::Forbidden(_) => StatusCode::FORBIDDEN,
      ApiError::NotFound(_) => StatusCode::NOT_FOUND,
      ApiError::MethodNotAllowed => StatusCode::METHOD_NOT_ALLOWED,
      ApiError::Conflict(_) => StatusCode::CONFLICT,
      ApiError::NotConfigured(_) => StatusCode::NOT_IMPLEMENTED,
      ApiError::Upstream(_) | ApiError::Store(_) | ApiError::Internal(_) => {
        StatusCode::INTERNAL_SERVER_ERROR
      }
    }
  }

  pub fn body(&self) -> serde_json::Value {
    serde_json::json!({"success": false, "error": self.to_string()})
  }
}

impl From<hyper::http::Error> for ApiError {
  fn from(err: hyper::http::Error) -> Self {
    ApiError::Internal(err.to_string())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn upstream_errors_surface_the_provider_message_verbatim() {
    let err = ApiError::from(ProviderError::new("tiktok", Some(400), "invalid_grant: code expired"));
    assert_eq!(err.status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(
      err.body(),
      serde_json::json!({"success": false, "error": "invalid_grant: code expired"})
    );
  }

  #[test]
  fn not_configured_maps_to_not_implemented() {
    let err = ApiError::NotConfigured("Missing RESEND_API_KEY".to_string());
    assert_eq!(err.status(), StatusCode::NOT_IMPLEMENTED);
  }
}
