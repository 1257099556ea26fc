//! Bridges Lambda/Netlify proxy events onto the same handlers the Vercel
//! binaries serve.

use std::collections::BTreeMap;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use bytes::Bytes;
use http_body_util::BodyExt;
use hyper::header::{HeaderName, HeaderValue};
use hyper::{Method, Request, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use vercel_runtime::{Response, ResponseBody};

use crate::context::AppContext;
use crate::http::finish;
use crate::routes::{dispatch, Route};

#[derive(Debug, Error)]
pub enum AdapterError {
  #[error("Malformed event: {0}")]
  Event(#[from] serde_json::Error),
  #[error("Body is not valid base64: {0}")]
  Base64(#[from] base64::DecodeError),
  #[error("Invalid request: {0}")]
  Request(String),
}

/// Proxy event as delivered by Lambda function URLs, API Gateway v1 and Netlify.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FunctionEvent {
  #[serde(default)]
  pub http_method: Option<String>,
  #[serde(default)]
  pub path: Option<String>,
  #[serde(default)]
  pub headers: Option<BTreeMap<String, String>>,
  #[serde(default)]
  pub query_string_parameters: Option<BTreeMap<String, String>>,
  #[serde(default)]
  pub body: Option<String>,
  #[serde(default)]
  pub is_base64_encoded: bool,
}

/// Request in the shape handlers expect. Decoded base64 bodies keep their
/// exact bytes.
#[derive(Debug, Clone, PartialEq)]
pub struct FunctionRequest {
  pub method: String,
  pub url: String,
  pub headers: BTreeMap<String, String>,
  pub query: BTreeMap<String, String>,
  pub body: Bytes,
}

impl FunctionEvent {
  pub fn into_request(self) -> Result<FunctionRequest, AdapterError> {
    let method = self
      .http_method
      .map(|m| m.trim().to_ascii_uppercase())
      .filter(|m| !m.is_empty())
      .unwrap_or_else(|| "GET".to_string());
    let query = self.query_string_parameters.unwrap_or_default();
    let path = self.path.filter(|p| !p.is_empty()).unwrap_or_else(|| "/".to_string());

    let url = if query.is_empty() {
      path
    } else {
      let encoded = url::form_urlencoded::Serializer::new(String::new())
        .extend_pairs(query.iter())
        .finish();
      format!("{path}?{encoded}")
    };

    let raw = self.body.unwrap_or_default();
    let body = if self.is_base64_encoded {
      Bytes::from(STANDARD.decode(raw.as_bytes())?)
    } else {
      Bytes::from(raw)
    };

    Ok(FunctionRequest {
      method,
      url,
      headers: self.headers.unwrap_or_default(),
      query,
      body,
    })
  }
}

impl FunctionRequest {
  pub fn into_http(self) -> Result<Request<Bytes>, AdapterError> {
    let method = Method::from_bytes(self.method.as_bytes()).map_err(|e| AdapterError::Request(e.to_string()))?;
    let mut req = Request::builder()
      .method(method)
      .uri(self.url.as_str())
      .body(self.body)
      .map_err(|e| AdapterError::Request(e.to_string()))?;

    for (name, value) in &self.headers {
      let name = HeaderName::from_bytes(name.as_bytes()).map_err(|e| AdapterError::Request(e.to_string()))?;
      let value = HeaderValue::from_str(value).map_err(|e| AdapterError::Request(e.to_string()))?;
      req.headers_mut().append(name, value);
    }
    Ok(req)
  }
}

/// What a handler hands back; every field optional.
#[derive(Debug, Default, Clone, PartialEq, Deserialize)]
pub struct FunctionReply {
  #[serde(default)]
  pub status: Option<u16>,
  #[serde(default)]
  pub headers: Option<BTreeMap<String, String>>,
  #[serde(default)]
  pub body: Option<String>,
  #[serde(skip)]
  pub is_base64_encoded: bool,
}

impl FunctionReply {
  /// Drains a handler response. Bodies that are not UTF-8 are base64 encoded.
  pub async fn from_response(response: Response<ResponseBody>) -> Result<Self, AdapterError> {
    let (parts, body) = response.into_parts();
    let bytes = body
      .collect()
      .await
      .map_err(|e| AdapterError::Request(e.to_string()))?
      .to_bytes();

    let headers = parts
      .headers
      .iter()
      .filter_map(|(name, value)| Some((name.as_str().to_string(), value.to_str().ok()?.to_string())))
      .collect();

    let (body, is_base64_encoded) = match String::from_utf8(bytes.to_vec()) {
      Ok(text) => (text, false),
      Err(_) => (STANDARD.encode(&bytes), true),
    };

    Ok(Self {
      status: Some(parts.status.as_u16()),
      headers: Some(headers),
      body: Some(body),
      is_base64_encoded,
    })
  }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LambdaResponse {
  pub status_code: u16,
  pub headers: BTreeMap<String, String>,
  pub body: String,
  pub is_base64_encoded: bool,
}

impl From<FunctionReply> for LambdaResponse {
  fn from(reply: FunctionReply) -> Self {
    Self {
      status_code: reply.status.unwrap_or(200),
      headers: reply.headers.unwrap_or_default(),
      body: reply.body.unwrap_or_default(),
      is_base64_encoded: reply.is_base64_encoded,
    }
  }
}

fn error_reply(status: StatusCode, message: &str) -> LambdaResponse {
  LambdaResponse {
    status_code: status.as_u16(),
    headers: BTreeMap::from([(
      "content-type".to_string(),
      "application/json; charset=utf-8".to_string(),
    )]),
    body: serde_json::json!({"success": false, "error": message}).to_string(),
    is_base64_encoded: false,
  }
}

/// Full bridge: event in, proxy response out. Never fails; problems become
/// JSON error replies.
pub async fn handle_event(ctx: &AppContext, event: Value) -> LambdaResponse {
  let request = match serde_json::from_value::<FunctionEvent>(event)
    .map_err(AdapterError::from)
    .and_then(FunctionEvent::into_request)
  {
    Ok(request) => request,
    Err(err) => {
      tracing::info!(error = %err, "rejected function event");
      return error_reply(StatusCode::BAD_REQUEST, &err.to_string());
    }
  };

  let path = request.url.split('?').next().unwrap_or_default().to_string();
  let Some(route) = Route::resolve(&path) else {
    tracing::info!(path = %path, "no function for path");
    return error_reply(StatusCode::NOT_FOUND, &format!("No function for {path}"));
  };

  let req = match request.into_http() {
    Ok(req) => req,
    Err(err) => return error_reply(StatusCode::BAD_REQUEST, &err.to_string()),
  };

  let response = match finish(&ctx.config, route.name(), dispatch(ctx, route, req).await) {
    Ok(response) => response,
    Err(err) => {
      tracing::error!(route = route.name(), error = %err, "failed to build response");
      return error_reply(StatusCode::INTERNAL_SERVER_ERROR, &err.to_string());
    }
  };

  match FunctionReply::from_response(response).await {
    Ok(reply) => reply.into(),
    Err(err) => {
      tracing::error!(route = route.name(), error = %err, "failed to read response body");
      error_reply(StatusCode::INTERNAL_SERVER_ERROR, &err.to_string())
    }
  }
}
