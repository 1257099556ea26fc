use bytes::Bytes;
use http_body_util::BodyExt;
use hyper::header::{HeaderValue, LOCATION};
use hyper::{HeaderMap, Method, Request, StatusCode, Uri};
use serde::de::DeserializeOwned;
use vercel_runtime::{Error, Response, ResponseBody};

use crate::config::AppConfig;
use crate::error::ApiError;

pub type HandlerResult = Result<Response<ResponseBody>, ApiError>;

pub fn json_response(status: StatusCode, value: serde_json::Value) -> HandlerResult {
  Ok(
    Response::builder()
      .status(status)
      .header("content-type", "application/json; charset=utf-8")
      .body(ResponseBody::from(value))?,
  )
}

pub fn ok_json(value: serde_json::Value) -> HandlerResult {
  json_response(StatusCode::OK, value)
}

pub fn redirect_response(location: &str) -> HandlerResult {
  Ok(
    Response::builder()
      .status(StatusCode::FOUND)
      .header(LOCATION, location)
      .header("cache-control", "no-store")
      .body(ResponseBody::from(String::new()))?,
  )
}

pub fn preflight_response() -> HandlerResult {
  Ok(
    Response::builder()
      .status(StatusCode::NO_CONTENT)
      .body(ResponseBody::from(String::new()))?,
  )
}

pub fn apply_cors(headers: &mut HeaderMap, allow_origin: &str) {
  let origin = HeaderValue::from_str(allow_origin).unwrap_or_else(|_| HeaderValue::from_static("*"));
  headers.insert("access-control-allow-origin", origin);
  headers.insert(
    "access-control-allow-methods",
    HeaderValue::from_static("GET, POST, DELETE, OPTIONS"),
  );
  headers.insert(
    "access-control-allow-headers",
    HeaderValue::from_static("authorization, content-type, x-client-info, apikey"),
  );
  headers.insert("access-control-max-age", HeaderValue::from_static("86400"));
}

pub fn ensure_method(method: &Method, allowed: &[Method]) -> Result<(), ApiError> {
  if allowed.contains(method) {
    Ok(())
  } else {
    Err(ApiError::MethodNotAllowed)
  }
}

pub fn bearer_token(headers: &HeaderMap) -> Option<&str> {
  let value = headers.get("authorization")?.to_str().ok()?;
  value.strip_prefix("Bearer ").or_else(|| value.strip_prefix("bearer "))
}

pub fn query_param(uri: &Uri, key: &str) -> Option<String> {
  let query = uri.query()?;
  url::form_urlencoded::parse(query.as_bytes())
    .find(|(k, _)| k == key)
    .map(|(_, v)| v.into_owned())
}

pub fn parse_json_body<T: DeserializeOwned>(body: &Bytes) -> Result<T, ApiError> {
  if body.iter().all(u8::is_ascii_whitespace) {
    return Err(ApiError::bad_request("Request body is required"));
  }
  serde_json::from_slice(body).map_err(|e| ApiError::BadRequest(format!("Invalid JSON body: {e}")))
}

/// Like `parse_json_body`, but an empty body deserializes from `{}`.
pub fn parse_optional_json_body<T: DeserializeOwned + Default>(body: &Bytes) -> Result<T, ApiError> {
  if body.iter().all(u8::is_ascii_whitespace) {
    return Ok(T::default());
  }
  parse_json_body(body)
}

pub async fn collect_request(req: vercel_runtime::Request) -> Result<Request<Bytes>, Error> {
  let (parts, body) = req.into_parts();
  let bytes = body.collect().await?.to_bytes();
  Ok(Request::from_parts(parts, bytes))
}

/// Converts a handler outcome into the runtime response: errors become
/// `{success: false, error}` bodies and every response carries CORS headers.
pub fn finish(config: &AppConfig, route: &str, result: HandlerResult) -> Result<Response<ResponseBody>, Error> {
  let mut response = match result {
    Ok(response) => response,
    Err(err) => {
      let status = err.status();
      if status.is_server_error() {
        tracing::error!(route, status = status.as_u16(), error = %err, "handler failed");
      } else {
        tracing::info!(route, status = status.as_u16(), error = %err, "request rejected");
      }
      json_response(status, err.body()).map_err(|e| -> Error { Box::new(e) })?
    }
  };
  apply_cors(response.headers_mut(), &config.cors_allow_origin);
  Ok(response)
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn query_param_decodes_values() {
    let uri: Uri = "/api/oauth?platform=tiktok&returnTo=%2Fdashboard%3Ftab%3D1&x=a+b"
      .parse()
      .unwrap();
    assert_eq!(query_param(&uri, "platform").as_deref(), Some("tiktok"));
    assert_eq!(query_param(&uri, "returnTo").as_deref(), Some("/dashboard?tab=1"));
    assert_eq!(query_param(&uri, "x").as_deref(), Some("a b"));
    assert_eq!(query_param(&uri, "missing"), None);
  }

  #[test]
  fn bearer_token_accepts_either_case_prefix() {
    let mut headers = HeaderMap::new();
    headers.insert("authorization", "bearer abc".parse().unwrap());
    assert_eq!(bearer_token(&headers), Some("abc"));
    headers.insert("authorization", "Basic abc".parse().unwrap());
    assert_eq!(bearer_token(&headers), None);
  }

  #[test]
  fn empty_body_is_a_bad_request() {
    let err = parse_json_body::<serde_json::Value>(&Bytes::from_static(b"  ")).unwrap_err();
    assert!(matches!(err, ApiError::BadRequest(_)));
  }

  #[test]
  fn finish_adds_cors_headers_to_error_responses() {
    let config = AppConfig::default();
    let response = finish(&config, "test", Err(ApiError::MethodNotAllowed)).unwrap();
    assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
    assert_eq!(
      response.headers().get("access-control-allow-origin").unwrap(),
      "*"
    );
  }
}
