use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{HeaderMap, Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use jsonwebtoken::{EncodingKey, Header};
use tokio::net::TcpListener;
use vercel_runtime::ResponseBody;

use crate::config::AppConfig;

pub const TEST_JWT_SECRET: &str = "test-jwt-secret";
pub const TEST_INTERNAL_TOKEN: &str = "internal-test-token";

#[derive(Debug, Clone)]
pub struct RecordedRequest {
  pub method: Method,
  pub path: String,
  pub headers: HeaderMap,
  pub body: Bytes,
}

impl RecordedRequest {
  pub fn header(&self, name: &str) -> Option<String> {
    self.headers.get(name).and_then(|v| v.to_str().ok()).map(str::to_string)
  }

  pub fn json(&self) -> serde_json::Value {
    serde_json::from_slice(&self.body).unwrap()
  }

  pub fn form(&self) -> Vec<(String, String)> {
    url::form_urlencoded::parse(&self.body).into_owned().collect()
  }

  pub fn form_value(&self, key: &str) -> Option<String> {
    self.form().into_iter().find(|(k, _)| k == key).map(|(_, v)| v)
  }
}

/// Local HTTP server answering with canned responses in order. Unscripted
/// requests get a 599 so a test fails loudly instead of hanging.
pub struct MockServer {
  pub base_url: String,
  requests: Arc<Mutex<Vec<RecordedRequest>>>,
}

impl MockServer {
  pub async fn start(responses: Vec<(u16, &str)>) -> Self {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let queue: Arc<Mutex<VecDeque<(u16, String)>>> = Arc::new(Mutex::new(
      responses.into_iter().map(|(s, b)| (s, b.to_string())).collect(),
    ));
    let requests = Arc::new(Mutex::new(Vec::new()));

    let accept_queue = queue.clone();
    let accept_requests = requests.clone();
    tokio::spawn(async move {
      loop {
        let Ok((stream, _)) = listener.accept().await else {
          return;
        };
        let queue = accept_queue.clone();
        let requests = accept_requests.clone();
        tokio::spawn(async move {
          let service = service_fn(move |req: Request<Incoming>| {
            let queue = queue.clone();
            let requests = requests.clone();
            async move {
              let (parts, body) = req.into_parts();
              let body = body.collect().await?.to_bytes();
              let path = parts
                .uri
                .path_and_query()
                .map(|pq| pq.as_str().to_string())
                .unwrap_or_else(|| "/".to_string());
              requests.lock().unwrap().push(RecordedRequest {
                method: parts.method,
                path,
                headers: parts.headers,
                body,
              });

              let (status, body) = queue
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or((599, r#"{"error":"unexpected request"}"#.to_string()));
              Ok::<_, hyper::Error>(
                Response::builder()
                  .status(StatusCode::from_u16(status).unwrap())
                  .header("content-type", "application/json")
                  .body(Full::new(Bytes::from(body)))
                  .unwrap(),
              )
            }
          });
          let _ = http1::Builder::new()
            .serve_connection(TokioIo::new(stream), service)
            .await;
        });
      }
    });

    Self {
      base_url: format!("http://{addr}"),
      requests,
    }
  }

  pub fn url(&self, path: &str) -> String {
    format!("{}{}", self.base_url, path)
  }

  pub fn requests(&self) -> Vec<RecordedRequest> {
    self.requests.lock().unwrap().clone()
  }
}

pub fn test_config() -> AppConfig {
  let mut config = AppConfig::default();
  config.internal_token = Some(TEST_INTERNAL_TOKEN.to_string());
  config.jwt_secret = Some(TEST_JWT_SECRET.to_string());
  config.app_base_url = "https://app.example.com".to_string();
  config
}

pub fn sign_user_token(user_id: &str) -> String {
  let claims = serde_json::json!({
    "sub": user_id,
    "aud": "authenticated",
    "role": "authenticated",
    "exp": chrono::Utc::now().timestamp() + 3600,
  });
  jsonwebtoken::encode(
    &Header::default(),
    &claims,
    &EncodingKey::from_secret(TEST_JWT_SECRET.as_bytes()),
  )
  .unwrap()
}

pub fn user_headers(user_id: &str) -> HeaderMap {
  let mut headers = HeaderMap::new();
  headers.insert(
    "authorization",
    format!("Bearer {}", sign_user_token(user_id)).parse().unwrap(),
  );
  headers
}

pub fn internal_headers() -> HeaderMap {
  let mut headers = HeaderMap::new();
  headers.insert(
    "authorization",
    format!("Bearer {TEST_INTERNAL_TOKEN}").parse().unwrap(),
  );
  headers
}

pub fn request(method: Method, uri: &str, headers: HeaderMap, body: &str) -> Request<Bytes> {
  let mut req = Request::builder()
    .method(method)
    .uri(uri)
    .body(Bytes::from(body.to_string()))
    .unwrap();
  *req.headers_mut() = headers;
  req
}

pub async fn response_json(response: vercel_runtime::Response<ResponseBody>) -> serde_json::Value {
  let bytes = response.into_body().collect().await.unwrap().to_bytes();
  serde_json::from_slice(&bytes).unwrap()
}
