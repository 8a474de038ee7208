//! Local API server for integration tests.

use axum::extract::State;
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;

use tracker_query::api::ApiClient;
use tracker_query::config::ApiConfig;

/// A running test server and the number of requests its counted routes received.
pub struct TestServer {
  pub base_url: String,
  pub hits: Arc<AtomicUsize>,
}

impl TestServer {
  pub fn hits(&self) -> usize {
    self.hits.load(Ordering::SeqCst)
  }

  pub fn client(&self) -> ApiClient {
    ApiClient::new(&ApiConfig {
      base_url: Some(self.base_url.clone()),
      timeout_ms: Some(5000),
    })
    .unwrap()
  }
}

fn header_value(headers: &HeaderMap, name: header::HeaderName) -> Option<String> {
  headers
    .get(name)
    .and_then(|v| v.to_str().ok())
    .map(String::from)
}

pub async fn spawn_server() -> TestServer {
  let hits = Arc::new(AtomicUsize::new(0));

  let app = Router::new()
    .route(
      "/api/habits",
      get(|| async { Json(json!([{"id": 1, "name": "Read"}, {"id": 2, "name": "Run"}])) }),
    )
    .route(
      "/api/missing",
      get(|| async { (StatusCode::NOT_FOUND, Json(json!({"message": "not found"}))) }),
    )
    .route(
      "/api/invalid",
      post(|| async {
        (
          StatusCode::BAD_REQUEST,
          Json(json!({"error": "name is required"})),
        )
      }),
    )
    .route(
      "/api/plain",
      get(|| async { (StatusCode::BAD_GATEWAY, "upstream timed out") }),
    )
    .route("/api/empty", get(|| async { StatusCode::SERVICE_UNAVAILABLE }))
    .route(
      "/api/user",
      get(|| async { (StatusCode::UNAUTHORIZED, Json(json!({"message": "Unauthorized"}))) }),
    )
    .route(
      "/api/headers",
      get(|headers: HeaderMap| async move {
        Json(json!({
          "cache_control": header_value(&headers, header::CACHE_CONTROL),
          "pragma": header_value(&headers, header::PRAGMA),
          "expires": header_value(&headers, header::EXPIRES),
        }))
      }),
    )
    .route(
      "/api/echo",
      post(|headers: HeaderMap, body: String| async move {
        Json(json!({
          "content_type": header_value(&headers, header::CONTENT_TYPE),
          "body": body,
        }))
      }),
    )
    .route(
      "/api/login",
      post(|| async {
        (
          StatusCode::NO_CONTENT,
          [(header::SET_COOKIE, "session=abc123; Path=/")],
        )
      }),
    )
    .route(
      "/api/session",
      get(|headers: HeaderMap| async move {
        let cookie = header_value(&headers, header::COOKIE).unwrap_or_default();
        if cookie.contains("session=abc123") {
          Json(json!({"user": "me"})).into_response()
        } else {
          StatusCode::UNAUTHORIZED.into_response()
        }
      }),
    )
    .route("/api/garbage", get(|| async { "not json" }))
    .route("/api/nothing", get(|| async { StatusCode::NO_CONTENT }))
    .route(
      "/api/counted",
      get(|State(hits): State<Arc<AtomicUsize>>| async move {
        let n = hits.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(50)).await;
        Json(json!({"hit": n}))
      }),
    )
    .route(
      "/api/counted-missing",
      get(|State(hits): State<Arc<AtomicUsize>>| async move {
        hits.fetch_add(1, Ordering::SeqCst);
        (StatusCode::NOT_FOUND, Json(json!({"message": "habit not found"})))
      }),
    )
    .with_state(Arc::clone(&hits));

  let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
  let addr = listener.local_addr().unwrap();
  tokio::spawn(async move {
    axum::serve(listener, app).await.unwrap();
  });

  TestServer {
    base_url: format!("http://{}", addr),
    hits,
  }
}
