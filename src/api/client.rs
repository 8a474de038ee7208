use reqwest::header::{HeaderMap, HeaderValue, CACHE_CONTROL, CONTENT_TYPE, EXPIRES, PRAGMA};
use reqwest::{Method, Response};
use serde_json::Value;
use tracing::{debug, warn};
use url::Url;

use crate::api::error::ApiError;
use crate::config::ApiConfig;

/// HTTP request executor shared by queries and mutations.
///
/// Every request carries no-cache headers and the client's cookie jar, and every
/// non-2xx response comes back as a classified [`ApiError::Http`].
#[derive(Clone, Debug)]
pub struct ApiClient {
  http: reqwest::Client,
  base_url: Option<Url>,
}

impl ApiClient {
  pub fn new(config: &ApiConfig) -> Result<Self, ApiError> {
    let mut builder = reqwest::Client::builder()
      .cookie_store(true)
      .default_headers(no_cache_headers());
    if let Some(timeout) = config.timeout() {
      builder = builder.timeout(timeout);
    }
    let http = builder
      .build()
      .map_err(|e| ApiError::transport(format!("Failed to create HTTP client: {}", e)))?;

    let base_url = config
      .base_url
      .as_deref()
      .map(Url::parse)
      .transpose()
      .map_err(|e| ApiError::transport(format!("Invalid base URL: {}", e)))?;

    Ok(Self { http, base_url })
  }

  /// Resolve a request URL. Absolute URLs pass through, relative ones are joined
  /// onto the configured base URL.
  pub fn resolve(&self, url: &str) -> Result<Url, ApiError> {
    match Url::parse(url) {
      Ok(absolute) => Ok(absolute),
      Err(url::ParseError::RelativeUrlWithoutBase) => match &self.base_url {
        Some(base) => base
          .join(url)
          .map_err(|e| ApiError::transport(format!("Invalid URL {}: {}", url, e))),
        None => Err(ApiError::transport(format!(
          "Relative URL {} requires a configured base URL",
          url
        ))),
      },
      Err(e) => Err(ApiError::transport(format!("Invalid URL {}: {}", url, e))),
    }
  }

  /// Issue one request. Returns the raw response on 2xx.
  pub async fn execute(
    &self,
    method: Method,
    url: &str,
    body: Option<&Value>,
  ) -> Result<Response, ApiError> {
    let target = self.resolve(url)?;
    debug!(%method, url = %target, has_body = body.is_some(), "outgoing request");

    let mut request = self.http.request(method.clone(), target.clone());
    if let Some(body) = body {
      let bytes = serde_json::to_vec(body)
        .map_err(|e| ApiError::transport(format!("Failed to serialize request body: {}", e)))?;
      request = request
        .header(CONTENT_TYPE, "application/json")
        .body(bytes);
    }

    let response = request.send().await.map_err(|e| {
      warn!(%method, url = %target, error = %e, "request failed");
      ApiError::from(e)
    })?;

    if response.status().is_success() {
      return Ok(response);
    }

    let err = error_from_response(response).await;
    warn!(%method, url = %target, error = %err, "request returned error status");
    Err(err)
  }

  /// Execute and decode the JSON body. An empty body decodes to `None`.
  pub async fn request_json(
    &self,
    method: Method,
    url: &str,
    body: Option<&Value>,
  ) -> Result<Option<Value>, ApiError> {
    let response = self.execute(method, url, body).await?;
    decode_json(response).await
  }
}

fn no_cache_headers() -> HeaderMap {
  let mut headers = HeaderMap::new();
  headers.insert(
    CACHE_CONTROL,
    HeaderValue::from_static("no-cache, no-store, must-revalidate"),
  );
  headers.insert(PRAGMA, HeaderValue::from_static("no-cache"));
  headers.insert(EXPIRES, HeaderValue::from_static("0"));
  headers
}

/// Decode a successful response body as JSON.
pub(crate) async fn decode_json(response: Response) -> Result<Option<Value>, ApiError> {
  let bytes = response.bytes().await?;
  if bytes.iter().all(u8::is_ascii_whitespace) {
    return Ok(None);
  }
  serde_json::from_slice(&bytes)
    .map(Some)
    .map_err(|e| ApiError::decode(format!("Failed to parse response body: {}", e)))
}

/// Turn a non-2xx response into an [`ApiError::Http`].
async fn error_from_response(response: Response) -> ApiError {
  let status = response.status();
  let status_text = status.canonical_reason().unwrap_or_default();
  // An unreadable body is treated like an empty one.
  let body = response.text().await.unwrap_or_default();
  ApiError::http(status.as_u16(), extract_error_message(&body, status_text))
}

/// Pick the most useful message for a failed response: a JSON `message` or
/// `error` field, then the raw body, then the status text.
pub fn extract_error_message(body: &str, status_text: &str) -> String {
  if body.trim().is_empty() {
    return status_text.to_string();
  }

  if let Ok(Value::Object(fields)) = serde_json::from_str::<Value>(body) {
    let field = ["message", "error"].iter().find_map(|name| {
      fields
        .get(*name)
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
    });
    if let Some(message) = field {
      return message.to_string();
    }
  }

  body.to_string()
}
