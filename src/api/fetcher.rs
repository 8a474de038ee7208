//! Read-side fetching with a per-subscription unauthorized policy.

use futures::future::BoxFuture;
use futures::FutureExt;
use reqwest::Method;
use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;
use tracing::debug;

use crate::api::client::{decode_json, ApiClient};
use crate::api::error::ApiError;
use crate::query::QueryKey;

/// Result of fetching one query: `None` when the server sent no body or an
/// unauthorized response was suppressed.
pub type FetchResult = Result<Option<Value>, ApiError>;

/// Async function of a query key, as used by the cache manager.
pub type QueryFn = Arc<dyn Fn(&QueryKey) -> BoxFuture<'static, FetchResult> + Send + Sync>;

/// Wrap a closure into a [`QueryFn`].
pub fn query_fn<F, Fut>(f: F) -> QueryFn
where
  F: Fn(QueryKey) -> Fut + Send + Sync + 'static,
  Fut: std::future::Future<Output = FetchResult> + Send + 'static,
{
  Arc::new(move |key: &QueryKey| f(key.clone()).boxed())
}

/// What to do with a 401 response.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum On401 {
  /// Treat as "no data" so anonymous or expired sessions degrade gracefully
  ReturnNull,
  /// Propagate like any other classified error
  #[default]
  Throw,
}

/// GETs the URL at the head of a query key.
#[derive(Clone, Debug)]
pub struct QueryFetcher {
  client: ApiClient,
  on_401: On401,
}

impl QueryFetcher {
  pub fn new(client: ApiClient, on_401: On401) -> Self {
    Self { client, on_401 }
  }

  pub fn on_401(&self) -> On401 {
    self.on_401
  }

  pub async fn fetch(&self, key: &QueryKey) -> FetchResult {
    match self.client.execute(Method::GET, key.url(), None).await {
      Ok(response) => decode_json(response).await,
      Err(err) if err.is_unauthorized() && self.on_401 == On401::ReturnNull => {
        debug!(key = %key, "unauthorized, returning no data");
        Ok(None)
      }
      Err(err) => Err(err),
    }
  }

  pub fn into_query_fn(self) -> QueryFn {
    let fetcher = Arc::new(self);
    Arc::new(move |key: &QueryKey| {
      let fetcher = Arc::clone(&fetcher);
      let key = key.clone();
      async move { fetcher.fetch(&key).await }.boxed()
    })
  }
}
