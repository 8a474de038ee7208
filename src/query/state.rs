use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::api::ErrorRecord;

/// Lifecycle status of a cache entry
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum QueryStatus {
  /// Entry exists but has never been fetched
  #[default]
  Idle,
  /// A fetch (or a retry of one) is in progress
  Loading,
  /// Last fetch completed successfully
  Success,
  /// Last fetch failed after exhausting retries
  Error,
}

/// Snapshot of a cache entry as seen by subscribers.
///
/// `data` survives a later failure or refetch: a refetching or errored entry
/// still exposes the last successful payload.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryState {
  pub status: QueryStatus,
  pub data: Option<Value>,
  pub error: Option<ErrorRecord>,
  pub last_fetched_at: Option<DateTime<Utc>>,
  /// Failures in the current fetch run. Reset to zero on success.
  pub attempt_count: u32,
}

impl QueryState {
  pub fn is_idle(&self) -> bool {
    self.status == QueryStatus::Idle
  }

  pub fn is_loading(&self) -> bool {
    self.status == QueryStatus::Loading
  }

  pub fn is_success(&self) -> bool {
    self.status == QueryStatus::Success
  }

  pub fn is_error(&self) -> bool {
    self.status == QueryStatus::Error
  }

  /// Settled means no fetch is pending: success or terminal error.
  pub fn is_settled(&self) -> bool {
    matches!(self.status, QueryStatus::Success | QueryStatus::Error)
  }

  pub fn data(&self) -> Option<&Value> {
    self.data.as_ref()
  }

  pub fn error(&self) -> Option<&ErrorRecord> {
    self.error.as_ref()
  }

  /// Decode the payload into a typed value.
  pub fn data_as<T: DeserializeOwned>(&self) -> Option<Result<T, serde_json::Error>> {
    self
      .data
      .as_ref()
      .map(|data| serde_json::from_value(data.clone()))
  }
}
