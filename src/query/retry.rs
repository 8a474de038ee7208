//! Retry and backoff decisions for failed fetches and writes.
//!
//! The policy is pure: it only looks at the attempt index, the typed status code
//! of the error and the kind of operation. Scheduling the delay is the caller's
//! job.

use serde::Deserialize;
use std::time::Duration;

use crate::api::ApiError;

/// Statuses that describe a request that can never succeed as issued.
const NON_RETRYABLE_STATUSES: [u16; 3] = [401, 403, 404];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationKind {
  Read,
  Write,
}

/// Retry ceiling and backoff bounds for one kind of operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryLimits {
  /// Number of retries after the initial attempt
  pub max_retries: u32,
  pub base_delay_ms: u64,
  pub max_delay_ms: u64,
}

impl RetryLimits {
  pub const READ: Self = Self {
    max_retries: 3,
    base_delay_ms: 1000,
    max_delay_ms: 10_000,
  };

  pub const WRITE: Self = Self {
    max_retries: 2,
    base_delay_ms: 1000,
    max_delay_ms: 5000,
  };

  /// `min(base * 2^attempt, max)`, saturating.
  pub fn delay_for(&self, attempt_index: u32) -> Duration {
    let factor = 1u64.checked_shl(attempt_index).unwrap_or(u64::MAX);
    let millis = self.base_delay_ms.saturating_mul(factor).min(self.max_delay_ms);
    Duration::from_millis(millis)
  }
}

/// Retry policy for reads and writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(from = "RetryPolicyOverrides")]
pub struct RetryPolicy {
  pub read: RetryLimits,
  pub write: RetryLimits,
}

impl Default for RetryPolicy {
  fn default() -> Self {
    Self {
      read: RetryLimits::READ,
      write: RetryLimits::WRITE,
    }
  }
}

impl RetryPolicy {
  /// A policy that never retries.
  pub fn disabled() -> Self {
    let none = RetryLimits {
      max_retries: 0,
      ..RetryLimits::READ
    };
    Self {
      read: none,
      write: none,
    }
  }

  pub fn limits(&self, kind: OperationKind) -> &RetryLimits {
    match kind {
      OperationKind::Read => &self.read,
      OperationKind::Write => &self.write,
    }
  }

  /// Whether the failure at `attempt_index` (0 for the first failure) should be retried.
  pub fn should_retry(&self, attempt_index: u32, error: &ApiError, kind: OperationKind) -> bool {
    if let Some(status) = error.status() {
      if NON_RETRYABLE_STATUSES.contains(&status) {
        return false;
      }
    }
    attempt_index < self.limits(kind).max_retries
  }

  pub fn delay_for(&self, attempt_index: u32, kind: OperationKind) -> Duration {
    self.limits(kind).delay_for(attempt_index)
  }
}

/// Config file shape: every field optional, missing ones fall back per operation kind.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RetryPolicyOverrides {
  read: LimitOverrides,
  write: LimitOverrides,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct LimitOverrides {
  max_retries: Option<u32>,
  base_delay_ms: Option<u64>,
  max_delay_ms: Option<u64>,
}

impl LimitOverrides {
  fn apply(self, defaults: RetryLimits) -> RetryLimits {
    RetryLimits {
      max_retries: self.max_retries.unwrap_or(defaults.max_retries),
      base_delay_ms: self.base_delay_ms.unwrap_or(defaults.base_delay_ms),
      max_delay_ms: self.max_delay_ms.unwrap_or(defaults.max_delay_ms),
    }
  }
}

impl From<RetryPolicyOverrides> for RetryPolicy {
  fn from(raw: RetryPolicyOverrides) -> Self {
    Self {
      read: raw.read.apply(RetryLimits::READ),
      write: raw.write.apply(RetryLimits::WRITE),
    }
  }
}
