//! Error taxonomy for the data access layer.
//!
//! Every failure that leaves the request executor is an [`ApiError`]. Downstream
//! policy (retry, unauthorized handling) classifies errors by matching on the
//! typed status code rather than by parsing the rendered message.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Coarse classification of an [`ApiError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
  /// The request could not be sent or the response could not be received
  Transport,
  /// Non-2xx status other than 401
  Http,
  /// HTTP 401
  Auth,
  /// A 2xx body that is not valid JSON
  Decode,
}

/// A classified failure from the API.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ApiError {
  #[error("{message}")]
  Transport { message: String },

  /// Rendered as `"<status>: <message>"`.
  #[error("{status}: {message}")]
  Http { status: u16, message: String },

  #[error("{message}")]
  Decode { message: String },
}

impl ApiError {
  pub fn transport(message: impl Into<String>) -> Self {
    Self::Transport {
      message: message.into(),
    }
  }

  pub fn http(status: u16, message: impl Into<String>) -> Self {
    Self::Http {
      status,
      message: message.into(),
    }
  }

  pub fn decode(message: impl Into<String>) -> Self {
    Self::Decode {
      message: message.into(),
    }
  }

  /// HTTP status code, if the server answered at all.
  pub fn status(&self) -> Option<u16> {
    match self {
      Self::Http { status, .. } => Some(*status),
      _ => None,
    }
  }

  pub fn message(&self) -> &str {
    match self {
      Self::Transport { message } | Self::Http { message, .. } | Self::Decode { message } => {
        message
      }
    }
  }

  pub fn kind(&self) -> ErrorKind {
    match self {
      Self::Transport { .. } => ErrorKind::Transport,
      Self::Http { status: 401, .. } => ErrorKind::Auth,
      Self::Http { .. } => ErrorKind::Http,
      Self::Decode { .. } => ErrorKind::Decode,
    }
  }

  pub fn is_unauthorized(&self) -> bool {
    self.kind() == ErrorKind::Auth
  }

  /// Snapshot stored on a cache entry and exposed to subscribers.
  pub fn record(&self) -> ErrorRecord {
    ErrorRecord {
      status_code: self.status(),
      message: self.message().to_string(),
    }
  }
}

impl From<reqwest::Error> for ApiError {
  fn from(err: reqwest::Error) -> Self {
    Self::transport(err.to_string())
  }
}

/// Error as recorded on a cache entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorRecord {
  pub status_code: Option<u16>,
  pub message: String,
}

impl fmt::Display for ErrorRecord {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self.status_code {
      Some(status) => write!(f, "{}: {}", status, self.message),
      None => f.write_str(&self.message),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_http_error_display() {
    let err = ApiError::http(404, "not found");
    assert_eq!(err.to_string(), "404: not found");
    assert_eq!(err.status(), Some(404));
    assert_eq!(err.kind(), ErrorKind::Http);
  }

  #[test]
  fn test_unauthorized_kind() {
    let err = ApiError::http(401, "Unauthorized");
    assert!(err.is_unauthorized());
    assert_eq!(err.kind(), ErrorKind::Auth);
    assert!(!ApiError::http(403, "Forbidden").is_unauthorized());
  }

  #[test]
  fn test_transport_has_no_status() {
    let err = ApiError::transport("connection refused");
    assert_eq!(err.status(), None);
    assert_eq!(err.to_string(), "connection refused");
    assert_eq!(err.kind(), ErrorKind::Transport);
  }

  #[test]
  fn test_record_matches_display() {
    let err = ApiError::http(500, "boom");
    let record = err.record();
    assert_eq!(record.status_code, Some(500));
    assert_eq!(record.message, "boom");
    assert_eq!(record.to_string(), err.to_string());

    let record = ApiError::decode("expected value").record();
    assert_eq!(record.to_string(), "expected value");
  }
}
