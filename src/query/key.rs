//! Query keys: the logical identity of a cached request.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::fmt;
use std::hash::{Hash, Hasher};

/// A primitive element of a [`QueryKey`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum KeyPart {
  Null,
  Bool(bool),
  Int(i64),
  Float(f64),
  Str(String),
}

impl KeyPart {
  fn to_value(&self) -> Value {
    match self {
      Self::Null => Value::Null,
      Self::Bool(b) => Value::Bool(*b),
      Self::Int(i) => Value::from(*i),
      Self::Float(f) => Value::from(*f),
      Self::Str(s) => Value::String(s.clone()),
    }
  }
}

impl From<&str> for KeyPart {
  fn from(s: &str) -> Self {
    Self::Str(s.to_string())
  }
}

impl From<String> for KeyPart {
  fn from(s: String) -> Self {
    Self::Str(s)
  }
}

impl From<i64> for KeyPart {
  fn from(i: i64) -> Self {
    Self::Int(i)
  }
}

impl From<i32> for KeyPart {
  fn from(i: i32) -> Self {
    Self::Int(i64::from(i))
  }
}

impl From<u32> for KeyPart {
  fn from(i: u32) -> Self {
    Self::Int(i64::from(i))
  }
}

impl From<f64> for KeyPart {
  fn from(f: f64) -> Self {
    Self::Float(f)
  }
}

impl From<bool> for KeyPart {
  fn from(b: bool) -> Self {
    Self::Bool(b)
  }
}

impl<T: Into<KeyPart>> From<Option<T>> for KeyPart {
  fn from(value: Option<T>) -> Self {
    value.map(Into::into).unwrap_or(Self::Null)
  }
}

/// Ordered key identifying a cacheable request. The first element is always the
/// request URL.
///
/// Two keys are equal iff their canonical JSON serializations are equal, so
/// `["/api/logs", 1]` and `["/api/logs", 1.0]` are distinct keys.
#[derive(Debug, Clone)]
pub struct QueryKey {
  parts: Vec<KeyPart>,
  canonical: String,
}

impl QueryKey {
  pub fn new(url: impl Into<String>) -> Self {
    Self::from_parts(vec![KeyPart::Str(url.into())])
  }

  /// Append a parameter to the key.
  pub fn with(self, part: impl Into<KeyPart>) -> Self {
    let mut parts = self.parts;
    parts.push(part.into());
    Self::from_parts(parts)
  }

  fn from_parts(parts: Vec<KeyPart>) -> Self {
    let canonical = Value::Array(parts.iter().map(KeyPart::to_value).collect()).to_string();
    Self { parts, canonical }
  }

  /// The request URL (first key element).
  pub fn url(&self) -> &str {
    match self.parts.first() {
      Some(KeyPart::Str(url)) => url,
      _ => "",
    }
  }

  pub fn parts(&self) -> &[KeyPart] {
    &self.parts
  }

  /// Canonical serialized form; this is the cache identity.
  pub fn canonical(&self) -> &str {
    &self.canonical
  }

  /// SHA256 of the canonical form, for stable fixed-length log tags.
  pub fn cache_hash(&self) -> String {
    let mut hasher = Sha256::new();
    hasher.update(self.canonical.as_bytes());
    hex::encode(hasher.finalize())
  }

  /// Element-wise prefix match, used for bulk invalidation.
  pub fn starts_with(&self, prefix: &QueryKey) -> bool {
    prefix.parts.len() <= self.parts.len()
      && prefix
        .parts
        .iter()
        .zip(&self.parts)
        .all(|(a, b)| a.to_value() == b.to_value())
  }
}

impl PartialEq for QueryKey {
  fn eq(&self, other: &Self) -> bool {
    self.canonical == other.canonical
  }
}

impl Eq for QueryKey {}

impl Hash for QueryKey {
  fn hash<H: Hasher>(&self, state: &mut H) {
    self.canonical.hash(state);
  }
}

impl fmt::Display for QueryKey {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.canonical)
  }
}

impl From<&str> for QueryKey {
  fn from(url: &str) -> Self {
    Self::new(url)
  }
}

impl From<String> for QueryKey {
  fn from(url: String) -> Self {
    Self::new(url)
  }
}
