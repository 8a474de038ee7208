use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::query::RetryPolicy;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
  pub api: ApiConfig,
  pub queries: QueryConfig,
  pub log: LogConfig,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
  /// Base URL that relative request paths (e.g. "/api/habits") are resolved against
  pub base_url: Option<String>,
  /// Per-request timeout. Unset means no timeout.
  pub timeout_ms: Option<u64>,
}

impl ApiConfig {
  pub fn timeout(&self) -> Option<Duration> {
    self.timeout_ms.map(Duration::from_millis)
  }
}

/// Cache manager defaults applied to every query.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct QueryConfig {
  /// How long fetched data counts as fresh. Zero means stale as soon as stored.
  pub stale_time_ms: u64,
  /// Idle time after the last subscriber leaves before an entry is evicted
  pub gc_time_ms: u64,
  pub refetch_on_mount: bool,
  pub refetch_on_window_focus: bool,
  pub refetch_on_reconnect: bool,
  pub retry: RetryPolicy,
}

impl Default for QueryConfig {
  fn default() -> Self {
    Self {
      stale_time_ms: 0,
      gc_time_ms: 10 * 60 * 1000,
      refetch_on_mount: true,
      refetch_on_window_focus: true,
      refetch_on_reconnect: true,
      retry: RetryPolicy::default(),
    }
  }
}

impl QueryConfig {
  pub fn stale_time(&self) -> Duration {
    Duration::from_millis(self.stale_time_ms)
  }

  pub fn gc_time(&self) -> Duration {
    Duration::from_millis(self.gc_time_ms)
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LogConfig {
  /// `EnvFilter` directive, overridden by `RUST_LOG` when set
  pub filter: String,
  /// Write daily rolling log files here instead of stderr
  pub directory: Option<PathBuf>,
}

impl Default for LogConfig {
  fn default() -> Self {
    Self {
      filter: "info".to_string(),
      directory: None,
    }
  }
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./tracker-query.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/tracker-query/config.yaml
  ///
  /// Without an explicit path and with no file found, defaults are used.
  pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
    let path = if let Some(p) = explicit_path {
      if p.exists() {
        Some(p.to_path_buf())
      } else {
        return Err(eyre!("Config file not found: {}", p.display()));
      }
    } else {
      Self::find_config_file()
    };

    match path {
      Some(p) => Self::load_from_path(&p),
      None => Ok(Self::default()),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    let local = PathBuf::from("tracker-query.yaml");
    if local.exists() {
      return Some(local);
    }

    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("tracker-query").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    Self::from_yaml(&contents)
      .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))
  }

  pub fn from_yaml(contents: &str) -> Result<Self> {
    let config: Config = serde_yaml::from_str(contents)?;
    Ok(config)
  }
}
