use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

use crate::sync::store::{MemoryStorage, SqliteStorage};
use crate::sync::{Store, SyncOptions};

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
  pub api: ApiConfig,
  pub storage: StorageConfig,
  pub connectivity: ConnectivityConfig,
  pub sync: SyncConfig,
  pub log: LogConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
  /// Base URL that relative resource paths are joined to
  pub base_url: String,
  pub timeout_secs: u64,
}

impl Default for ApiConfig {
  fn default() -> Self {
    Self {
      base_url: "http://localhost:3000/api".to_string(),
      timeout_secs: 30,
    }
  }
}

impl ApiConfig {
  pub fn timeout(&self) -> Duration {
    Duration::from_secs(self.timeout_secs)
  }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
  /// Database file (defaults to the user data directory)
  pub path: Option<PathBuf>,
  /// Keep the queue and cache in memory only
  pub ephemeral: bool,
}

impl StorageConfig {
  pub fn open(&self) -> Result<Store> {
    if self.ephemeral {
      return Ok(Store::new(MemoryStorage::new()));
    }
    let storage = match &self.path {
      Some(path) => SqliteStorage::open(path)?,
      None => SqliteStorage::open_default()?,
    };
    Ok(Store::new(storage))
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ConnectivityConfig {
  /// URL probed to decide whether the API is reachable (defaults to the API base URL)
  pub probe_url: Option<String>,
  pub probe_interval_secs: u64,
}

impl Default for ConnectivityConfig {
  fn default() -> Self {
    Self {
      probe_url: None,
      probe_interval_secs: 15,
    }
  }
}

impl ConnectivityConfig {
  pub fn probe_url(&self, api: &ApiConfig) -> Result<Url> {
    let raw = self.probe_url.as_deref().unwrap_or(&api.base_url);
    Url::parse(raw).map_err(|e| eyre!("Invalid probe URL '{}': {}", raw, e))
  }

  pub fn probe_interval(&self) -> Duration {
    Duration::from_secs(self.probe_interval_secs.max(1))
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
  /// URL fragments whose writes fail instead of being queued while offline
  pub no_queue_paths: Vec<String>,
  pub event_capacity: usize,
}

impl Default for SyncConfig {
  fn default() -> Self {
    let defaults = SyncOptions::default();
    Self {
      no_queue_paths: defaults.no_queue_paths,
      event_capacity: defaults.event_capacity,
    }
  }
}

impl SyncConfig {
  pub fn options(&self) -> SyncOptions {
    SyncOptions {
      no_queue_paths: self.no_queue_paths.clone(),
      event_capacity: self.event_capacity,
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LogConfig {
  /// Write daily log files here instead of stderr
  pub directory: Option<PathBuf>,
  /// Filter directive used when RUST_LOG is unset
  pub filter: String,
}

impl Default for LogConfig {
  fn default() -> Self {
    Self {
      directory: None,
      filter: "info".to_string(),
    }
  }
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./outbox.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/outbox/config.yaml
  ///
  /// Without any file the defaults apply.
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
    let local = PathBuf::from("outbox.yaml");
    if local.exists() {
      return Some(local);
    }

    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("outbox").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    Self::parse(&contents)
      .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))
  }

  pub fn parse(contents: &str) -> Result<Self> {
    serde_yaml::from_str(contents).map_err(|e| eyre!("{}", e))
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_empty_file_uses_defaults() {
    let config = Config::parse("{}").unwrap();
    assert_eq!(config.api.base_url, "http://localhost:3000/api");
    assert_eq!(
      config.sync.no_queue_paths,
      vec!["/auth/login".to_string(), "/auth/register".to_string()]
    );
    assert_eq!(config.connectivity.probe_interval(), Duration::from_secs(15));
    assert!(!config.storage.ephemeral);
  }

  #[test]
  fn test_partial_sections_merge_with_defaults() {
    let config = Config::parse(
      r#"
api:
  base_url: http://10.0.0.5:8000
storage:
  ephemeral: true
sync:
  no_queue_paths: [/auth/]
"#,
    )
    .unwrap();

    assert_eq!(config.api.base_url, "http://10.0.0.5:8000");
    assert_eq!(config.api.timeout_secs, 30);
    assert_eq!(config.sync.no_queue_paths, vec!["/auth/".to_string()]);
    assert_eq!(config.sync.event_capacity, 64);
    assert_eq!(
      config.connectivity.probe_url(&config.api).unwrap().as_str(),
      "http://10.0.0.5:8000/"
    );
    assert!(config.storage.open().is_ok());
  }

  #[test]
  fn test_missing_explicit_file_is_an_error() {
    let dir = tempfile::tempdir().unwrap();
    assert!(Config::load(Some(&dir.path().join("nope.yaml"))).is_err());
  }

  #[test]
  fn test_load_from_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("outbox.yaml");
    std::fs::write(
      &path,
      "connectivity:\n  probe_url: http://api.test/health\n  probe_interval_secs: 0\n",
    )
    .unwrap();

    let config = Config::load(Some(&path)).unwrap();
    assert_eq!(
      config.connectivity.probe_url(&config.api).unwrap().as_str(),
      "http://api.test/health"
    );
    assert_eq!(config.connectivity.probe_interval(), Duration::from_secs(1));
  }
}
