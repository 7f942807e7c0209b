use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::cache::BackoffPolicy;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
  pub backend: BackendConfig,
  /// Interest-join source; the feed merges it only when enabled under `feed`
  pub interests: Option<InterestsConfig>,
  #[serde(default)]
  pub images: ImagesConfig,
  #[serde(default)]
  pub feed: FeedConfig,
  #[serde(default)]
  pub cache: CacheConfig,
  #[serde(default)]
  pub log: LogConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BackendConfig {
  pub url: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct InterestsConfig {
  pub url: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ImagesConfig {
  /// Host serving content-addressed files
  pub gateway_host: String,
  pub sign_endpoint: String,
  /// Images whose larger side is below this are served unsigned
  pub min_dimension: u32,
  pub cache_capacity: usize,
  pub cache_ttl_secs: u64,
  pub max_concurrent: usize,
  /// Callers allowed to queue for a signing slot
  pub max_pending: usize,
  pub max_retries: u32,
  pub retry_base_delay_ms: u64,
  /// Requested signature validity
  pub expires_secs: u64,
}

impl Default for ImagesConfig {
  fn default() -> Self {
    Self {
      gateway_host: "gateway.example.cloud".to_string(),
      sign_endpoint: "https://api.pinata.cloud/v3/files/sign".to_string(),
      min_dimension: 100,
      cache_capacity: 100,
      cache_ttl_secs: 3600,
      max_concurrent: 2,
      max_pending: 8,
      max_retries: 3,
      retry_base_delay_ms: 500,
      expires_secs: 500_000,
    }
  }
}

impl ImagesConfig {
  pub fn cache_ttl(&self) -> Duration {
    Duration::from_secs(self.cache_ttl_secs)
  }

  pub fn backoff(&self) -> BackoffPolicy {
    BackoffPolicy::new(
      Duration::from_millis(self.retry_base_delay_ms),
      self.max_retries,
    )
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FeedConfig {
  pub page_size: usize,
  pub include_interest_joins: bool,
  /// Start with network fetches enabled; otherwise only the snapshot shows
  /// until the feed network is enabled
  pub network_enabled: bool,
}

impl Default for FeedConfig {
  fn default() -> Self {
    Self {
      page_size: 15,
      include_interest_joins: false,
      network_enabled: true,
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
  /// Persist snapshots; when false every snapshot read misses
  pub enabled: bool,
  pub path: Option<PathBuf>,
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      enabled: true,
      path: None,
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LogConfig {
  pub level: String,
  /// Directory for a daily-rolled log file
  pub dir: Option<PathBuf>,
}

impl Default for LogConfig {
  fn default() -> Self {
    Self {
      level: "info".to_string(),
      dir: None,
    }
  }
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./feedcore.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/feedcore/config.yaml
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
      None => Err(eyre!(
        "No configuration file found. Create one at ~/.config/feedcore/config.yaml"
      )),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("feedcore.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("feedcore").join("config.yaml");
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
    serde_yaml::from_str(contents).map_err(|e| eyre!("{}", e))
  }

  /// Get the signing service token from environment variables.
  ///
  /// Checks FEEDCORE_SIGNING_TOKEN first, then PINATA_JWT as fallback.
  pub fn get_signing_token() -> Result<String> {
    std::env::var("FEEDCORE_SIGNING_TOKEN")
      .or_else(|_| std::env::var("PINATA_JWT"))
      .map_err(|_| {
        eyre!("Signing token not found. Set FEEDCORE_SIGNING_TOKEN or PINATA_JWT environment variable.")
      })
  }

  /// Get the interest source API key from FEEDCORE_INTERESTS_KEY.
  pub fn get_interests_key() -> Result<String> {
    std::env::var("FEEDCORE_INTERESTS_KEY")
      .map_err(|_| eyre!("Interests key not found. Set FEEDCORE_INTERESTS_KEY environment variable."))
  }

  /// Optional record store auth token from FEEDCORE_BACKEND_TOKEN.
  pub fn get_backend_token() -> Option<String> {
    std::env::var("FEEDCORE_BACKEND_TOKEN").ok()
  }
}
