use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::api::RetryPolicy;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
  pub api: ApiConfig,
  #[serde(default)]
  pub retry: RetryPolicy,
  #[serde(default)]
  pub cache: CacheSettings,
  #[serde(default)]
  pub storage: StorageConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
  /// Backend root, e.g. "https://api.example.com/v1/"
  pub base_url: String,
  /// Whole-request timeout in seconds
  #[serde(default = "default_timeout_secs")]
  pub timeout_secs: u64,
  pub user_agent: Option<String>,
}

fn default_timeout_secs() -> u64 {
  30
}

#[derive(Debug, Clone, Copy, Default, Deserialize)]
pub struct CacheSettings {
  /// TTL applied when a caller does not choose one (0 = always revalidate)
  #[serde(default)]
  pub default_ttl_minutes: u32,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct StorageConfig {
  /// Database path (defaults to $XDG_DATA_HOME/feedgate/store.db)
  pub path: Option<PathBuf>,
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./feedgate.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/feedgate/config.yaml
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
        "No configuration file found. Create one at ~/.config/feedgate/config.yaml\n\
                 with at least `api: {{ base_url: ... }}`."
      )),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("feedgate.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("feedgate").join("config.yaml");
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
    config.validate()?;
    Ok(config)
  }

  fn validate(&self) -> Result<()> {
    let url = url::Url::parse(&self.api.base_url)
      .map_err(|e| eyre!("api.base_url is not a valid URL: {}", e))?;
    if !matches!(url.scheme(), "http" | "https") {
      return Err(eyre!("api.base_url must use http or https"));
    }
    if self.api.timeout_secs == 0 {
      return Err(eyre!("api.timeout_secs must be greater than zero"));
    }
    if self.retry.base_delay_ms > self.retry.max_delay_ms {
      return Err(eyre!("retry.base_delay_ms must not exceed retry.max_delay_ms"));
    }
    Ok(())
  }

  /// Config pointing at `base_url` with every other setting defaulted.
  pub fn for_base_url(base_url: &str) -> Self {
    Self {
      api: ApiConfig {
        base_url: base_url.to_string(),
        timeout_secs: default_timeout_secs(),
        user_agent: None,
      },
      retry: RetryPolicy::default(),
      cache: CacheSettings::default(),
      storage: StorageConfig::default(),
    }
  }

  /// Get the account password from environment variables.
  ///
  /// Checks FEEDGATE_PASSWORD.
  pub fn get_password() -> Result<String> {
    std::env::var("FEEDGATE_PASSWORD")
      .map_err(|_| eyre!("Password not found. Set FEEDGATE_PASSWORD environment variable."))
  }
}
