use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::session::Account;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
  pub tracker: TrackerConfig,
  /// Root for per-account databases and logs (defaults to the XDG data dir)
  pub data_dir: Option<PathBuf>,
  #[serde(default)]
  pub decoder: DecoderConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TrackerConfig {
  /// Base URL of the tracker, e.g. "https://bugzilla.mozilla.org"
  pub url: String,
  /// Login name (e-mail) of the signed-in user
  pub login: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DecoderConfig {
  /// Pending decode requests before callers wait for the worker
  #[serde(default = "default_queue")]
  pub queue: usize,
}

fn default_queue() -> usize {
  16
}

impl Default for DecoderConfig {
  fn default() -> Self {
    Self {
      queue: default_queue(),
    }
  }
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./bugsync.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/bugsync/config.yaml
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
        "No configuration file found. Create one at ~/.config/bugsync/config.yaml"
      )),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    let local = PathBuf::from("bugsync.yaml");
    if local.exists() {
      return Some(local);
    }

    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("bugsync").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    Self::parse(&contents).map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))
  }

  fn parse(contents: &str) -> Result<Self> {
    let config: Config = serde_yaml::from_str(contents)?;
    url::Url::parse(&config.tracker.url)
      .map_err(|e| eyre!("Invalid tracker url '{}': {}", config.tracker.url, e))?;
    Ok(config)
  }

  /// Directory holding databases and logs.
  pub fn data_dir(&self) -> Result<PathBuf> {
    if let Some(dir) = &self.data_dir {
      return Ok(dir.clone());
    }
    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| eyre!("Could not determine data directory"))?;

    Ok(data_dir.join("bugsync"))
  }

  /// The account this configuration signs in as.
  pub fn account(&self) -> Result<Account> {
    let host = url::Url::parse(&self.tracker.url)?
      .host_str()
      .map(String::from)
      .ok_or_else(|| eyre!("Tracker url has no host: {}", self.tracker.url))?;

    Ok(Account {
      host,
      login: self.tracker.login.clone(),
    })
  }

  /// Get the tracker API key from environment variables.
  ///
  /// Checks BUGSYNC_API_KEY first, then BUGZILLA_API_KEY as fallback.
  pub fn get_api_key() -> Result<String> {
    std::env::var("BUGSYNC_API_KEY")
      .or_else(|_| std::env::var("BUGZILLA_API_KEY"))
      .map_err(|_| {
        eyre!("Tracker API key not found. Set BUGSYNC_API_KEY or BUGZILLA_API_KEY environment variable.")
      })
  }
}
