use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
  pub api: ApiConfig,
  #[serde(default)]
  pub cache: CacheConfig,
  #[serde(default)]
  pub queue: QueueConfig,
  #[serde(default)]
  pub sync: SyncConfig,
  #[serde(default)]
  pub precache: PrecacheConfig,
  #[serde(default)]
  pub connectivity: ConnectivityConfig,
  #[serde(default)]
  pub credentials: CredentialsConfig,
  /// Overrides the default data directory ($XDG_DATA_HOME/medisync)
  pub data_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
  pub base_url: String,
  #[serde(default = "default_login_path")]
  pub login_path: String,
  #[serde(default = "default_timeout_secs")]
  pub timeout_secs: u64,
}

fn default_login_path() -> String {
  "/auth/login/".to_string()
}

fn default_timeout_secs() -> u64 {
  30
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
  /// Lifetime of a cached response
  pub ttl_hours: i64,
  /// Serve a sibling query of the same resource when the exact key is missing
  pub prefix_fallback: bool,
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      ttl_hours: 24,
      prefix_fallback: true,
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
  pub max_attempts: u32,
  /// How long `Done` items stay visible before being pruned
  pub done_retention_minutes: i64,
}

impl Default for QueueConfig {
  fn default() -> Self {
    Self {
      max_attempts: 3,
      done_retention_minutes: 60,
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
  /// Re-read affected collections after confirmed writes
  pub refresh_after_sync: bool,
}

impl Default for SyncConfig {
  fn default() -> Self {
    Self {
      refresh_after_sync: true,
    }
  }
}

/// A family of endpoints scoped to every record of a parent listing.
///
/// `child` contains an `{id}` placeholder, e.g. `/organizations/{id}/departments/`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct EndpointFamily {
  pub parent: String,
  pub child: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PrecacheConfig {
  pub max_concurrent: usize,
  pub dispatch_delay_ms: u64,
  pub endpoints: Vec<String>,
  pub families: Vec<EndpointFamily>,
}

impl Default for PrecacheConfig {
  fn default() -> Self {
    let endpoints = [
      "/organizations/",
      "/patients/",
      "/employees/",
      "/appointments/",
      "/schedules/",
      "/departments/",
      "/notifications/",
      "/auth/me/",
    ];
    let families = ["departments", "employees", "schedules"]
      .iter()
      .map(|child| EndpointFamily {
        parent: "/organizations/".to_string(),
        child: format!("/organizations/{{id}}/{}/", child),
      })
      .collect();

    Self {
      max_concurrent: 5,
      dispatch_delay_ms: 100,
      endpoints: endpoints.iter().map(|e| e.to_string()).collect(),
      families,
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ConnectivityConfig {
  /// URL probed periodically to detect connectivity. Without one the device is
  /// assumed online.
  pub probe_url: Option<String>,
  pub probe_interval_secs: u64,
  pub force_offline: bool,
}

impl Default for ConnectivityConfig {
  fn default() -> Self {
    Self {
      probe_url: None,
      probe_interval_secs: 15,
      force_offline: false,
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CredentialsConfig {
  pub ttl_days: i64,
}

impl Default for CredentialsConfig {
  fn default() -> Self {
    Self { ttl_days: 7 }
  }
}

impl Config {
  /// Minimal configuration pointing at `base_url`, everything else defaulted.
  pub fn with_base_url(base_url: impl Into<String>) -> Self {
    Self {
      api: ApiConfig {
        base_url: base_url.into(),
        login_path: default_login_path(),
        timeout_secs: default_timeout_secs(),
      },
      cache: CacheConfig::default(),
      queue: QueueConfig::default(),
      sync: SyncConfig::default(),
      precache: PrecacheConfig::default(),
      connectivity: ConnectivityConfig::default(),
      credentials: CredentialsConfig::default(),
      data_dir: None,
    }
  }

  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./medisync.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/medisync/config.yaml
  pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
    let path = if let Some(p) = explicit_path {
      if p.exists() {
        Some(p.to_path_buf())
      } else {
        return Err(Error::Config(format!(
          "Config file not found: {}",
          p.display()
        )));
      }
    } else {
      Self::find_config_file()
    };

    match path {
      Some(p) => Self::load_from_path(&p),
      None => Err(Error::Config(
        "No configuration file found. Create one at ~/.config/medisync/config.yaml".to_string(),
      )),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    let local = PathBuf::from("medisync.yaml");
    if local.exists() {
      return Some(local);
    }

    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("medisync").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path).map_err(|e| {
      Error::Config(format!(
        "Failed to read config file {}: {}",
        path.display(),
        e
      ))
    })?;

    Self::parse(&contents)
      .map_err(|e| Error::Config(format!("{} ({})", e, path.display())))
  }

  /// Parse configuration from YAML text.
  pub fn parse(contents: &str) -> Result<Self> {
    serde_yaml::from_str(contents)
      .map_err(|e| Error::Config(format!("Failed to parse config: {}", e)))
  }

  /// Directory holding the database, flags file and logs.
  pub fn data_dir(&self) -> Result<PathBuf> {
    if let Some(dir) = &self.data_dir {
      return Ok(dir.clone());
    }

    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| Error::Config("Could not determine data directory".to_string()))?;

    Ok(data_dir.join("medisync"))
  }

  /// Get a session token from the environment, if one was provided.
  pub fn get_session_token() -> Option<String> {
    std::env::var("MEDISYNC_TOKEN")
      .ok()
      .filter(|t| !t.trim().is_empty())
  }

  /// Get the account password from environment variables.
  pub fn get_password() -> Result<String> {
    std::env::var("MEDISYNC_PASSWORD").map_err(|_| {
      Error::Config("Password not found. Set MEDISYNC_PASSWORD environment variable.".to_string())
    })
  }
}
