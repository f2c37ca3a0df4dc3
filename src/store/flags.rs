//! Small persisted markers kept outside the database.
//!
//! These survive a delete-and-recreate of the store, which matters for the
//! device salt: losing it would make every cached credential undecryptable.

use chrono::{DateTime, Utc};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::warn;

use crate::error::{Error, Result};

/// File name inside the data directory.
pub const FLAGS_FILE: &str = "flags.json";

const DEVICE_SALT_BYTES: usize = 16;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlagValues {
  #[serde(default)]
  pub precache_completed: bool,
  pub precache_completed_at: Option<DateTime<Utc>>,
  /// Hex-encoded random salt bound to this installation
  pub device_salt: Option<String>,
  /// Email of the last account that signed in on this device
  pub active_email: Option<String>,
}

/// Flags persisted as a JSON file, or kept in memory when no path is given.
pub struct Flags {
  path: Option<PathBuf>,
  values: Mutex<FlagValues>,
}

impl Flags {
  /// Load flags from `path`. A missing or unreadable file starts empty.
  pub fn load(path: &Path) -> Self {
    let values = match std::fs::read_to_string(path) {
      Ok(contents) => serde_json::from_str(&contents).unwrap_or_else(|e| {
        warn!(path = %path.display(), error = %e, "ignoring unreadable flags file");
        FlagValues::default()
      }),
      Err(_) => FlagValues::default(),
    };

    Self {
      path: Some(path.to_path_buf()),
      values: Mutex::new(values),
    }
  }

  pub fn in_memory() -> Self {
    Self {
      path: None,
      values: Mutex::new(FlagValues::default()),
    }
  }

  /// Snapshot of the current values.
  pub fn get(&self) -> FlagValues {
    self
      .values
      .lock()
      .map(|v| v.clone())
      .unwrap_or_default()
  }

  /// Mutate the flags and persist them.
  pub fn update(&self, f: impl FnOnce(&mut FlagValues)) -> Result<FlagValues> {
    let mut values = self
      .values
      .lock()
      .map_err(|e| Error::unavailable(format!("Lock poisoned: {}", e)))?;
    f(&mut values);
    self.save(&values)?;
    Ok(values.clone())
  }

  /// The installation's salt, generated on first use.
  pub fn device_salt(&self) -> Result<Vec<u8>> {
    if let Some(salt) = self.get().device_salt.and_then(|s| hex::decode(s).ok()) {
      return Ok(salt);
    }

    let mut salt = vec![0u8; DEVICE_SALT_BYTES];
    rand::thread_rng().fill_bytes(&mut salt);
    let encoded = hex::encode(&salt);
    self.update(|v| v.device_salt = Some(encoded))?;
    Ok(salt)
  }

  fn save(&self, values: &FlagValues) -> Result<()> {
    let Some(path) = &self.path else {
      return Ok(());
    };
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| Error::unavailable(format!("failed to create {}: {}", parent.display(), e)))?;
    }
    let contents = serde_json::to_string_pretty(values)?;
    std::fs::write(path, contents)
      .map_err(|e| Error::unavailable(format!("failed to write {}: {}", path.display(), e)))
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_device_salt_is_stable() {
    let flags = Flags::in_memory();
    let first = flags.device_salt().unwrap();
    let second = flags.device_salt().unwrap();
    assert_eq!(first.len(), DEVICE_SALT_BYTES);
    assert_eq!(first, second);
  }

  #[test]
  fn test_flags_persist_to_file() {
    let dir = std::env::temp_dir().join(format!("medisync-flags-{}", uuid::Uuid::new_v4()));
    let path = dir.join(FLAGS_FILE);

    let flags = Flags::load(&path);
    assert!(!flags.get().precache_completed);
    flags
      .update(|v| {
        v.precache_completed = true;
        v.active_email = Some("nurse@clinic.test".to_string());
      })
      .unwrap();

    let reloaded = Flags::load(&path);
    assert!(reloaded.get().precache_completed);
    assert_eq!(
      reloaded.get().active_email.as_deref(),
      Some("nurse@clinic.test")
    );
    let _ = std::fs::remove_dir_all(dir);
  }

  #[test]
  fn test_garbage_file_starts_empty() {
    let dir = std::env::temp_dir().join(format!("medisync-flags-{}", uuid::Uuid::new_v4()));
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join(FLAGS_FILE);
    std::fs::write(&path, "{not json").unwrap();

    assert_eq!(Flags::load(&path).get(), FlagValues::default());
    let _ = std::fs::remove_dir_all(dir);
  }
}
