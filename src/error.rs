//! Error types for the offline sync engine.

use thiserror::Error;

/// Result type alias for engine operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by the store, cache, queue, router and sync processor.
#[derive(Debug, Error)]
pub enum Error {
  /// No persistent storage in this context; callers degrade to online-only.
  #[error("Local storage unavailable: {0}")]
  StorageUnavailable(String),

  /// The store schema is inconsistent. Recovered by delete-and-recreate.
  #[error("Local storage schema is corrupted: {0}")]
  SchemaCorruption(String),

  /// SQLite error from the local store
  #[error("Storage error: {0}")]
  Storage(#[from] rusqlite::Error),

  /// Offline read with nothing usable in the cache
  #[error("No cached data available offline for {key}")]
  NoCachedData { key: String },

  /// Offline authentication failure
  #[error(transparent)]
  Credential(#[from] CredentialError),

  /// Replaying a queued write against the server failed
  #[error("Replay of queued mutation {id} failed: {message}")]
  SyncReplayFailed { id: i64, message: String },

  /// Network call failed
  #[error(transparent)]
  Transport(#[from] TransportError),

  /// JSON serialization/deserialization error
  #[error("JSON error: {0}")]
  Json(#[from] serde_json::Error),

  /// Endpoint key could not be parsed
  #[error("Invalid endpoint key: {0}")]
  InvalidEndpoint(String),

  /// Configuration problem
  #[error("Configuration error: {0}")]
  Config(String),
}

impl Error {
  /// Create a storage unavailable error
  pub fn unavailable(message: impl Into<String>) -> Self {
    Self::StorageUnavailable(message.into())
  }

  /// Create a schema corruption error
  pub fn corruption(message: impl Into<String>) -> Self {
    Self::SchemaCorruption(message.into())
  }

  /// True when the failure means the network could not be reached at all.
  pub fn is_connection(&self) -> bool {
    matches!(self, Self::Transport(TransportError::Connection(_)))
  }
}

/// Offline login failures. Each maps to a different message for the user.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CredentialError {
  #[error("No offline credentials for this account. Sign in once while online first.")]
  NotFound,

  #[error("Offline credentials have expired. Sign in online to refresh them.")]
  Expired,

  #[error("Invalid password")]
  InvalidPassword,

  #[error("Stored credentials could not be decrypted on this device. Sign in online again.")]
  DecryptionFailed,
}

/// Errors from the network boundary.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
  /// The server could not be reached (DNS, refused, reset, timeout)
  #[error("Connection failed: {0}")]
  Connection(String),

  /// The server answered with a non-success status
  #[error("API error ({status}): {message}")]
  Status { status: u16, message: String },

  /// The response body could not be decoded
  #[error("Failed to decode response: {0}")]
  Decode(String),
}

impl TransportError {
  /// Create a status error from code and message
  pub fn status(status: u16, message: impl Into<String>) -> Self {
    Self::Status {
      status,
      message: message.into(),
    }
  }
}

impl From<reqwest::Error> for TransportError {
  fn from(err: reqwest::Error) -> Self {
    if err.is_connect() || err.is_timeout() || err.is_request() {
      Self::Connection(err.to_string())
    } else if err.is_decode() || err.is_body() {
      Self::Decode(err.to_string())
    } else {
      let status = err.status().map(|s| s.as_u16()).unwrap_or(0);
      Self::status(status, err.to_string())
    }
  }
}
