//! Offline credential storage.

use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, OptionalExtension};
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::cipher::{self, normalize_email};
use crate::error::{CredentialError, Error, Result};
use crate::store::{from_millis, to_millis, Flags, Store};

/// Offline credentials stay usable this long after the last online login.
pub const DEFAULT_CREDENTIAL_TTL_DAYS: i64 = 7;

/// Stored row for one account on this device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OfflineCredential {
  pub email: String,
  pub password_hash: String,
  pub encrypted_token: Vec<u8>,
  pub encrypted_profile: Vec<u8>,
  pub created_at: DateTime<Utc>,
  pub last_login_at: DateTime<Utc>,
  pub expires_at: DateTime<Utc>,
}

/// What a successful offline login recovers.
#[derive(Debug, Clone, PartialEq)]
pub struct OfflineSession {
  pub email: String,
  pub token: String,
  pub profile: Value,
  pub last_login_at: DateTime<Utc>,
}

/// Caches login material so a returning user can sign in without the network.
///
/// The password is only ever stored as a salted hash. The token and profile
/// are sealed with a key derived from the email and the installation salt.
/// This protects against casual inspection of the database, not against a
/// compromised device.
#[derive(Clone)]
pub struct CredentialVault {
  store: Arc<Store>,
  flags: Arc<Flags>,
  ttl: Duration,
}

impl CredentialVault {
  pub fn new(store: Arc<Store>, flags: Arc<Flags>) -> Self {
    Self {
      store,
      flags,
      ttl: Duration::days(DEFAULT_CREDENTIAL_TTL_DAYS),
    }
  }

  pub fn with_ttl(mut self, ttl: Duration) -> Self {
    self.ttl = ttl;
    self
  }

  /// Cache credentials after a successful online login.
  ///
  /// Never fails: not being able to cache credentials must not block the
  /// login that produced them.
  pub fn store(&self, email: &str, password: &str, token: &str, profile: &Value) {
    match self.try_store(email, password, token, profile, Utc::now()) {
      Ok(()) => info!(email = %normalize_email(email), "cached offline credentials"),
      Err(err) => warn!(error = %err, "failed to cache offline credentials"),
    }
  }

  pub(crate) fn try_store(
    &self,
    email: &str,
    password: &str,
    token: &str,
    profile: &Value,
    now: DateTime<Utc>,
  ) -> Result<()> {
    let email = normalize_email(email);
    let salt = self.flags.device_salt()?;
    let key = cipher::derive_key(&email, &salt).map_err(|e| Error::unavailable(e.to_string()))?;

    let profile_bytes = serde_json::to_vec(profile)?;
    let encrypted_token =
      cipher::encrypt(&key, token.as_bytes()).map_err(|e| Error::unavailable(e.to_string()))?;
    let encrypted_profile =
      cipher::encrypt(&key, &profile_bytes).map_err(|e| Error::unavailable(e.to_string()))?;
    let password_hash = cipher::hash_password(password);

    self.store.with_conn(|conn| {
      conn.execute(
        "INSERT OR REPLACE INTO offline_credentials
           (email, password_hash, encrypted_token, encrypted_profile, created_at, last_login_at, expires_at)
         VALUES (?, ?, ?, ?, ?, ?, ?)",
        params![
          email,
          password_hash,
          encrypted_token,
          encrypted_profile,
          to_millis(now),
          to_millis(now),
          to_millis(now + self.ttl)
        ],
      )
    })?;
    Ok(())
  }

  /// Authenticate offline.
  pub fn verify(&self, email: &str, password: &str) -> Result<OfflineSession> {
    self.verify_at(email, password, Utc::now())
  }

  pub(crate) fn verify_at(
    &self,
    email: &str,
    password: &str,
    now: DateTime<Utc>,
  ) -> Result<OfflineSession> {
    let email = normalize_email(email);
    let credential = self
      .load(&email)?
      .ok_or(Error::Credential(CredentialError::NotFound))?;

    if now >= credential.expires_at {
      self.delete(&email)?;
      info!(%email, "removed expired offline credentials");
      return Err(CredentialError::Expired.into());
    }

    if !cipher::verify_password(password, &credential.password_hash) {
      return Err(CredentialError::InvalidPassword.into());
    }

    let salt = self.flags.device_salt()?;
    let key = cipher::derive_key(&email, &salt)
      .map_err(|_| Error::Credential(CredentialError::DecryptionFailed))?;
    let token = cipher::decrypt(&key, &credential.encrypted_token)
      .ok()
      .and_then(|bytes| String::from_utf8(bytes.to_vec()).ok())
      .ok_or(Error::Credential(CredentialError::DecryptionFailed))?;
    let profile: Value = cipher::decrypt(&key, &credential.encrypted_profile)
      .ok()
      .and_then(|bytes| serde_json::from_slice(&bytes).ok())
      .ok_or(Error::Credential(CredentialError::DecryptionFailed))?;

    self.store.with_conn(|conn| {
      conn.execute(
        "UPDATE offline_credentials SET last_login_at = ? WHERE email = ?",
        params![to_millis(now), email],
      )
    })?;
    debug!(%email, "offline login succeeded");

    Ok(OfflineSession {
      email,
      token,
      profile,
      last_login_at: now,
    })
  }

  /// Sign-out handling. Credentials survive logout unless
  /// `keep_for_offline` is false; `email = None` then removes every account.
  pub fn clear(&self, email: Option<&str>, keep_for_offline: bool) -> Result<usize> {
    if keep_for_offline {
      return Ok(0);
    }

    let removed = match email {
      Some(email) => self.delete(&normalize_email(email))?,
      None => self
        .store
        .with_conn(|conn| conn.execute("DELETE FROM offline_credentials", []))?,
    };
    info!(removed, "removed offline credentials");
    Ok(removed)
  }

  /// Delete every expired row.
  pub fn purge_expired(&self) -> Result<usize> {
    let now = to_millis(Utc::now());
    self.store.with_conn(|conn| {
      conn.execute(
        "DELETE FROM offline_credentials WHERE expires_at <= ?",
        params![now],
      )
    })
  }

  /// Stored row for `email`, if any.
  pub fn load(&self, email: &str) -> Result<Option<OfflineCredential>> {
    let email = normalize_email(email);
    self.store.with_conn(|conn| {
      conn
        .query_row(
          "SELECT email, password_hash, encrypted_token, encrypted_profile, created_at, last_login_at, expires_at
           FROM offline_credentials WHERE email = ?",
          params![email],
          |row| {
            Ok(OfflineCredential {
              email: row.get(0)?,
              password_hash: row.get(1)?,
              encrypted_token: row.get(2)?,
              encrypted_profile: row.get(3)?,
              created_at: from_millis(row.get(4)?),
              last_login_at: from_millis(row.get(5)?),
              expires_at: from_millis(row.get(6)?),
            })
          },
        )
        .optional()
    })
  }

  fn delete(&self, email: &str) -> Result<usize> {
    self.store.with_conn(|conn| {
      conn.execute(
        "DELETE FROM offline_credentials WHERE email = ?",
        params![email],
      )
    })
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  fn vault() -> CredentialVault {
    CredentialVault::new(
      Arc::new(Store::open_in_memory().unwrap()),
      Arc::new(Flags::in_memory()),
    )
  }

  fn profile() -> Value {
    json!({"id": 12, "name": "Dana", "role": "nurse"})
  }

  #[test]
  fn test_store_then_verify_round_trip() {
    let vault = vault();
    vault.store("nurse@clinic.test", "pw", "tok-123", &profile());

    let session = vault.verify("nurse@clinic.test", "pw").unwrap();
    assert_eq!(session.token, "tok-123");
    assert_eq!(session.profile, profile());
    assert_eq!(session.email, "nurse@clinic.test");
  }

  #[test]
  fn test_wrong_password() {
    let vault = vault();
    vault.store("nurse@clinic.test", "pw", "tok", &profile());
    let err = vault.verify("nurse@clinic.test", "nope").unwrap_err();
    assert!(matches!(err, Error::Credential(CredentialError::InvalidPassword)));
  }

  #[test]
  fn test_unknown_email() {
    let vault = vault();
    vault.store("nurse@clinic.test", "pw", "tok", &profile());
    let err = vault.verify("doctor@clinic.test", "pw").unwrap_err();
    assert!(matches!(err, Error::Credential(CredentialError::NotFound)));
  }

  #[test]
  fn test_email_is_normalized() {
    let vault = vault();
    vault.store(" Nurse@Clinic.test", "pw", "tok", &profile());
    assert!(vault.verify("nurse@clinic.test", "pw").is_ok());
  }

  #[test]
  fn test_expired_credentials_are_deleted() {
    let vault = vault();
    let created = Utc::now() - Duration::days(8);
    vault
      .try_store("nurse@clinic.test", "pw", "tok", &profile(), created)
      .unwrap();

    let err = vault.verify("nurse@clinic.test", "pw").unwrap_err();
    assert!(matches!(err, Error::Credential(CredentialError::Expired)));
    assert!(vault.load("nurse@clinic.test").unwrap().is_none());
  }

  #[test]
  fn test_changed_salt_fails_decryption() {
    let store = Arc::new(Store::open_in_memory().unwrap());
    let first = CredentialVault::new(store.clone(), Arc::new(Flags::in_memory()));
    first.store("nurse@clinic.test", "pw", "tok", &profile());

    let second = CredentialVault::new(store, Arc::new(Flags::in_memory()));
    let err = second.verify("nurse@clinic.test", "pw").unwrap_err();
    assert!(matches!(err, Error::Credential(CredentialError::DecryptionFailed)));
  }

  #[test]
  fn test_verify_updates_last_login() {
    let vault = vault();
    let created = Utc::now() - Duration::days(2);
    vault
      .try_store("nurse@clinic.test", "pw", "tok", &profile(), created)
      .unwrap();
    let now = Utc::now();
    vault.verify_at("nurse@clinic.test", "pw", now).unwrap();

    let row = vault.load("nurse@clinic.test").unwrap().unwrap();
    assert_eq!(row.last_login_at, from_millis(to_millis(now)));
    assert_eq!(row.created_at, from_millis(to_millis(created)));
  }

  #[test]
  fn test_stored_row_holds_no_plaintext() {
    let vault = vault();
    vault.store("nurse@clinic.test", "pw", "tok-plain", &profile());
    let row = vault.load("nurse@clinic.test").unwrap().unwrap();
    assert!(!row.password_hash.contains("pw"));
    let needle = b"tok-plain";
    assert!(!row
      .encrypted_token
      .windows(needle.len())
      .any(|w| w == needle));
  }

  #[test]
  fn test_clear_keeps_credentials_by_default() {
    let vault = vault();
    vault.store("nurse@clinic.test", "pw", "tok", &profile());
    assert_eq!(vault.clear(Some("nurse@clinic.test"), true).unwrap(), 0);
    assert!(vault.verify("nurse@clinic.test", "pw").is_ok());

    assert_eq!(vault.clear(Some("nurse@clinic.test"), false).unwrap(), 1);
    assert!(matches!(
      vault.verify("nurse@clinic.test", "pw").unwrap_err(),
      Error::Credential(CredentialError::NotFound)
    ));
  }

  #[test]
  fn test_store_fails_soft_without_storage() {
    let vault = CredentialVault::new(
      Arc::new(Store::unavailable("private mode")),
      Arc::new(Flags::in_memory()),
    );
    vault.store("nurse@clinic.test", "pw", "tok", &profile());
    assert!(vault.verify("nurse@clinic.test", "pw").is_err());
  }
}
