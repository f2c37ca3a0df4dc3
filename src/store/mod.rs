//! Persistent local store.
//!
//! A single SQLite database holds cached responses, the mutation queue, the
//! offline credentials and per-record sync bookkeeping. The store can also be
//! constructed in an "unavailable" state, in which every access fails with
//! `StorageUnavailable` and the rest of the engine falls back to online-only
//! behaviour.
//!
//! Corruption is handled the same way whenever it is detected: the file is
//! deleted and an empty store recreated in its place. Detected at open, the
//! open then succeeds; detected by a later query, that query still fails
//! with `SchemaCorruption` and the next one runs against the fresh store.

pub mod flags;
pub mod schema;

use chrono::{DateTime, Utc};
use rusqlite::{Connection, ErrorCode, Transaction};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{info, warn};

use crate::error::{Error, Result};

pub use flags::{FlagValues, Flags};

/// Database file name inside the data directory.
pub const DB_FILE: &str = "medisync.db";

/// SQLite-backed local store.
pub struct Store {
  conn: Option<Mutex<Connection>>,
  path: Option<PathBuf>,
  unavailable_reason: String,
}

impl Store {
  /// Open (or create) the store at `path`.
  ///
  /// Failing to open the file at all yields `StorageUnavailable`. A database
  /// that opens but is unreadable or fails migration is deleted and recreated.
  pub fn open(path: &Path) -> Result<Self> {
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent).map_err(|e| {
        Error::unavailable(format!("failed to create {}: {}", parent.display(), e))
      })?;
    }

    match Self::open_at(path) {
      Err(Error::SchemaCorruption(reason)) => {
        warn!(
          path = %path.display(),
          %reason,
          "local store is corrupted, deleting and recreating it"
        );
        Self::destroy(path)?;
        Self::open_at(path)
      }
      other => other,
    }
  }

  /// Open the store, degrading to an unavailable store instead of failing.
  pub fn open_or_unavailable(path: &Path) -> Self {
    match Self::open(path) {
      Ok(store) => store,
      Err(err) => {
        warn!(error = %err, "local store unavailable, running online-only");
        Self::unavailable(err.to_string())
      }
    }
  }

  /// In-memory store, used by tests and ephemeral sessions.
  pub fn open_in_memory() -> Result<Self> {
    let mut conn = Connection::open_in_memory().map_err(|e| Error::unavailable(e.to_string()))?;
    schema::migrate(&mut conn)?;
    Ok(Self {
      conn: Some(Mutex::new(conn)),
      path: None,
      unavailable_reason: String::new(),
    })
  }

  /// A store that refuses every operation.
  pub fn unavailable(reason: impl Into<String>) -> Self {
    Self {
      conn: None,
      path: None,
      unavailable_reason: reason.into(),
    }
  }

  fn open_at(path: &Path) -> Result<Self> {
    let conn = Self::connect(path)?;
    Ok(Self {
      conn: Some(Mutex::new(conn)),
      path: Some(path.to_path_buf()),
      unavailable_reason: String::new(),
    })
  }

  fn connect(path: &Path) -> Result<Connection> {
    let mut conn = Connection::open(path).map_err(|e| {
      Error::unavailable(format!("failed to open {}: {}", path.display(), e))
    })?;

    conn
      .execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")
      .map_err(classify)?;

    let check: String = conn
      .query_row("PRAGMA quick_check", [], |row| row.get(0))
      .map_err(classify)?;
    if check != "ok" {
      return Err(Error::corruption(format!("integrity check failed: {}", check)));
    }

    let version = schema::migrate(&mut conn)?;
    info!(path = %path.display(), version, "opened local store");
    Ok(conn)
  }

  /// Swap a corrupted connection for one on a freshly created file.
  fn rebuild(&self, conn: &mut Connection, reason: &str) {
    let Some(path) = self.path.as_deref() else {
      return;
    };
    warn!(
      path = %path.display(),
      %reason,
      "local store is corrupted, deleting and recreating it"
    );
    let placeholder = match Connection::open_in_memory() {
      Ok(placeholder) => placeholder,
      Err(err) => {
        warn!(error = %err, "cannot recreate local store");
        return;
      }
    };
    drop(std::mem::replace(conn, placeholder));

    match Self::destroy(path).and_then(|()| Self::connect(path)) {
      Ok(fresh) => *conn = fresh,
      Err(err) => warn!(error = %err, "failed to recreate local store"),
    }
  }

  /// Remove the database file and its WAL side files.
  fn destroy(path: &Path) -> Result<()> {
    for suffix in ["", "-wal", "-shm"] {
      let mut file = path.as_os_str().to_owned();
      file.push(suffix);
      match std::fs::remove_file(&file) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => {
          return Err(Error::unavailable(format!(
            "failed to delete corrupted store {}: {}",
            path.display(),
            e
          )))
        }
      }
    }
    Ok(())
  }

  /// Whether persistent storage is usable.
  pub fn is_available(&self) -> bool {
    self.conn.is_some()
  }

  /// Location of the database file, if file-backed.
  pub fn path(&self) -> Option<&Path> {
    self.path.as_deref()
  }

  /// Run `f` with the connection.
  pub fn with_conn<T>(&self, f: impl FnOnce(&Connection) -> rusqlite::Result<T>) -> Result<T> {
    let mut conn = self.lock()?;
    let result = f(&conn).map_err(classify);
    if let Err(Error::SchemaCorruption(reason)) = &result {
      self.rebuild(&mut conn, reason);
    }
    result
  }

  /// Run `f` inside a transaction, committing if it succeeds.
  pub fn with_tx<T>(&self, f: impl FnOnce(&Transaction<'_>) -> Result<T>) -> Result<T> {
    let mut conn = self.lock()?;
    let result = run_tx(&mut conn, f);
    if let Err(Error::SchemaCorruption(reason)) = &result {
      self.rebuild(&mut conn, reason);
    }
    result
  }

  fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
    let conn = self
      .conn
      .as_ref()
      .ok_or_else(|| Error::unavailable(self.unavailable_reason.clone()))?;
    conn
      .lock()
      .map_err(|e| Error::unavailable(format!("Lock poisoned: {}", e)))
  }
}

fn run_tx<T>(conn: &mut Connection, f: impl FnOnce(&Transaction<'_>) -> Result<T>) -> Result<T> {
  let tx = conn.transaction().map_err(classify)?;
  let value = f(&tx)?;
  tx.commit().map_err(classify)?;
  Ok(value)
}

/// Map a SQLite error onto the engine's taxonomy.
pub(crate) fn classify(err: rusqlite::Error) -> Error {
  match err.sqlite_error_code() {
    Some(ErrorCode::NotADatabase) | Some(ErrorCode::DatabaseCorrupt) => {
      Error::corruption(err.to_string())
    }
    Some(ErrorCode::CannotOpen)
    | Some(ErrorCode::ReadOnly)
    | Some(ErrorCode::PermissionDenied)
    | Some(ErrorCode::DiskFull) => Error::unavailable(err.to_string()),
    _ => Error::Storage(err),
  }
}

/// Convert a timestamp to the millisecond integer stored in SQLite.
pub fn to_millis(ts: DateTime<Utc>) -> i64 {
  ts.timestamp_millis()
}

/// Convert a stored millisecond integer back to a timestamp.
pub fn from_millis(ms: i64) -> DateTime<Utc> {
  DateTime::from_timestamp_millis(ms).unwrap_or(DateTime::<Utc>::MIN_UTC)
}

#[cfg(test)]
mod tests {
  use super::*;

  fn temp_db_path(name: &str) -> PathBuf {
    std::env::temp_dir()
      .join(format!("medisync-test-{}", uuid::Uuid::new_v4()))
      .join(name)
  }

  #[test]
  fn test_open_creates_schema() {
    let path = temp_db_path(DB_FILE);
    let store = Store::open(&path).unwrap();
    assert!(store.is_available());
    let version = store.with_conn(|conn| {
      conn.query_row("PRAGMA user_version", [], |row| row.get::<_, i64>(0))
    });
    assert_eq!(version.unwrap(), schema::SCHEMA_VERSION);
    let _ = std::fs::remove_dir_all(path.parent().unwrap());
  }

  #[test]
  fn test_reopen_keeps_rows() {
    let path = temp_db_path(DB_FILE);
    {
      let store = Store::open(&path).unwrap();
      store
        .with_conn(|conn| {
          conn.execute(
            "INSERT INTO cached_responses (endpoint_key, resource, payload, cached_at, expires_at)
             VALUES ('/patients/', '/patients/', '[]', 1, 2)",
            [],
          )
        })
        .unwrap();
    }
    let store = Store::open(&path).unwrap();
    let count = store
      .with_conn(|conn| conn.query_row("SELECT COUNT(*) FROM cached_responses", [], |r| r.get::<_, i64>(0)))
      .unwrap();
    assert_eq!(count, 1);
    let _ = std::fs::remove_dir_all(path.parent().unwrap());
  }

  #[test]
  fn test_corrupted_file_is_recreated() {
    let path = temp_db_path(DB_FILE);
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(&path, vec![0x42u8; 4096]).unwrap();

    let store = Store::open(&path).unwrap();
    assert!(store.is_available());
    let count = store
      .with_conn(|conn| conn.query_row("SELECT COUNT(*) FROM mutation_queue", [], |r| r.get::<_, i64>(0)))
      .unwrap();
    assert_eq!(count, 0);
    let _ = std::fs::remove_dir_all(path.parent().unwrap());
  }

  #[test]
  fn test_corruption_after_open_recreates_store() {
    let path = temp_db_path(DB_FILE);
    let store = Store::open(&path).unwrap();
    store
      .with_conn(|conn| {
        conn.execute(
          "INSERT INTO cached_responses (endpoint_key, resource, payload, cached_at, expires_at)
           VALUES ('/patients/', '/patients/', '[]', 1, 2)",
          [],
        )
      })
      .unwrap();

    let err = store
      .with_conn(|_| -> rusqlite::Result<()> {
        Err(rusqlite::Error::SqliteFailure(
          rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_CORRUPT),
          Some("database disk image is malformed".into()),
        ))
      })
      .unwrap_err();
    assert!(matches!(err, Error::SchemaCorruption(_)));

    let count = store
      .with_conn(|conn| conn.query_row("SELECT COUNT(*) FROM cached_responses", [], |r| r.get::<_, i64>(0)))
      .unwrap();
    assert_eq!(count, 0);
    let version = store
      .with_conn(|conn| conn.query_row("PRAGMA user_version", [], |row| row.get::<_, i64>(0)))
      .unwrap();
    assert_eq!(version, schema::SCHEMA_VERSION);
    let _ = std::fs::remove_dir_all(path.parent().unwrap());
  }

  #[test]
  fn test_corruption_in_transaction_recreates_store() {
    let path = temp_db_path(DB_FILE);
    let store = Store::open(&path).unwrap();
    let err = store
      .with_tx(|_| -> Result<()> { Err(Error::corruption("page checksum mismatch")) })
      .unwrap_err();
    assert!(matches!(err, Error::SchemaCorruption(_)));
    assert!(store.is_available());
    let count = store
      .with_conn(|conn| conn.query_row("SELECT COUNT(*) FROM mutation_queue", [], |r| r.get::<_, i64>(0)))
      .unwrap();
    assert_eq!(count, 0);
    let _ = std::fs::remove_dir_all(path.parent().unwrap());
  }

  #[test]
  fn test_unavailable_store_fails_soft() {
    let store = Store::unavailable("private browsing");
    assert!(!store.is_available());
    let err = store.with_conn(|conn| conn.execute("SELECT 1", [])).unwrap_err();
    assert!(matches!(err, Error::StorageUnavailable(_)));
  }

  #[test]
  fn test_millis_round_trip() {
    let now = Utc::now();
    assert_eq!(to_millis(from_millis(to_millis(now))), to_millis(now));
  }
}
