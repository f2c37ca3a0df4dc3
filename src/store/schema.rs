//! Versioned schema for the local store.
//!
//! Migrations are append-only. `PRAGMA user_version` records how many have
//! been applied; opening an older database applies only the missing ones, so
//! existing rows survive an upgrade.

use rusqlite::Connection;

use crate::error::{Error, Result};

/// Ordered migrations. Index `n` upgrades the schema from version `n` to `n + 1`.
pub const MIGRATIONS: &[&str] = &[V1_INITIAL, V2_SYNC_STATE, V3_BLOCKED_BY];

/// Current schema version.
pub const SCHEMA_VERSION: i64 = MIGRATIONS.len() as i64;

const V1_INITIAL: &str = r#"
-- Cached API responses keyed by logical request (path + query)
CREATE TABLE IF NOT EXISTS cached_responses (
    endpoint_key TEXT PRIMARY KEY,
    resource TEXT NOT NULL,
    payload TEXT NOT NULL,
    cached_at INTEGER NOT NULL,
    expires_at INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_cached_responses_resource
    ON cached_responses(resource, cached_at DESC);

-- Writes waiting for the server
CREATE TABLE IF NOT EXISTS mutation_queue (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    action TEXT NOT NULL,
    entity_kind TEXT NOT NULL,
    method TEXT NOT NULL,
    endpoint_key TEXT NOT NULL,
    payload TEXT NOT NULL,
    enqueued_at INTEGER NOT NULL,
    attempts INTEGER NOT NULL DEFAULT 0,
    status TEXT NOT NULL,
    last_error TEXT,
    updated_at INTEGER NOT NULL
);

-- Material for offline login
CREATE TABLE IF NOT EXISTS offline_credentials (
    email TEXT PRIMARY KEY,
    password_hash TEXT NOT NULL,
    encrypted_token BLOB NOT NULL,
    encrypted_profile BLOB NOT NULL,
    created_at INTEGER NOT NULL,
    last_login_at INTEGER NOT NULL,
    expires_at INTEGER NOT NULL
);
"#;

const V2_SYNC_STATE: &str = r#"
ALTER TABLE mutation_queue ADD COLUMN temp_id TEXT;

CREATE INDEX IF NOT EXISTS idx_mutation_queue_status
    ON mutation_queue(status, id);

-- Per-record bookkeeping for optimistic writes
CREATE TABLE IF NOT EXISTS entity_sync_state (
    entity_kind TEXT NOT NULL,
    record_id TEXT NOT NULL,
    state TEXT NOT NULL,
    queue_id INTEGER,
    updated_at INTEGER NOT NULL,
    PRIMARY KEY (entity_kind, record_id)
);

-- Temporary ids assigned offline, resolved to server ids after sync
CREATE TABLE IF NOT EXISTS id_mappings (
    temp_id TEXT PRIMARY KEY,
    real_id TEXT NOT NULL,
    entity_kind TEXT NOT NULL,
    mapped_at INTEGER NOT NULL
);
"#;

const V3_BLOCKED_BY: &str = r#"
-- Queued create whose failure parked a dependent write
ALTER TABLE mutation_queue ADD COLUMN blocked_by INTEGER;
"#;

/// Read the schema version recorded in the database.
pub fn current_version(conn: &Connection) -> Result<i64> {
  conn
    .query_row("PRAGMA user_version", [], |row| row.get(0))
    .map_err(super::classify)
}

/// Apply every migration newer than the recorded version.
///
/// A database claiming a version this build does not know about, or a
/// migration that fails part-way, is reported as `SchemaCorruption`.
pub fn migrate(conn: &mut Connection) -> Result<i64> {
  migrate_to(conn, MIGRATIONS)
}

pub(crate) fn migrate_to(conn: &mut Connection, migrations: &[&str]) -> Result<i64> {
  let current = current_version(conn)?;
  let target = migrations.len() as i64;

  if current > target {
    return Err(Error::corruption(format!(
      "database schema version {} is newer than supported version {}",
      current, target
    )));
  }

  for (index, sql) in migrations.iter().enumerate().skip(current as usize) {
    let version = index as i64 + 1;
    let tx = conn
      .transaction()
      .map_err(|e| Error::corruption(format!("failed to begin migration: {}", e)))?;
    tx.execute_batch(sql)
      .map_err(|e| Error::corruption(format!("migration to v{} failed: {}", version, e)))?;
    tx.pragma_update(None, "user_version", version)
      .map_err(|e| Error::corruption(format!("failed to record v{}: {}", version, e)))?;
    tx.commit()
      .map_err(|e| Error::corruption(format!("failed to commit v{}: {}", version, e)))?;
    tracing::debug!(version, "applied store migration");
  }

  Ok(target)
}

#[cfg(test)]
mod tests {
  use super::*;

  fn table_exists(conn: &Connection, name: &str) -> bool {
    conn
      .query_row(
        "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?",
        [name],
        |row| row.get::<_, i64>(0),
      )
      .map(|n| n > 0)
      .unwrap_or(false)
  }

  #[test]
  fn test_fresh_database_reaches_current_version() {
    let mut conn = Connection::open_in_memory().unwrap();
    assert_eq!(migrate(&mut conn).unwrap(), SCHEMA_VERSION);
    assert_eq!(current_version(&conn).unwrap(), SCHEMA_VERSION);
    assert!(table_exists(&conn, "cached_responses"));
    assert!(table_exists(&conn, "entity_sync_state"));
  }

  #[test]
  fn test_upgrade_preserves_existing_rows() {
    let mut conn = Connection::open_in_memory().unwrap();
    migrate_to(&mut conn, &MIGRATIONS[..1]).unwrap();
    conn
      .execute(
        "INSERT INTO cached_responses (endpoint_key, resource, payload, cached_at, expires_at)
         VALUES ('/patients/', '/patients/', '[]', 1, 2)",
        [],
      )
      .unwrap();

    assert_eq!(migrate(&mut conn).unwrap(), SCHEMA_VERSION);

    let count: i64 = conn
      .query_row("SELECT COUNT(*) FROM cached_responses", [], |row| row.get(0))
      .unwrap();
    assert_eq!(count, 1);
    assert!(table_exists(&conn, "id_mappings"));
  }

  #[test]
  fn test_migrate_is_idempotent() {
    let mut conn = Connection::open_in_memory().unwrap();
    migrate(&mut conn).unwrap();
    assert_eq!(migrate(&mut conn).unwrap(), SCHEMA_VERSION);
  }

  #[test]
  fn test_newer_schema_is_corruption() {
    let mut conn = Connection::open_in_memory().unwrap();
    conn.pragma_update(None, "user_version", 99).unwrap();
    assert!(matches!(
      migrate(&mut conn),
      Err(Error::SchemaCorruption(_))
    ));
  }
}
