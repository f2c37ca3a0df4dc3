//! Per-record sync bookkeeping: sync-state tags and temporary-id mappings.

use chrono::Utc;
use rusqlite::{params, OptionalExtension};
use std::sync::Arc;

use crate::entity::{EntityKind, SyncState};
use crate::error::Result;
use crate::store::{to_millis, Store};

#[derive(Clone)]
pub struct SyncLedger {
  store: Arc<Store>,
}

impl SyncLedger {
  pub fn new(store: Arc<Store>) -> Self {
    Self { store }
  }

  pub fn set_state(
    &self,
    kind: EntityKind,
    record_id: &str,
    state: SyncState,
    queue_id: Option<i64>,
  ) -> Result<()> {
    let now = to_millis(Utc::now());
    self.store.with_conn(|conn| {
      conn.execute(
        "INSERT OR REPLACE INTO entity_sync_state (entity_kind, record_id, state, queue_id, updated_at)
         VALUES (?, ?, ?, ?, ?)",
        params![kind.as_str(), record_id, state.as_str(), queue_id, now],
      )
    })?;
    Ok(())
  }

  /// Tag of a record. Records never touched offline count as synced.
  pub fn state(&self, kind: EntityKind, record_id: &str) -> Result<SyncState> {
    let raw: Option<String> = self.store.with_conn(|conn| {
      conn
        .query_row(
          "SELECT state FROM entity_sync_state WHERE entity_kind = ? AND record_id = ?",
          params![kind.as_str(), record_id],
          |row| row.get(0),
        )
        .optional()
    })?;
    Ok(
      raw
        .and_then(|s| s.parse().ok())
        .unwrap_or(SyncState::Synced),
    )
  }

  pub fn clear_state(&self, kind: EntityKind, record_id: &str) -> Result<()> {
    self.store.with_conn(|conn| {
      conn.execute(
        "DELETE FROM entity_sync_state WHERE entity_kind = ? AND record_id = ?",
        params![kind.as_str(), record_id],
      )
    })?;
    Ok(())
  }

  /// `(kind, record_id)` pairs currently tagged `state`.
  pub fn records_in_state(&self, state: SyncState) -> Result<Vec<(EntityKind, String)>> {
    let rows: Vec<(String, String)> = self.store.with_conn(|conn| {
      let mut stmt = conn.prepare(
        "SELECT entity_kind, record_id FROM entity_sync_state WHERE state = ?
         ORDER BY entity_kind, record_id",
      )?;
      let rows = stmt
        .query_map(params![state.as_str()], |row| Ok((row.get(0)?, row.get(1)?)))?
        .collect::<rusqlite::Result<Vec<_>>>()?;
      Ok(rows)
    })?;
    Ok(
      rows
        .into_iter()
        .filter_map(|(kind, id)| kind.parse().ok().map(|kind| (kind, id)))
        .collect(),
    )
  }

  /// Move the tag of a temporary record onto its server-assigned id.
  pub fn rename_record(&self, kind: EntityKind, from: &str, to: &str) -> Result<()> {
    self.store.with_conn(|conn| {
      conn.execute(
        "UPDATE OR REPLACE entity_sync_state SET record_id = ? WHERE entity_kind = ? AND record_id = ?",
        params![to, kind.as_str(), from],
      )
    })?;
    Ok(())
  }

  pub fn record_mapping(&self, temp_id: &str, real_id: &str, kind: EntityKind) -> Result<()> {
    let now = to_millis(Utc::now());
    self.store.with_conn(|conn| {
      conn.execute(
        "INSERT OR REPLACE INTO id_mappings (temp_id, real_id, entity_kind, mapped_at)
         VALUES (?, ?, ?, ?)",
        params![temp_id, real_id, kind.as_str(), now],
      )
    })?;
    Ok(())
  }

  /// Server id assigned to a temporary id, once its create has synced.
  pub fn resolve(&self, temp_id: &str) -> Result<Option<String>> {
    self.store.with_conn(|conn| {
      conn
        .query_row(
          "SELECT real_id FROM id_mappings WHERE temp_id = ?",
          params![temp_id],
          |row| row.get(0),
        )
        .optional()
    })
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn ledger() -> SyncLedger {
    SyncLedger::new(Arc::new(Store::open_in_memory().unwrap()))
  }

  #[test]
  fn test_untracked_records_are_synced() {
    let ledger = ledger();
    assert_eq!(ledger.state(EntityKind::Patient, "1").unwrap(), SyncState::Synced);
  }

  #[test]
  fn test_state_lifecycle() {
    let ledger = ledger();
    ledger
      .set_state(EntityKind::Organization, "7", SyncState::Pending, Some(1))
      .unwrap();
    assert_eq!(
      ledger.records_in_state(SyncState::Pending).unwrap(),
      vec![(EntityKind::Organization, "7".to_string())]
    );

    ledger
      .set_state(EntityKind::Organization, "7", SyncState::Conflict, Some(1))
      .unwrap();
    assert_eq!(
      ledger.state(EntityKind::Organization, "7").unwrap(),
      SyncState::Conflict
    );

    ledger.clear_state(EntityKind::Organization, "7").unwrap();
    assert!(ledger.records_in_state(SyncState::Conflict).unwrap().is_empty());
  }

  #[test]
  fn test_rename_and_mapping() {
    let ledger = ledger();
    ledger
      .set_state(EntityKind::Patient, "tmp-a", SyncState::Pending, None)
      .unwrap();
    ledger.rename_record(EntityKind::Patient, "tmp-a", "42").unwrap();
    assert_eq!(ledger.state(EntityKind::Patient, "42").unwrap(), SyncState::Pending);
    assert_eq!(ledger.state(EntityKind::Patient, "tmp-a").unwrap(), SyncState::Synced);

    assert_eq!(ledger.resolve("tmp-a").unwrap(), None);
    ledger.record_mapping("tmp-a", "42", EntityKind::Patient).unwrap();
    assert_eq!(ledger.resolve("tmp-a").unwrap().as_deref(), Some("42"));
  }
}
