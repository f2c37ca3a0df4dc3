//! Durable queue of writes waiting for the server.
//!
//! Items are created by the request router while offline. Only the sync
//! processor moves them through their lifecycle:
//! `Pending → InFlight → Done | Pending (retry) | Failed`.
//! Failed items are kept until an operator retries or discards them. A write
//! that references a record whose create failed or was discarded is failed
//! with it, and comes back when the create is retried.

mod ledger;

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, info};

use crate::api::Method;
use crate::cache::key::is_temp_id;
use crate::cache::EndpointKey;
use crate::entity::EntityKind;
use crate::error::{Error, Result};
use crate::store::{from_millis, to_millis, Store};

pub use ledger::SyncLedger;

/// Kind of write recorded in the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MutationAction {
  Create,
  Update,
  Delete,
}

impl MutationAction {
  pub fn from_method(method: Method) -> Option<Self> {
    match method {
      Method::Post => Some(Self::Create),
      Method::Put | Method::Patch => Some(Self::Update),
      Method::Delete => Some(Self::Delete),
      Method::Get => None,
    }
  }

  pub fn as_str(&self) -> &'static str {
    match self {
      Self::Create => "create",
      Self::Update => "update",
      Self::Delete => "delete",
    }
  }
}

impl FromStr for MutationAction {
  type Err = String;

  fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
    match s {
      "create" => Ok(Self::Create),
      "update" => Ok(Self::Update),
      "delete" => Ok(Self::Delete),
      other => Err(format!("unknown mutation action '{}'", other)),
    }
  }
}

/// Lifecycle status of a queue item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueStatus {
  Pending,
  InFlight,
  Failed,
  Done,
}

impl QueueStatus {
  pub fn as_str(&self) -> &'static str {
    match self {
      Self::Pending => "pending",
      Self::InFlight => "in_flight",
      Self::Failed => "failed",
      Self::Done => "done",
    }
  }
}

impl FromStr for QueueStatus {
  type Err = String;

  fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
    match s {
      "pending" => Ok(Self::Pending),
      "in_flight" => Ok(Self::InFlight),
      "failed" => Ok(Self::Failed),
      "done" => Ok(Self::Done),
      other => Err(format!("unknown queue status '{}'", other)),
    }
  }
}

/// A write that could not reach the server when it was made.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MutationQueueItem {
  pub id: i64,
  pub action: MutationAction,
  pub entity_kind: EntityKind,
  pub method: Method,
  pub endpoint_key: String,
  pub payload: Value,
  pub enqueued_at: DateTime<Utc>,
  pub attempts: u32,
  pub status: QueueStatus,
  pub last_error: Option<String>,
  /// Temporary id given to the record by an offline create
  pub temp_id: Option<String>,
  /// Create whose failure parked this item
  pub blocked_by: Option<i64>,
  pub updated_at: DateTime<Utc>,
}

impl MutationQueueItem {
  pub fn key(&self) -> Result<EndpointKey> {
    EndpointKey::parse(&self.endpoint_key)
  }

  /// Temporary ids this item depends on, excluding the one it creates.
  pub fn referenced_temp_ids(&self) -> Vec<String> {
    let mut ids: Vec<String> = self
      .key()
      .map(|k| k.temp_ids().into_iter().map(String::from).collect())
      .unwrap_or_default();
    collect_temp_ids(&self.payload, &mut ids);
    ids.retain(|id| Some(id) != self.temp_id.as_ref());
    ids.sort();
    ids.dedup();
    ids
  }
}

/// Append every temporary id found among the string values of `value`.
pub fn collect_temp_ids(value: &Value, out: &mut Vec<String>) {
  match value {
    Value::String(s) if is_temp_id(s) => out.push(s.clone()),
    Value::Array(items) => items.iter().for_each(|v| collect_temp_ids(v, out)),
    Value::Object(map) => map.values().for_each(|v| collect_temp_ids(v, out)),
    _ => {}
  }
}

/// Replace every string equal to `from` with `to`. Returns whether anything changed.
pub fn replace_string_values(value: &mut Value, from: &str, to: &str) -> bool {
  match value {
    Value::String(s) if s == from => {
      *s = to.to_string();
      true
    }
    Value::Array(items) => items
      .iter_mut()
      .fold(false, |acc, v| replace_string_values(v, from, to) || acc),
    Value::Object(map) => map
      .values_mut()
      .fold(false, |acc, v| replace_string_values(v, from, to) || acc),
    _ => false,
  }
}

/// Input for `MutationQueue::enqueue`.
#[derive(Debug, Clone)]
pub struct NewMutation {
  pub action: MutationAction,
  pub entity_kind: EntityKind,
  pub method: Method,
  pub endpoint_key: EndpointKey,
  pub payload: Value,
  pub temp_id: Option<String>,
}

/// Number of items per status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueCounts {
  pub pending: usize,
  pub in_flight: usize,
  pub failed: usize,
  pub done: usize,
}

#[derive(Clone)]
pub struct MutationQueue {
  store: Arc<Store>,
}

const SELECT_ITEM: &str = "SELECT id, action, entity_kind, method, endpoint_key, payload, enqueued_at,
  attempts, status, last_error, temp_id, blocked_by, updated_at FROM mutation_queue";

impl MutationQueue {
  pub fn new(store: Arc<Store>) -> Self {
    Self { store }
  }

  pub fn enqueue(&self, mutation: NewMutation) -> Result<MutationQueueItem> {
    let now = Utc::now();
    let payload = serde_json::to_string(&mutation.payload)?;
    let id = self.store.with_conn(|conn| {
      conn.execute(
        "INSERT INTO mutation_queue
           (action, entity_kind, method, endpoint_key, payload, enqueued_at, attempts, status, temp_id, updated_at)
         VALUES (?, ?, ?, ?, ?, ?, 0, ?, ?, ?)",
        params![
          mutation.action.as_str(),
          mutation.entity_kind.as_str(),
          mutation.method.as_str(),
          mutation.endpoint_key.as_str(),
          payload,
          to_millis(now),
          QueueStatus::Pending.as_str(),
          mutation.temp_id,
          to_millis(now),
        ],
      )?;
      Ok(conn.last_insert_rowid())
    })?;

    info!(
      id,
      action = mutation.action.as_str(),
      key = %mutation.endpoint_key,
      "queued offline mutation"
    );
    self
      .get(id)?
      .ok_or_else(|| Error::unavailable(format!("queued mutation {} vanished", id)))
  }

  pub fn get(&self, id: i64) -> Result<Option<MutationQueueItem>> {
    let raw = self.store.with_conn(|conn| {
      conn
        .query_row(&format!("{} WHERE id = ?", SELECT_ITEM), params![id], read_row)
        .optional()
    })?;
    raw.map(decode_row).transpose()
  }

  /// Items in enqueue order, optionally filtered by status.
  pub fn list(&self, status: Option<QueueStatus>) -> Result<Vec<MutationQueueItem>> {
    let raw = self.store.with_conn(|conn| match status {
      Some(status) => {
        let mut stmt = conn.prepare(&format!("{} WHERE status = ? ORDER BY id", SELECT_ITEM))?;
        let rows = stmt
          .query_map(params![status.as_str()], read_row)?
          .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
      }
      None => {
        let mut stmt = conn.prepare(&format!("{} ORDER BY id", SELECT_ITEM))?;
        let rows = stmt
          .query_map([], read_row)?
          .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
      }
    })?;
    raw.into_iter().map(decode_row).collect()
  }

  pub fn pending(&self) -> Result<Vec<MutationQueueItem>> {
    self.list(Some(QueueStatus::Pending))
  }

  pub fn counts(&self) -> Result<QueueCounts> {
    let rows: Vec<(String, i64)> = self.store.with_conn(|conn| {
      let mut stmt = conn.prepare("SELECT status, COUNT(*) FROM mutation_queue GROUP BY status")?;
      let rows = stmt
        .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
        .collect::<rusqlite::Result<Vec<_>>>()?;
      Ok(rows)
    })?;

    let mut counts = QueueCounts::default();
    for (status, n) in rows {
      let n = n as usize;
      match status.parse::<QueueStatus>() {
        Ok(QueueStatus::Pending) => counts.pending = n,
        Ok(QueueStatus::InFlight) => counts.in_flight = n,
        Ok(QueueStatus::Failed) => counts.failed = n,
        Ok(QueueStatus::Done) => counts.done = n,
        Err(_) => {}
      }
    }
    Ok(counts)
  }

  /// `Pending → InFlight`. Returns false if the item was not pending.
  pub fn mark_in_flight(&self, id: i64) -> Result<bool> {
    self.transition(id, QueueStatus::Pending, QueueStatus::InFlight)
  }

  /// `InFlight → Done`.
  pub fn mark_done(&self, id: i64) -> Result<bool> {
    let now = to_millis(Utc::now());
    let changed = self.store.with_conn(|conn| {
      conn.execute(
        "UPDATE mutation_queue SET status = ?, last_error = NULL, updated_at = ?
         WHERE id = ? AND status = ?",
        params![
          QueueStatus::Done.as_str(),
          now,
          id,
          QueueStatus::InFlight.as_str()
        ],
      )
    })?;
    Ok(changed > 0)
  }

  /// `InFlight → Pending` without counting an attempt.
  pub fn release(&self, id: i64) -> Result<bool> {
    self.transition(id, QueueStatus::InFlight, QueueStatus::Pending)
  }

  /// Count a failed attempt. The item returns to `Pending` while attempts
  /// remain and is parked as `Failed` once `max_attempts` is reached.
  pub fn record_failure(&self, id: i64, error: &str, max_attempts: u32) -> Result<QueueStatus> {
    let now = to_millis(Utc::now());
    self.store.with_tx(|tx| {
      let attempts: u32 = tx.query_row(
        "SELECT attempts FROM mutation_queue WHERE id = ?",
        params![id],
        |row| row.get(0),
      )?;
      let attempts = attempts + 1;
      let status = if attempts >= max_attempts {
        QueueStatus::Failed
      } else {
        QueueStatus::Pending
      };
      tx.execute(
        "UPDATE mutation_queue SET attempts = ?, status = ?, last_error = ?, updated_at = ?
         WHERE id = ?",
        params![attempts, status.as_str(), error, now, id],
      )?;
      debug!(id, attempts, status = status.as_str(), "recorded replay failure");
      Ok(status)
    })
  }

  /// Return items stranded `InFlight` by an abandoned pass to `Pending`.
  pub fn recover_in_flight(&self) -> Result<usize> {
    let now = to_millis(Utc::now());
    self.store.with_conn(|conn| {
      conn.execute(
        "UPDATE mutation_queue SET status = ?, updated_at = ? WHERE status = ?",
        params![
          QueueStatus::Pending.as_str(),
          now,
          QueueStatus::InFlight.as_str()
        ],
      )
    })
  }

  /// Delete `Done` items last touched before `before`.
  pub fn prune_done(&self, before: DateTime<Utc>) -> Result<usize> {
    self.store.with_conn(|conn| {
      conn.execute(
        "DELETE FROM mutation_queue WHERE status = ? AND updated_at < ?",
        params![QueueStatus::Done.as_str(), to_millis(before)],
      )
    })
  }

  /// Operator action: give a `Failed` item a fresh set of attempts.
  ///
  /// Items that were failed because they depend on it are re-queued too.
  pub fn retry_failed(&self, id: i64) -> Result<bool> {
    let now = to_millis(Utc::now());
    let requeued = self.store.with_tx(|tx| {
      let mut requeued = Vec::new();
      let mut next = vec![id];
      while let Some(current) = next.pop() {
        let changed = tx.execute(
          "UPDATE mutation_queue SET status = ?, attempts = 0, blocked_by = NULL, updated_at = ?
           WHERE id = ? AND status = ?",
          params![
            QueueStatus::Pending.as_str(),
            now,
            current,
            QueueStatus::Failed.as_str()
          ],
        )?;
        if changed == 0 {
          continue;
        }
        requeued.push(current);

        let mut stmt = tx.prepare("SELECT id FROM mutation_queue WHERE blocked_by = ? AND status = ?")?;
        let dependants = stmt
          .query_map(params![current, QueueStatus::Failed.as_str()], |row| row.get::<_, i64>(0))?
          .collect::<rusqlite::Result<Vec<_>>>()?;
        next.extend(dependants);
      }
      Ok(requeued)
    })?;
    if requeued.len() > 1 {
      debug!(id, ?requeued, "re-queued failed write and its dependants");
    }
    Ok(!requeued.is_empty())
  }

  /// `Pending → Failed` without counting an attempt, for an item that can
  /// never be sent because a record it references will not be created.
  pub fn block(&self, id: i64, blocked_by: Option<i64>, reason: &str) -> Result<bool> {
    let now = to_millis(Utc::now());
    let changed = self.store.with_conn(|conn| {
      conn.execute(
        "UPDATE mutation_queue SET status = ?, blocked_by = ?, last_error = ?, updated_at = ?
         WHERE id = ? AND status = ?",
        params![
          QueueStatus::Failed.as_str(),
          blocked_by,
          reason,
          now,
          id,
          QueueStatus::Pending.as_str()
        ],
      )
    })?;
    Ok(changed > 0)
  }

  /// The queued create that assigned `temp_id`, if it is still in the queue.
  pub fn creator_of(&self, temp_id: &str) -> Result<Option<MutationQueueItem>> {
    let raw = self.store.with_conn(|conn| {
      conn
        .query_row(
          &format!("{} WHERE temp_id = ? ORDER BY id LIMIT 1", SELECT_ITEM),
          params![temp_id],
          read_row,
        )
        .optional()
    })?;
    raw.map(decode_row).transpose()
  }

  /// Whether any `Pending` or `InFlight` item other than `except` writes
  /// to `record` of `kind`.
  pub fn has_open_writes_for(&self, kind: EntityKind, record: &str, except: i64) -> Result<bool> {
    let open = self.store.with_conn(|conn| {
      let mut stmt = conn.prepare(
        "SELECT endpoint_key, temp_id FROM mutation_queue
         WHERE entity_kind = ? AND id != ? AND status IN (?, ?)",
      )?;
      let rows = stmt
        .query_map(
          params![
            kind.as_str(),
            except,
            QueueStatus::Pending.as_str(),
            QueueStatus::InFlight.as_str()
          ],
          |row| Ok((row.get::<_, String>(0)?, row.get::<_, Option<String>>(1)?)),
        )?
        .collect::<rusqlite::Result<Vec<_>>>()?;
      Ok(rows)
    })?;

    for (endpoint_key, temp_id) in open {
      if temp_id.as_deref() == Some(record) {
        return Ok(true);
      }
      if EndpointKey::parse(&endpoint_key)?.record_id() == Some(record) {
        return Ok(true);
      }
    }
    Ok(false)
  }

  /// Operator action: drop an item that is not currently in flight.
  pub fn discard(&self, id: i64) -> Result<bool> {
    let changed = self.store.with_conn(|conn| {
      conn.execute(
        "DELETE FROM mutation_queue WHERE id = ? AND status != ?",
        params![id, QueueStatus::InFlight.as_str()],
      )
    })?;
    Ok(changed > 0)
  }

  /// Point every pending item that references `temp_id` at `real_id`.
  pub fn rewrite_temp_id(&self, temp_id: &str, real_id: &str) -> Result<usize> {
    let mut rewritten = 0;
    for mut item in self.pending()? {
      let key = item.key()?;
      let new_key = key.with_segment_replaced(temp_id, real_id);
      let key_changed = new_key != key;
      let payload_changed = replace_string_values(&mut item.payload, temp_id, real_id);
      if !key_changed && !payload_changed {
        continue;
      }

      let payload = serde_json::to_string(&item.payload)?;
      self.store.with_conn(|conn| {
        conn.execute(
          "UPDATE mutation_queue SET endpoint_key = ?, payload = ? WHERE id = ?",
          params![new_key.as_str(), payload, item.id],
        )
      })?;
      rewritten += 1;
    }
    if rewritten > 0 {
      debug!(temp_id, real_id, rewritten, "rewrote queued references to temporary id");
    }
    Ok(rewritten)
  }

  fn transition(&self, id: i64, from: QueueStatus, to: QueueStatus) -> Result<bool> {
    let now = to_millis(Utc::now());
    let changed = self.store.with_conn(|conn| {
      conn.execute(
        "UPDATE mutation_queue SET status = ?, updated_at = ? WHERE id = ? AND status = ?",
        params![to.as_str(), now, id, from.as_str()],
      )
    })?;
    Ok(changed > 0)
  }
}

type RawItem = (
  i64,
  String,
  String,
  String,
  String,
  String,
  i64,
  u32,
  String,
  Option<String>,
  Option<String>,
  Option<i64>,
  i64,
);

fn read_row(row: &Row<'_>) -> rusqlite::Result<RawItem> {
  Ok((
    row.get(0)?,
    row.get(1)?,
    row.get(2)?,
    row.get(3)?,
    row.get(4)?,
    row.get(5)?,
    row.get(6)?,
    row.get(7)?,
    row.get(8)?,
    row.get(9)?,
    row.get(10)?,
    row.get(11)?,
    row.get(12)?,
  ))
}

fn decode_row(raw: RawItem) -> Result<MutationQueueItem> {
  let (
    id,
    action,
    entity_kind,
    method,
    endpoint_key,
    payload,
    enqueued_at,
    attempts,
    status,
    last_error,
    temp_id,
    blocked_by,
    updated_at,
  ) = raw;

  let bad = |what: String| Error::corruption(format!("queue item {}: {}", id, what));
  Ok(MutationQueueItem {
    id,
    action: action.parse().map_err(bad)?,
    entity_kind: entity_kind.parse().map_err(bad)?,
    method: method.parse().map_err(bad)?,
    endpoint_key,
    payload: serde_json::from_str(&payload)?,
    enqueued_at: from_millis(enqueued_at),
    attempts,
    status: status.parse().map_err(bad)?,
    last_error,
    temp_id,
    blocked_by,
    updated_at: from_millis(updated_at),
  })
}
