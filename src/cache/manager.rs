//! Time-bounded response cache on top of the local store.

use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, OptionalExtension};
use serde_json::Value;
use std::sync::Arc;
use tracing::debug;

use super::key::EndpointKey;
use crate::error::Result;
use crate::store::{from_millis, to_millis, Store};

/// Default lifetime of a cached response.
pub const DEFAULT_TTL_HOURS: i64 = 24;

/// A cached response snapshot.
#[derive(Debug, Clone, PartialEq)]
pub struct CachedResponse {
  pub endpoint_key: String,
  pub payload: Value,
  pub cached_at: DateTime<Utc>,
  pub expires_at: DateTime<Utc>,
}

impl CachedResponse {
  pub fn is_live(&self, now: DateTime<Utc>) -> bool {
    now < self.expires_at
  }
}

/// Result of a cache lookup.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheHit {
  pub response: CachedResponse,
  /// The entry was cached for a different parameterisation of the same
  /// resource and is only an approximation of what was asked for.
  pub approximate: bool,
}

/// Reads and writes cached responses.
///
/// Expired entries are never served but are not deleted on read either; the
/// next `put` for the key overwrites them.
///
/// When `prefix_fallback` is on, a miss on one parameterisation of a listing
/// (say `/patients/?page=2`) is answered with the most recently cached live
/// sibling (`/patients/`, `/patients/?search=ann`, ...). Offline users get a
/// plausible list instead of an error; the cost is that the list may not
/// match the requested filter or page. Hits served this way are flagged
/// `approximate`.
#[derive(Clone)]
pub struct CacheManager {
  store: Arc<Store>,
  ttl: Duration,
  prefix_fallback: bool,
}

impl CacheManager {
  pub fn new(store: Arc<Store>) -> Self {
    Self {
      store,
      ttl: Duration::hours(DEFAULT_TTL_HOURS),
      prefix_fallback: true,
    }
  }

  pub fn with_ttl(mut self, ttl: Duration) -> Self {
    self.ttl = ttl;
    self
  }

  pub fn with_prefix_fallback(mut self, enabled: bool) -> Self {
    self.prefix_fallback = enabled;
    self
  }

  pub fn ttl(&self) -> Duration {
    self.ttl
  }

  /// Store `payload` under `key` with the default time-to-live.
  pub fn put(&self, key: &EndpointKey, payload: &Value) -> Result<()> {
    self.put_with_ttl(key, payload, self.ttl)
  }

  /// Store `payload` under `key`, replacing any previous entry.
  pub fn put_with_ttl(&self, key: &EndpointKey, payload: &Value, ttl: Duration) -> Result<()> {
    self.put_at(key, payload, ttl, Utc::now())
  }

  pub(crate) fn put_at(
    &self,
    key: &EndpointKey,
    payload: &Value,
    ttl: Duration,
    now: DateTime<Utc>,
  ) -> Result<()> {
    let data = serde_json::to_string(payload)?;
    self.store.with_conn(|conn| {
      conn.execute(
        "INSERT OR REPLACE INTO cached_responses (endpoint_key, resource, payload, cached_at, expires_at)
         VALUES (?, ?, ?, ?, ?)",
        params![
          key.as_str(),
          key.resource(),
          data,
          to_millis(now),
          to_millis(now + ttl)
        ],
      )
    })?;
    debug!(key = %key, "cached response");
    Ok(())
  }

  /// Look up `key`, honouring expiry and the prefix fallback.
  pub fn get(&self, key: &EndpointKey) -> Result<Option<CacheHit>> {
    self.get_at(key, Utc::now())
  }

  pub(crate) fn get_at(&self, key: &EndpointKey, now: DateTime<Utc>) -> Result<Option<CacheHit>> {
    if let Some(entry) = self.entry(key.as_str())? {
      if entry.is_live(now) {
        debug!(key = %key, "cache hit");
        return Ok(Some(CacheHit {
          response: entry,
          approximate: false,
        }));
      }
      debug!(key = %key, "cache entry expired");
    }

    if !self.prefix_fallback {
      return Ok(None);
    }

    let sibling = self.latest_live_sibling(key, now)?;
    if let Some(entry) = &sibling {
      debug!(key = %key, matched = %entry.endpoint_key, "approximate cache hit");
    }
    Ok(sibling.map(|response| CacheHit {
      response,
      approximate: true,
    }))
  }

  /// Raw entry for an exact key, expired or not.
  pub fn entry(&self, key: &str) -> Result<Option<CachedResponse>> {
    let row = self.store.with_conn(|conn| {
      conn
        .query_row(
          "SELECT endpoint_key, payload, cached_at, expires_at FROM cached_responses
           WHERE endpoint_key = ?",
          params![key],
          read_row,
        )
        .optional()
    })?;
    row.map(decode_row).transpose()
  }

  fn latest_live_sibling(
    &self,
    key: &EndpointKey,
    now: DateTime<Utc>,
  ) -> Result<Option<CachedResponse>> {
    let row = self.store.with_conn(|conn| {
      conn
        .query_row(
          "SELECT endpoint_key, payload, cached_at, expires_at FROM cached_responses
           WHERE resource = ? AND endpoint_key != ? AND expires_at > ?
           ORDER BY cached_at DESC LIMIT 1",
          params![key.resource(), key.as_str(), to_millis(now)],
          read_row,
        )
        .optional()
    })?;
    row.map(decode_row).transpose()
  }

  /// Live entries whose resource path is exactly `resource`.
  pub fn live_entries_for(&self, resource: &str) -> Result<Vec<CachedResponse>> {
    let now = to_millis(Utc::now());
    let rows = self.store.with_conn(|conn| {
      let mut stmt = conn.prepare(
        "SELECT endpoint_key, payload, cached_at, expires_at FROM cached_responses
         WHERE resource = ? AND expires_at > ?
         ORDER BY endpoint_key",
      )?;
      let rows = stmt
        .query_map(params![resource, now], read_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
      Ok(rows)
    })?;
    rows.into_iter().map(decode_row).collect()
  }

  /// Replace the payload of an existing entry, keeping its timestamps.
  pub fn replace_payload(&self, key: &str, payload: &Value) -> Result<bool> {
    let data = serde_json::to_string(payload)?;
    let changed = self.store.with_conn(|conn| {
      conn.execute(
        "UPDATE cached_responses SET payload = ? WHERE endpoint_key = ?",
        params![data, key],
      )
    })?;
    Ok(changed > 0)
  }

  /// Every cached key, live or expired.
  pub fn keys(&self) -> Result<Vec<EndpointKey>> {
    let raw: Vec<String> = self.store.with_conn(|conn| {
      let mut stmt = conn.prepare("SELECT endpoint_key FROM cached_responses ORDER BY endpoint_key")?;
      let keys = stmt
        .query_map([], |row| row.get(0))?
        .collect::<rusqlite::Result<Vec<String>>>()?;
      Ok(keys)
    })?;
    Ok(raw.iter().filter_map(|k| EndpointKey::parse(k).ok()).collect())
  }

  /// Remove every entry whose key matches `predicate`. Returns how many were removed.
  pub fn invalidate<P>(&self, predicate: P) -> Result<usize>
  where
    P: Fn(&EndpointKey) -> bool,
  {
    let doomed: Vec<String> = self
      .keys()?
      .into_iter()
      .filter(|k| predicate(k))
      .map(|k| k.as_str().to_string())
      .collect();
    if doomed.is_empty() {
      return Ok(0);
    }

    self.store.with_tx(|tx| {
      let mut stmt = tx.prepare("DELETE FROM cached_responses WHERE endpoint_key = ?")?;
      for key in &doomed {
        stmt.execute(params![key])?;
      }
      Ok(())
    })?;
    debug!(count = doomed.len(), "invalidated cached responses");
    Ok(doomed.len())
  }

  /// Drop entries related to the collection `collection`: every listing of
  /// it and every record below it.
  pub fn invalidate_collection(&self, collection: &str) -> Result<usize> {
    self.invalidate(|key| key.resource().starts_with(collection))
  }

  /// Delete expired entries. Reads never do this; it is a maintenance step.
  pub fn purge_expired(&self) -> Result<usize> {
    let now = to_millis(Utc::now());
    let removed = self.store.with_conn(|conn| {
      conn.execute(
        "DELETE FROM cached_responses WHERE expires_at <= ?",
        params![now],
      )
    })?;
    Ok(removed)
  }
}

type RawRow = (String, String, i64, i64);

fn read_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawRow> {
  Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
}

fn decode_row((endpoint_key, payload, cached_at, expires_at): RawRow) -> Result<CachedResponse> {
  Ok(CachedResponse {
    endpoint_key,
    payload: serde_json::from_str(&payload)?,
    cached_at: from_millis(cached_at),
    expires_at: from_millis(expires_at),
  })
}
