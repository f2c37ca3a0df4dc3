//! Drains the mutation queue once the device is back online.
//!
//! A pass replays pending items strictly in enqueue order through the
//! request router. Only one pass runs at a time; a second caller gets
//! `SyncOutcome::AlreadyRunning` instead of starting another drain.

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::cache::shape::record_id;
use crate::cache::{CacheManager, EndpointKey};
use crate::entity::SyncState;
use crate::error::{Error, Result, TransportError};
use crate::queue::{MutationAction, MutationQueue, MutationQueueItem, QueueStatus, SyncLedger};
use crate::router::RequestRouter;

/// Attempts before a queued write is parked as `Failed`.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncReport {
  pub started_at: Option<DateTime<Utc>>,
  pub finished_at: Option<DateTime<Utc>>,
  /// Items found `InFlight` from an abandoned pass
  pub recovered: usize,
  pub pruned: usize,
  pub succeeded: usize,
  /// Failed but returned to `Pending` for a later pass
  pub retried: usize,
  /// Parked as `Failed` in this pass
  pub failed: usize,
  /// Skipped because they reference a record whose create has not synced
  pub deferred: usize,
  /// Parked as `Failed` because a record they reference will not be created
  pub blocked: usize,
  pub refreshed: usize,
  /// Connectivity was lost before the queue was drained
  pub interrupted: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum SyncOutcome {
  Completed(SyncReport),
  AlreadyRunning,
  Offline,
}

/// Resets the in-progress flag when a pass ends, however it ends.
struct PassGuard(Arc<AtomicBool>);

impl Drop for PassGuard {
  fn drop(&mut self) {
    self.0.store(false, Ordering::SeqCst);
  }
}

#[derive(Clone)]
pub struct SyncProcessor {
  router: RequestRouter,
  cache: CacheManager,
  queue: MutationQueue,
  ledger: SyncLedger,
  max_attempts: u32,
  done_retention: Duration,
  refresh_after_sync: bool,
  running: Arc<AtomicBool>,
  last_report: Arc<Mutex<Option<SyncReport>>>,
}

impl SyncProcessor {
  pub fn new(
    router: RequestRouter,
    cache: CacheManager,
    queue: MutationQueue,
    ledger: SyncLedger,
  ) -> Self {
    Self {
      router,
      cache,
      queue,
      ledger,
      max_attempts: DEFAULT_MAX_ATTEMPTS,
      done_retention: Duration::minutes(60),
      refresh_after_sync: true,
      running: Arc::new(AtomicBool::new(false)),
      last_report: Arc::new(Mutex::new(None)),
    }
  }

  pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
    self.max_attempts = max_attempts.max(1);
    self
  }

  pub fn with_done_retention(mut self, retention: Duration) -> Self {
    self.done_retention = retention;
    self
  }

  pub fn with_refresh_after_sync(mut self, enabled: bool) -> Self {
    self.refresh_after_sync = enabled;
    self
  }

  pub fn is_running(&self) -> bool {
    self.running.load(Ordering::SeqCst)
  }

  pub fn last_report(&self) -> Option<SyncReport> {
    self.last_report.lock().ok().and_then(|r| r.clone())
  }

  /// Run one drain of the queue.
  pub async fn run_pass(&self) -> Result<SyncOutcome> {
    if !self.router.connectivity().is_online() {
      debug!("offline, skipping sync pass");
      return Ok(SyncOutcome::Offline);
    }
    if self
      .running
      .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
      .is_err()
    {
      debug!("sync pass already in progress");
      return Ok(SyncOutcome::AlreadyRunning);
    }
    let _guard = PassGuard(self.running.clone());

    let report = self.drain().await?;
    info!(
      succeeded = report.succeeded,
      retried = report.retried,
      failed = report.failed,
      deferred = report.deferred,
      blocked = report.blocked,
      interrupted = report.interrupted,
      "sync pass finished"
    );
    if let Ok(mut last) = self.last_report.lock() {
      *last = Some(report.clone());
    }
    Ok(SyncOutcome::Completed(report))
  }

  /// Run a pass on every offline to online transition until the
  /// connectivity signal is dropped.
  pub fn spawn_on_reconnect(self) -> JoinHandle<()> {
    let mut rx = self.router.connectivity().subscribe();
    tokio::spawn(async move {
      if *rx.borrow_and_update() {
        self.run_logged().await;
      }
      while rx.changed().await.is_ok() {
        if *rx.borrow_and_update() {
          self.run_logged().await;
        }
      }
    })
  }

  async fn run_logged(&self) {
    if let Err(err) = self.run_pass().await {
      warn!(error = %err, "sync pass aborted");
    }
  }

  async fn drain(&self) -> Result<SyncReport> {
    let mut report = SyncReport {
      started_at: Some(Utc::now()),
      ..SyncReport::default()
    };

    report.recovered = self.queue.recover_in_flight()?;
    if report.recovered > 0 {
      info!(count = report.recovered, "recovered writes from an abandoned sync pass");
    }
    report.pruned = self.queue.prune_done(Utc::now() - self.done_retention)?;

    let ids: Vec<i64> = self.queue.pending()?.iter().map(|item| item.id).collect();
    let mut affected = BTreeSet::new();

    for id in ids {
      if !self.router.connectivity().is_online() {
        report.interrupted = true;
        break;
      }
      // Earlier items in this pass may have rewritten or discarded this one.
      let Some(item) = self.queue.get(id)? else {
        continue;
      };
      if item.status != QueueStatus::Pending {
        continue;
      }

      let waiting_on = self.unresolved_references(&item)?;
      if !waiting_on.is_empty() {
        if let Some((blocker, reason)) = self.dead_reference(&waiting_on)? {
          if self.park_blocked(&item, blocker, &reason)? {
            report.blocked += 1;
          }
          continue;
        }
        debug!(id, ?waiting_on, "deferring write until referenced records sync");
        report.deferred += 1;
        continue;
      }

      if !self.queue.mark_in_flight(id)? {
        continue;
      }

      let key = item.key()?;
      let body = (!item.payload.is_null()).then_some(&item.payload);
      match self.router.dispatch(item.method, &key, body).await {
        Ok(response) => {
          self.on_success(&item, &key, &response)?;
          affected.insert(key.collection());
          report.succeeded += 1;
        }
        Err(err) => {
          let lost_connection = matches!(err, TransportError::Connection(_));
          match self.on_failure(&item, &key, err)? {
            QueueStatus::Failed => report.failed += 1,
            _ => report.retried += 1,
          }
          if lost_connection {
            report.interrupted = true;
            break;
          }
        }
      }
    }

    if self.refresh_after_sync && !report.interrupted {
      report.refreshed = self.refresh(&affected).await;
    }
    report.finished_at = Some(Utc::now());
    Ok(report)
  }

  fn unresolved_references(&self, item: &MutationQueueItem) -> Result<Vec<String>> {
    let mut unresolved = Vec::new();
    for temp_id in item.referenced_temp_ids() {
      if self.ledger.resolve(&temp_id)?.is_none() {
        unresolved.push(temp_id);
      }
    }
    Ok(unresolved)
  }

  /// The first of `temp_ids` whose create can no longer assign it, with the
  /// queue id of that create when it is still around to be retried.
  fn dead_reference(&self, temp_ids: &[String]) -> Result<Option<(Option<i64>, String)>> {
    for temp_id in temp_ids {
      match self.queue.creator_of(temp_id)? {
        None => {
          return Ok(Some((
            None,
            format!("references {} but the write creating it was discarded", temp_id),
          )))
        }
        Some(create) if create.status == QueueStatus::Failed => {
          return Ok(Some((
            Some(create.id),
            format!(
              "blocked by queued write #{} which failed to create {}",
              create.id, temp_id
            ),
          )))
        }
        Some(create) if create.status == QueueStatus::Done => {
          return Ok(Some((
            None,
            format!(
              "queued write #{} created {} but the server returned no id",
              create.id, temp_id
            ),
          )))
        }
        Some(_) => {}
      }
    }
    Ok(None)
  }

  fn park_blocked(
    &self,
    item: &MutationQueueItem,
    blocker: Option<i64>,
    reason: &str,
  ) -> Result<bool> {
    if !self.queue.block(item.id, blocker, reason)? {
      return Ok(false);
    }
    warn!(id = item.id, key = %item.endpoint_key, %reason, "giving up on dependent write");
    let key = item.key()?;
    if let Some(record) = item.temp_id.as_deref().or(key.record_id()) {
      self
        .ledger
        .set_state(item.entity_kind, record, SyncState::Conflict, Some(item.id))?;
    }
    Ok(true)
  }

  fn on_success(
    &self,
    item: &MutationQueueItem,
    key: &EndpointKey,
    response: &serde_json::Value,
  ) -> Result<()> {
    self.queue.mark_done(item.id)?;

    let mut record = key.record_id().map(String::from);
    if let (MutationAction::Create, Some(temp_id)) = (item.action, &item.temp_id) {
      record = Some(temp_id.clone());
      match record_id(response) {
        Some(real_id) => {
          self.ledger.record_mapping(temp_id, &real_id, item.entity_kind)?;
          self.ledger.rename_record(item.entity_kind, temp_id, &real_id)?;
          self.queue.rewrite_temp_id(temp_id, &real_id)?;
          record = Some(real_id);
        }
        None => warn!(
          id = item.id,
          temp_id = %temp_id,
          "server response to a queued create carries no id"
        ),
      }
    }

    self
      .router
      .optimistic()
      .confirm(item.action, key, item.temp_id.as_deref(), response)?;
    if let Some(record) = record {
      if self
        .queue
        .has_open_writes_for(item.entity_kind, &record, item.id)?
      {
        debug!(id = item.id, %record, "record still has queued writes");
      } else {
        self.ledger.clear_state(item.entity_kind, &record)?;
      }
    }
    debug!(id = item.id, key = %key, "replayed queued write");
    Ok(())
  }

  fn on_failure(
    &self,
    item: &MutationQueueItem,
    key: &EndpointKey,
    err: TransportError,
  ) -> Result<QueueStatus> {
    let message = err.to_string();
    let status = self.queue.record_failure(item.id, &message, self.max_attempts)?;
    let err = Error::SyncReplayFailed {
      id: item.id,
      message,
    };

    if status == QueueStatus::Failed {
      warn!(error = %err, key = %key, "giving up on queued write");
      let record = item.temp_id.as_deref().or(key.record_id());
      if let Some(record) = record {
        self
          .ledger
          .set_state(item.entity_kind, record, SyncState::Conflict, Some(item.id))?;
      }
    } else {
      warn!(error = %err, key = %key, "queued write will be retried");
    }
    Ok(status)
  }

  /// Re-read cached listings of collections touched by confirmed writes.
  async fn refresh(&self, collections: &BTreeSet<String>) -> usize {
    let mut refreshed = 0;
    for collection in collections {
      let entries = match self.cache.live_entries_for(collection) {
        Ok(entries) => entries,
        Err(err) => {
          debug!(%collection, error = %err, "cannot list cached reads to refresh");
          continue;
        }
      };
      for entry in entries {
        match self.router.refresh(&entry.endpoint_key).await {
          Ok(_) => refreshed += 1,
          Err(err) => warn!(key = %entry.endpoint_key, error = %err, "post-sync refresh failed"),
        }
      }
    }
    refreshed
  }
}
