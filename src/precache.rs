//! Warms the cache with every read endpoint the application is known to use.
//!
//! A sweep issues GETs through the router with at most `max_concurrent`
//! requests in flight and `dispatch_delay` between dispatches. Endpoint
//! families such as `/organizations/{id}/departments/` are expanded from
//! the ids in their parent listing once it has been fetched. A sweep that
//! finishes online with every request answered is recorded in the flags
//! file so later sessions skip it until it is reset. Any failed request
//! leaves the marker unset and the next session sweeps again.

use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

use crate::cache::shape::{record_id, ListShape};
use crate::config::{EndpointFamily, PrecacheConfig};
use crate::error::Result;
use crate::router::RequestRouter;
use crate::store::Flags;

const ID_PLACEHOLDER: &str = "{id}";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PrecacheReport {
  pub started_at: Option<DateTime<Utc>>,
  pub finished_at: Option<DateTime<Utc>>,
  pub requested: usize,
  pub succeeded: usize,
  pub failed: usize,
  /// Child endpoints generated from family templates
  pub expanded: usize,
  /// The sweep ran to the end online without failures and was recorded as done
  pub completed: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum PrecacheOutcome {
  Completed(PrecacheReport),
  /// A previous sweep already completed
  Skipped,
  AlreadyRunning,
  Offline,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PrecacheStatus {
  pub completed: bool,
  pub completed_at: Option<DateTime<Utc>>,
  pub running: bool,
  pub last_report: Option<PrecacheReport>,
}

struct SweepGuard(Arc<AtomicBool>);

impl Drop for SweepGuard {
  fn drop(&mut self) {
    self.0.store(false, Ordering::SeqCst);
  }
}

#[derive(Clone)]
pub struct PrecacheOrchestrator {
  router: RequestRouter,
  flags: Arc<Flags>,
  config: PrecacheConfig,
  running: Arc<AtomicBool>,
  last_report: Arc<Mutex<Option<PrecacheReport>>>,
}

impl PrecacheOrchestrator {
  pub fn new(router: RequestRouter, flags: Arc<Flags>, config: PrecacheConfig) -> Self {
    Self {
      router,
      flags,
      config,
      running: Arc::new(AtomicBool::new(false)),
      last_report: Arc::new(Mutex::new(None)),
    }
  }

  pub fn status(&self) -> PrecacheStatus {
    let flags = self.flags.get();
    PrecacheStatus {
      completed: flags.precache_completed,
      completed_at: flags.precache_completed_at,
      running: self.running.load(Ordering::SeqCst),
      last_report: self.last_report.lock().ok().and_then(|r| r.clone()),
    }
  }

  /// Forget the completion marker so the next `run_if_needed` sweeps again.
  pub fn reset(&self) -> Result<()> {
    self.flags.update(|f| {
      f.precache_completed = false;
      f.precache_completed_at = None;
    })?;
    info!("pre-cache marker reset");
    Ok(())
  }

  /// Sweep unless a previous sweep already completed.
  pub async fn run_if_needed(&self) -> Result<PrecacheOutcome> {
    if self.flags.get().precache_completed {
      debug!("pre-cache already completed, skipping");
      return Ok(PrecacheOutcome::Skipped);
    }
    self.run().await
  }

  /// Sweep every known read endpoint.
  pub async fn run(&self) -> Result<PrecacheOutcome> {
    if !self.router.connectivity().is_online() {
      return Ok(PrecacheOutcome::Offline);
    }
    if self
      .running
      .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
      .is_err()
    {
      return Ok(PrecacheOutcome::AlreadyRunning);
    }
    let _guard = SweepGuard(self.running.clone());

    let mut report = PrecacheReport {
      started_at: Some(Utc::now()),
      ..PrecacheReport::default()
    };
    info!(
      endpoints = self.config.endpoints.len(),
      families = self.config.families.len(),
      "starting pre-cache sweep"
    );

    let parents: Vec<&str> = self
      .config
      .families
      .iter()
      .map(|f| f.parent.as_str())
      .collect();
    let mut listings = self
      .sweep(self.config.endpoints.clone(), &parents, &mut report)
      .await;

    let missing: Vec<String> = parents
      .iter()
      .filter(|p| !listings.contains_key(**p) && !self.config.endpoints.iter().any(|e| e == *p))
      .map(|p| p.to_string())
      .collect();
    if !missing.is_empty() {
      listings.extend(self.sweep(missing, &parents, &mut report).await);
    }

    let children = expand_families(&self.config.families, &listings);
    report.expanded = children.len();
    self.sweep(children, &[], &mut report).await;

    if !self.router.connectivity().is_online() {
      warn!("connectivity lost during pre-cache, will retry next time");
    } else if report.failed > 0 {
      warn!(
        failed = report.failed,
        requested = report.requested,
        "pre-cache sweep had failures, will retry next time"
      );
    } else {
      let now = Utc::now();
      self.flags.update(|f| {
        f.precache_completed = true;
        f.precache_completed_at = Some(now);
      })?;
      report.completed = true;
    }
    report.finished_at = Some(Utc::now());

    info!(
      requested = report.requested,
      succeeded = report.succeeded,
      failed = report.failed,
      "pre-cache sweep finished"
    );
    if let Ok(mut last) = self.last_report.lock() {
      *last = Some(report.clone());
    }
    Ok(PrecacheOutcome::Completed(report))
  }

  /// GET every key with bounded concurrency. Returns the bodies of the keys
  /// listed in `keep`.
  async fn sweep(
    &self,
    keys: Vec<String>,
    keep: &[&str],
    report: &mut PrecacheReport,
  ) -> HashMap<String, Value> {
    let semaphore = Arc::new(Semaphore::new(self.config.max_concurrent.max(1)));
    let delay = Duration::from_millis(self.config.dispatch_delay_ms);
    let mut tasks = Vec::with_capacity(keys.len());

    for (i, key) in keys.into_iter().enumerate() {
      if !self.router.connectivity().is_online() {
        break;
      }
      if i > 0 && !delay.is_zero() {
        tokio::time::sleep(delay).await;
      }
      let Ok(permit) = semaphore.clone().acquire_owned().await else {
        break;
      };

      let router = self.router.clone();
      report.requested += 1;
      tasks.push(tokio::spawn(async move {
        let result = router.refresh(&key).await;
        drop(permit);
        (key, result)
      }));
    }

    let mut kept = HashMap::new();
    for result in join_all(tasks).await {
      match result {
        Ok((key, Ok(response))) => {
          report.succeeded += 1;
          if keep.contains(&key.as_str()) {
            kept.insert(key, response.data);
          }
        }
        Ok((key, Err(err))) => {
          report.failed += 1;
          debug!(%key, error = %err, "pre-cache request failed");
        }
        Err(err) => {
          report.failed += 1;
          warn!(error = %err, "pre-cache task panicked");
        }
      }
    }
    kept
  }
}

/// Concrete child endpoints for every record of each family's parent listing.
fn expand_families(families: &[EndpointFamily], listings: &HashMap<String, Value>) -> Vec<String> {
  let mut children = Vec::new();
  for family in families {
    let Some(listing) = listings.get(&family.parent) else {
      continue;
    };
    let Ok(shape) = ListShape::from_value(listing.clone()) else {
      continue;
    };
    for id in shape.items().iter().filter_map(record_id) {
      let child = family.child.replace(ID_PLACEHOLDER, &id);
      if !children.contains(&child) {
        children.push(child);
      }
    }
  }
  children
}
