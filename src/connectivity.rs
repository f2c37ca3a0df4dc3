//! Online/offline signal.
//!
//! `Connectivity` is a watch channel holding the current state. Anything may
//! flip it (a probe, a CLI flag, a test). Components read it at the start of
//! every operation and the sync processor subscribes to transitions. Without
//! any signal source the device counts as online, so writes are never queued
//! by mistake.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

#[derive(Clone)]
pub struct Connectivity {
  tx: Arc<watch::Sender<bool>>,
}

impl Connectivity {
  pub fn new(online: bool) -> Self {
    let (tx, _rx) = watch::channel(online);
    Self { tx: Arc::new(tx) }
  }

  pub fn is_online(&self) -> bool {
    *self.tx.borrow()
  }

  /// Record the current state. Subscribers are only woken on an actual change.
  pub fn set_online(&self, online: bool) {
    let changed = self.tx.send_if_modified(|current| {
      if *current == online {
        false
      } else {
        *current = online;
        true
      }
    });
    if changed {
      if online {
        info!("connectivity restored");
      } else {
        warn!("connectivity lost, switching to offline mode");
      }
    }
  }

  pub fn subscribe(&self) -> watch::Receiver<bool> {
    self.tx.subscribe()
  }
}

impl Default for Connectivity {
  fn default() -> Self {
    Self::new(true)
  }
}

/// Periodically probes a URL and feeds the result into `Connectivity`.
///
/// Any HTTP response, whatever its status, means the network is up.
pub struct ConnectivityMonitor {
  client: reqwest::Client,
  probe_url: String,
  interval: Duration,
  connectivity: Connectivity,
}

impl ConnectivityMonitor {
  pub fn new(probe_url: impl Into<String>, interval: Duration, connectivity: Connectivity) -> Self {
    let client = reqwest::Client::builder()
      .timeout(Duration::from_secs(5))
      .build()
      .unwrap_or_default();
    Self {
      client,
      probe_url: probe_url.into(),
      interval,
      connectivity,
    }
  }

  /// Probe once and update the signal.
  pub async fn probe(&self) -> bool {
    let online = match self.client.head(&self.probe_url).send().await {
      Ok(response) => {
        debug!(status = %response.status(), "connectivity probe answered");
        true
      }
      Err(err) => {
        debug!(error = %err, "connectivity probe failed");
        false
      }
    };
    self.connectivity.set_online(online);
    online
  }

  pub fn spawn(self) -> JoinHandle<()> {
    tokio::spawn(async move {
      loop {
        self.probe().await;
        tokio::time::sleep(self.interval).await;
      }
    })
  }
}
