//! Application context: every service, built once and passed around.

use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration as StdDuration;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::api::{HttpTransport, Session, Transport};
use crate::auth::{AuthService, LoginMode, LoginOutcome};
use crate::cache::CacheManager;
use crate::config::Config;
use crate::connectivity::{Connectivity, ConnectivityMonitor};
use crate::error::Result;
use crate::precache::{PrecacheOrchestrator, PrecacheOutcome, PrecacheStatus};
use crate::queue::{MutationQueue, QueueCounts, SyncLedger};
use crate::router::RequestRouter;
use crate::store::{Flags, Store, DB_FILE};
use crate::store::flags::FLAGS_FILE;
use crate::sync::{SyncProcessor, SyncReport};
use crate::vault::CredentialVault;

/// Snapshot of the engine's state for display.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Status {
  pub online: bool,
  pub authenticated: bool,
  pub active_email: Option<String>,
  pub storage_available: bool,
  pub storage_path: Option<PathBuf>,
  pub queue: Option<QueueCounts>,
  pub sync_running: bool,
  pub last_sync: Option<SyncReport>,
  pub precache: PrecacheStatus,
}

pub struct AppContext {
  pub config: Config,
  pub store: Arc<Store>,
  pub flags: Arc<Flags>,
  pub session: Session,
  pub connectivity: Connectivity,
  pub cache: CacheManager,
  pub queue: MutationQueue,
  pub ledger: SyncLedger,
  pub vault: CredentialVault,
  pub router: RequestRouter,
  pub auth: AuthService,
  pub sync: SyncProcessor,
  pub precache: PrecacheOrchestrator,
}

impl AppContext {
  /// Open the local store under the data directory and wire up the services.
  ///
  /// A store that cannot be opened leaves the engine in online-only mode.
  pub fn open(config: Config) -> Result<Self> {
    let data_dir = config.data_dir()?;
    let store = Arc::new(Store::open_or_unavailable(&data_dir.join(DB_FILE)));
    let flags = Arc::new(Flags::load(&data_dir.join(FLAGS_FILE)));
    let session = Session::new();
    let connectivity = Connectivity::new(!config.connectivity.force_offline);
    let transport: Arc<dyn Transport> = Arc::new(HttpTransport::new(&config, session.clone())?);

    Ok(Self::assemble(
      config,
      store,
      flags,
      transport,
      session,
      connectivity,
    ))
  }

  pub fn assemble(
    config: Config,
    store: Arc<Store>,
    flags: Arc<Flags>,
    transport: Arc<dyn Transport>,
    session: Session,
    connectivity: Connectivity,
  ) -> Self {
    let cache = CacheManager::new(store.clone())
      .with_ttl(chrono::Duration::hours(config.cache.ttl_hours))
      .with_prefix_fallback(config.cache.prefix_fallback);
    let queue = MutationQueue::new(store.clone());
    let ledger = SyncLedger::new(store.clone());
    let vault = CredentialVault::new(store.clone(), flags.clone())
      .with_ttl(chrono::Duration::days(config.credentials.ttl_days));

    let router = RequestRouter::new(
      transport.clone(),
      cache.clone(),
      queue.clone(),
      ledger.clone(),
      connectivity.clone(),
    );
    let auth = AuthService::new(
      transport,
      session.clone(),
      vault.clone(),
      flags.clone(),
      connectivity.clone(),
      config.api.login_path.clone(),
    );
    let sync = SyncProcessor::new(router.clone(), cache.clone(), queue.clone(), ledger.clone())
      .with_max_attempts(config.queue.max_attempts)
      .with_done_retention(chrono::Duration::minutes(config.queue.done_retention_minutes))
      .with_refresh_after_sync(config.sync.refresh_after_sync);
    let precache = PrecacheOrchestrator::new(router.clone(), flags.clone(), config.precache.clone());

    if store.is_available() {
      match vault.purge_expired() {
        Ok(0) => {}
        Ok(n) => info!(removed = n, "purged expired offline credentials"),
        Err(err) => warn!(error = %err, "failed to purge expired credentials"),
      }
    }

    Self {
      config,
      store,
      flags,
      session,
      connectivity,
      cache,
      queue,
      ledger,
      vault,
      router,
      auth,
      sync,
      precache,
    }
  }

  /// Sign in, then warm the cache if this device has never completed a
  /// pre-cache sweep.
  pub async fn login(
    &self,
    email: &str,
    password: &str,
  ) -> Result<(LoginOutcome, Option<PrecacheOutcome>)> {
    let outcome = self.auth.login(email, password).await?;
    if outcome.mode != LoginMode::Online {
      return Ok((outcome, None));
    }

    let precache = match self.precache.run_if_needed().await {
      Ok(result) => Some(result),
      Err(err) => {
        warn!(error = %err, "pre-cache after login failed");
        None
      }
    };
    Ok((outcome, precache))
  }

  pub fn status(&self) -> Status {
    Status {
      online: self.connectivity.is_online(),
      authenticated: self.session.is_authenticated(),
      active_email: self.auth.active_email(),
      storage_available: self.store.is_available(),
      storage_path: self.store.path().map(|p| p.to_path_buf()),
      queue: self.queue.counts().ok(),
      sync_running: self.sync.is_running(),
      last_sync: self.sync.last_report(),
      precache: self.precache.status(),
    }
  }

  /// Start the connectivity probe (when configured) and the reconnect-driven
  /// sync loop.
  pub fn start_background(&self) -> Vec<JoinHandle<()>> {
    let mut handles = Vec::new();
    let connectivity = &self.config.connectivity;
    match (&connectivity.probe_url, connectivity.force_offline) {
      (Some(url), false) => {
        let monitor = ConnectivityMonitor::new(
          url.clone(),
          StdDuration::from_secs(connectivity.probe_interval_secs.max(1)),
          self.connectivity.clone(),
        );
        handles.push(monitor.spawn());
      }
      _ => info!("no connectivity probe configured"),
    }
    handles.push(self.sync.clone().spawn_on_reconnect());
    handles
  }
}
