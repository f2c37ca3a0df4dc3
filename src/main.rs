use clap::{Parser, Subcommand};
use color_eyre::eyre::{eyre, WrapErr};
use color_eyre::Result;
use serde::Serialize;
use serde_json::Value;
use std::path::PathBuf;
use tracing::warn;

use medisync::api::Method;
use medisync::config::Config;
use medisync::queue::QueueStatus;
use medisync::router::ResponseSource;
use medisync::{logging, AppContext};

#[derive(Parser, Debug)]
#[command(name = "medisync")]
#[command(about = "Offline-first client for the clinic API")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/medisync/config.yaml)
  #[arg(short, long, global = true)]
  config: Option<PathBuf>,

  /// Treat the device as offline regardless of the network
  #[arg(long, global = true)]
  offline: bool,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Sign in (password from MEDISYNC_PASSWORD)
  Login { email: String },
  /// Sign out
  Logout {
    /// Also delete the credentials cached for offline sign-in
    #[arg(long)]
    forget: bool,
  },
  /// Read an endpoint, from the cache when offline
  Get { key: String },
  /// Create a record
  Post {
    key: String,
    /// JSON request body
    #[arg(short, long)]
    data: Option<String>,
  },
  /// Replace a record
  Put {
    key: String,
    #[arg(short, long)]
    data: Option<String>,
  },
  /// Update a record
  Patch {
    key: String,
    #[arg(short, long)]
    data: Option<String>,
  },
  /// Delete a record
  Delete { key: String },
  /// Replay queued writes now
  Sync,
  /// List queued writes
  Queue {
    /// pending, in_flight, failed or done
    #[arg(long)]
    status: Option<String>,
  },
  /// Give a failed write a fresh set of attempts
  Retry { id: i64 },
  /// Drop a queued write
  Discard { id: i64 },
  /// Warm the cache with every known read endpoint
  Precache {
    /// Sweep even if a previous sweep completed
    #[arg(long)]
    force: bool,
  },
  /// Show connectivity, session, queue and cache state
  Status,
  /// Stay running: probe connectivity and sync on reconnect
  Watch,
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
  println!("{}", serde_json::to_string_pretty(value)?);
  Ok(())
}

fn parse_body(data: Option<String>) -> Result<Option<Value>> {
  data
    .map(|d| serde_json::from_str(&d).wrap_err("--data is not valid JSON"))
    .transpose()
}

async fn write(ctx: &AppContext, method: Method, key: &str, data: Option<String>) -> Result<()> {
  let response = ctx.router.request(method, key, parse_body(data)?).await?;
  if response.source == ResponseSource::Optimistic {
    eprintln!(
      "offline: queued as #{} and will sync when the connection returns",
      response.queue_id.unwrap_or_default()
    );
  }
  print_json(&response.data)
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();

  let mut config = Config::load(args.config.as_deref())?;
  if args.offline {
    config.connectivity.force_offline = true;
  }

  let _log_guard = logging::init(&config.data_dir()?)?;
  let ctx = AppContext::open(config)?;

  if !matches!(args.command, Command::Login { .. } | Command::Logout { .. }) {
    if let Err(err) = ctx.auth.resume() {
      warn!(error = %err, "could not restore session");
    }
  }

  match args.command {
    Command::Login { email } => {
      let password = Config::get_password()?;
      let (outcome, precache) = ctx.login(&email, &password).await?;
      print_json(&outcome)?;
      if let Some(precache) = precache {
        print_json(&precache)?;
      }
    }
    Command::Logout { forget } => ctx.auth.logout(forget)?,
    Command::Get { key } => {
      let response = ctx.router.get(&key).await?;
      if response.approximate {
        eprintln!("offline: showing the closest cached listing, filters may not match");
      } else if let Some(cached_at) = response.cached_at {
        eprintln!("offline: cached at {}", cached_at.to_rfc3339());
      }
      print_json(&response.data)?;
    }
    Command::Post { key, data } => write(&ctx, Method::Post, &key, data).await?,
    Command::Put { key, data } => write(&ctx, Method::Put, &key, data).await?,
    Command::Patch { key, data } => write(&ctx, Method::Patch, &key, data).await?,
    Command::Delete { key } => write(&ctx, Method::Delete, &key, None).await?,
    Command::Sync => print_json(&ctx.sync.run_pass().await?)?,
    Command::Queue { status } => {
      let status = status
        .map(|s| s.parse::<QueueStatus>().map_err(|e| eyre!(e)))
        .transpose()?;
      print_json(&ctx.queue.list(status)?)?;
    }
    Command::Retry { id } => {
      if !ctx.queue.retry_failed(id)? {
        return Err(eyre!("queued write #{} is not in the failed state", id));
      }
      println!("queued write #{} will be retried on the next sync", id);
    }
    Command::Discard { id } => {
      if !ctx.queue.discard(id)? {
        return Err(eyre!("queued write #{} not found or currently syncing", id));
      }
      println!("discarded queued write #{}", id);
    }
    Command::Precache { force } => {
      let outcome = if force {
        ctx.precache.reset()?;
        ctx.precache.run().await?
      } else {
        ctx.precache.run_if_needed().await?
      };
      print_json(&outcome)?;
    }
    Command::Status => print_json(&ctx.status())?,
    Command::Watch => {
      let handles = ctx.start_background();
      eprintln!("watching connectivity, press Ctrl-C to stop");
      tokio::signal::ctrl_c().await?;
      for handle in handles {
        handle.abort();
      }
    }
  }

  Ok(())
}
