//! Logging setup.
//!
//! Everything goes to a daily rolling file under `<data_dir>/logs`. Warnings
//! are also echoed to stderr so the CLI surfaces them.

use std::path::Path;
use tracing_appender::{non_blocking, rolling};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

use crate::error::{Error, Result};

/// Environment variable holding the file log filter.
pub const LOG_ENV: &str = "MEDISYNC_LOG";

const DEFAULT_FILE_FILTER: &str = "info";
const DEFAULT_TERMINAL_FILTER: &str = "warn";
const MAX_LOG_FILES: usize = 7;

fn filter(default: &str) -> EnvFilter {
  EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new(default))
}

/// Install the global subscriber. Keep the returned guard alive for the
/// lifetime of the process or buffered lines are lost.
pub fn init(data_dir: &Path) -> Result<non_blocking::WorkerGuard> {
  let logs = data_dir.join("logs");
  let appender = rolling::Builder::new()
    .rotation(rolling::Rotation::DAILY)
    .max_log_files(MAX_LOG_FILES)
    .filename_prefix("medisync")
    .filename_suffix("log")
    .build(&logs)
    .map_err(|e| Error::Config(format!("Failed to open log directory {}: {}", logs.display(), e)))?;
  let (writer, guard) = non_blocking(appender);

  let file_layer = fmt::layer()
    .with_ansi(false)
    .with_line_number(true)
    .with_writer(writer)
    .with_filter(filter(DEFAULT_FILE_FILTER));
  let terminal_layer = fmt::layer()
    .with_writer(std::io::stderr)
    .with_target(false)
    .with_filter(EnvFilter::new(DEFAULT_TERMINAL_FILTER));

  tracing_subscriber::registry()
    .with(file_layer)
    .with(terminal_layer)
    .try_init()
    .map_err(|e| Error::Config(format!("Failed to initialise logging: {}", e)))?;
  Ok(guard)
}
