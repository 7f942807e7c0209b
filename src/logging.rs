//! Tracing subscriber setup.

use color_eyre::{eyre::eyre, Result};
use tracing::Level;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

use crate::config::LogConfig;

/// Keeps the file writer alive; hold it for the life of the process.
pub struct LogGuard {
  _file: Option<WorkerGuard>,
}

/// Install the global subscriber: stderr always, plus a daily-rolled file
/// when `config.dir` is set. `RUST_LOG` overrides the configured level.
pub fn init(config: &LogConfig) -> Result<LogGuard> {
  let level: Level = config
    .level
    .parse()
    .map_err(|_| eyre!("Invalid log level: {}", config.level))?;

  let filter = EnvFilter::builder()
    .with_default_directive(level.into())
    .from_env_lossy();

  let stderr_layer = tracing_subscriber::fmt::layer()
    .with_writer(std::io::stderr)
    .with_target(true)
    .with_filter(filter.clone());

  let (file_layer, guard) = match &config.dir {
    Some(dir) => {
      let appender = tracing_appender::rolling::daily(dir, "feedcore.log");
      let (writer, guard) = tracing_appender::non_blocking(appender);
      let layer = tracing_subscriber::fmt::layer()
        .with_writer(writer)
        .with_ansi(false)
        .with_filter(filter);
      (Some(layer), Some(guard))
    }
    None => (None, None),
  };

  tracing_subscriber::registry()
    .with(stderr_layer)
    .with(file_layer)
    .try_init()
    .map_err(|e| eyre!("Failed to install tracing subscriber: {}", e))?;

  Ok(LogGuard { _file: guard })
}
