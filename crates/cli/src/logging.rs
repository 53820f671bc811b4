//! Logging setup for the CLI

use kibitz_core::LogConfig;
use std::path::PathBuf;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

const LOG_FILE: &str = "kibitz.log";

/// Get the kibitz data directory (respects env vars)
pub fn data_dir() -> PathBuf {
  kibitz_core::dirs::default_data_dir()
}

/// Get the log file path
pub fn log_file_path() -> PathBuf {
  data_dir().join(LOG_FILE)
}

/// Parse log level from config string
fn parse_log_level(level: &str) -> tracing::Level {
  match level.to_lowercase().as_str() {
    "off" | "error" => tracing::Level::ERROR,
    "warn" => tracing::Level::WARN,
    "info" => tracing::Level::INFO,
    "debug" => tracing::Level::DEBUG,
    "trace" => tracing::Level::TRACE,
    _ => tracing::Level::INFO,
  }
}

/// Console logging on stderr; stdout carries protocol output
fn init_stderr_logging(env_filter: EnvFilter) {
  tracing_subscriber::fmt()
    .with_env_filter(env_filter)
    .with_target(true)
    .with_writer(std::io::stderr)
    .init();
}

/// Initialize logging from the `[log]` config section.
///
/// Logs go to stderr unless `log.file` is set, in which case they go to a
/// rolling file in the data directory. `RUST_LOG` overrides the level.
///
/// Returns the guard that must be kept alive for the duration of the program
pub fn init_logging(config: &LogConfig) -> Option<WorkerGuard> {
  let level = parse_log_level(&config.level);
  let env_filter = EnvFilter::builder()
    .with_default_directive(level.into())
    .from_env_lossy();

  if !config.file {
    init_stderr_logging(env_filter);
    return None;
  }

  let log_dir = data_dir();
  if std::fs::create_dir_all(&log_dir).is_err() {
    // Fall back to console-only logging
    init_stderr_logging(env_filter);
    return None;
  }

  let file_appender = match config.rotation.as_str() {
    "hourly" => tracing_appender::rolling::hourly(&log_dir, LOG_FILE),
    "never" => tracing_appender::rolling::never(&log_dir, LOG_FILE),
    _ => tracing_appender::rolling::daily(&log_dir, LOG_FILE),
  };

  let (file_writer, guard) = tracing_appender::non_blocking(file_appender);

  tracing_subscriber::fmt()
    .with_env_filter(env_filter)
    .with_target(true)
    .with_ansi(false)
    .with_writer(file_writer)
    .init();

  Some(guard)
}
