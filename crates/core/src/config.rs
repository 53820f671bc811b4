//! Configuration system for kibitz.
//!
//! Config priority: explicit path > `KIBITZ_CONFIG_DIR` > `$XDG_CONFIG_HOME/kibitz` > platform config dir.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::dirs;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
  #[error("failed to read config {path:?}: {source}")]
  Read {
    path: PathBuf,
    #[source]
    source: std::io::Error,
  },
  #[error("failed to parse config {path:?}: {source}")]
  Parse {
    path: PathBuf,
    #[source]
    source: toml::de::Error,
  },
  #[error("failed to write config {path:?}: {source}")]
  Write {
    path: PathBuf,
    #[source]
    source: std::io::Error,
  },
}

// ============================================================================
// Engine Process
// ============================================================================

/// How to launch the analysis engine
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
  /// Path to the engine executable
  pub command: String,

  /// Flat argument list passed to `command`
  pub args: Vec<String>,

  /// Full command line run through the platform shell.
  /// When set, `command` and `args` are ignored.
  #[serde(skip_serializing_if = "Option::is_none")]
  pub shell: Option<String>,

  /// Working directory for the engine process
  #[serde(skip_serializing_if = "Option::is_none")]
  pub working_dir: Option<PathBuf>,

  /// Extra environment variables for the engine process
  pub env: BTreeMap<String, String>,
}

impl EngineConfig {
  /// Engine launched directly from an executable and argument list
  pub fn new(command: impl Into<String>, args: impl IntoIterator<Item = impl Into<String>>) -> Self {
    Self {
      command: command.into(),
      args: args.into_iter().map(Into::into).collect(),
      ..Default::default()
    }
  }

  /// Engine launched from a full shell command line
  pub fn shell(command_line: impl Into<String>) -> Self {
    Self {
      shell: Some(command_line.into()),
      ..Default::default()
    }
  }

  /// Human readable command line, for logs
  pub fn display_command(&self) -> String {
    match &self.shell {
      Some(line) => line.clone(),
      None if self.args.is_empty() => self.command.clone(),
      None => format!("{} {}", self.command, self.args.join(" ")),
    }
  }

  pub fn is_configured(&self) -> bool {
    self.shell.as_deref().is_some_and(|s| !s.trim().is_empty()) || !self.command.trim().is_empty()
  }
}

// ============================================================================
// Queues
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
  /// Bounded capacity of the engine stdout line queue
  pub stdout_capacity: usize,
  /// Bounded capacity of the engine stderr line queue
  pub stderr_capacity: usize,
  /// Bounded capacity of the outbound request queue
  pub write_capacity: usize,
  /// How long a producer may wait on a full request queue
  pub submit_timeout_ms: u64,
}

impl Default for QueueConfig {
  fn default() -> Self {
    Self {
      stdout_capacity: 1024,
      stderr_capacity: 256,
      write_capacity: 256,
      submit_timeout_ms: 2000,
    }
  }
}

impl QueueConfig {
  pub fn submit_timeout(&self) -> Duration {
    Duration::from_millis(self.submit_timeout_ms)
  }
}

// ============================================================================
// Timeouts
// ============================================================================

/// Bounds for every blocking step of the engine lifecycle
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
  /// Dispatcher poll interval; also the responsiveness check period
  pub poll_interval_ms: u64,
  /// Shutdown: wait for outstanding queries to drain
  pub drain_timeout_ms: u64,
  /// Shutdown: delay before retrying the write-queue sentinel
  pub sentinel_retry_ms: u64,
  /// Shutdown: per-thread join bound
  pub join_timeout_ms: u64,
  /// Shutdown: wait for the exit status after a forced kill
  pub kill_wait_ms: u64,
  /// Default bound for `wait_ready`
  pub ready_timeout_ms: u64,
}

impl Default for TimeoutConfig {
  fn default() -> Self {
    Self {
      poll_interval_ms: 500,
      drain_timeout_ms: 5000,
      sentinel_retry_ms: 100,
      join_timeout_ms: 1000,
      kill_wait_ms: 2000,
      ready_timeout_ms: 60_000,
    }
  }
}

impl TimeoutConfig {
  pub fn poll_interval(&self) -> Duration {
    Duration::from_millis(self.poll_interval_ms)
  }

  pub fn drain_timeout(&self) -> Duration {
    Duration::from_millis(self.drain_timeout_ms)
  }

  pub fn sentinel_retry(&self) -> Duration {
    Duration::from_millis(self.sentinel_retry_ms)
  }

  pub fn join_timeout(&self) -> Duration {
    Duration::from_millis(self.join_timeout_ms)
  }

  pub fn kill_wait(&self) -> Duration {
    Duration::from_millis(self.kill_wait_ms)
  }

  pub fn ready_timeout(&self) -> Duration {
    Duration::from_millis(self.ready_timeout_ms)
  }
}

// ============================================================================
// Ponder
// ============================================================================

/// Continuous (ponder) query behavior
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PonderConfig {
  /// Payload fields ignored when deciding whether a new ponder request
  /// differs from the active one
  pub exclude_fields: Vec<String>,
  /// Visit budget stamped on an installed ponder query
  pub max_visits: u64,
  /// Progress report interval stamped on an installed ponder query
  pub report_interval_secs: f64,
}

impl Default for PonderConfig {
  fn default() -> Self {
    Self {
      exclude_fields: vec![
        "id".to_string(),
        "maxVisits".to_string(),
        "reportDuringSearchEvery".to_string(),
        "priority".to_string(),
      ],
      max_visits: 1_000_000_000,
      report_interval_secs: 0.5,
    }
  }
}

// ============================================================================
// Diagnostics
// ============================================================================

/// Engine stderr interpretation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiagnosticsConfig {
  /// Substrings on stderr that mean the engine has crashed
  pub crash_signatures: Vec<String>,
  /// Substring on stderr that means the engine is ready for requests
  #[serde(skip_serializing_if = "Option::is_none")]
  pub ready_marker: Option<String>,
  /// Exit codes that mean a deliberate exit rather than a failure
  pub expected_exit_codes: Vec<i32>,
}

impl Default for DiagnosticsConfig {
  fn default() -> Self {
    Self {
      crash_signatures: vec![
        "Uncaught exception".to_string(),
        "terminate called after throwing".to_string(),
        "Segmentation fault".to_string(),
        "CUDA error".to_string(),
        "OpenCL error".to_string(),
      ],
      ready_marker: None,
      expected_exit_codes: vec![0],
    }
  }
}

// ============================================================================
// Logging
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
  /// Log level: "off", "error", "warn", "info", "debug", "trace"
  pub level: String,
  /// Write logs to a rolling file in the data directory instead of stderr
  pub file: bool,
  /// Log file rotation: "daily", "hourly", "never"
  pub rotation: String,
}

impl Default for LogConfig {
  fn default() -> Self {
    Self {
      level: "info".to_string(),
      file: false,
      rotation: "daily".to_string(),
    }
  }
}

// ============================================================================
// Main Config
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
  #[serde(default)]
  pub engine: EngineConfig,

  #[serde(default)]
  pub queues: QueueConfig,

  #[serde(default)]
  pub timeouts: TimeoutConfig,

  #[serde(default)]
  pub ponder: PonderConfig,

  #[serde(default)]
  pub diagnostics: DiagnosticsConfig,

  #[serde(default)]
  pub log: LogConfig,
}

impl Config {
  /// Load a config file, failing if it is missing or malformed
  pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
      path: path.to_path_buf(),
      source,
    })?;
    toml::from_str(&content).map_err(|source| ConfigError::Parse {
      path: path.to_path_buf(),
      source,
    })
  }

  /// Load the explicit path if given, else the user config, else defaults.
  ///
  /// An explicit path must exist; a missing user config silently yields defaults.
  pub fn load(explicit: Option<&Path>) -> Result<Self, ConfigError> {
    if let Some(path) = explicit {
      return Self::load_from(path);
    }

    if let Some(path) = Self::user_config_path()
      && path.exists()
    {
      return Self::load_from(&path);
    }

    Ok(Self::default())
  }

  /// Get the user-level config path
  pub fn user_config_path() -> Option<PathBuf> {
    Some(dirs::default_config_dir().join("config.toml"))
  }

  /// Write the default template to `path`, creating parent directories
  pub fn write_template(path: &Path) -> Result<(), ConfigError> {
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent).map_err(|source| ConfigError::Write {
        path: path.to_path_buf(),
        source,
      })?;
    }
    std::fs::write(path, Self::generate_template()).map_err(|source| ConfigError::Write {
      path: path.to_path_buf(),
      source,
    })
  }

  /// Generate a default config file as a string
  pub fn generate_template() -> String {
    let defaults = Self::default();
    let quote = |items: &[String]| {
      items
        .iter()
        .map(|s| format!("\"{}\"", s))
        .collect::<Vec<_>>()
        .join(", ")
    };

    format!(
      r#"# kibitz configuration

[engine]
# Engine executable and its arguments
command = ""
args = []
# Full shell command line (overrides command/args when set)
# shell = "katago analysis -config analysis.cfg -model model.bin.gz"
# working_dir = "/path/to/engine"

[engine.env]

[queues]
stdout_capacity = {stdout}
stderr_capacity = {stderr}
write_capacity = {write}
# Producers wait this long on a full request queue before giving up
submit_timeout_ms = {submit}

[timeouts]
# Dispatcher poll period; also how quickly a dead engine is noticed
poll_interval_ms = {poll}
drain_timeout_ms = {drain}
sentinel_retry_ms = {sentinel}
join_timeout_ms = {join}
kill_wait_ms = {kill}
ready_timeout_ms = {ready}

[ponder]
# Fields ignored when comparing a new ponder request with the active one
exclude_fields = [{exclude}]
max_visits = {max_visits}
report_interval_secs = {report}

[diagnostics]
crash_signatures = [{signatures}]
# Substring on engine stderr that signals readiness
# ready_marker = "ready to begin handling requests"
expected_exit_codes = [{exit_codes}]

[log]
# off, error, warn, info, debug, trace
level = "{level}"
# Log to a rolling file in the data directory instead of stderr
file = {file}
# daily, hourly, never
rotation = "{rotation}"
"#,
      stdout = defaults.queues.stdout_capacity,
      stderr = defaults.queues.stderr_capacity,
      write = defaults.queues.write_capacity,
      submit = defaults.queues.submit_timeout_ms,
      poll = defaults.timeouts.poll_interval_ms,
      drain = defaults.timeouts.drain_timeout_ms,
      sentinel = defaults.timeouts.sentinel_retry_ms,
      join = defaults.timeouts.join_timeout_ms,
      kill = defaults.timeouts.kill_wait_ms,
      ready = defaults.timeouts.ready_timeout_ms,
      exclude = quote(&defaults.ponder.exclude_fields),
      max_visits = defaults.ponder.max_visits,
      report = defaults.ponder.report_interval_secs,
      signatures = quote(&defaults.diagnostics.crash_signatures),
      exit_codes = defaults
        .diagnostics
        .expected_exit_codes
        .iter()
        .map(|c| c.to_string())
        .collect::<Vec<_>>()
        .join(", "),
      level = defaults.log.level,
      file = defaults.log.file,
      rotation = defaults.log.rotation,
    )
  }
}
