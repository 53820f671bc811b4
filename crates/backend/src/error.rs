//! Error types for the engine bridge.
//!
//! `EngineError` is returned from fallible operations. `EngineFailure` is never
//! returned: it describes a dead or broken engine and is delivered once per
//! generation through the recovery hook.

use thiserror::Error;

use crate::protocol::QueryId;

#[derive(Debug, Error)]
pub enum EngineError {
  #[error("failed to launch engine `{command}`: {source}")]
  Launch {
    command: String,
    #[source]
    source: std::io::Error,
  },

  #[error("engine is not running")]
  NotRunning,

  #[error("engine is already running")]
  AlreadyRunning,

  #[error("request queue is full")]
  QueueFull,

  #[error("invalid request: {0}")]
  InvalidRequest(String),

  #[error("configuration error: {0}")]
  Config(String),

  #[error("serialization error: {0}")]
  Serialize(#[from] serde_json::Error),

  #[error("io error: {0}")]
  Io(#[from] std::io::Error),
}

/// A terminal engine failure, surfaced through the recovery hook
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EngineFailure {
  #[error("engine crashed ({signature}): {line}")]
  Crashed { signature: String, line: String },

  #[error("engine exited unexpectedly with {}", describe_exit(*code))]
  UnexpectedExit { code: Option<i32> },

  #[error("engine stopped responding with {pending} queries outstanding")]
  Unresponsive { pending: usize },

  #[error("engine closed its output stream while still running")]
  OutputClosed,
}

fn describe_exit(code: Option<i32>) -> String {
  match code {
    Some(code) => format!("exit code {code}"),
    None => "no exit code (terminated by signal)".to_string(),
  }
}

/// Error handed to a query's error callback
#[derive(Debug, Clone, PartialEq, Error)]
#[error("query {id} failed: {message}")]
pub struct QueryError {
  pub id: QueryId,
  pub message: String,
  /// The full response object
  pub payload: serde_json::Value,
}
