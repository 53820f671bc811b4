//! Shared configuration for the kibitz workspace.

pub mod config;
pub mod dirs;

pub use config::{
  Config, ConfigError, DiagnosticsConfig, EngineConfig, LogConfig, PonderConfig, QueueConfig, TimeoutConfig,
};
