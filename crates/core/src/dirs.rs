//! Default directory locations

use std::path::PathBuf;

/// Get the default config directory
///
/// Respects the following environment variables (in order of precedence):
/// 1. KIBITZ_CONFIG_DIR - explicit config directory override
/// 2. XDG_CONFIG_HOME - standard XDG config home directory
/// 3. dirs::config_dir() - platform default
pub fn default_config_dir() -> PathBuf {
  if let Ok(dir) = std::env::var("KIBITZ_CONFIG_DIR") {
    return PathBuf::from(dir);
  }

  if let Ok(xdg_config) = std::env::var("XDG_CONFIG_HOME") {
    return PathBuf::from(xdg_config).join("kibitz");
  }

  ::dirs::config_dir().unwrap_or_else(|| PathBuf::from(".")).join("kibitz")
}

/// Get the default data directory (log files)
///
/// Respects the following environment variables (in order of precedence):
/// 1. KIBITZ_DATA_DIR - explicit data directory override
/// 2. XDG_DATA_HOME - standard XDG data home directory
/// 3. dirs::data_local_dir() - platform default
pub fn default_data_dir() -> PathBuf {
  if let Ok(dir) = std::env::var("KIBITZ_DATA_DIR") {
    return PathBuf::from(dir);
  }

  if let Ok(xdg_data) = std::env::var("XDG_DATA_HOME") {
    return PathBuf::from(xdg_data).join("kibitz");
  }

  ::dirs::data_local_dir()
    .unwrap_or_else(|| PathBuf::from("."))
    .join("kibitz")
}
