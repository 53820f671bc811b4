//! Config commands: show, init, path

use anyhow::{Context, Result};
use kibitz_core::Config;
use std::path::{Path, PathBuf};

fn config_path(explicit: Option<&Path>) -> Option<PathBuf> {
  explicit.map(Path::to_path_buf).or_else(Config::user_config_path)
}

/// Show the effective configuration
pub async fn cmd_config_show(explicit: Option<&Path>) -> Result<()> {
  let config = Config::load(explicit).context("failed to load configuration")?;

  match config_path(explicit) {
    Some(path) if path.exists() => println!("# Using config: {:?}", path),
    _ => println!("# Using default configuration (no config file found)"),
  }
  println!();

  let toml_str = toml::to_string_pretty(&config)?;
  println!("{}", toml_str);

  Ok(())
}

/// Write the commented config template
pub async fn cmd_config_init(explicit: Option<&Path>, force: bool) -> Result<()> {
  let Some(path) = config_path(explicit) else {
    anyhow::bail!("could not determine a config directory; pass --config");
  };

  if path.exists() && !force {
    eprintln!("Config file already exists: {:?}", path);
    eprintln!("Use --force to overwrite it");
    std::process::exit(1);
  }

  Config::write_template(&path)?;

  println!("Created config: {:?}", path);
  println!();
  println!("Set [engine] command/args (or shell) to your analysis engine.");

  Ok(())
}

/// Print where configuration and logs live
pub async fn cmd_config_path(explicit: Option<&Path>) -> Result<()> {
  match config_path(explicit) {
    Some(path) => {
      let state = if path.exists() { "exists" } else { "not created" };
      println!("config: {} ({})", path.display(), state);
    }
    None => println!("config: <none>"),
  }
  println!("log:    {}", crate::logging::log_file_path().display());
  Ok(())
}
