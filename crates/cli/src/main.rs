//! kibitz CLI - drive an external analysis engine over line-delimited JSON

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use kibitz_core::Config;
use std::path::PathBuf;

mod commands;
mod logging;

use commands::{cmd_config_init, cmd_config_path, cmd_config_show, cmd_query, cmd_run, cmd_status};
use logging::init_logging;

#[derive(Parser)]
#[command(name = "kibitz")]
#[command(about = "Run an analysis engine behind a line-delimited JSON bridge")]
#[command(after_help = "\
QUICK START:
  kibitz config init              # Write a config template
  kibitz status                   # Start the engine and report its state
  kibitz run < requests.jsonl     # Stream requests, print replies

REQUESTS:
  One JSON object per line. Add \"ponder\": true for the continuous query,
  or send {\"action\": \"cancel\", \"id\": \"...\"} to cancel one.")]
struct Cli {
  /// Config file (default: user config directory)
  #[arg(long, global = true, value_name = "PATH")]
  config: Option<PathBuf>,

  #[command(subcommand)]
  command: Commands,
}

/// Subcommands for `kibitz config`
#[derive(Subcommand)]
pub enum ConfigCommand {
  /// Show the effective configuration
  Show,
  /// Write a commented config template
  Init {
    /// Overwrite an existing file
    #[arg(long)]
    force: bool,
  },
  /// Print where the config file is read from
  Path,
}

#[derive(Subcommand)]
enum Commands {
  /// Start the engine and bridge stdin requests to stdout replies
  Run,
  /// Submit a single request and print its results
  Query {
    /// Request file, or `-` for stdin
    #[arg(value_name = "FILE")]
    input: String,
    /// Give up after this many seconds
    #[arg(long, default_value = "60")]
    timeout_secs: u64,
  },
  /// Manage configuration
  Config {
    #[command(subcommand)]
    command: ConfigCommand,
  },
  /// Start the engine, print a status snapshot, and stop it
  Status,
}

#[tokio::main]
async fn main() -> Result<()> {
  let cli = Cli::parse();

  if let Commands::Config { command } = &cli.command {
    return match command {
      ConfigCommand::Show => cmd_config_show(cli.config.as_deref()).await,
      ConfigCommand::Init { force } => cmd_config_init(cli.config.as_deref(), *force).await,
      ConfigCommand::Path => cmd_config_path(cli.config.as_deref()).await,
    };
  }

  let config = Config::load(cli.config.as_deref()).context("failed to load configuration")?;
  let _guard = init_logging(&config.log);

  match cli.command {
    Commands::Run => cmd_run(config).await,
    Commands::Query { input, timeout_secs } => cmd_query(config, &input, timeout_secs).await,
    Commands::Status => cmd_status(config).await,
    Commands::Config { .. } => Ok(()),
  }
}
