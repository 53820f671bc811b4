//! `kibitz status`: start the engine, report, stop

use anyhow::Result;
use kibitz::Engine;
use kibitz_core::Config;

use super::{start_engine, stop_engine};

pub async fn cmd_status(config: Config) -> Result<()> {
  let engine = Engine::new(config);
  println!("engine: {}", engine.config().engine.display_command());

  start_engine(&engine).await?;
  let status = engine.status();
  println!("{}", serde_json::to_string_pretty(&status)?);

  stop_engine(&engine, false).await?;
  Ok(())
}
