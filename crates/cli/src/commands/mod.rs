//! CLI command implementations

mod config;
mod query;
mod run;
mod status;

pub use config::{cmd_config_init, cmd_config_path, cmd_config_show};
pub use query::cmd_query;
pub use run::cmd_run;
pub use status::cmd_status;

use anyhow::{Context, Result};
use kibitz::Engine;

/// Run a blocking engine call off the async runtime
pub(crate) async fn blocking<T, F>(f: F) -> Result<T>
where
  F: FnOnce() -> T + Send + 'static,
  T: Send + 'static,
{
  tokio::task::spawn_blocking(f).await.context("engine task panicked")
}

/// Start the engine and wait for it to report readiness
pub(crate) async fn start_engine(engine: &Engine) -> Result<()> {
  let starter = engine.clone();
  blocking(move || starter.start())
    .await?
    .context("failed to start engine")?;

  let timeout = engine.config().timeouts.ready_timeout();
  let waiter = engine.clone();
  if !blocking(move || waiter.wait_ready(timeout)).await? {
    if !engine.is_alive() {
      anyhow::bail!("engine exited during startup");
    }
    tracing::warn!(timeout = ?timeout, "engine did not report readiness in time");
  }
  Ok(())
}

pub(crate) async fn stop_engine(engine: &Engine, drain: bool) -> Result<()> {
  let stopper = engine.clone();
  blocking(move || stopper.shutdown(drain)).await
}
