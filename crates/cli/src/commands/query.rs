//! `kibitz query`: submit one request and print its results

use anyhow::{Context, Result, bail};
use kibitz::{Engine, Request};
use kibitz_core::Config;
use serde_json::Value;
use std::time::Duration;
use tokio::{io::AsyncReadExt, sync::mpsc::unbounded_channel, time::Instant};

use super::{blocking, start_engine, stop_engine};

enum Event {
  Reply { payload: Value, partial: bool },
  Failed(String),
}

async fn read_input(input: &str) -> Result<String> {
  if input == "-" {
    let mut text = String::new();
    tokio::io::stdin()
      .read_to_string(&mut text)
      .await
      .context("failed to read request from stdin")?;
    Ok(text)
  } else {
    tokio::fs::read_to_string(input)
      .await
      .with_context(|| format!("failed to read request from {input}"))
  }
}

pub async fn cmd_query(config: Config, input: &str, timeout_secs: u64) -> Result<()> {
  let text = read_input(input).await?;
  let payload: Value = serde_json::from_str(&text).context("request is not valid JSON")?;

  let (tx, mut rx) = unbounded_channel::<Event>();

  let failure_tx = tx.clone();
  let engine = Engine::builder(config)
    .on_failure(move |failure| {
      let _ = failure_tx.send(Event::Failed(failure.to_string()));
    })
    .build();

  let replies = tx.clone();
  let errors = tx;
  let request = Request::new(payload, move |reply| {
    let _ = replies.send(Event::Reply {
      payload: reply.payload,
      partial: reply.partial,
    });
  })?
  .on_error(move |error| {
    let _ = errors.send(Event::Failed(error.to_string()));
  });

  start_engine(&engine).await?;

  let submitter = engine.clone();
  let id = blocking(move || submitter.submit(request)).await??;
  tracing::debug!(id = %id, "submitted query");

  let deadline = Instant::now() + Duration::from_secs(timeout_secs);
  let outcome = loop {
    match tokio::time::timeout_at(deadline, rx.recv()).await {
      Ok(Some(Event::Reply { payload, partial })) => {
        println!("{}", payload);
        if !partial {
          break Ok(());
        }
      }
      Ok(Some(Event::Failed(message))) => break Err(anyhow::anyhow!(message)),
      Ok(None) => break Err(anyhow::anyhow!("engine stopped before answering")),
      Err(_) => break Err(anyhow::anyhow!("no result for {id} within {timeout_secs}s")),
    }
  };

  stop_engine(&engine, false).await?;

  if let Err(e) = outcome {
    bail!("query failed: {e}");
  }
  Ok(())
}
