//! `kibitz run`: stream stdin requests to the engine and replies to stdout

use anyhow::Result;
use kibitz::{Engine, Request};
use kibitz_core::Config;
use serde_json::{Value, json};
use std::time::Duration;
use tokio::{
  io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
  sync::mpsc::{UnboundedSender, unbounded_channel},
};
use tracing::{info, warn};

use super::{blocking, start_engine, stop_engine};

pub async fn cmd_run(config: Config) -> Result<()> {
  let (out_tx, mut out_rx) = unbounded_channel::<Value>();

  let failure_tx = out_tx.clone();
  let engine = Engine::builder(config)
    .on_failure(move |failure| {
      let _ = failure_tx.send(json!({"error": failure.to_string(), "fatal": true}));
    })
    .build();

  start_engine(&engine).await?;
  info!("engine ready, reading requests from stdin");

  let printer = tokio::spawn(async move {
    let mut stdout = tokio::io::stdout();
    while let Some(value) = out_rx.recv().await {
      let mut line = value.to_string();
      line.push('\n');
      stdout.write_all(line.as_bytes()).await?;
      stdout.flush().await?;
    }
    Ok::<_, std::io::Error>(())
  });

  let mut lines = BufReader::new(tokio::io::stdin()).lines();
  let ctrl_c = tokio::signal::ctrl_c();
  tokio::pin!(ctrl_c);

  let drain = loop {
    tokio::select! {
      line = lines.next_line() => match line {
        Ok(Some(line)) => {
          let engine = engine.clone();
          let out = out_tx.clone();
          blocking(move || handle_line(&engine, &line, &out)).await?;
        }
        Ok(None) => break true,
        Err(e) => {
          warn!(error = %e, "failed to read stdin");
          break true;
        }
      },
      _ = &mut ctrl_c => {
        info!("interrupted, shutting down");
        break false;
      }
    }
  };

  stop_engine(&engine, drain).await?;
  drop(engine);
  drop(out_tx);

  // Remaining senders live in callbacks the engine has already dropped
  match tokio::time::timeout(Duration::from_secs(2), printer).await {
    Ok(Ok(Err(e))) => warn!(error = %e, "failed to write output"),
    Ok(_) => {}
    Err(_) => warn!("output did not flush in time"),
  }
  Ok(())
}

/// Handle one line of input: a request, or a cancel command
fn handle_line(engine: &Engine, line: &str, out: &UnboundedSender<Value>) {
  let line = line.trim();
  if line.is_empty() {
    return;
  }

  let mut value: Value = match serde_json::from_str(line) {
    Ok(value) => value,
    Err(e) => {
      let _ = out.send(json!({"error": format!("invalid request: {e}")}));
      return;
    }
  };

  if value.get("action").and_then(Value::as_str) == Some("cancel") {
    match value.get("id").and_then(Value::as_str) {
      Some(id) => {
        if let Err(e) = engine.cancel(id, true) {
          let _ = out.send(json!({"id": id, "error": e.to_string()}));
        }
      }
      None => {
        let _ = out.send(json!({"error": "cancel needs an id"}));
      }
    }
    return;
  }

  let ponder = match value.as_object_mut() {
    Some(map) => map.remove("ponder").and_then(|v| v.as_bool()).unwrap_or(false),
    None => false,
  };

  let replies = out.clone();
  let errors = out.clone();
  let request = match Request::new(value, move |reply| {
    let _ = replies.send(reply.payload);
  }) {
    Ok(request) => request.on_error(move |error| {
      let _ = errors.send(json!({"id": error.id, "error": error.message}));
    }),
    Err(e) => {
      let _ = out.send(json!({"error": e.to_string()}));
      return;
    }
  };
  let request = if ponder { request.ponder() } else { request };

  if let Err(e) = engine.submit(request) {
    let _ = out.send(json!({"error": e.to_string()}));
  }
}
