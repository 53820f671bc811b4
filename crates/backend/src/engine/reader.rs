use std::{
  io::{BufRead, BufReader, Read},
  sync::mpsc::{SyncSender, TrySendError},
  time::Duration,
};

use tokio_util::sync::CancellationToken;

use super::sink::{Diagnostics, report};

const BACKOFF: Duration = Duration::from_millis(5);

/// Item flowing from a line pump to its dispatcher
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum PumpItem {
  Line(String),
  /// The source is exhausted; pushed exactly once when the pump exits
  Eof,
}

/// Moves lines from a blocking pipe onto a bounded queue.
///
/// This is the only place an engine output pipe is read, so nothing else in
/// the bridge ever blocks on the child.
pub(crate) struct LinePump<R> {
  pub name: &'static str,
  pub source: R,
  pub tx: SyncSender<PumpItem>,
  pub cancel: CancellationToken,
  pub diag: Diagnostics,
}

impl<R: Read> LinePump<R> {
  pub fn run(self) {
    let LinePump {
      name,
      source,
      tx,
      cancel,
      diag,
    } = self;

    let mut reader = BufReader::new(source);
    let mut buf = Vec::new();

    while !cancel.is_cancelled() {
      buf.clear();
      match reader.read_until(b'\n', &mut buf) {
        Ok(0) => break,
        Ok(_) => {
          let line = String::from_utf8_lossy(&buf).trim_end_matches(['\r', '\n']).to_string();
          if !push(&tx, PumpItem::Line(line), &cancel) {
            break;
          }
        }
        Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
        Err(e) => {
          report!(diag, DEBUG, pump = name, error = e; "pump read failed");
          break;
        }
      }
    }

    // A dispatcher that is already gone needs no end marker
    if let Err(TrySendError::Full(eof)) = tx.try_send(PumpItem::Eof)
      && !cancel.is_cancelled()
    {
      let _ = tx.send(eof);
    }
    report!(diag, DEBUG, pump = name; "pump stopped");
  }
}

/// Push onto a bounded queue, giving up only when shutdown is signalled or
/// the consumer is gone
fn push(tx: &SyncSender<PumpItem>, mut item: PumpItem, cancel: &CancellationToken) -> bool {
  loop {
    match tx.try_send(item) {
      Ok(()) => return true,
      Err(TrySendError::Disconnected(_)) => return false,
      Err(TrySendError::Full(back)) => {
        if cancel.is_cancelled() {
          return false;
        }
        item = back;
        std::thread::sleep(BACKOFF);
      }
    }
  }
}
