use std::{
  sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
    mpsc::{Receiver, RecvTimeoutError},
  },
  time::Duration,
};

use tokio_util::sync::CancellationToken;

use super::{
  reader::PumpItem,
  sink::{Diagnostics, LogLevel, report},
  supervisor::FailureLatch,
};
use crate::error::EngineFailure;

/// Consumes the engine's stderr: logs it, watches for readiness and crashes
pub(crate) struct DiagnosticDispatcher {
  pub rx: Receiver<PumpItem>,
  pub latch: Arc<FailureLatch>,
  pub ready: Arc<AtomicBool>,
  pub cancel: CancellationToken,
  pub diag: Diagnostics,
  pub poll_interval: Duration,
  pub crash_signatures: Vec<String>,
  pub ready_marker: Option<String>,
}

/// What a single stderr line means
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum LineKind<'a> {
  Crash(&'a str),
  Ready,
  Plain,
}

impl DiagnosticDispatcher {
  pub fn run(self) {
    loop {
      if self.cancel.is_cancelled() {
        break;
      }

      match self.rx.recv_timeout(self.poll_interval) {
        Ok(PumpItem::Line(line)) => {
          if !self.handle_line(&line) {
            break;
          }
        }
        Ok(PumpItem::Eof) | Err(RecvTimeoutError::Disconnected) => break,
        Err(RecvTimeoutError::Timeout) => {}
      }
    }

    report!(self.diag, DEBUG; "diagnostic dispatcher stopped");
  }

  /// Returns false once a crash has been seen; nothing after it matters
  pub(crate) fn handle_line(&self, line: &str) -> bool {
    match classify(line, &self.crash_signatures, self.ready_marker.as_deref()) {
      LineKind::Crash(signature) => {
        report!(self.diag, ERROR, signature = signature; "engine crashed: {line}");
        if !self.cancel.is_cancelled() {
          self.latch.trip(Some(EngineFailure::Crashed {
            signature: signature.to_string(),
            line: line.to_string(),
          }));
        }
        false
      }
      LineKind::Ready => {
        self.ready.store(true, Ordering::Release);
        self.diag.engine_line(LogLevel::Info, line);
        true
      }
      LineKind::Plain => {
        self.diag.engine_line(LogLevel::Debug, line);
        true
      }
    }
  }
}

pub(crate) fn classify<'a>(line: &str, crash_signatures: &'a [String], ready_marker: Option<&str>) -> LineKind<'a> {
  if let Some(signature) = crash_signatures.iter().find(|sig| line.contains(sig.as_str())) {
    return LineKind::Crash(signature);
  }
  if ready_marker.is_some_and(|marker| line.contains(marker)) {
    return LineKind::Ready;
  }
  LineKind::Plain
}
