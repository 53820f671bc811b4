//! Turns engine stdout lines into callback invocations.
//!
//! Callbacks run on this thread, after the registry lock has been released,
//! in the order their lines were read.

use std::{
  panic::{AssertUnwindSafe, catch_unwind},
  sync::{
    Arc,
    atomic::Ordering,
    mpsc::{Receiver, RecvTimeoutError},
  },
  time::Duration,
};

use tokio_util::sync::CancellationToken;

use super::{
  Counters,
  reader::PumpItem,
  registry::QueryRegistry,
  sink::{Diagnostics, panic_message, report},
  supervisor::{FailureLatch, ProcessSlot},
};
use crate::{
  error::{EngineFailure, QueryError},
  protocol::{QueryReply, Response},
};

pub(crate) struct ResultDispatcher {
  pub rx: Receiver<PumpItem>,
  pub registry: Arc<QueryRegistry>,
  pub process: Arc<ProcessSlot>,
  pub latch: Arc<FailureLatch>,
  pub cancel: CancellationToken,
  pub diag: Diagnostics,
  pub counters: Arc<Counters>,
  pub poll_interval: Duration,
  /// How long to wait for an exit code once stdout has closed
  pub exit_wait: Duration,
  pub expected_exit_codes: Vec<i32>,
}

impl ResultDispatcher {
  pub fn run(self) {
    report!(self.diag, DEBUG; "result dispatcher started");

    loop {
      if self.cancel.is_cancelled() {
        break;
      }

      match self.rx.recv_timeout(self.poll_interval) {
        Ok(PumpItem::Line(line)) => self.handle_line(&line),
        Ok(PumpItem::Eof) | Err(RecvTimeoutError::Disconnected) => {
          self.on_output_closed();
          break;
        }
        Err(RecvTimeoutError::Timeout) => {
          let pending = self.registry.len();
          if pending > 0 && !self.process.is_alive() && !self.cancel.is_cancelled() {
            report!(self.diag, ERROR, pending = pending; "engine is gone with queries outstanding");
            self.latch.trip(Some(EngineFailure::Unresponsive { pending }));
            break;
          }
        }
      }
    }

    report!(self.diag, DEBUG; "result dispatcher stopped");
  }

  fn on_output_closed(&self) {
    if self.cancel.is_cancelled() {
      return;
    }

    match self.process.exit_status(self.exit_wait) {
      Some(status) => {
        let code = status.code();
        if code.is_some_and(|code| self.expected_exit_codes.contains(&code)) {
          report!(self.diag, INFO, status = status; "engine exited");
          self.latch.trip(None);
        } else {
          report!(self.diag, ERROR, status = status; "engine exited unexpectedly");
          self.latch.trip(Some(EngineFailure::UnexpectedExit { code }));
        }
      }
      None if self.process.is_occupied() => {
        report!(self.diag, ERROR; "engine closed its output but is still running");
        self.latch.trip(Some(EngineFailure::OutputClosed));
      }
      None => {}
    }
  }

  pub(crate) fn handle_line(&self, line: &str) {
    if line.trim().is_empty() {
      return;
    }

    let response = match Response::decode(line) {
      Ok(response) => response,
      Err(e) => {
        report!(self.diag, WARN, error = e, line = line; "skipping engine output");
        return;
      }
    };
    self.counters.responses_received.fetch_add(1, Ordering::Relaxed);

    match response {
      Response::TerminateAck { terminate_id, .. } => {
        if self.registry.remove(&terminate_id) {
          report!(self.diag, DEBUG, id = terminate_id; "query terminated");
        }
      }

      Response::Warning { id, message, field } => {
        let id = id.as_deref().unwrap_or("-");
        match field {
          Some(field) => report!(self.diag, WARN, id = id, field = field; "engine warning: {message}"),
          None => report!(self.diag, WARN, id = id; "engine warning: {message}"),
        }
      }

      Response::Error { id: None, message, .. } => {
        report!(self.diag, WARN; "engine error: {message}");
      }

      Response::Error {
        id: Some(id),
        message,
        payload,
      } => {
        let Some(resolved) = self.registry.resolve(&id, true) else {
          report!(self.diag, TRACE, id = id; "error for unknown query discarded");
          return;
        };
        if resolved.ponder {
          report!(self.diag, DEBUG, id = id; "ponder query failed, pondering stopped");
        }
        match resolved.entry.on_error {
          Some(on_error) => {
            let error = QueryError {
              id: id.clone(),
              message,
              payload,
            };
            self.invoke(&id, move || on_error(error));
          }
          None => report!(self.diag, WARN, id = id; "query failed: {message}"),
        }
      }

      Response::PartialResult { id, payload } => self.deliver(id, payload, true),
      Response::Result { id, payload } => self.deliver(id, payload, false),
    }
  }

  fn deliver(&self, id: String, payload: serde_json::Value, partial: bool) {
    let Some(resolved) = self.registry.resolve(&id, !partial) else {
      report!(self.diag, TRACE, id = id; "result for unknown query discarded");
      return;
    };
    if resolved.ponder && !partial {
      report!(self.diag, DEBUG, id = id; "ponder query finished");
    }

    let on_success = resolved.entry.on_success;
    let reply = QueryReply {
      id: id.clone(),
      payload,
      partial,
      metadata: resolved.entry.metadata,
    };
    self.invoke(&id, move || on_success(reply));
  }

  fn invoke<F: FnOnce()>(&self, id: &str, callback: F) {
    if let Err(panic) = catch_unwind(AssertUnwindSafe(callback)) {
      report!(
        self.diag,
        ERROR,
        id = id;
        "callback panicked: {}",
        panic_message(panic.as_ref())
      );
    }
  }
}
