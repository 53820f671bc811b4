//! The write pump: sole writer of the engine's stdin.
//!
//! Requests are written one at a time in the order they were enqueued. The
//! registry lock is taken only to record bookkeeping and is always released
//! before touching the pipe, since the result dispatcher needs the same lock
//! to make progress.

use std::{
  io::{self, Write},
  sync::{
    Arc, Mutex, PoisonError, TryLockError,
    atomic::Ordering,
    mpsc::Receiver,
  },
  time::{Duration, Instant},
};

use kibitz_core::PonderConfig;
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;

use super::{
  Counters,
  registry::{PonderSlot, QueryEntry, QueryRegistry},
  sink::{Diagnostics, report},
};
use crate::protocol::{
  ErrorCallback, FIELD_ID, FIELD_MAX_VISITS, FIELD_PRIORITY, FIELD_REPORT_EVERY, QueryId, QueryMetadata, SuccessCallback,
  is_termination, ponder_differs, termination_request,
};

/// Work item for the write pump
pub(crate) enum Outbound {
  Query(PendingQuery),
  Terminate { id: QueryId, target: QueryId },
  /// Sentinel pushed at shutdown so a waiting pump wakes up and exits
  Stop,
}

pub(crate) struct PendingQuery {
  pub id: Option<QueryId>,
  pub payload: Map<String, Value>,
  pub ponder: bool,
  pub on_success: SuccessCallback,
  pub on_error: Option<ErrorCallback>,
  pub metadata: QueryMetadata,
  pub submitted_at: Instant,
}

impl PendingQuery {
  fn into_entry(self, id: QueryId) -> (QueryEntry, Map<String, Value>) {
    let entry = QueryEntry {
      id,
      on_success: self.on_success,
      on_error: self.on_error,
      submitted_at: self.submitted_at,
      metadata: self.metadata,
    };
    (entry, self.payload)
  }
}

/// A pipe end shared between its writer and the supervisor that may close it
pub(crate) struct SharedPipe<W> {
  inner: Arc<Mutex<Option<W>>>,
}

impl<W> Clone for SharedPipe<W> {
  fn clone(&self) -> Self {
    Self {
      inner: Arc::clone(&self.inner),
    }
  }
}

impl<W: Write> SharedPipe<W> {
  pub fn new(writer: W) -> Self {
    Self {
      inner: Arc::new(Mutex::new(Some(writer))),
    }
  }

  /// Write one line and flush it
  pub fn write_line(&self, line: &[u8]) -> io::Result<()> {
    let mut guard = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
    let Some(writer) = guard.as_mut() else {
      return Err(io::Error::new(io::ErrorKind::BrokenPipe, "pipe closed"));
    };
    writer.write_all(line)?;
    writer.write_all(b"\n")?;
    writer.flush()
  }

  /// Drop the pipe end. Gives up after `wait` if a write is in progress.
  pub fn close(&self, wait: Duration) -> bool {
    let deadline = Instant::now() + wait;
    loop {
      match self.inner.try_lock() {
        Ok(mut guard) => {
          guard.take();
          return true;
        }
        Err(TryLockError::Poisoned(poisoned)) => {
          poisoned.into_inner().take();
          return true;
        }
        Err(TryLockError::WouldBlock) if Instant::now() < deadline => std::thread::sleep(Duration::from_millis(1)),
        Err(TryLockError::WouldBlock) => return false,
      }
    }
  }
}

pub(crate) struct WritePump<W> {
  pub rx: Receiver<Outbound>,
  pub pipe: SharedPipe<W>,
  pub registry: Arc<QueryRegistry>,
  pub ponder: PonderConfig,
  pub cancel: CancellationToken,
  pub diag: Diagnostics,
  pub counters: Arc<Counters>,
}

impl<W: Write> WritePump<W> {
  pub fn run(self) {
    report!(self.diag, DEBUG; "write pump started");

    while let Ok(item) = self.rx.recv() {
      if self.cancel.is_cancelled() {
        break;
      }

      let result = match item {
        Outbound::Stop => break,
        Outbound::Terminate { id, target } => self.write_termination(&id, &target),
        Outbound::Query(query) => {
          let result = self.handle_query(query);
          self.counters.dequeued();
          result
        }
      };

      if let Err(e) = result {
        // A dead pipe means a dead engine; recovery belongs to the supervisor
        report!(self.diag, ERROR, error = e; "write to engine failed");
        break;
      }
    }

    report!(self.diag, DEBUG; "write pump stopped");
  }

  fn handle_query(&self, query: PendingQuery) -> io::Result<()> {
    let id = query.id.clone().unwrap_or_else(|| self.registry.next_id());
    let ponder = query.ponder;
    let (entry, mut payload) = query.into_entry(id.clone());
    payload.insert(FIELD_ID.to_string(), Value::String(id.clone()));
    if !payload.contains_key(FIELD_PRIORITY) && !is_termination(&payload) {
      payload.insert(FIELD_PRIORITY.to_string(), Value::from(entry.metadata.priority));
    }

    let displaced = if ponder {
      match self.install_ponder(entry, &mut payload) {
        Some(displaced) => displaced,
        None => {
          report!(self.diag, DEBUG, id = id; "ponder request unchanged, dropped");
          return Ok(());
        }
      }
    } else {
      if !is_termination(&payload) {
        self.registry.register(entry);
      }
      None
    };

    // Bookkeeping is done; the lock is released before any I/O
    if let Some(old) = displaced {
      let term_id = self.registry.next_id();
      self.write_termination(&term_id, &old)?;
    }

    let line = serde_json::to_vec(&Value::Object(payload)).map_err(io::Error::other)?;
    self.pipe.write_line(&line)?;
    self.counters.requests_sent.fetch_add(1, Ordering::Relaxed);
    report!(self.diag, DEBUG, id = id; "sent query");
    Ok(())
  }

  /// Decide, under the registry lock, whether a ponder request replaces the
  /// active one.
  ///
  /// Returns `None` when nothing of substance changed, else `Some(old_id)` with
  /// the id (if any) of the displaced ponder query.
  fn install_ponder(&self, entry: QueryEntry, payload: &mut Map<String, Value>) -> Option<Option<QueryId>> {
    let requested = payload.clone();

    let mut state = self.registry.lock();
    if let Some(active) = &state.ponder
      && !ponder_differs(&active.requested, &requested, &self.ponder.exclude_fields)
    {
      return None;
    }

    payload.insert(FIELD_MAX_VISITS.to_string(), Value::from(self.ponder.max_visits));
    payload.insert(FIELD_REPORT_EVERY.to_string(), Value::from(self.ponder.report_interval_secs));

    let displaced = state.ponder.take().map(|slot| slot.entry.id);
    state.ponder = Some(PonderSlot { entry, requested });
    Some(displaced)
  }

  fn write_termination(&self, id: &str, target: &str) -> io::Result<()> {
    let line = serde_json::to_vec(&termination_request(id, target)).map_err(io::Error::other)?;
    self.pipe.write_line(&line)?;
    self.counters.requests_sent.fetch_add(1, Ordering::Relaxed);
    report!(self.diag, DEBUG, id = id, terminate_id = target; "sent termination");
    Ok(())
  }
}
