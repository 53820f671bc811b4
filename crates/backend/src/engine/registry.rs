//! Outstanding query bookkeeping.
//!
//! One mutex guards both the id -> entry map and the single ponder slot. No
//! I/O and no callback ever runs while it is held: lookups hand back cheap
//! clones (callbacks are `Arc`s) for the caller to invoke after unlocking.

use std::{
  collections::HashMap,
  sync::{
    Mutex, MutexGuard, PoisonError,
    atomic::{AtomicU64, Ordering},
  },
  time::{Duration, Instant},
};

use serde_json::{Map, Value};

use crate::protocol::{ErrorCallback, QueryId, QueryMetadata, SuccessCallback};

/// An outstanding query
#[derive(Clone)]
pub struct QueryEntry {
  pub id: QueryId,
  pub on_success: SuccessCallback,
  pub on_error: Option<ErrorCallback>,
  pub submitted_at: Instant,
  pub metadata: QueryMetadata,
}

impl std::fmt::Debug for QueryEntry {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("QueryEntry")
      .field("id", &self.id)
      .field("submitted_at", &self.submitted_at)
      .field("metadata", &self.metadata)
      .finish_non_exhaustive()
  }
}

/// The active continuous query
pub(crate) struct PonderSlot {
  pub entry: QueryEntry,
  /// Payload as requested, before the ponder budget was stamped on it
  pub requested: Map<String, Value>,
}

#[derive(Default)]
pub(crate) struct RegistryState {
  pub entries: HashMap<QueryId, QueryEntry>,
  pub ponder: Option<PonderSlot>,
}

/// Result of a lookup
#[derive(Debug, Clone)]
pub struct Resolved {
  pub entry: QueryEntry,
  pub ponder: bool,
}

#[derive(Default)]
pub struct QueryRegistry {
  state: Mutex<RegistryState>,
  next_id: AtomicU64,
}

impl QueryRegistry {
  pub fn new() -> Self {
    Self::default()
  }

  pub(crate) fn lock(&self) -> MutexGuard<'_, RegistryState> {
    self.state.lock().unwrap_or_else(PoisonError::into_inner)
  }

  /// Next generated correlation id
  pub fn next_id(&self) -> QueryId {
    let n = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
    format!("kb{n}")
  }

  /// Insert an entry, replacing any previous entry with the same id
  pub fn register(&self, entry: QueryEntry) -> bool {
    self.lock().entries.insert(entry.id.clone(), entry).is_some()
  }

  /// Look up `id`, removing it when `terminal`.
  ///
  /// Lookup and removal happen under one lock so that exactly one caller
  /// ever owns the terminal handling of an id. A terminal response for the
  /// ponder query empties the ponder slot.
  pub fn resolve(&self, id: &str, terminal: bool) -> Option<Resolved> {
    let mut state = self.lock();

    if state.ponder.as_ref().is_some_and(|slot| slot.entry.id == id) {
      let entry = if terminal {
        state.ponder.take().map(|slot| slot.entry)
      } else {
        state.ponder.as_ref().map(|slot| slot.entry.clone())
      };
      return entry.map(|entry| Resolved { entry, ponder: true });
    }

    let entry = if terminal {
      state.entries.remove(id)
    } else {
      state.entries.get(id).cloned()
    };

    entry.map(|entry| Resolved { entry, ponder: false })
  }

  /// Forget `id`, including the ponder slot if it holds `id`
  pub fn remove(&self, id: &str) -> bool {
    let mut state = self.lock();
    let removed = state.entries.remove(id).is_some();
    let was_ponder = state.ponder.as_ref().is_some_and(|slot| slot.entry.id == id);
    if was_ponder {
      state.ponder = None;
    }
    removed || was_ponder
  }

  pub fn contains(&self, id: &str) -> bool {
    let state = self.lock();
    state.entries.contains_key(id) || state.ponder.as_ref().is_some_and(|slot| slot.entry.id == id)
  }

  /// Number of outstanding one-shot queries (the ponder query is not counted)
  pub fn len(&self) -> usize {
    self.lock().entries.len()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  pub fn ponder_id(&self) -> Option<QueryId> {
    self.lock().ponder.as_ref().map(|slot| slot.entry.id.clone())
  }

  /// Ids whose metadata matches `filter`, ponder included, from a snapshot
  pub fn matching<F>(&self, filter: F) -> Vec<QueryId>
  where
    F: Fn(&QueryMetadata) -> bool,
  {
    let state = self.lock();
    let mut ids: Vec<QueryId> = state
      .entries
      .values()
      .filter(|entry| filter(&entry.metadata))
      .map(|entry| entry.id.clone())
      .collect();
    if let Some(slot) = &state.ponder
      && filter(&slot.entry.metadata)
    {
      ids.push(slot.entry.id.clone());
    }
    ids
  }

  /// Age of the oldest outstanding one-shot query
  pub fn oldest_pending(&self) -> Option<Duration> {
    self
      .lock()
      .entries
      .values()
      .map(|entry| entry.submitted_at.elapsed())
      .max()
  }

  /// Drop every entry and the ponder slot, returning how many were dropped
  pub fn clear(&self) -> usize {
    let mut state = self.lock();
    let count = state.entries.len() + usize::from(state.ponder.is_some());
    state.entries.clear();
    state.ponder = None;
    count
  }
}
