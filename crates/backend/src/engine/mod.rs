//! The engine bridge.
//!
//! An [`Engine`] owns one external analysis process at a time and five
//! threads per process generation:
//!
//! ```text
//! submit ──► write queue ──► kibitz-writer ──► stdin
//!                                              │
//!                      kibitz-stdout ◄── stdout ┤
//!                           │                  │
//!                      kibitz-results          │
//!                           │ callbacks         │
//!                      kibitz-stderr ◄── stderr ┘
//!                           │
//!                      kibitz-diagnostics ──► log sink
//! ```
//!
//! Only the two line pumps and the writer ever block on the child; the
//! dispatchers poll with a timeout so they always notice shutdown.

mod diagnostics;
mod dispatcher;
mod reader;
mod registry;
mod sink;
mod supervisor;
mod writer;


use std::{
  io,
  panic::{AssertUnwindSafe, catch_unwind},
  process::ChildStdin,
  sync::{
    Arc, Mutex, MutexGuard, PoisonError, Weak,
    atomic::{AtomicBool, AtomicI64, AtomicU64, AtomicUsize, Ordering},
    mpsc::{SyncSender, TrySendError, sync_channel},
  },
  thread::{self, JoinHandle},
  time::{Duration, Instant},
};

use kibitz_core::Config;
use serde::Serialize;
use tokio_util::sync::CancellationToken;

pub use registry::{QueryEntry, QueryRegistry, Resolved};
pub use sink::{LogLevel, LogSink};
pub use supervisor::RecoveryHook;

use self::{
  diagnostics::DiagnosticDispatcher,
  dispatcher::ResultDispatcher,
  reader::LinePump,
  sink::{Diagnostics, panic_message, report},
  supervisor::{FailureLatch, ProcessSlot, join_bounded},
  writer::{Outbound, PendingQuery, SharedPipe, WritePump},
};
use crate::{
  error::{EngineError, EngineFailure},
  protocol::{QueryId, QueryMetadata, Request},
};

const ENQUEUE_BACKOFF: Duration = Duration::from_millis(2);

/// Traffic counters shared with the pump threads
#[derive(Debug, Default)]
pub(crate) struct Counters {
  pub requests_sent: AtomicU64,
  pub responses_received: AtomicU64,
  /// Queries accepted by `submit` that the writer has not handled yet
  pub queued: AtomicUsize,
}

impl Counters {
  pub fn dequeued(&self) {
    let _ = self
      .queued
      .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
  }
}

/// Point-in-time view of an engine
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EngineStatus {
  pub alive: bool,
  pub ready: bool,
  pub pending: usize,
  pub ponder_id: Option<QueryId>,
  pub base_priority: i64,
  #[serde(rename = "oldest_pending_ms", serialize_with = "serialize_millis")]
  pub oldest_pending: Option<Duration>,
  pub requests_sent: u64,
  pub responses_received: u64,
  pub restarts: u64,
}

fn serialize_millis<S: serde::Serializer>(value: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error> {
  match value {
    Some(duration) => serializer.serialize_some(&(duration.as_millis() as u64)),
    None => serializer.serialize_none(),
  }
}

// ============================================================================
// Builder
// ============================================================================

pub struct EngineBuilder {
  config: Config,
  log_sink: Option<LogSink>,
  on_failure: Option<RecoveryHook>,
}

impl EngineBuilder {
  /// Route every diagnostic message to `sink` in addition to `tracing`
  pub fn log_sink<F>(mut self, sink: F) -> Self
  where
    F: Fn(LogLevel, &str) + Send + Sync + 'static,
  {
    self.log_sink = Some(Arc::new(sink));
    self
  }

  /// Called once per process generation when the engine crashes, exits
  /// unexpectedly, or stops responding. The engine is already shut down by
  /// the time the hook runs; calling [`Engine::start`] from it is allowed.
  pub fn on_failure<F>(mut self, hook: F) -> Self
  where
    F: Fn(EngineFailure) + Send + Sync + 'static,
  {
    self.on_failure = Some(Arc::new(hook));
    self
  }

  pub fn build(self) -> Engine {
    let inner = Arc::new_cyclic(|this| EngineInner {
      diag: Diagnostics::new(self.log_sink),
      config: self.config,
      on_failure: self.on_failure,
      registry: Arc::new(QueryRegistry::new()),
      process: Arc::new(ProcessSlot::default()),
      runtime: Mutex::new(None),
      lifecycle: Mutex::new(()),
      ready: Arc::new(AtomicBool::new(false)),
      counters: Arc::new(Counters::default()),
      base_priority: AtomicI64::new(0),
      generation: AtomicU64::new(0),
      restarts: AtomicU64::new(0),
      this: this.clone(),
    });
    Engine { inner }
  }
}

// ============================================================================
// Engine
// ============================================================================

/// Handle to an engine bridge. Clones share the same engine; the process is
/// shut down when the last handle is dropped.
#[derive(Clone)]
pub struct Engine {
  inner: Arc<EngineInner>,
}

impl Engine {
  pub fn new(config: Config) -> Self {
    Self::builder(config).build()
  }

  pub fn builder(config: Config) -> EngineBuilder {
    EngineBuilder {
      config,
      log_sink: None,
      on_failure: None,
    }
  }

  pub fn config(&self) -> &Config {
    &self.inner.config
  }

  /// Spawn the engine process and its threads
  pub fn start(&self) -> Result<(), EngineError> {
    let _lifecycle = self.inner.lifecycle();
    self.inner.start_locked()
  }

  /// Tear the engine down. Always returns in bounded time.
  pub fn shutdown(&self, drain: bool) {
    let _lifecycle = self.inner.lifecycle();
    self.inner.shutdown_locked(drain);
  }

  /// Drop every outstanding query, then stop and start the engine
  pub fn restart(&self) -> Result<(), EngineError> {
    let _lifecycle = self.inner.lifecycle();
    let dropped = self.inner.registry.clear();
    report!(self.inner.diag, INFO, dropped = dropped; "restarting engine");
    self.inner.shutdown_locked(false);
    self.inner.restarts.fetch_add(1, Ordering::Relaxed);
    self.inner.start_locked()
  }

  pub fn is_alive(&self) -> bool {
    self.inner.process.is_alive()
  }

  /// Queries submitted and not yet finished, the ponder query excluded
  pub fn pending_count(&self) -> usize {
    self.inner.registry.len() + self.inner.counters.queued.load(Ordering::Acquire)
  }

  pub fn ponder_id(&self) -> Option<QueryId> {
    self.inner.registry.ponder_id()
  }

  /// OS process id of the running engine
  pub fn pid(&self) -> Option<u32> {
    self.inner.process.pid()
  }

  /// Queue a request for the engine, returning its correlation id.
  ///
  /// Waits up to `queues.submit_timeout_ms` for room in the write queue.
  pub fn submit(&self, request: Request) -> Result<QueryId, EngineError> {
    let inner = &self.inner;
    let tx = inner.write_sender()?;

    let Request {
      id,
      payload,
      ponder,
      priority,
      mut metadata,
      on_success,
      on_error,
    } = request;

    let id = id.unwrap_or_else(|| inner.registry.next_id());
    let generation = inner.base_priority.load(Ordering::Acquire);
    metadata.generation = generation;
    metadata.priority = generation + priority;

    let query = PendingQuery {
      id: Some(id.clone()),
      payload,
      ponder,
      on_success,
      on_error,
      metadata,
      submitted_at: Instant::now(),
    };

    inner.counters.queued.fetch_add(1, Ordering::AcqRel);
    if let Err(e) = inner.enqueue(&tx, Outbound::Query(query)) {
      inner.counters.dequeued();
      return Err(e);
    }
    report!(inner.diag, TRACE, id = id; "queued query");
    Ok(id)
  }

  /// Ask the engine to stop working on `id`.
  ///
  /// With `forget`, the entry is dropped at once and no further results are
  /// delivered; otherwise it stays until the engine acknowledges.
  pub fn cancel(&self, id: &str, forget: bool) -> Result<(), EngineError> {
    self.inner.cancel(id, forget)
  }

  /// Terminate and forget every query whose metadata matches `filter`
  pub fn cancel_all<F>(&self, filter: F) -> usize
  where
    F: Fn(&QueryMetadata) -> bool,
  {
    let ids = self.inner.registry.matching(filter);
    for id in &ids {
      if let Err(e) = self.inner.cancel(id, true) {
        report!(self.inner.diag, WARN, id = id, error = e; "could not terminate query");
      }
    }
    ids.len()
  }

  pub fn cancel_all_for_node(&self, node: &str) -> usize {
    self.cancel_all(|meta| meta.node.as_deref() == Some(node))
  }

  /// Terminate and forget the active ponder query, if any
  pub fn stop_pondering(&self) -> Result<bool, EngineError> {
    match self.inner.registry.ponder_id() {
      Some(id) => self.inner.cancel(&id, true).map(|_| true),
      None => Ok(false),
    }
  }

  /// Start a new session; results from earlier sessions stop being current
  pub fn bump_base_priority(&self) -> i64 {
    self.inner.base_priority.fetch_add(1, Ordering::AcqRel) + 1
  }

  pub fn base_priority(&self) -> i64 {
    self.inner.base_priority.load(Ordering::Acquire)
  }

  /// Whether a result belongs to the current session
  pub fn is_current(&self, metadata: &QueryMetadata) -> bool {
    metadata.generation == self.base_priority()
  }

  /// Wait until the engine reports readiness, it dies, or `timeout` passes
  pub fn wait_ready(&self, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
      if self.inner.ready.load(Ordering::Acquire) {
        return self.is_alive();
      }
      if Instant::now() >= deadline || !self.inner.process.is_occupied() {
        return false;
      }
      thread::sleep(Duration::from_millis(10));
    }
  }

  pub fn status(&self) -> EngineStatus {
    let inner = &self.inner;
    EngineStatus {
      alive: inner.process.is_alive(),
      ready: inner.ready.load(Ordering::Acquire),
      pending: self.pending_count(),
      ponder_id: inner.registry.ponder_id(),
      base_priority: self.base_priority(),
      oldest_pending: inner.registry.oldest_pending(),
      requests_sent: inner.counters.requests_sent.load(Ordering::Relaxed),
      responses_received: inner.counters.responses_received.load(Ordering::Relaxed),
      restarts: inner.restarts.load(Ordering::Relaxed),
    }
  }
}

// ============================================================================
// Internals
// ============================================================================

/// Everything belonging to one process generation
struct Runtime {
  generation: u64,
  write_tx: SyncSender<Outbound>,
  cancel: CancellationToken,
  stdin: SharedPipe<ChildStdin>,
  latch: Arc<FailureLatch>,
  threads: Vec<JoinHandle<()>>,
}

struct EngineInner {
  config: Config,
  diag: Diagnostics,
  on_failure: Option<RecoveryHook>,
  registry: Arc<QueryRegistry>,
  process: Arc<ProcessSlot>,
  runtime: Mutex<Option<Runtime>>,
  /// Serializes start, shutdown and restart
  lifecycle: Mutex<()>,
  ready: Arc<AtomicBool>,
  counters: Arc<Counters>,
  base_priority: AtomicI64,
  generation: AtomicU64,
  restarts: AtomicU64,
  this: Weak<EngineInner>,
}

impl EngineInner {
  fn lifecycle(&self) -> MutexGuard<'_, ()> {
    self.lifecycle.lock().unwrap_or_else(PoisonError::into_inner)
  }

  fn runtime(&self) -> MutexGuard<'_, Option<Runtime>> {
    self.runtime.lock().unwrap_or_else(PoisonError::into_inner)
  }

  fn write_sender(&self) -> Result<SyncSender<Outbound>, EngineError> {
    self
      .runtime()
      .as_ref()
      .map(|runtime| runtime.write_tx.clone())
      .ok_or(EngineError::NotRunning)
  }

  fn enqueue(&self, tx: &SyncSender<Outbound>, mut item: Outbound) -> Result<(), EngineError> {
    let deadline = Instant::now() + self.config.queues.submit_timeout();
    loop {
      match tx.try_send(item) {
        Ok(()) => return Ok(()),
        Err(TrySendError::Disconnected(_)) => return Err(EngineError::NotRunning),
        Err(TrySendError::Full(back)) => {
          if Instant::now() >= deadline {
            return Err(EngineError::QueueFull);
          }
          item = back;
          thread::sleep(ENQUEUE_BACKOFF);
        }
      }
    }
  }

  fn cancel(&self, id: &str, forget: bool) -> Result<(), EngineError> {
    if forget {
      self.registry.remove(id);
    }
    let tx = match self.write_sender() {
      Ok(tx) => tx,
      // Nothing is running, so nothing is left to terminate
      Err(EngineError::NotRunning) => return Ok(()),
      Err(e) => return Err(e),
    };
    let terminate = Outbound::Terminate {
      id: self.registry.next_id(),
      target: id.to_string(),
    };
    self.enqueue(&tx, terminate)
  }

  fn start_locked(&self) -> Result<(), EngineError> {
    if self.runtime().is_some() {
      return Err(EngineError::AlreadyRunning);
    }
    if !self.config.engine.is_configured() {
      return Err(EngineError::Config("no engine command configured".to_string()));
    }

    let spawned = supervisor::spawn(&self.config.engine)
      .inspect_err(|e| report!(self.diag, ERROR, error = e; "failed to launch engine"))?;
    let pid = spawned.child.id();

    let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
    let cancel = CancellationToken::new();
    let queues = &self.config.queues;
    let timeouts = &self.config.timeouts;
    let (stdout_tx, stdout_rx) = sync_channel(queues.stdout_capacity);
    let (stderr_tx, stderr_rx) = sync_channel(queues.stderr_capacity);
    let (write_tx, write_rx) = sync_channel(queues.write_capacity);

    self.ready.store(self.config.diagnostics.ready_marker.is_none(), Ordering::Release);
    self.process.install(spawned.child);

    let latch = Arc::new(FailureLatch::new(self.recovery_trigger(generation)));
    let stdin = SharedPipe::new(spawned.stdin);

    let mut runtime = Runtime {
      generation,
      write_tx,
      cancel: cancel.clone(),
      stdin: stdin.clone(),
      latch: Arc::clone(&latch),
      threads: Vec::with_capacity(5),
    };

    let stdout_pump = LinePump {
      name: "stdout",
      source: spawned.stdout,
      tx: stdout_tx,
      cancel: cancel.clone(),
      diag: self.diag.clone(),
    };
    let stderr_pump = LinePump {
      name: "stderr",
      source: spawned.stderr,
      tx: stderr_tx,
      cancel: cancel.clone(),
      diag: self.diag.clone(),
    };
    let results = ResultDispatcher {
      rx: stdout_rx,
      registry: Arc::clone(&self.registry),
      process: Arc::clone(&self.process),
      latch: Arc::clone(&latch),
      cancel: cancel.clone(),
      diag: self.diag.clone(),
      counters: Arc::clone(&self.counters),
      poll_interval: timeouts.poll_interval(),
      exit_wait: timeouts.kill_wait(),
      expected_exit_codes: self.config.diagnostics.expected_exit_codes.clone(),
    };
    let diagnostics = DiagnosticDispatcher {
      rx: stderr_rx,
      latch: Arc::clone(&latch),
      ready: Arc::clone(&self.ready),
      cancel: cancel.clone(),
      diag: self.diag.clone(),
      poll_interval: timeouts.poll_interval(),
      crash_signatures: self.config.diagnostics.crash_signatures.clone(),
      ready_marker: self.config.diagnostics.ready_marker.clone(),
    };
    let writer = WritePump {
      rx: write_rx,
      pipe: stdin,
      registry: Arc::clone(&self.registry),
      ponder: self.config.ponder.clone(),
      cancel,
      diag: self.diag.clone(),
      counters: Arc::clone(&self.counters),
    };

    let spawned_threads = (|| -> io::Result<()> {
      runtime.threads.push(spawn_thread("kibitz-stdout", move || stdout_pump.run())?);
      runtime.threads.push(spawn_thread("kibitz-stderr", move || stderr_pump.run())?);
      runtime.threads.push(spawn_thread("kibitz-results", move || results.run())?);
      runtime.threads.push(spawn_thread("kibitz-diagnostics", move || diagnostics.run())?);
      runtime.threads.push(spawn_thread("kibitz-writer", move || writer.run())?);
      Ok(())
    })();

    *self.runtime() = Some(runtime);

    if let Err(e) = spawned_threads {
      report!(self.diag, ERROR, error = e; "failed to start engine threads");
      self.shutdown_locked(false);
      return Err(EngineError::Io(e));
    }

    report!(
      self.diag,
      INFO,
      command = self.config.engine.display_command(),
      pid = pid,
      generation = generation;
      "engine started"
    );
    Ok(())
  }

  /// The latch callback: hands the failure to a dedicated thread, since the
  /// thread that noticed it is one of the threads shutdown has to join
  fn recovery_trigger(&self, generation: u64) -> impl Fn(Option<EngineFailure>) + Send + Sync + 'static {
    let this = self.this.clone();
    let diag = self.diag.clone();
    move |failure| {
      let this = this.clone();
      let spawned = spawn_thread("kibitz-recovery", move || {
        let Some(inner) = this.upgrade() else {
          return;
        };
        inner.shutdown_generation(generation);
        if let Some(failure) = failure {
          inner.report(failure);
        }
      });
      if let Err(e) = spawned {
        report!(diag, ERROR, error = e; "failed to start recovery thread");
      }
    }
  }

  fn shutdown_generation(&self, generation: u64) {
    let _lifecycle = self.lifecycle();
    let current = self.runtime().as_ref().map(|runtime| runtime.generation);
    if current == Some(generation) {
      self.shutdown_locked(false);
    }
  }

  fn report(&self, failure: EngineFailure) {
    report!(self.diag, ERROR, failure = failure; "engine failure");
    let Some(hook) = &self.on_failure else {
      return;
    };
    if let Err(panic) = catch_unwind(AssertUnwindSafe(|| hook(failure))) {
      report!(self.diag, ERROR; "failure hook panicked: {}", panic_message(panic.as_ref()));
    }
  }

  fn shutdown_locked(&self, drain: bool) {
    // Taking the runtime first makes new submissions fail with NotRunning
    let Some(runtime) = self.runtime().take() else {
      self.registry.clear();
      self.counters.queued.store(0, Ordering::Release);
      self.ready.store(false, Ordering::Release);
      return;
    };

    let Runtime {
      generation,
      write_tx,
      cancel,
      stdin,
      latch,
      threads,
    } = runtime;
    latch.disarm();

    let timeouts = &self.config.timeouts;
    report!(self.diag, INFO, generation = generation, drain = drain; "shutting down engine");

    self.step("drain", || {
      if drain {
        self.drain(timeouts.drain_timeout());
      }
      Ok(())
    });

    self.step("signal", || {
      cancel.cancel();
      Ok(())
    });

    self.step("sentinel", || {
      match write_tx.try_send(Outbound::Stop) {
        Ok(()) | Err(TrySendError::Disconnected(_)) => {}
        Err(TrySendError::Full(stop)) => {
          thread::sleep(timeouts.sentinel_retry());
          if write_tx.try_send(stop).is_err() {
            report!(self.diag, WARN; "write queue still full, sentinel dropped");
          }
        }
      }
      drop(write_tx);
      Ok(())
    });

    self.step("terminate", || self.process.terminate());

    // Only stdin can be closed here. The stdout/stderr read ends belong to
    // pump threads blocked in `read`, and closing a descriptor does not wake a
    // reader on Linux. Those pumps see end of stream once the process group
    // exits: at step 4 normally, otherwise at the step 7 kill, after the step 6
    // join has timed out and detached them.
    self.step("close pipes", || {
      if !stdin.close(timeouts.join_timeout()) {
        report!(self.diag, WARN; "engine stdin is busy, leaving it to the kill");
      }
      Ok(())
    });

    self.step("join", || {
      for handle in threads {
        join_bounded(handle, timeouts.join_timeout(), &self.diag);
      }
      Ok(())
    });

    self.step("kill", || {
      if self.process.is_alive() {
        report!(self.diag, WARN; "engine ignored termination, killing it");
        self.process.kill()?;
      }
      match self.process.exit_status(timeouts.kill_wait()) {
        Some(status) => report!(self.diag, DEBUG, status = status; "engine exited"),
        None if self.process.is_occupied() => report!(self.diag, WARN; "engine exit status unavailable after kill"),
        None => {}
      }
      Ok(())
    });

    self.step("clear registry", || {
      let dropped = self.registry.clear();
      if dropped > 0 {
        report!(self.diag, DEBUG, dropped = dropped; "dropped outstanding queries");
      }
      self.counters.queued.store(0, Ordering::Release);
      Ok(())
    });

    // Last, so a concurrent liveness check never sees a half-torn-down engine
    self.ready.store(false, Ordering::Release);
    self.process.clear();
    report!(self.diag, INFO, generation = generation; "engine stopped");
  }

  fn drain(&self, timeout: Duration) {
    let deadline = Instant::now() + timeout;
    loop {
      let pending = self.registry.len() + self.counters.queued.load(Ordering::Acquire);
      if pending == 0 {
        return;
      }
      if !self.process.is_alive() {
        report!(self.diag, WARN, pending = pending; "engine died with queries outstanding");
        return;
      }
      if Instant::now() >= deadline {
        report!(self.diag, WARN, pending = pending; "gave up draining");
        return;
      }
      thread::sleep(Duration::from_millis(10));
    }
  }

  /// Run one shutdown step; nothing it does can stop the steps after it
  fn step<F>(&self, name: &str, f: F)
  where
    F: FnOnce() -> io::Result<()>,
  {
    match catch_unwind(AssertUnwindSafe(f)) {
      Ok(Ok(())) => report!(self.diag, DEBUG, step = name; "shutdown step done"),
      Ok(Err(e)) => report!(self.diag, WARN, step = name, error = e; "shutdown step failed"),
      Err(panic) => report!(
        self.diag,
        ERROR,
        step = name;
        "shutdown step panicked: {}",
        panic_message(panic.as_ref())
      ),
    }
  }
}

impl Drop for EngineInner {
  fn drop(&mut self) {
    if self.runtime().is_some() {
      self.shutdown_locked(false);
    }
  }
}

fn spawn_thread<F>(name: &str, f: F) -> io::Result<JoinHandle<()>>
where
  F: FnOnce() + Send + 'static,
{
  thread::Builder::new().name(name.to_string()).spawn(f)
}
