//! In-memory harness for the pump and dispatcher threads.
//!
//! No process is involved: the write pump writes into a shared buffer and the
//! result dispatcher is fed lines directly.

use std::{
  io::{self, Write},
  sync::{
    Arc, Mutex,
    mpsc::{SyncSender, sync_channel},
  },
  thread::JoinHandle,
  time::{Duration, Instant},
};

use kibitz_core::PonderConfig;
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;

use crate::{
  engine::{
    Counters,
    dispatcher::ResultDispatcher,
    reader::PumpItem,
    registry::QueryRegistry,
    sink::Diagnostics,
    supervisor::{FailureLatch, ProcessSlot},
    writer::{Outbound, PendingQuery, SharedPipe, WritePump},
  },
  error::QueryError,
  protocol::{QueryMetadata, QueryReply},
};

/// A `Write` whose bytes can be inspected from the test thread
#[derive(Clone, Default)]
pub struct CaptureBuf {
  bytes: Arc<Mutex<Vec<u8>>>,
}

impl CaptureBuf {
  /// Every complete line written so far, parsed as JSON
  pub fn lines(&self) -> Vec<Value> {
    let bytes = self.bytes.lock().unwrap();
    String::from_utf8_lossy(&bytes)
      .lines()
      .filter(|line| !line.is_empty())
      .map(|line| serde_json::from_str(line).expect("pump wrote invalid json"))
      .collect()
  }
}

impl Write for CaptureBuf {
  fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
    self.bytes.lock().unwrap().extend_from_slice(buf);
    Ok(buf.len())
  }

  fn flush(&mut self) -> io::Result<()> {
    Ok(())
  }
}

/// A writer that always fails, like a pipe to a dead process
pub struct BrokenPipe;

impl Write for BrokenPipe {
  fn write(&mut self, _buf: &[u8]) -> io::Result<usize> {
    Err(io::Error::new(io::ErrorKind::BrokenPipe, "engine went away"))
  }

  fn flush(&mut self) -> io::Result<()> {
    Ok(())
  }
}

/// Callback log shared between a test and the callbacks it registers
#[derive(Clone, Default)]
pub struct Calls {
  pub replies: Arc<Mutex<Vec<QueryReply>>>,
  pub errors: Arc<Mutex<Vec<QueryError>>>,
}

impl Calls {
  pub fn replies(&self) -> Vec<QueryReply> {
    self.replies.lock().unwrap().clone()
  }

  pub fn errors(&self) -> Vec<QueryError> {
    self.errors.lock().unwrap().clone()
  }
}

pub fn object(value: Value) -> Map<String, Value> {
  match value {
    Value::Object(map) => map,
    other => panic!("expected an object, got {other}"),
  }
}

/// A query whose callbacks record into `calls`
pub fn query(id: Option<&str>, payload: Value, ponder: bool, calls: &Calls) -> PendingQuery {
  let replies = Arc::clone(&calls.replies);
  let errors = Arc::clone(&calls.errors);
  PendingQuery {
    id: id.map(String::from),
    payload: object(payload),
    ponder,
    on_success: Arc::new(move |reply| replies.lock().unwrap().push(reply)),
    on_error: Some(Arc::new(move |error| errors.lock().unwrap().push(error))),
    metadata: QueryMetadata::default(),
    submitted_at: Instant::now(),
  }
}

/// A write pump running on its own thread against a [`CaptureBuf`]
pub struct WriteHarness {
  pub tx: SyncSender<Outbound>,
  pub out: CaptureBuf,
  pub registry: Arc<QueryRegistry>,
  pub counters: Arc<Counters>,
  handle: Option<JoinHandle<()>>,
}

impl WriteHarness {
  pub fn new() -> Self {
    Self::with_registry(Arc::new(QueryRegistry::new()))
  }

  pub fn with_registry(registry: Arc<QueryRegistry>) -> Self {
    let (tx, rx) = sync_channel(64);
    let out = CaptureBuf::default();
    let counters = Arc::new(Counters::default());
    let pump = WritePump {
      rx,
      pipe: SharedPipe::new(out.clone()),
      registry: Arc::clone(&registry),
      ponder: PonderConfig::default(),
      cancel: CancellationToken::new(),
      diag: Diagnostics::default(),
      counters: Arc::clone(&counters),
    };
    let handle = std::thread::spawn(move || pump.run());
    Self {
      tx,
      out,
      registry,
      counters,
      handle: Some(handle),
    }
  }

  pub fn send(&self, query: PendingQuery) {
    self.tx.send(Outbound::Query(query)).unwrap();
  }

  /// Stop the pump and return everything it wrote
  pub fn finish(mut self) -> Vec<Value> {
    self.tx.send(Outbound::Stop).unwrap();
    if let Some(handle) = self.handle.take() {
      handle.join().unwrap();
    }
    self.out.lines()
  }
}

/// A result dispatcher whose lines are fed by the test
pub fn dispatcher(registry: Arc<QueryRegistry>) -> ResultDispatcher {
  let (_tx, dispatcher) = polling_dispatcher(
    registry,
    Arc::new(ProcessSlot::default()),
    Arc::new(FailureLatch::new(|_| {})),
  );
  dispatcher
}

/// Poll interval of the dispatchers built here
pub const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// A result dispatcher meant to `run`, plus the sender feeding its queue
pub fn polling_dispatcher(
  registry: Arc<QueryRegistry>,
  process: Arc<ProcessSlot>,
  latch: Arc<FailureLatch>,
) -> (SyncSender<PumpItem>, ResultDispatcher) {
  let (tx, rx) = sync_channel(16);
  let dispatcher = ResultDispatcher {
    rx,
    registry,
    process,
    latch,
    cancel: CancellationToken::new(),
    diag: Diagnostics::default(),
    counters: Arc::new(Counters::default()),
    poll_interval: POLL_INTERVAL,
    exit_wait: Duration::ZERO,
    expected_exit_codes: vec![0],
  };
  (tx, dispatcher)
}
