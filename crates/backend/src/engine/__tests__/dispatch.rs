//! Result dispatch: classification, callback delivery, and bookkeeping.

#[cfg(test)]
mod tests {
  use std::{
    process::Command,
    sync::{Arc, Mutex, atomic::Ordering},
    time::{Duration, Instant},
  };

  use pretty_assertions::assert_eq;
  use serde_json::json;

  use crate::{
    engine::{
      __tests__::helpers::{Calls, POLL_INTERVAL, dispatcher, polling_dispatcher},
      registry::{QueryEntry, QueryRegistry},
      supervisor::{FailureLatch, ProcessSlot},
    },
    error::EngineFailure,
    protocol::QueryMetadata,
  };

  fn register(registry: &QueryRegistry, id: &str, calls: &Calls) {
    let replies = Arc::clone(&calls.replies);
    let errors = Arc::clone(&calls.errors);
    registry.register(QueryEntry {
      id: id.to_string(),
      on_success: Arc::new(move |reply| replies.lock().unwrap().push(reply)),
      on_error: Some(Arc::new(move |error| errors.lock().unwrap().push(error))),
      submitted_at: Instant::now(),
      metadata: QueryMetadata {
        node: Some("root".to_string()),
        ..Default::default()
      },
    });
  }

  // ==========================================================================
  // Terminal and partial results
  // ==========================================================================

  #[test]
  fn test_result_fires_once_and_removes_entry() {
    let registry = Arc::new(QueryRegistry::new());
    let calls = Calls::default();
    register(&registry, "Q1", &calls);

    let dispatcher = dispatcher(Arc::clone(&registry));
    dispatcher.handle_line(r#"{"id":"Q1","result":42}"#);
    dispatcher.handle_line(r#"{"id":"Q1","result":43}"#);

    let replies = calls.replies();
    assert_eq!(replies.len(), 1);
    assert_eq!(replies[0].payload, json!({"id": "Q1", "result": 42}));
    assert!(!replies[0].partial);
    assert_eq!(replies[0].metadata.node.as_deref(), Some("root"));
    assert!(!registry.contains("Q1"));
    assert!(calls.errors().is_empty());
  }

  #[test]
  fn test_error_fires_error_callback_once() {
    let registry = Arc::new(QueryRegistry::new());
    let calls = Calls::default();
    register(&registry, "Q2", &calls);

    let dispatcher = dispatcher(Arc::clone(&registry));
    dispatcher.handle_line(r#"{"id":"Q2","error":"bad"}"#);
    dispatcher.handle_line(r#"{"id":"Q2","error":"bad"}"#);

    let errors = calls.errors();
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].id, "Q2");
    assert_eq!(errors[0].message, "bad");
    assert!(calls.replies().is_empty());
    assert!(!registry.contains("Q2"));
  }

  #[test]
  fn test_partial_then_final() {
    let registry = Arc::new(QueryRegistry::new());
    let calls = Calls::default();
    register(&registry, "Q3", &calls);

    let dispatcher = dispatcher(Arc::clone(&registry));
    dispatcher.handle_line(r#"{"id":"Q3","isDuringSearch":true,"visits":10}"#);
    assert!(registry.contains("Q3"));

    dispatcher.handle_line(r#"{"id":"Q3","isDuringSearch":false,"visits":100}"#);
    assert!(!registry.contains("Q3"));

    let replies = calls.replies();
    assert_eq!(replies.len(), 2);
    assert!(replies[0].partial);
    assert!(!replies[1].partial);
    assert_eq!(replies[1].payload["visits"], json!(100));
  }

  // ==========================================================================
  // Responses that fire nothing
  // ==========================================================================

  #[test]
  fn test_unknown_id_is_discarded() {
    let registry = Arc::new(QueryRegistry::new());
    let calls = Calls::default();
    register(&registry, "known", &calls);

    let dispatcher = dispatcher(Arc::clone(&registry));
    dispatcher.handle_line(r#"{"id":"stale","result":1}"#);
    dispatcher.handle_line(r#"{"id":"stale","error":"gone"}"#);
    dispatcher.handle_line(r#"{"id":"stale","isDuringSearch":true}"#);

    assert!(calls.replies().is_empty());
    assert!(calls.errors().is_empty());
    assert!(registry.contains("known"));
  }

  #[test]
  fn test_malformed_lines_are_skipped() {
    let registry = Arc::new(QueryRegistry::new());
    let calls = Calls::default();
    register(&registry, "Q1", &calls);

    let dispatcher = dispatcher(Arc::clone(&registry));
    for line in ["", "   ", "KataGo v1.13 loading", "[1,2]", r#"{"result":1}"#, r#"{"id":"Q1""#] {
      dispatcher.handle_line(line);
    }
    dispatcher.handle_line(r#"{"id":"Q1","result":1}"#);

    assert_eq!(calls.replies().len(), 1);
  }

  #[test]
  fn test_warning_keeps_entry() {
    let registry = Arc::new(QueryRegistry::new());
    let calls = Calls::default();
    register(&registry, "Q4", &calls);

    let dispatcher = dispatcher(Arc::clone(&registry));
    dispatcher.handle_line(r#"{"id":"Q4","warning":"unused field","field":"foo"}"#);

    assert!(registry.contains("Q4"));
    assert!(calls.replies().is_empty());
    assert!(calls.errors().is_empty());
  }

  #[test]
  fn test_global_error_is_not_fatal() {
    let registry = Arc::new(QueryRegistry::new());
    let calls = Calls::default();
    register(&registry, "Q5", &calls);

    let dispatcher = dispatcher(Arc::clone(&registry));
    dispatcher.handle_line(r#"{"error":"could not parse request"}"#);

    assert!(registry.contains("Q5"));
    assert!(calls.errors().is_empty());
  }

  #[test]
  fn test_terminate_ack_removes_without_callbacks() {
    let registry = Arc::new(QueryRegistry::new());
    let calls = Calls::default();
    register(&registry, "Q6", &calls);

    let dispatcher = dispatcher(Arc::clone(&registry));
    dispatcher.handle_line(r#"{"id":"t1","action":"terminate","terminateId":"Q6"}"#);
    dispatcher.handle_line(r#"{"id":"Q6","result":1}"#);

    assert!(!registry.contains("Q6"));
    assert!(calls.replies().is_empty());
    assert!(calls.errors().is_empty());
  }

  // ==========================================================================
  // Callback isolation
  // ==========================================================================

  #[test]
  fn test_panicking_callback_does_not_stop_dispatch() {
    let registry = Arc::new(QueryRegistry::new());
    registry.register(QueryEntry {
      id: "boom".to_string(),
      on_success: Arc::new(|_| panic!("callback exploded")),
      on_error: None,
      submitted_at: Instant::now(),
      metadata: QueryMetadata::default(),
    });
    let calls = Calls::default();
    register(&registry, "after", &calls);

    let dispatcher = dispatcher(Arc::clone(&registry));
    dispatcher.handle_line(r#"{"id":"boom","result":1}"#);
    dispatcher.handle_line(r#"{"id":"after","result":2}"#);

    assert!(!registry.contains("boom"));
    assert_eq!(calls.replies().len(), 1);
  }

  #[test]
  fn test_callback_runs_without_registry_lock() {
    let registry = Arc::new(QueryRegistry::new());
    let observed = Arc::new(Mutex::new(None));
    let seen = Arc::clone(&observed);
    let inner = Arc::clone(&registry);
    registry.register(QueryEntry {
      id: "reentrant".to_string(),
      // Would deadlock if the dispatcher still held the lock
      on_success: Arc::new(move |_| *seen.lock().unwrap() = Some(inner.len())),
      on_error: None,
      submitted_at: Instant::now(),
      metadata: QueryMetadata::default(),
    });

    let dispatcher = dispatcher(Arc::clone(&registry));
    dispatcher.handle_line(r#"{"id":"reentrant","result":1}"#);

    assert_eq!(*observed.lock().unwrap(), Some(0));
  }

  #[test]
  fn test_responses_are_counted() {
    let registry = Arc::new(QueryRegistry::new());
    let dispatcher = dispatcher(registry);
    dispatcher.handle_line(r#"{"id":"a","result":1}"#);
    dispatcher.handle_line("garbage");
    dispatcher.handle_line(r#"{"id":"b","warning":"w"}"#);

    assert_eq!(dispatcher.counters.responses_received.load(Ordering::Relaxed), 2);
  }

  // ==========================================================================
  // Liveness polling
  // ==========================================================================

  fn recording_latch() -> (Arc<FailureLatch>, Arc<Mutex<Vec<Option<EngineFailure>>>>) {
    let failures = Arc::new(Mutex::new(Vec::new()));
    let captured = Arc::clone(&failures);
    let latch = FailureLatch::new(move |failure| captured.lock().unwrap().push(failure));
    (Arc::new(latch), failures)
  }

  #[cfg(unix)]
  #[test]
  fn test_dead_engine_with_silent_queue_is_unresponsive() {
    let registry = Arc::new(QueryRegistry::new());
    let calls = Calls::default();
    for n in 0..100 {
      register(&registry, &format!("Q{n}"), &calls);
    }

    let process = Arc::new(ProcessSlot::default());
    process.install(Command::new("true").spawn().unwrap());
    assert!(process.exit_status(Duration::from_secs(5)).is_some());

    let (latch, failures) = recording_latch();
    let (tx, dispatcher) = polling_dispatcher(Arc::clone(&registry), process, latch);

    // No lines and no end of stream: only the poll can notice the dead engine
    let started = Instant::now();
    std::thread::spawn(move || dispatcher.run()).join().unwrap();
    let elapsed = started.elapsed();
    drop(tx);

    assert!(elapsed < POLL_INTERVAL * 20, "took {elapsed:?}");
    assert_eq!(
      *failures.lock().unwrap(),
      vec![Some(EngineFailure::Unresponsive { pending: 100 })]
    );
    assert_eq!(registry.len(), 100);
    assert!(calls.replies().is_empty());
    assert!(calls.errors().is_empty());
  }

  #[cfg(unix)]
  #[test]
  fn test_live_engine_with_pending_queries_is_left_alone() {
    let registry = Arc::new(QueryRegistry::new());
    let calls = Calls::default();
    register(&registry, "Q1", &calls);

    let process = Arc::new(ProcessSlot::default());
    process.install(Command::new("sleep").arg("5").spawn().unwrap());

    let (latch, failures) = recording_latch();
    let (tx, dispatcher) = polling_dispatcher(Arc::clone(&registry), Arc::clone(&process), latch);
    let cancel = dispatcher.cancel.clone();
    let handle = std::thread::spawn(move || dispatcher.run());

    std::thread::sleep(POLL_INTERVAL * 10);
    cancel.cancel();
    handle.join().unwrap();
    drop(tx);

    assert!(failures.lock().unwrap().is_empty());
    if let Some(mut child) = process.clear() {
      let _ = child.kill();
      let _ = child.wait();
    }
  }
}
