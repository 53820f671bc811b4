//! Write pump ordering and bookkeeping.

#[cfg(test)]
mod tests {
  use std::sync::{Arc, atomic::Ordering, mpsc::sync_channel};

  use pretty_assertions::assert_eq;
  use serde_json::json;
  use tokio_util::sync::CancellationToken;

  use crate::engine::{
    Counters,
    __tests__::helpers::{BrokenPipe, Calls, WriteHarness, query},
    registry::QueryRegistry,
    sink::Diagnostics,
    writer::{Outbound, SharedPipe, WritePump},
  };

  #[test]
  fn test_requests_written_in_submission_order() {
    let harness = WriteHarness::new();
    let calls = Calls::default();

    let ids: Vec<String> = (0..50).map(|n| format!("Q{n}")).collect();
    for id in &ids {
      harness.send(query(Some(id), json!({"n": id}), false, &calls));
    }
    let registry = Arc::clone(&harness.registry);
    let lines = harness.finish();

    let written: Vec<&str> = lines.iter().map(|line| line["id"].as_str().unwrap()).collect();
    assert_eq!(written, ids.iter().map(String::as_str).collect::<Vec<_>>());
    assert_eq!(registry.len(), 50);
  }

  #[test]
  fn test_missing_id_is_assigned() {
    let harness = WriteHarness::new();
    let calls = Calls::default();
    harness.send(query(None, json!({"moves": []}), false, &calls));

    let registry = Arc::clone(&harness.registry);
    let lines = harness.finish();

    let id = lines[0]["id"].as_str().expect("id assigned").to_string();
    assert!(!id.is_empty());
    assert!(registry.contains(&id));
  }

  #[test]
  fn test_priority_stamped_unless_present() {
    let harness = WriteHarness::new();
    let calls = Calls::default();

    let mut stamped = query(Some("a"), json!({}), false, &calls);
    stamped.metadata.priority = 7;
    harness.send(stamped);

    let mut explicit = query(Some("b"), json!({"priority": -1}), false, &calls);
    explicit.metadata.priority = 7;
    harness.send(explicit);

    let lines = harness.finish();
    assert_eq!(lines[0]["priority"], json!(7));
    assert_eq!(lines[1]["priority"], json!(-1));
  }

  #[test]
  fn test_termination_is_written_but_not_tracked() {
    let harness = WriteHarness::new();
    let calls = Calls::default();
    harness.send(query(Some("Q1"), json!({}), false, &calls));
    harness
      .tx
      .send(Outbound::Terminate {
        id: "t1".to_string(),
        target: "Q1".to_string(),
      })
      .unwrap();
    harness.send(query(
      Some("t2"),
      json!({"action": "terminate", "terminateId": "Q1"}),
      false,
      &calls,
    ));

    let registry = Arc::clone(&harness.registry);
    let counters = Arc::clone(&harness.counters);
    let lines = harness.finish();

    assert_eq!(lines.len(), 3);
    assert_eq!(lines[1], json!({"id": "t1", "action": "terminate", "terminateId": "Q1"}));
    assert_eq!(lines[2]["terminateId"], json!("Q1"));
    assert!(lines[2].get("priority").is_none());
    assert!(registry.contains("Q1"));
    assert!(!registry.contains("t1"));
    assert!(!registry.contains("t2"));
    assert_eq!(counters.requests_sent.load(Ordering::Relaxed), 3);
  }

  #[test]
  fn test_write_failure_stops_the_pump() {
    let (tx, rx) = sync_channel(8);
    let registry = Arc::new(QueryRegistry::new());
    let pump = WritePump {
      rx,
      pipe: SharedPipe::new(BrokenPipe),
      registry: Arc::clone(&registry),
      ponder: Default::default(),
      cancel: CancellationToken::new(),
      diag: Diagnostics::default(),
      counters: Arc::new(Counters::default()),
    };

    let calls = Calls::default();
    tx.send(Outbound::Query(query(Some("Q1"), json!({}), false, &calls))).unwrap();
    tx.send(Outbound::Query(query(Some("Q2"), json!({}), false, &calls))).unwrap();

    // Returns on its own after the first failed write; Q2 is never taken
    pump.run();
    assert!(registry.contains("Q1"));
    assert!(!registry.contains("Q2"));
  }

  #[test]
  fn test_cancelled_pump_writes_nothing() {
    let (tx, rx) = sync_channel(8);
    let out = crate::engine::__tests__::helpers::CaptureBuf::default();
    let cancel = CancellationToken::new();
    let pump = WritePump {
      rx,
      pipe: SharedPipe::new(out.clone()),
      registry: Arc::new(QueryRegistry::new()),
      ponder: Default::default(),
      cancel: cancel.clone(),
      diag: Diagnostics::default(),
      counters: Arc::new(Counters::default()),
    };

    let calls = Calls::default();
    tx.send(Outbound::Query(query(Some("late"), json!({}), false, &calls))).unwrap();
    cancel.cancel();
    pump.run();

    assert!(out.lines().is_empty());
  }

  #[test]
  fn test_closed_pipe_rejects_writes() {
    let out = crate::engine::__tests__::helpers::CaptureBuf::default();
    let pipe = SharedPipe::new(out);
    pipe.write_line(b"{}").unwrap();
    assert!(pipe.close(std::time::Duration::from_millis(10)));
    let err = pipe.write_line(b"{}").unwrap_err();
    assert_eq!(err.kind(), std::io::ErrorKind::BrokenPipe);
  }
}
