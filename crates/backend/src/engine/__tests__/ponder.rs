//! Ponder coalescing and replacement.

#[cfg(test)]
mod tests {
  use std::sync::Arc;

  use pretty_assertions::assert_eq;
  use serde_json::json;

  use crate::engine::{
    __tests__::helpers::{Calls, WriteHarness, dispatcher, query},
    registry::QueryRegistry,
  };

  // ==========================================================================
  // Coalescing
  // ==========================================================================

  #[test]
  fn test_identical_ponder_request_is_dropped() {
    let harness = WriteHarness::new();
    let calls = Calls::default();

    harness.send(query(Some("P1"), json!({"moves": ["D4"], "komi": 6.5}), true, &calls));
    // Differs only in volatile fields
    harness.send(query(
      Some("P2"),
      json!({"moves": ["D4"], "komi": 6.5, "maxVisits": 50}),
      true,
      &calls,
    ));

    let registry = Arc::clone(&harness.registry);
    let lines = harness.finish();

    assert_eq!(lines.len(), 1);
    assert_eq!(lines[0]["id"], json!("P1"));
    assert_eq!(registry.ponder_id().as_deref(), Some("P1"));
  }

  #[test]
  fn test_first_ponder_gets_unbounded_budget() {
    let harness = WriteHarness::new();
    let calls = Calls::default();
    harness.send(query(Some("P1"), json!({"moves": []}), true, &calls));

    let lines = harness.finish();
    assert_eq!(lines.len(), 1);
    assert_eq!(lines[0]["maxVisits"], json!(1_000_000_000u64));
    assert_eq!(lines[0]["reportDuringSearchEvery"], json!(0.5));
  }

  // ==========================================================================
  // Replacement
  // ==========================================================================

  #[test]
  fn test_changed_ponder_terminates_old_then_writes_new() {
    let harness = WriteHarness::new();
    let calls = Calls::default();

    harness.send(query(Some("P1"), json!({"moves": ["D4"]}), true, &calls));
    harness.send(query(Some("P2"), json!({"moves": ["D4", "Q16"]}), true, &calls));

    let registry = Arc::clone(&harness.registry);
    let lines = harness.finish();

    assert_eq!(lines.len(), 3);
    assert_eq!(lines[0]["id"], json!("P1"));
    assert_eq!(lines[1]["action"], json!("terminate"));
    assert_eq!(lines[1]["terminateId"], json!("P1"));
    assert_eq!(lines[2]["id"], json!("P2"));

    assert_eq!(registry.ponder_id().as_deref(), Some("P2"));
    // Ponder queries never count as pending
    assert_eq!(registry.len(), 0);
  }

  #[test]
  fn test_displaced_ponder_results_are_ignored() {
    let harness = WriteHarness::new();
    let calls = Calls::default();
    harness.send(query(Some("P1"), json!({"moves": []}), true, &calls));
    harness.send(query(Some("P2"), json!({"moves": ["K10"]}), true, &calls));

    let registry = Arc::clone(&harness.registry);
    harness.finish();

    let dispatcher = dispatcher(registry);
    dispatcher.handle_line(r#"{"id":"P1","isDuringSearch":true,"rootInfo":{}}"#);
    dispatcher.handle_line(r#"{"id":"P2","isDuringSearch":true,"rootInfo":{}}"#);
    dispatcher.handle_line(r#"{"id":"P2","rootInfo":{}}"#);

    let replies = calls.replies();
    assert_eq!(replies.len(), 2);
    assert!(replies.iter().all(|reply| reply.id == "P2"));
    assert!(replies[0].partial);
    assert!(!replies[1].partial);
  }

  #[test]
  fn test_ponder_survives_results_until_acknowledged() {
    let harness = WriteHarness::new();
    let calls = Calls::default();
    harness.send(query(Some("P1"), json!({"moves": []}), true, &calls));
    let registry = Arc::clone(&harness.registry);
    harness.finish();

    let dispatcher = dispatcher(Arc::clone(&registry));
    dispatcher.handle_line(r#"{"id":"P1","isDuringSearch":true,"result":1}"#);
    dispatcher.handle_line(r#"{"id":"P1","isDuringSearch":true,"result":2}"#);
    assert_eq!(registry.ponder_id().as_deref(), Some("P1"));

    dispatcher.handle_line(r#"{"id":"t9","action":"terminate","terminateId":"P1"}"#);
    assert_eq!(registry.ponder_id(), None);
    assert_eq!(calls.replies().len(), 2);
  }

  // ==========================================================================
  // Terminal responses
  // ==========================================================================

  #[test]
  fn test_failed_ponder_can_be_restarted() {
    let registry = Arc::new(QueryRegistry::new());
    let calls = Calls::default();
    let payload = json!({"moves": ["D4", "pass", "pass", "D4"]});

    let harness = WriteHarness::with_registry(Arc::clone(&registry));
    harness.send(query(Some("P1"), payload.clone(), true, &calls));
    assert_eq!(harness.finish().len(), 1);

    let dispatcher = dispatcher(Arc::clone(&registry));
    dispatcher.handle_line(r#"{"id":"P1","error":"illegal move"}"#);

    let errors = calls.errors();
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].id, "P1");
    assert_eq!(registry.ponder_id(), None);

    let harness = WriteHarness::with_registry(Arc::clone(&registry));
    harness.send(query(Some("P2"), payload, true, &calls));
    let lines = harness.finish();

    // Nothing is left to terminate, so only the new request goes out
    assert_eq!(lines.len(), 1);
    assert_eq!(lines[0]["id"], json!("P2"));
    assert_eq!(registry.ponder_id().as_deref(), Some("P2"));
  }

  #[test]
  fn test_final_ponder_result_ends_pondering() {
    let registry = Arc::new(QueryRegistry::new());
    let calls = Calls::default();
    let payload = json!({"moves": ["Q16"]});

    let harness = WriteHarness::with_registry(Arc::clone(&registry));
    harness.send(query(Some("P1"), payload.clone(), true, &calls));
    harness.finish();

    let dispatcher = dispatcher(Arc::clone(&registry));
    dispatcher.handle_line(r#"{"id":"P1","isDuringSearch":true,"rootInfo":{"visits":100}}"#);
    dispatcher.handle_line(r#"{"id":"P1","isDuringSearch":false,"rootInfo":{"visits":5000}}"#);
    dispatcher.handle_line(r#"{"id":"P1","isDuringSearch":true,"rootInfo":{"visits":5001}}"#);

    let replies = calls.replies();
    assert_eq!(replies.len(), 2);
    assert!(replies[0].partial);
    assert!(!replies[1].partial);
    assert_eq!(registry.ponder_id(), None);

    let harness = WriteHarness::with_registry(Arc::clone(&registry));
    harness.send(query(Some("P2"), payload, true, &calls));
    let lines = harness.finish();
    assert_eq!(lines.len(), 1);
    assert_eq!(lines[0]["id"], json!("P2"));
  }
}
