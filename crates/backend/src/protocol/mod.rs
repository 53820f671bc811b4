//! Wire protocol: one JSON object per line in each direction.
//!
//! Requests carry a string `id`; every response for that request echoes it.
//! The payload is otherwise opaque to the bridge, apart from the handful of
//! fields named below.

use std::sync::Arc;

use serde_json::{Map, Value, json};

use crate::error::{EngineError, QueryError};

mod response;

pub use response::{DecodeError, Response};

/// Correlation id tying a request to its responses
pub type QueryId = String;

pub const FIELD_ID: &str = "id";
pub const FIELD_ACTION: &str = "action";
pub const FIELD_TERMINATE_ID: &str = "terminateId";
pub const FIELD_ERROR: &str = "error";
pub const FIELD_WARNING: &str = "warning";
pub const FIELD_DURING_SEARCH: &str = "isDuringSearch";
pub const FIELD_PRIORITY: &str = "priority";
pub const FIELD_MAX_VISITS: &str = "maxVisits";
pub const FIELD_REPORT_EVERY: &str = "reportDuringSearchEvery";

pub const ACTION_TERMINATE: &str = "terminate";

/// Invoked for every result of a query, partial or final
pub type SuccessCallback = Arc<dyn Fn(QueryReply) + Send + Sync>;

/// Invoked once when the engine reports a query as failed
pub type ErrorCallback = Arc<dyn Fn(QueryError) + Send + Sync>;

/// Caller-supplied attribution carried alongside a query
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueryMetadata {
  /// Logical node (position) the query analyses
  pub node: Option<String>,
  /// Move the result should be attributed to, if any
  pub next_move: Option<String>,
  /// Effective priority sent to the engine
  pub priority: i64,
  /// Base priority at submission time
  pub generation: i64,
}

/// A result delivered to a success callback
#[derive(Debug, Clone, PartialEq)]
pub struct QueryReply {
  pub id: QueryId,
  /// The full response object
  pub payload: Value,
  /// More results for this id will follow
  pub partial: bool,
  pub metadata: QueryMetadata,
}

/// An analysis request and the callbacks that receive its results.
///
/// ```ignore
/// let request = Request::new(json!({"moves": []}), |reply| println!("{}", reply.payload))?
///   .node("root")
///   .priority(5);
/// let id = engine.submit(request)?;
/// ```
#[derive(Clone)]
pub struct Request {
  pub(crate) id: Option<QueryId>,
  pub(crate) payload: Map<String, Value>,
  pub(crate) ponder: bool,
  pub(crate) priority: i64,
  pub(crate) metadata: QueryMetadata,
  pub(crate) on_success: SuccessCallback,
  pub(crate) on_error: Option<ErrorCallback>,
}

impl Request {
  /// Create a request from a JSON object payload.
  ///
  /// An `id` inside the payload is taken as the correlation id.
  pub fn new<F>(payload: Value, on_success: F) -> Result<Self, EngineError>
  where
    F: Fn(QueryReply) + Send + Sync + 'static,
  {
    let Value::Object(mut payload) = payload else {
      return Err(EngineError::InvalidRequest("payload must be a JSON object".to_string()));
    };

    let id = match payload.remove(FIELD_ID) {
      None | Some(Value::Null) => None,
      Some(Value::String(id)) if !id.is_empty() => Some(id),
      Some(Value::Number(n)) => Some(n.to_string()),
      Some(other) => {
        return Err(EngineError::InvalidRequest(format!("unsupported id: {other}")));
      }
    };

    Ok(Self {
      id,
      payload,
      ponder: false,
      priority: 0,
      metadata: QueryMetadata::default(),
      on_success: Arc::new(on_success),
      on_error: None,
    })
  }

  pub fn with_id(mut self, id: impl Into<QueryId>) -> Self {
    self.id = Some(id.into());
    self
  }

  /// Mark this as the continuous (ponder) query
  pub fn ponder(mut self) -> Self {
    self.ponder = true;
    self
  }

  /// Priority relative to the current base priority
  pub fn priority(mut self, priority: i64) -> Self {
    self.priority = priority;
    self
  }

  pub fn node(mut self, node: impl Into<String>) -> Self {
    self.metadata.node = Some(node.into());
    self
  }

  pub fn next_move(mut self, next_move: impl Into<String>) -> Self {
    self.metadata.next_move = Some(next_move.into());
    self
  }

  pub fn on_error<F>(mut self, on_error: F) -> Self
  where
    F: Fn(QueryError) + Send + Sync + 'static,
  {
    self.on_error = Some(Arc::new(on_error));
    self
  }

  pub fn id(&self) -> Option<&str> {
    self.id.as_deref()
  }

  pub fn is_ponder(&self) -> bool {
    self.ponder
  }

  pub fn payload(&self) -> &Map<String, Value> {
    &self.payload
  }
}

impl std::fmt::Debug for Request {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Request")
      .field("id", &self.id)
      .field("payload", &self.payload)
      .field("ponder", &self.ponder)
      .field("priority", &self.priority)
      .field("metadata", &self.metadata)
      .finish_non_exhaustive()
  }
}

/// Build the termination request for `target`
pub fn termination_request(id: &str, target: &str) -> Value {
  json!({
    FIELD_ID: id,
    FIELD_ACTION: ACTION_TERMINATE,
    FIELD_TERMINATE_ID: target,
  })
}

/// Whether a payload is itself a termination request (never tracked)
pub fn is_termination(payload: &Map<String, Value>) -> bool {
  payload.get(FIELD_ACTION).and_then(Value::as_str) == Some(ACTION_TERMINATE)
}

/// Whether two ponder payloads differ in anything but the excluded fields
pub fn ponder_differs(active: &Map<String, Value>, candidate: &Map<String, Value>, exclude: &[String]) -> bool {
  let relevant = |map: &Map<String, Value>| {
    map
      .iter()
      .filter(|(key, _)| !exclude.iter().any(|e| e == *key))
      .map(|(k, v)| (k.clone(), v.clone()))
      .collect::<std::collections::BTreeMap<_, _>>()
  };
  relevant(active) != relevant(candidate)
}
