use serde_json::Value;
use thiserror::Error;

use super::{FIELD_DURING_SEARCH, FIELD_ERROR, FIELD_ID, FIELD_TERMINATE_ID, FIELD_WARNING, QueryId};

#[derive(Debug, Error)]
pub enum DecodeError {
  #[error("malformed json: {0}")]
  Json(#[from] serde_json::Error),
  #[error("response is not a JSON object")]
  NotAnObject,
  #[error("response has no id")]
  MissingId,
}

/// A decoded engine response, classified once at the dispatcher boundary
#[derive(Debug, Clone, PartialEq)]
pub enum Response {
  /// Final result; the query is complete
  Result { id: QueryId, payload: Value },
  /// Streaming update; more responses for this id will follow
  PartialResult { id: QueryId, payload: Value },
  /// Non-fatal notice about a request
  Warning {
    id: Option<QueryId>,
    message: String,
    field: Option<String>,
  },
  /// Acknowledges termination of `terminate_id`
  TerminateAck { id: Option<QueryId>, terminate_id: QueryId },
  /// Terminal failure; without an id it concerns the engine as a whole
  Error {
    id: Option<QueryId>,
    message: String,
    payload: Value,
  },
}

impl Response {
  pub fn decode(line: &str) -> Result<Self, DecodeError> {
    let payload: Value = serde_json::from_str(line)?;
    Self::from_value(payload)
  }

  pub fn from_value(payload: Value) -> Result<Self, DecodeError> {
    let Value::Object(map) = &payload else {
      return Err(DecodeError::NotAnObject);
    };

    let id = map.get(FIELD_ID).and_then(id_string);

    if let Some(terminate_id) = map.get(FIELD_TERMINATE_ID).and_then(id_string) {
      return Ok(Self::TerminateAck { id, terminate_id });
    }

    if let Some(error) = map.get(FIELD_ERROR) {
      return Ok(Self::Error {
        id,
        message: text(error),
        payload,
      });
    }

    if let Some(warning) = map.get(FIELD_WARNING) {
      return Ok(Self::Warning {
        id,
        message: text(warning),
        field: map.get("field").map(text),
      });
    }

    let Some(id) = id else {
      return Err(DecodeError::MissingId);
    };

    let during_search = map.get(FIELD_DURING_SEARCH).and_then(Value::as_bool).unwrap_or(false);
    if during_search {
      Ok(Self::PartialResult { id, payload })
    } else {
      Ok(Self::Result { id, payload })
    }
  }

  pub fn id(&self) -> Option<&str> {
    match self {
      Self::Result { id, .. } | Self::PartialResult { id, .. } => Some(id),
      Self::Warning { id, .. } | Self::TerminateAck { id, .. } | Self::Error { id, .. } => id.as_deref(),
    }
  }

  /// Whether this response ends its query
  pub fn is_terminal(&self) -> bool {
    matches!(self, Self::Result { .. } | Self::Error { .. } | Self::TerminateAck { .. })
  }
}

fn id_string(value: &Value) -> Option<String> {
  match value {
    Value::String(s) => Some(s.clone()),
    Value::Number(n) => Some(n.to_string()),
    _ => None,
  }
}

fn text(value: &Value) -> String {
  match value {
    Value::String(s) => s.clone(),
    other => other.to_string(),
  }
}
