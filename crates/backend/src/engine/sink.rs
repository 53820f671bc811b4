//! Log routing.
//!
//! Every significant transition is emitted as a `tracing` event and, when the
//! embedder installed one, forwarded to a single [`LogSink`] callback.

use std::sync::Arc;

use tracing::{Level, debug, info};

/// Severity passed to a [`LogSink`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LogLevel {
  Trace,
  Debug,
  Info,
  Warn,
  Error,
}

impl LogLevel {
  pub fn as_str(&self) -> &'static str {
    match self {
      LogLevel::Trace => "trace",
      LogLevel::Debug => "debug",
      LogLevel::Info => "info",
      LogLevel::Warn => "warn",
      LogLevel::Error => "error",
    }
  }
}

impl From<Level> for LogLevel {
  fn from(level: Level) -> Self {
    if level == Level::TRACE {
      LogLevel::Trace
    } else if level == Level::DEBUG {
      LogLevel::Debug
    } else if level == Level::INFO {
      LogLevel::Info
    } else if level == Level::WARN {
      LogLevel::Warn
    } else {
      LogLevel::Error
    }
  }
}

impl std::fmt::Display for LogLevel {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(f, "{}", self.as_str())
  }
}

/// UI-facing log callback
pub type LogSink = Arc<dyn Fn(LogLevel, &str) + Send + Sync>;

/// Emit a `tracing` event with fields and forward its rendered text to the
/// engine's [`LogSink`].
///
/// ```ignore
/// report!(self.diag, WARN, id = id, pending = pending; "query failed: {message}");
/// report!(self.diag, DEBUG; "write pump started");
/// ```
macro_rules! report {
  ($diag:expr, $level:ident, $($field:ident = $value:expr),+ ; $($arg:tt)+) => {
    match ($(&$value,)+) {
      ($($field,)+) => {
        let message = format!($($arg)+);
        ::tracing::event!(::tracing::Level::$level, $($field = %$field,)+ "{}", message);
        let mut rendered = message;
        $(rendered.push_str(&format!(" {}={}", stringify!($field), $field));)+
        $diag.forward($crate::engine::LogLevel::from(::tracing::Level::$level), &rendered);
      }
    }
  };
  ($diag:expr, $level:ident ; $($arg:tt)+) => {{
    let message = format!($($arg)+);
    ::tracing::event!(::tracing::Level::$level, "{}", message);
    $diag.forward($crate::engine::LogLevel::from(::tracing::Level::$level), &message);
  }};
}

pub(crate) use report;

const ENGINE_STDERR: &str = "kibitz::engine_stderr";

#[derive(Clone, Default)]
pub(crate) struct Diagnostics {
  sink: Option<LogSink>,
}

impl Diagnostics {
  pub fn new(sink: Option<LogSink>) -> Self {
    Self { sink }
  }

  /// Hand already-rendered text to the sink, if one is installed
  pub fn forward(&self, level: LogLevel, text: &str) {
    if let Some(sink) = &self.sink {
      // A panicking sink must not take a pump thread down with it
      let _ = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| sink(level, text)));
    }
  }

  /// A line from the engine's diagnostic stream
  pub fn engine_line(&self, level: LogLevel, line: &str) {
    match level {
      LogLevel::Trace | LogLevel::Debug => debug!(target: ENGINE_STDERR, "{line}"),
      _ => info!(target: ENGINE_STDERR, "{line}"),
    }
    self.forward(level, line);
  }
}

/// Best-effort text of a caught panic payload
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
  if let Some(s) = payload.downcast_ref::<&str>() {
    s.to_string()
  } else if let Some(s) = payload.downcast_ref::<String>() {
    s.clone()
  } else {
    "non-string panic payload".to_string()
  }
}
