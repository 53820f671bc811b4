pub mod engine;
pub mod error;
pub mod protocol;

pub use engine::{Engine, EngineBuilder, EngineStatus, LogLevel, LogSink, RecoveryHook};
pub use error::{EngineError, EngineFailure, QueryError};
pub use protocol::{QueryId, QueryMetadata, QueryReply, Request, Response};
