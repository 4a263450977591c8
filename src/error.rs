use crate::frame::{ErrorCode, StreamId};
use thiserror::Error;

/// Errors surfaced by the multiplexer, either to a submitter or to an
/// exchange through [`ExchangeEvent::Failed`](crate::ExchangeEvent::Failed).
#[derive(Debug, Error)]
pub enum MuxError {
    #[error("connection is closed")]
    Closed,

    #[error("connection is going away; no streams after {last_stream_id} will be opened")]
    GoingAway { last_stream_id: StreamId },

    #[error("connection terminated (last stream {last_stream_id}, code {code})")]
    ConnectionTerminated {
        last_stream_id: StreamId,
        code: ErrorCode,
    },

    #[error("transport closed with exchanges in flight")]
    TransportClosed,

    #[error("stream {stream_id} reset ({code})")]
    StreamReset { stream_id: StreamId, code: ErrorCode },

    #[error("stream {0} is not registered")]
    UnknownStream(StreamId),

    #[error("stream {0} is already registered")]
    DuplicateStream(StreamId),

    #[error("stream id space exhausted")]
    StreamIdsExhausted,

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("operation requires the {0} role")]
    WrongRole(&'static str),

    #[error("peer disabled server push")]
    PushDisabled,

    #[error("body transfer failed on stream {stream_id}: {source}")]
    Body {
        stream_id: StreamId,
        #[source]
        source: PipeError,
    },

    #[error("frame encoder failed: {0}")]
    Codec(#[from] std::io::Error),

    #[error("no tokio runtime available to drive body transfers")]
    NoRuntime,

    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
}

impl MuxError {
    /// Whether the exchange never reached the peer's application and may be
    /// retried on another connection.
    pub fn is_retryable(&self) -> bool {
        match self {
            MuxError::GoingAway { .. }
            | MuxError::ConnectionTerminated { .. }
            | MuxError::TransportClosed => true,
            MuxError::StreamReset { code, .. } => *code == ErrorCode::RefusedStream,
            _ => false,
        }
    }
}

/// Body pipe usage and transfer errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PipeError {
    #[error("pipe consumer already attached")]
    ConsumerAlreadyAttached,

    #[error("pipe already completed")]
    Completed,

    #[error("pipe full ({buffered} of {capacity} bytes buffered)")]
    Full { buffered: usize, capacity: usize },

    #[error("pipe consumer went away")]
    ConsumerGone,

    #[error("pipe producer failed: {0}")]
    Failed(String),
}

/// Configuration loading errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Parse error: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}
