//! HTTP/2 stream multiplexer.
//!
//! Many concurrent request/response exchanges share one connection: outbound
//! exchanges get stream ids and are written through a single write context,
//! inbound frames are correlated back to their exchange (or to the request that
//! triggered a server push), and message bodies flow through bounded pipes.
//! Byte-level framing and HPACK stay behind the [`FrameEncoder`] seam.

pub mod codec;
pub mod config;
mod connection;
mod dispatcher;
mod error;
pub mod frame;
mod lifecycle;
mod pipe;
pub mod runtime;
mod stream_id;
mod streams;
mod table;
mod writer;

pub use config::{load_config, parse_config, MuxConfig, Role};
pub use connection::{
    ChannelConsumer, ConnectionEvent, InboundConsumer, MuxBuilder, MuxHandle, NoConsumer,
    OutboundRequest, RequestKind,
};
pub use dispatcher::InboundDispatcher;
pub use error::{ConfigError, MuxError, PipeError};
pub use frame::{ErrorCode, Frame, FrameEncoder, Headers, Settings, StreamId};
pub use lifecycle::ConnectionState;
pub use pipe::{BodyPipe, BodySink, PipeConsumer};
pub use runtime::drive;
pub use stream_id::{is_peer_initiated, StreamIdAllocator};
pub use streams::{ExchangeEvent, ExchangeHandle, StreamMetrics, StreamPhase};
pub use writer::{DefaultHeaderBuilder, HeaderBuilder};
