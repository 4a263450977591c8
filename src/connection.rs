//! Binding a multiplexer to a connection.
//!
//! [`MuxBuilder`] only offers `bind` once an inbound consumer has been supplied,
//! so an [`InboundDispatcher`] always has somewhere to send connection events.

use crate::config::{MuxConfig, Role};
use crate::dispatcher::{DispatcherParts, InboundDispatcher};
use crate::error::MuxError;
use crate::frame::{ErrorCode, FrameEncoder, Headers, Settings, StreamId};
use crate::lifecycle::{ConnectionState, Lifecycle};
use crate::pipe::BodyPipe;
use crate::stream_id::StreamIdAllocator;
use crate::streams::{ExchangeHandle, StreamMetrics};
use crate::table::CorrelationTable;
use crate::writer::{DefaultHeaderBuilder, HeaderBuilder, OutboundWriter, WriterParts};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, watch};
use tracing::info;

/// Connection-level events, delivered to the [`InboundConsumer`].
#[derive(Debug)]
pub enum ConnectionEvent {
    Settings(Settings),
    GoAway {
        last_stream_id: StreamId,
        code: ErrorCode,
    },
    /// A reset for a stream no exchange owned any more.
    StreamReset { stream_id: StreamId, code: ErrorCode },
    /// Server role: the peer opened a stream with a request.
    IncomingStream {
        stream_id: StreamId,
        exchange: ExchangeHandle,
    },
    /// The driver stopped; `error` is set when it stopped on a failure.
    Closed { error: Option<MuxError> },
}

/// Receives connection-level events from the inbound dispatcher.
pub trait InboundConsumer: Send {
    /// Whether PUSH_PROMISE frames should be accepted rather than refused.
    fn accepts_push(&self) -> bool {
        false
    }

    fn on_connection_event(&mut self, event: ConnectionEvent);
}

/// Forwards connection events onto an unbounded channel.
pub struct ChannelConsumer {
    accept_push: bool,
    events_tx: mpsc::UnboundedSender<ConnectionEvent>,
}

impl ChannelConsumer {
    pub fn new(accept_push: bool) -> (Self, mpsc::UnboundedReceiver<ConnectionEvent>) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        (
            Self {
                accept_push,
                events_tx,
            },
            events_rx,
        )
    }
}

impl InboundConsumer for ChannelConsumer {
    fn accepts_push(&self) -> bool {
        self.accept_push
    }

    fn on_connection_event(&mut self, event: ConnectionEvent) {
        let _ = self.events_tx.send(event);
    }
}

/// What an outbound submission asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    Normal,
    Reset { stream_id: StreamId, code: ErrorCode },
    Terminate {
        last_stream_id: StreamId,
        code: ErrorCode,
    },
}

pub struct OutboundRequest {
    pub headers: Headers,
    pub body: Option<Arc<BodyPipe>>,
    pub kind: RequestKind,
}

impl OutboundRequest {
    pub fn normal(headers: Headers, body: Option<Arc<BodyPipe>>) -> Self {
        Self {
            headers,
            body,
            kind: RequestKind::Normal,
        }
    }

    pub fn reset(stream_id: StreamId, code: ErrorCode) -> Self {
        Self {
            headers: Headers::new(),
            body: None,
            kind: RequestKind::Reset { stream_id, code },
        }
    }

    pub fn terminate(last_stream_id: StreamId, code: ErrorCode) -> Self {
        Self {
            headers: Headers::new(),
            body: None,
            kind: RequestKind::Terminate {
                last_stream_id,
                code,
            },
        }
    }
}

/// Builder state before a consumer is supplied.
pub struct NoConsumer;

pub struct MuxBuilder<C> {
    config: MuxConfig,
    header_builder: Option<Arc<dyn HeaderBuilder>>,
    consumer: C,
}

impl MuxBuilder<NoConsumer> {
    pub fn new(config: MuxConfig) -> Self {
        Self {
            config,
            header_builder: None,
            consumer: NoConsumer,
        }
    }

    pub fn consumer<C: InboundConsumer + 'static>(self, consumer: C) -> MuxBuilder<C> {
        MuxBuilder {
            config: self.config,
            header_builder: self.header_builder,
            consumer,
        }
    }
}

impl<C> MuxBuilder<C> {
    pub fn header_builder(mut self, builder: impl HeaderBuilder + 'static) -> Self {
        self.header_builder = Some(Arc::new(builder));
        self
    }
}

impl<C: InboundConsumer + 'static> MuxBuilder<C> {
    /// Bind to a connection's encoder. Must be called inside a tokio runtime,
    /// which then runs the body transfers.
    pub fn bind<E: FrameEncoder + 'static>(
        self,
        encoder: E,
    ) -> Result<(MuxHandle, InboundDispatcher), MuxError> {
        let config = self.config;
        config.validate()?;
        let runtime = Handle::try_current().map_err(|_| MuxError::NoRuntime)?;

        let table = Arc::new(CorrelationTable::new());
        let (fatal_tx, fatal_rx) = mpsc::unbounded_channel();
        let header_builder: Arc<dyn HeaderBuilder> = match self.header_builder {
            Some(builder) => builder,
            None => Arc::new(DefaultHeaderBuilder::new(
                config.default_scheme.clone(),
                config.default_authority.clone(),
            )),
        };
        let writer = OutboundWriter::new(WriterParts {
            encoder: Box::new(encoder),
            table: Arc::clone(&table),
            ids: Arc::new(StreamIdAllocator::new(config.role)),
            header_builder,
            max_frame_size: config.max_frame_size,
            runtime: runtime.clone(),
            fatal_tx: fatal_tx.clone(),
            debug_streams: config.debug_streams,
        });
        let lifecycle = Arc::new(Lifecycle::new(
            config.role,
            writer.clone(),
            Arc::clone(&table),
            fatal_tx,
        ));
        let last_peer_stream_id = lifecycle.peer_stream_watermark();

        let handle = MuxHandle {
            role: config.role,
            lifecycle: Arc::clone(&lifecycle),
            writer: writer.clone(),
            table: Arc::clone(&table),
            last_peer_stream_id: Arc::clone(&last_peer_stream_id),
        };
        let dispatcher = InboundDispatcher::new(DispatcherParts {
            role: config.role,
            lifecycle,
            table,
            writer,
            consumer: Box::new(self.consumer),
            body_pipe_capacity: config.body_pipe_capacity,
            debug_streams: config.debug_streams,
            last_peer_stream_id,
            fatal_rx,
            runtime,
        });
        info!(
            "bound {:?} multiplexer (pipe_capacity={}, max_frame_size={})",
            config.role, config.body_pipe_capacity, config.max_frame_size
        );
        Ok((handle, dispatcher))
    }
}

/// Application side of a bound multiplexer. Cheap to clone; safe to use from
/// any thread.
#[derive(Clone)]
pub struct MuxHandle {
    role: Role,
    lifecycle: Arc<Lifecycle>,
    writer: OutboundWriter,
    table: Arc<CorrelationTable>,
    last_peer_stream_id: Arc<AtomicU32>,
}

impl MuxHandle {
    /// Submit an outbound request, stream reset or connection terminate.
    ///
    /// Only [`RequestKind::Normal`] yields an exchange.
    pub fn submit(&self, request: OutboundRequest) -> Result<Option<ExchangeHandle>, MuxError> {
        match request.kind {
            RequestKind::Normal => self.request(request.headers, request.body).map(Some),
            RequestKind::Reset { stream_id, code } => {
                self.lifecycle.reset_stream(stream_id, code).map(|_| None)
            }
            RequestKind::Terminate {
                last_stream_id,
                code,
            } => self.lifecycle.terminate(last_stream_id, code).map(|_| None),
        }
    }

    /// Open a new exchange (client role).
    pub fn request(
        &self,
        headers: Headers,
        body: Option<Arc<BodyPipe>>,
    ) -> Result<ExchangeHandle, MuxError> {
        if self.role != Role::Client {
            return Err(MuxError::WrongRole("client"));
        }
        self.lifecycle.submit_request(headers, body)
    }

    /// Answer a peer-opened or promised stream (server role).
    pub fn respond(
        &self,
        stream_id: StreamId,
        headers: Headers,
        body: Option<Arc<BodyPipe>>,
    ) -> Result<(), MuxError> {
        if self.role != Role::Server {
            return Err(MuxError::WrongRole("server"));
        }
        if self.lifecycle.is_closed() {
            return Err(MuxError::Closed);
        }
        self.writer.write_response(stream_id, &headers, body)
    }

    /// Promise a pushed response linked to `origin` (server role). The returned
    /// exchange carries the promised stream id; answer it with [`MuxHandle::respond`].
    pub fn push(&self, origin: StreamId, request_headers: Headers) -> Result<ExchangeHandle, MuxError> {
        if self.role != Role::Server {
            return Err(MuxError::WrongRole("server"));
        }
        self.lifecycle.submit_push(origin, &request_headers)
    }

    pub fn cancel(&self, exchange: &ExchangeHandle, code: ErrorCode) -> Result<(), MuxError> {
        self.lifecycle.cancel(exchange, code)
    }

    /// Terminate announcing the newest stream the peer opened as the last processed one.
    pub fn shutdown(&self, code: ErrorCode) -> Result<(), MuxError> {
        self.lifecycle.terminate(self.last_peer_stream_id(), code)
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn state(&self) -> ConnectionState {
        self.lifecycle.state()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.lifecycle.subscribe()
    }

    pub fn last_peer_stream_id(&self) -> StreamId {
        self.last_peer_stream_id.load(Ordering::SeqCst)
    }

    pub fn last_local_stream_id(&self) -> StreamId {
        self.writer.last_local_stream_id()
    }

    /// Exchanges waiting for the peer's SETTINGS.
    pub fn queued_requests(&self) -> usize {
        self.lifecycle.pending_len()
    }

    pub fn open_streams(&self) -> usize {
        self.table.len()
    }

    pub fn metrics(&self) -> StreamMetrics {
        self.table.metrics()
    }
}
