//! Inbound Frame Dispatcher.
//!
//! Runs on the connection's single I/O context and never waits: body bytes go
//! into pipes with `try_produce`. Once a stream's pipe is full, that stream's
//! remaining body is handed to a feeder task that waits on the pipe instead.
//! Other streams keep flowing.

use crate::config::Role;
use crate::connection::{ConnectionEvent, InboundConsumer};
use crate::error::{MuxError, PipeError};
use crate::frame::{ErrorCode, Frame, Headers, Settings, StreamId};
use crate::lifecycle::Lifecycle;
use crate::pipe::BodyPipe;
use crate::stream_id::is_peer_initiated;
use crate::streams::{
    check_stream_invariants, ExchangeEntry, ExchangeEvent, ExchangeLink, InboundChunk,
    StreamRecvState,
};
use crate::table::CorrelationTable;
use crate::writer::OutboundWriter;
use bytes::Bytes;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

pub(crate) struct DispatcherParts {
    pub(crate) role: Role,
    pub(crate) lifecycle: Arc<Lifecycle>,
    pub(crate) table: Arc<CorrelationTable>,
    pub(crate) writer: OutboundWriter,
    pub(crate) consumer: Box<dyn InboundConsumer>,
    pub(crate) body_pipe_capacity: usize,
    pub(crate) debug_streams: bool,
    pub(crate) last_peer_stream_id: Arc<AtomicU32>,
    pub(crate) fatal_rx: mpsc::UnboundedReceiver<MuxError>,
    pub(crate) runtime: Handle,
}

enum DataOutcome {
    Delivered,
    AfterEnd,
    Refused(PipeError),
}

/// Routes decoded frames to the exchanges they belong to.
pub struct InboundDispatcher {
    role: Role,
    lifecycle: Arc<Lifecycle>,
    table: Arc<CorrelationTable>,
    writer: OutboundWriter,
    consumer: Box<dyn InboundConsumer>,
    body_pipe_capacity: usize,
    debug_streams: bool,
    last_peer_stream_id: Arc<AtomicU32>,
    fatal_rx: Option<mpsc::UnboundedReceiver<MuxError>>,
    runtime: Handle,
}

impl InboundDispatcher {
    pub(crate) fn new(parts: DispatcherParts) -> Self {
        Self {
            role: parts.role,
            lifecycle: parts.lifecycle,
            table: parts.table,
            writer: parts.writer,
            consumer: parts.consumer,
            body_pipe_capacity: parts.body_pipe_capacity,
            debug_streams: parts.debug_streams,
            last_peer_stream_id: parts.last_peer_stream_id,
            fatal_rx: Some(parts.fatal_rx),
            runtime: parts.runtime,
        }
    }

    /// Process one frame. Frames for one stream must be passed in arrival order.
    ///
    /// An `Err` is connection-fatal; the caller is expected to hand it to
    /// [`InboundDispatcher::fail_connection`].
    pub fn dispatch(&mut self, frame: Frame) -> Result<(), MuxError> {
        if self.lifecycle.is_closed() {
            debug!(
                "stream {}: dropping {} frame on closed connection",
                frame.stream_id(),
                frame.kind()
            );
            return Ok(());
        }
        match frame {
            Frame::Headers {
                stream_id,
                headers,
                end_stream,
            } => self.on_headers(stream_id, headers, end_stream),
            Frame::Data {
                stream_id,
                data,
                end_stream,
            } => self.on_data(stream_id, data, end_stream),
            Frame::PushPromise {
                stream_id,
                promised_id,
                headers,
            } => self.on_push_promise(stream_id, promised_id, headers),
            Frame::Settings(settings) => self.on_settings(settings),
            Frame::GoAway {
                last_stream_id,
                code,
            } => {
                self.lifecycle.on_go_away(last_stream_id, code);
                self.consumer.on_connection_event(ConnectionEvent::GoAway {
                    last_stream_id,
                    code,
                });
                Ok(())
            }
            Frame::Reset { stream_id, code } => {
                self.on_reset(stream_id, code);
                Ok(())
            }
        }
    }

    fn on_headers(
        &mut self,
        stream_id: StreamId,
        headers: Headers,
        end_stream: bool,
    ) -> Result<(), MuxError> {
        if !self.table.contains(stream_id) {
            if self.opens_new_stream(stream_id) {
                return self.open_incoming(stream_id, headers, end_stream);
            }
            debug!("stream {}: dropping headers for unknown stream", stream_id);
            return Ok(());
        }
        let debug_streams = self.debug_streams;
        let delivered = self.table.with_entry(stream_id, |entry| {
            if entry.recv_state.is_closed() {
                return false;
            }
            let trailers = entry.peer_headers.is_some();
            if !trailers {
                entry.peer_headers = Some(headers.clone());
            }
            if debug_streams {
                debug!(
                    "stream {}: {} status={:?} end_stream={}",
                    stream_id,
                    if trailers { "trailers" } else { "headers" },
                    headers.status(),
                    end_stream
                );
            }
            entry.emit(ExchangeEvent::Headers {
                headers,
                end_stream,
            });
            if end_stream {
                finish_recv(entry);
            }
            true
        });
        match delivered {
            None => debug!("stream {}: dropping headers for closed stream", stream_id),
            Some(false) => debug!("stream {}: dropping headers after end of stream", stream_id),
            Some(true) => {
                if end_stream {
                    self.table.remove_if(stream_id, |entry| entry.is_closed());
                }
            }
        }
        Ok(())
    }

    fn opens_new_stream(&self, stream_id: StreamId) -> bool {
        self.role == Role::Server
            && is_peer_initiated(self.role, stream_id)
            && stream_id > self.last_peer_stream_id.load(Ordering::SeqCst)
    }

    fn open_incoming(
        &mut self,
        stream_id: StreamId,
        headers: Headers,
        end_stream: bool,
    ) -> Result<(), MuxError> {
        let (exchange, link) = ExchangeLink::pair();
        link.assign(stream_id);
        let mut entry = ExchangeEntry::incoming(link);
        entry.peer_headers = Some(headers.clone());
        if self.debug_streams {
            debug!(
                "stream {}: incoming request method={:?} path={:?} end_stream={}",
                stream_id,
                headers.method(),
                headers.path(),
                end_stream
            );
        }
        entry.emit(ExchangeEvent::Headers {
            headers,
            end_stream,
        });
        if end_stream {
            finish_recv(&mut entry);
        }
        self.table.register(stream_id, entry)?;
        self.last_peer_stream_id.store(stream_id, Ordering::SeqCst);
        self.consumer
            .on_connection_event(ConnectionEvent::IncomingStream {
                stream_id,
                exchange,
            });
        Ok(())
    }

    fn on_data(&mut self, stream_id: StreamId, data: Bytes, end_stream: bool) -> Result<(), MuxError> {
        let capacity = self.body_pipe_capacity;
        let runtime = &self.runtime;
        let len = data.len() as u64;
        let outcome = self.table.with_entry(stream_id, |entry| {
            if entry.recv_state.is_closed() {
                return DataOutcome::AfterEnd;
            }
            entry.rx_bytes = entry.rx_bytes.saturating_add(len);
            let pipe = Arc::clone(entry.body.get_or_insert_with(|| BodyPipe::new(capacity)));
            if !entry.processed {
                entry.processed = true;
                match pipe.attach_consumer() {
                    Ok(body) => {
                        entry.emit(ExchangeEvent::Data { body });
                    }
                    Err(err) => warn!("stream {}: cannot surface body: {}", stream_id, err),
                }
            }
            if let Err(source) = deliver_body(entry, &pipe, data, stream_id, runtime) {
                return DataOutcome::Refused(source);
            }
            if end_stream {
                finish_recv(entry);
            }
            DataOutcome::Delivered
        });
        match outcome {
            None => {
                debug!("stream {}: dropping data for unknown stream", stream_id);
                Ok(())
            }
            Some(DataOutcome::AfterEnd) => {
                debug!("stream {}: dropping data after end of stream", stream_id);
                Ok(())
            }
            Some(DataOutcome::Delivered) => {
                if end_stream {
                    self.table.remove_if(stream_id, |entry| entry.is_closed());
                }
                Ok(())
            }
            Some(DataOutcome::Refused(source)) => {
                warn!("stream {}: inbound body refused ({}); resetting", stream_id, source);
                if let Some(entry) = self.table.remove(stream_id) {
                    if let Some(body) = entry.body.as_ref() {
                        body.fail(source.to_string());
                    }
                    entry.emit(ExchangeEvent::Failed(MuxError::Body { stream_id, source }));
                }
                self.writer.write_stream_reset(stream_id, ErrorCode::Cancel)
            }
        }
    }

    fn on_push_promise(
        &mut self,
        origin: StreamId,
        promised_id: StreamId,
        request_headers: Headers,
    ) -> Result<(), MuxError> {
        if self.role == Role::Server {
            return Err(MuxError::Protocol(format!(
                "client sent PUSH_PROMISE on stream {}",
                origin
            )));
        }
        if !is_peer_initiated(self.role, promised_id) {
            return Err(MuxError::Protocol(format!(
                "push promised odd stream {}",
                promised_id
            )));
        }
        if !self.consumer.accepts_push() {
            info!("stream {}: refusing push promise {}", origin, promised_id);
            return self.writer.write_stream_reset(promised_id, ErrorCode::RefusedStream);
        }
        if !self.table.contains(origin) {
            info!(
                "stream {}: refusing push promise {} for unknown origin",
                origin, promised_id
            );
            return self.writer.write_stream_reset(promised_id, ErrorCode::RefusedStream);
        }

        let (exchange, link) = ExchangeLink::pair();
        link.assign(promised_id);
        self.table
            .register(promised_id, ExchangeEntry::pushed(link, origin))
            .map_err(|err| MuxError::Protocol(err.to_string()))?;
        self.last_peer_stream_id
            .fetch_max(promised_id, Ordering::SeqCst);
        if self.debug_streams {
            debug!(
                "stream {}: push offered promised={} path={:?}",
                origin,
                promised_id,
                request_headers.path()
            );
        }
        let offered = self.table.with_entry(origin, |entry| {
            entry.emit(ExchangeEvent::PushOffered {
                promised_id,
                request_headers,
                exchange,
            })
        });
        if offered != Some(true) {
            self.table.remove(promised_id);
            info!(
                "stream {}: origin exchange gone; refusing push {}",
                origin, promised_id
            );
            return self.writer.write_stream_reset(promised_id, ErrorCode::RefusedStream);
        }
        Ok(())
    }

    fn on_settings(&mut self, settings: Settings) -> Result<(), MuxError> {
        if settings.ack {
            return Ok(());
        }
        if let Err(code) = settings.validate() {
            return Err(MuxError::Protocol(format!("invalid SETTINGS ({})", code)));
        }
        self.lifecycle.on_settings(&settings);
        self.consumer
            .on_connection_event(ConnectionEvent::Settings(settings));
        Ok(())
    }

    fn on_reset(&mut self, stream_id: StreamId, code: ErrorCode) {
        let origin = self.table.origin_of(stream_id);
        match self.table.remove(stream_id) {
            Some(entry) => {
                info!(
                    "stream {}: reset by peer code={} push_origin={:?}",
                    stream_id, code, origin
                );
                if let Some(body) = entry.body.as_ref() {
                    body.fail(format!("stream reset by peer ({})", code));
                }
                entry.emit(ExchangeEvent::StreamReset { code });
            }
            None => {
                debug!("stream {}: reset for unowned stream code={}", stream_id, code);
                self.consumer
                    .on_connection_event(ConnectionEvent::StreamReset { stream_id, code });
            }
        }
    }

    /// Tear the connection down after a fatal error from [`InboundDispatcher::dispatch`]
    /// or the encoder.
    pub fn fail_connection(&mut self, err: &MuxError) {
        match err {
            MuxError::Codec(_) | MuxError::TransportClosed => {
                self.lifecycle.close(|| MuxError::TransportClosed);
            }
            _ => {
                warn!("connection error: {}", err);
                let last_stream_id = self.last_peer_stream_id.load(Ordering::SeqCst);
                if let Err(write_err) = self
                    .lifecycle
                    .terminate(last_stream_id, ErrorCode::ProtocolError)
                {
                    debug!("goaway after connection error not written: {}", write_err);
                }
            }
        }
    }

    pub fn is_closed(&self) -> bool {
        self.lifecycle.is_closed()
    }

    pub(crate) fn table(&self) -> Arc<CorrelationTable> {
        Arc::clone(&self.table)
    }

    pub(crate) fn take_fatal_rx(&mut self) -> Option<mpsc::UnboundedReceiver<MuxError>> {
        self.fatal_rx.take()
    }

    pub(crate) fn lifecycle(&self) -> &Lifecycle {
        &self.lifecycle
    }

    pub(crate) fn notify_closed(&mut self, error: Option<MuxError>) {
        self.consumer
            .on_connection_event(ConnectionEvent::Closed { error });
    }

    pub(crate) fn check_invariants(&self) {
        if !self.debug_streams {
            return;
        }
        for stream_id in self.table.stream_ids_where(|_| true) {
            self.table
                .with_entry(stream_id, |entry| check_stream_invariants(entry, stream_id, "dispatch"));
        }
    }
}

fn finish_recv(entry: &mut ExchangeEntry) {
    entry.recv_state = StreamRecvState::FinReceived;
    match entry.inbound_feed.as_ref() {
        Some(feed) => {
            let _ = feed.send(InboundChunk::End);
        }
        None => {
            if let Some(body) = entry.body.as_ref() {
                body.complete();
            }
        }
    }
    entry.emit(ExchangeEvent::StreamEnded);
}

/// Hand `data` to the stream's body. A full pipe switches the stream over to a
/// feeder task; from then on every chunk goes through it so order is kept.
fn deliver_body(
    entry: &mut ExchangeEntry,
    pipe: &Arc<BodyPipe>,
    data: Bytes,
    stream_id: StreamId,
    runtime: &Handle,
) -> Result<(), PipeError> {
    if let Some(feed) = entry.inbound_feed.as_ref() {
        return feed
            .send(InboundChunk::Data(data))
            .map_err(|_| PipeError::ConsumerGone);
    }
    match pipe.try_produce(data.clone()) {
        Err(PipeError::Full { buffered, capacity }) => {
            debug!(
                "stream {}: body consumer behind ({} of {} bytes buffered); feeding from task",
                stream_id, buffered, capacity
            );
            let (feed, chunks) = mpsc::unbounded_channel();
            let _ = feed.send(InboundChunk::Data(data));
            runtime.spawn(feed_pipe(stream_id, Arc::clone(pipe), chunks));
            entry.inbound_feed = Some(feed);
            Ok(())
        }
        other => other,
    }
}

async fn feed_pipe(
    stream_id: StreamId,
    pipe: Arc<BodyPipe>,
    mut chunks: mpsc::UnboundedReceiver<InboundChunk>,
) {
    while let Some(chunk) = chunks.recv().await {
        match chunk {
            InboundChunk::Data(data) => {
                if let Err(err) = pipe.produce(data).await {
                    debug!("stream {}: body feeder stopped: {}", stream_id, err);
                    return;
                }
            }
            InboundChunk::End => {
                pipe.complete();
                return;
            }
        }
    }
}
