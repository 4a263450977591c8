//! Outbound Exchange Writer.
//!
//! Every frame goes through the connection's single [`WriteContext`]; a frame is
//! written whole while the context is held, so body tasks and submitters on
//! other threads never interleave partial frames. The correlation table is
//! updated before each frame is handed to the encoder.

use crate::error::{MuxError, PipeError};
use crate::frame::{ErrorCode, FrameEncoder, Headers, StreamId};
use crate::pipe::{BodyPipe, PipeConsumer};
use crate::stream_id::StreamIdAllocator;
use crate::streams::{ExchangeEntry, ExchangeEvent, ExchangeHandle, ExchangeLink};
use crate::table::CorrelationTable;
use bytes::Bytes;
use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Produces the header block actually sent for a request.
pub trait HeaderBuilder: Send + Sync {
    fn build(&self, headers: &Headers, has_body: bool) -> Headers;
}

/// Fills in `:scheme` and `:authority` when the submitter left them out.
pub struct DefaultHeaderBuilder {
    scheme: String,
    authority: Option<String>,
}

impl DefaultHeaderBuilder {
    pub fn new(scheme: impl Into<String>, authority: Option<String>) -> Self {
        Self {
            scheme: scheme.into(),
            authority,
        }
    }
}

impl HeaderBuilder for DefaultHeaderBuilder {
    fn build(&self, headers: &Headers, _has_body: bool) -> Headers {
        let mut built = Headers::new();
        for (name, value) in headers.iter().filter(|(name, _)| name.starts_with(':')) {
            built.push(name, value);
        }
        if !headers.contains(":scheme") {
            built.push(":scheme", self.scheme.as_str());
        }
        if let Some(authority) = self.authority.as_deref() {
            if !headers.contains(":authority") {
                built.push(":authority", authority);
            }
        }
        for (name, value) in headers.iter().filter(|(name, _)| !name.starts_with(':')) {
            built.push(name, value);
        }
        built
    }
}

/// The connection's single serialization point for outbound frames.
pub(crate) struct WriteContext {
    encoder: Mutex<Box<dyn FrameEncoder>>,
}

impl WriteContext {
    pub(crate) fn new(encoder: Box<dyn FrameEncoder>) -> Self {
        Self {
            encoder: Mutex::new(encoder),
        }
    }

    fn with<R>(&self, f: impl FnOnce(&mut dyn FrameEncoder) -> io::Result<R>) -> io::Result<R> {
        let mut encoder = self.encoder.lock().unwrap_or_else(|e| e.into_inner());
        f(encoder.as_mut())
    }
}

#[derive(Clone)]
pub(crate) struct OutboundWriter {
    ctx: Arc<WriteContext>,
    table: Arc<CorrelationTable>,
    ids: Arc<StreamIdAllocator>,
    header_builder: Arc<dyn HeaderBuilder>,
    max_frame_size: Arc<AtomicUsize>,
    runtime: Handle,
    fatal_tx: mpsc::UnboundedSender<MuxError>,
    debug_streams: bool,
}

pub(crate) struct WriterParts {
    pub(crate) encoder: Box<dyn FrameEncoder>,
    pub(crate) table: Arc<CorrelationTable>,
    pub(crate) ids: Arc<StreamIdAllocator>,
    pub(crate) header_builder: Arc<dyn HeaderBuilder>,
    pub(crate) max_frame_size: usize,
    pub(crate) runtime: Handle,
    pub(crate) fatal_tx: mpsc::UnboundedSender<MuxError>,
    pub(crate) debug_streams: bool,
}

impl OutboundWriter {
    pub(crate) fn new(parts: WriterParts) -> Self {
        Self {
            ctx: Arc::new(WriteContext::new(parts.encoder)),
            table: parts.table,
            ids: parts.ids,
            header_builder: parts.header_builder,
            max_frame_size: Arc::new(AtomicUsize::new(parts.max_frame_size.max(1))),
            runtime: parts.runtime,
            fatal_tx: parts.fatal_tx,
            debug_streams: parts.debug_streams,
        }
    }

    pub(crate) fn set_max_frame_size(&self, size: usize) {
        self.max_frame_size.store(size.max(1), Ordering::SeqCst);
    }

    pub(crate) fn max_frame_size(&self) -> usize {
        self.max_frame_size.load(Ordering::SeqCst)
    }

    pub(crate) fn last_local_stream_id(&self) -> StreamId {
        self.ids.last_allocated()
    }

    /// Open a new local stream for a request and start its body, if any.
    ///
    /// The stream id is taken here, at write time, so exchanges that never get
    /// written never consume one.
    pub(crate) fn write_request(
        &self,
        link: ExchangeLink,
        headers: &Headers,
        body: Option<Arc<BodyPipe>>,
    ) -> Result<StreamId, MuxError> {
        let consumer = match body.as_ref().map(|pipe| pipe.attach_consumer()).transpose() {
            Ok(consumer) => consumer,
            Err(source) => {
                link.emit(ExchangeEvent::Failed(MuxError::Body {
                    stream_id: 0,
                    source: source.clone(),
                }));
                return Err(MuxError::Body {
                    stream_id: 0,
                    source,
                });
            }
        };
        let has_body = consumer.is_some();
        let headers = self.header_builder.build(headers, has_body);
        let stream_id = match self.ids.next_stream_id() {
            Ok(stream_id) => stream_id,
            Err(err) => {
                link.emit(ExchangeEvent::Failed(MuxError::StreamIdsExhausted));
                return Err(err);
            }
        };
        link.assign(stream_id);
        self.table
            .register(stream_id, ExchangeEntry::outbound(link, has_body))?;
        if self.debug_streams {
            debug!(
                "stream {}: opening request method={:?} path={:?} body={}",
                stream_id,
                headers.method(),
                headers.path(),
                has_body
            );
        }
        if let Err(err) = self.ctx.with(|encoder| {
            encoder.write_headers(stream_id, &headers, !has_body)?;
            encoder.flush()
        }) {
            if let Some(entry) = self.table.remove(stream_id) {
                entry.emit(ExchangeEvent::Failed(MuxError::TransportClosed));
            }
            return Err(MuxError::Codec(err));
        }
        if let Some(consumer) = consumer {
            self.spawn_body(stream_id, consumer);
        }
        Ok(stream_id)
    }

    /// Write the head (and start the body) of a response on a peer-opened or promised stream.
    pub(crate) fn write_response(
        &self,
        stream_id: StreamId,
        headers: &Headers,
        body: Option<Arc<BodyPipe>>,
    ) -> Result<(), MuxError> {
        let consumer = body
            .as_ref()
            .map(|pipe| pipe.attach_consumer())
            .transpose()
            .map_err(|source| MuxError::Body { stream_id, source })?;
        let has_body = consumer.is_some();
        let accepted = self.table.with_entry(stream_id, |entry| {
            if !entry.send_state.can_queue_fin() {
                return false;
            }
            if !has_body {
                entry.send_state = crate::streams::StreamSendState::FinQueued;
            }
            true
        });
        match accepted {
            None => return Err(MuxError::UnknownStream(stream_id)),
            Some(false) => {
                return Err(MuxError::Protocol(format!(
                    "stream {} already finished sending",
                    stream_id
                )))
            }
            Some(true) => {}
        }
        if self.debug_streams {
            debug!(
                "stream {}: writing response status={:?} body={}",
                stream_id,
                headers.status(),
                has_body
            );
        }
        self.ctx.with(|encoder| {
            encoder.write_headers(stream_id, headers, !has_body)?;
            encoder.flush()
        })?;
        match consumer {
            Some(consumer) => self.spawn_body(stream_id, consumer),
            None => {
                self.table.remove_if(stream_id, |entry| entry.is_closed());
            }
        }
        Ok(())
    }

    /// Promise a pushed response on `origin`; the promised stream is registered
    /// before the PUSH_PROMISE frame leaves.
    pub(crate) fn write_push_promise(
        &self,
        origin: StreamId,
        request_headers: &Headers,
    ) -> Result<ExchangeHandle, MuxError> {
        let origin_open = self
            .table
            .with_entry(origin, |entry| entry.send_state.can_queue_fin())
            .ok_or(MuxError::UnknownStream(origin))?;
        if !origin_open {
            return Err(MuxError::Protocol(format!(
                "cannot push on stream {} after its response finished",
                origin
            )));
        }
        let promised_id = self.ids.next_stream_id()?;
        let (handle, link) = ExchangeLink::pair();
        link.assign(promised_id);
        self.table
            .register(promised_id, ExchangeEntry::promised(link, origin))?;
        if self.debug_streams {
            debug!(
                "stream {}: promising push stream {} path={:?}",
                origin,
                promised_id,
                request_headers.path()
            );
        }
        if let Err(err) = self.ctx.with(|encoder| {
            encoder.write_push_promise(origin, promised_id, request_headers)?;
            encoder.flush()
        }) {
            self.table.remove(promised_id);
            return Err(MuxError::Codec(err));
        }
        Ok(handle)
    }

    /// Emit RST_STREAM; other streams are untouched.
    pub(crate) fn write_stream_reset(
        &self,
        stream_id: StreamId,
        code: ErrorCode,
    ) -> Result<(), MuxError> {
        if self.debug_streams {
            debug!("stream {}: writing reset code={}", stream_id, code);
        }
        self.ctx.with(|encoder| {
            encoder.write_rst_stream(stream_id, code)?;
            encoder.flush()
        })?;
        Ok(())
    }

    /// Emit GOAWAY announcing that nothing after `last_stream_id` will be processed.
    pub(crate) fn write_connection_terminate(
        &self,
        last_stream_id: StreamId,
        code: ErrorCode,
    ) -> Result<(), MuxError> {
        self.ctx.with(|encoder| {
            encoder.write_go_away(last_stream_id, code)?;
            encoder.flush()
        })?;
        Ok(())
    }

    fn spawn_body(&self, stream_id: StreamId, consumer: PipeConsumer) {
        let task = self
            .runtime
            .spawn(stream_body(self.clone(), stream_id, consumer));
        let abort = task.abort_handle();
        self.table.with_entry(stream_id, |entry| {
            if entry.send_state.can_queue_fin() {
                entry.body_task = Some(abort);
            }
        });
    }

    /// Write one body chunk, split at the negotiated frame size.
    ///
    /// Returns `Ok(false)` if the stream is gone (reset or closed) and the body
    /// should be abandoned.
    pub(crate) fn write_body_chunk(
        &self,
        stream_id: StreamId,
        chunk: Bytes,
        end_stream: bool,
    ) -> Result<bool, MuxError> {
        let max_frame_size = self.max_frame_size();
        let mut remaining = chunk;
        loop {
            let piece = if remaining.len() > max_frame_size {
                remaining.split_to(max_frame_size)
            } else {
                std::mem::take(&mut remaining)
            };
            let last_piece = remaining.is_empty();
            let fin = end_stream && last_piece;
            let piece_len = piece.len() as u64;
            let registered = self.table.with_entry(stream_id, |entry| {
                if !entry.send_state.can_queue_fin() {
                    return false;
                }
                entry.tx_bytes = entry.tx_bytes.saturating_add(piece_len);
                if fin {
                    entry.send_state = crate::streams::StreamSendState::FinQueued;
                    // Finishing normally; dropping the handle does not abort.
                    entry.body_task = None;
                }
                true
            });
            if registered != Some(true) {
                return Ok(false);
            }
            self.ctx.with(|encoder| {
                encoder.write_data(stream_id, piece, fin)?;
                encoder.flush()
            })?;
            if last_piece {
                break;
            }
        }
        if end_stream {
            if self.debug_streams {
                debug!("stream {}: body finished", stream_id);
            }
            self.table.remove_if(stream_id, |entry| entry.is_closed());
        }
        Ok(true)
    }

    /// The local body source failed: reset the stream and fail only its exchange.
    fn fail_body(&self, stream_id: StreamId, source: PipeError) {
        warn!("stream {}: body transfer failed: {}", stream_id, source);
        self.table.with_entry(stream_id, |entry| entry.body_task = None);
        if let Some(entry) = self.table.remove(stream_id) {
            entry.emit(ExchangeEvent::Failed(MuxError::Body { stream_id, source }));
        }
        if let Err(err) = self.write_stream_reset(stream_id, ErrorCode::InternalError) {
            self.report_fatal(err);
        }
    }

    fn report_fatal(&self, err: MuxError) {
        let _ = self.fatal_tx.send(err);
    }
}

async fn stream_body(writer: OutboundWriter, stream_id: StreamId, mut consumer: PipeConsumer) {
    let mut held: Option<Bytes> = None;
    loop {
        match consumer.next_chunk().await {
            Some(Ok(chunk)) => {
                let Some(previous) = held.replace(chunk) else {
                    continue;
                };
                match writer.write_body_chunk(stream_id, previous, false) {
                    Ok(true) => {}
                    Ok(false) => {
                        if writer.debug_streams {
                            debug!("stream {}: closed while body was streaming", stream_id);
                        }
                        return;
                    }
                    Err(err) => {
                        writer.report_fatal(err);
                        return;
                    }
                }
            }
            Some(Err(err)) => {
                writer.fail_body(stream_id, err);
                return;
            }
            None => {
                let last = held.take().unwrap_or_default();
                if let Err(err) = writer.write_body_chunk(stream_id, last, true) {
                    writer.report_fatal(err);
                }
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::ChannelEncoder;
    use crate::config::Role;
    use crate::frame::Frame;
    use crate::streams::StreamPhase;
    use tokio::time::{timeout, Duration};

    struct Harness {
        writer: OutboundWriter,
        table: Arc<CorrelationTable>,
        frames: mpsc::UnboundedReceiver<Frame>,
        fatal_rx: mpsc::UnboundedReceiver<MuxError>,
    }

    fn harness(role: Role, max_frame_size: usize) -> Harness {
        let (encoder, frames) = ChannelEncoder::new();
        let table = Arc::new(CorrelationTable::new());
        let (fatal_tx, fatal_rx) = mpsc::unbounded_channel();
        let writer = OutboundWriter::new(WriterParts {
            encoder: Box::new(encoder),
            table: Arc::clone(&table),
            ids: Arc::new(StreamIdAllocator::new(role)),
            header_builder: Arc::new(DefaultHeaderBuilder::new("https", None)),
            max_frame_size,
            runtime: Handle::current(),
            fatal_tx,
            debug_streams: true,
        });
        Harness {
            writer,
            table,
            frames,
            fatal_rx,
        }
    }

    fn runtime() -> tokio::runtime::Runtime {
        tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()
            .expect("build tokio runtime")
    }

    async fn next_frame(frames: &mut mpsc::UnboundedReceiver<Frame>) -> Frame {
        timeout(Duration::from_secs(1), frames.recv())
            .await
            .expect("frame should be written")
            .expect("frame channel open")
    }

    #[test]
    fn default_builder_fills_missing_pseudo_headers_first() {
        let builder = DefaultHeaderBuilder::new("https", Some("example.com".to_string()));
        let headers = Headers::new()
            .with("content-type", "text/xml")
            .with(":method", "POST")
            .with(":path", "/svc");
        let built = builder.build(&headers, true);
        let names: Vec<&str> = built.iter().map(|(name, _)| name).collect();
        assert_eq!(
            names,
            vec![":method", ":path", ":scheme", ":authority", "content-type"]
        );

        let explicit = Headers::request("GET", "/").with(":scheme", "http");
        let built = builder.build(&explicit, false);
        assert_eq!(built.get(":scheme"), Some("http"));
    }

    #[test]
    fn request_without_body_ends_stream_on_headers() {
        let rt = runtime();
        rt.block_on(async {
            let mut h = harness(Role::Client, 16_384);
            let (handle, link) = ExchangeLink::pair();
            let stream_id = h
                .writer
                .write_request(link, &Headers::request("GET", "/a"), None)
                .expect("write request");
            assert_eq!(stream_id, 1);
            assert_eq!(handle.stream_id(), Some(1));

            match next_frame(&mut h.frames).await {
                Frame::Headers {
                    stream_id,
                    headers,
                    end_stream,
                } => {
                    assert_eq!(stream_id, 1);
                    assert!(end_stream);
                    assert_eq!(headers.get(":scheme"), Some("https"));
                }
                other => panic!("unexpected frame {:?}", other),
            }
            let phase = h.table.with_entry(1, |entry| entry.phase());
            assert_eq!(phase, Some(StreamPhase::HalfClosedLocal));
        });
    }

    #[test]
    fn body_chunks_become_data_frames_with_final_end_stream() {
        let rt = runtime();
        rt.block_on(async {
            let mut h = harness(Role::Client, 16_384);
            let pipe = BodyPipe::new(1024);
            for i in 0..10u8 {
                pipe.produce(Bytes::from(vec![i; 4])).await.unwrap();
            }
            pipe.complete();

            let (_handle, link) = ExchangeLink::pair();
            h.writer
                .write_request(link, &Headers::request("POST", "/b"), Some(pipe))
                .expect("write request");

            assert!(matches!(
                next_frame(&mut h.frames).await,
                Frame::Headers {
                    end_stream: false,
                    ..
                }
            ));
            for i in 0..10u8 {
                match next_frame(&mut h.frames).await {
                    Frame::Data {
                        stream_id,
                        data,
                        end_stream,
                    } => {
                        assert_eq!(stream_id, 1);
                        assert_eq!(&data[..], &[i; 4]);
                        assert_eq!(end_stream, i == 9);
                    }
                    other => panic!("unexpected frame {:?}", other),
                }
            }
            let tx_bytes = h.table.with_entry(1, |entry| entry.tx_bytes);
            assert_eq!(tx_bytes, Some(40));
        });
    }

    #[test]
    fn oversized_chunks_are_split_at_frame_size() {
        let rt = runtime();
        rt.block_on(async {
            let mut h = harness(Role::Client, 4);
            let (_handle, link) = ExchangeLink::pair();
            let pipe = BodyPipe::new(64);
            pipe.produce(Bytes::from_static(b"abcdefghij")).await.unwrap();
            pipe.complete();
            h.writer
                .write_request(link, &Headers::request("POST", "/c"), Some(pipe))
                .unwrap();
            let _headers = next_frame(&mut h.frames).await;
            let mut sizes = Vec::new();
            let mut fins = Vec::new();
            for _ in 0..3 {
                if let Frame::Data {
                    data, end_stream, ..
                } = next_frame(&mut h.frames).await
                {
                    sizes.push(data.len());
                    fins.push(end_stream);
                }
            }
            assert_eq!(sizes, vec![4, 4, 2]);
            assert_eq!(fins, vec![false, false, true]);
        });
    }

    #[test]
    fn empty_body_ends_with_empty_data_frame() {
        let rt = runtime();
        rt.block_on(async {
            let mut h = harness(Role::Client, 16_384);
            let (_handle, link) = ExchangeLink::pair();
            let pipe = BodyPipe::new(64);
            pipe.complete();
            h.writer
                .write_request(link, &Headers::request("POST", "/d"), Some(pipe))
                .unwrap();
            let _headers = next_frame(&mut h.frames).await;
            assert_eq!(
                next_frame(&mut h.frames).await,
                Frame::Data {
                    stream_id: 1,
                    data: Bytes::new(),
                    end_stream: true
                }
            );
        });
    }

    #[test]
    fn failed_body_resets_only_its_stream() {
        let rt = runtime();
        rt.block_on(async {
            let mut h = harness(Role::Client, 16_384);
            let (_other_handle, other_link) = ExchangeLink::pair();
            h.writer
                .write_request(other_link, &Headers::request("GET", "/ok"), None)
                .unwrap();

            let (mut handle, link) = ExchangeLink::pair();
            let pipe = BodyPipe::new(64);
            h.writer
                .write_request(link, &Headers::request("POST", "/e"), Some(Arc::clone(&pipe)))
                .unwrap();
            pipe.fail("source exploded");

            let _ = next_frame(&mut h.frames).await;
            let _ = next_frame(&mut h.frames).await;
            assert_eq!(
                next_frame(&mut h.frames).await,
                Frame::Reset {
                    stream_id: 3,
                    code: ErrorCode::InternalError
                }
            );
            assert!(matches!(
                handle.next_event().await,
                Some(ExchangeEvent::Failed(MuxError::Body { stream_id: 3, .. }))
            ));
            assert!(h.table.contains(1));
            assert!(!h.table.contains(3));
            assert!(h.fatal_rx.try_recv().is_err());
        });
    }

    #[test]
    fn second_attach_of_body_pipe_fails_the_exchange() {
        let rt = runtime();
        rt.block_on(async {
            let h = harness(Role::Client, 16_384);
            let pipe = BodyPipe::new(64);
            let _app_consumer = pipe.attach_consumer().unwrap();
            let (mut handle, link) = ExchangeLink::pair();
            let err = h
                .writer
                .write_request(link, &Headers::request("POST", "/f"), Some(pipe))
                .unwrap_err();
            assert!(matches!(
                err,
                MuxError::Body {
                    source: PipeError::ConsumerAlreadyAttached,
                    ..
                }
            ));
            assert!(matches!(
                handle.try_next_event(),
                Some(ExchangeEvent::Failed(_))
            ));
            assert_eq!(h.writer.last_local_stream_id(), 0, "no id consumed");
        });
    }

    #[test]
    fn push_promise_registers_promised_stream_before_writing() {
        let rt = runtime();
        rt.block_on(async {
            let mut h = harness(Role::Server, 16_384);
            let (_handle, link) = ExchangeLink::pair();
            link.assign(1);
            h.table.register(1, ExchangeEntry::incoming(link)).unwrap();

            let pushed = h
                .writer
                .write_push_promise(1, &Headers::request("GET", "/style.css"))
                .expect("push promise");
            assert_eq!(pushed.stream_id(), Some(2));
            assert_eq!(h.table.origin_of(2), Some(1));
            assert!(matches!(
                next_frame(&mut h.frames).await,
                Frame::PushPromise {
                    stream_id: 1,
                    promised_id: 2,
                    ..
                }
            ));

            h.writer
                .write_response(2, &Headers::response(200), None)
                .expect("pushed response");
            assert!(matches!(
                next_frame(&mut h.frames).await,
                Frame::Headers {
                    stream_id: 2,
                    end_stream: true,
                    ..
                }
            ));
            assert!(!h.table.contains(2), "promised stream closes after response");
        });
    }
}
