use crate::error::MuxError;
use crate::frame::{ErrorCode, Headers, StreamId};
use crate::pipe::{BodyPipe, PipeConsumer};
use bytes::Bytes;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tracing::error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamSendState {
    Open,
    FinQueued,
}

impl StreamSendState {
    pub fn is_closed(self) -> bool {
        matches!(self, StreamSendState::FinQueued)
    }

    pub fn can_queue_fin(self) -> bool {
        matches!(self, StreamSendState::Open)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamRecvState {
    Open,
    FinReceived,
}

impl StreamRecvState {
    pub fn is_closed(self) -> bool {
        matches!(self, StreamRecvState::FinReceived)
    }
}

/// HTTP/2 view of a registered stream (RFC 9113 §5.1), derived from its halves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamPhase {
    Open,
    HalfClosedLocal,
    HalfClosedRemote,
    Closed,
}

/// Events delivered to the owner of one exchange, in frame arrival order.
#[derive(Debug)]
pub enum ExchangeEvent {
    /// Response headers (or trailers, or request headers on the server side).
    Headers { headers: Headers, end_stream: bool },
    /// The body started arriving. Sent once per exchange; later DATA frames
    /// flow through the pipe rather than through further events.
    Data { body: PipeConsumer },
    /// The peer promised a pushed response linked to this exchange.
    PushOffered {
        promised_id: StreamId,
        request_headers: Headers,
        exchange: ExchangeHandle,
    },
    /// The peer finished its side of the stream.
    StreamEnded,
    /// The peer reset the stream.
    StreamReset { code: ErrorCode },
    /// The peer announced go-away; streams up to `last_stream_id` may still finish.
    ConnectionClosing {
        last_stream_id: StreamId,
        code: ErrorCode,
    },
    /// The exchange will receive nothing further.
    Failed(MuxError),
}

#[derive(Debug, Default)]
struct ExchangeShared {
    stream_id: OnceLock<StreamId>,
    cancelled: AtomicBool,
}

/// Application side of one exchange.
pub struct ExchangeHandle {
    shared: Arc<ExchangeShared>,
    events: mpsc::UnboundedReceiver<ExchangeEvent>,
}

impl std::fmt::Debug for ExchangeHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExchangeHandle")
            .field("stream_id", &self.stream_id())
            .finish()
    }
}

impl ExchangeHandle {
    /// The stream carrying this exchange, once it has been written.
    pub fn stream_id(&self) -> Option<StreamId> {
        self.shared.stream_id.get().copied()
    }

    pub async fn next_event(&mut self) -> Option<ExchangeEvent> {
        self.events.recv().await
    }

    pub fn try_next_event(&mut self) -> Option<ExchangeEvent> {
        self.events.try_recv().ok()
    }

    pub(crate) fn mark_cancelled(&self) {
        self.shared.cancelled.store(true, Ordering::SeqCst);
    }
}

/// Multiplexer side of one exchange: where its events go.
pub(crate) struct ExchangeLink {
    shared: Arc<ExchangeShared>,
    events: mpsc::UnboundedSender<ExchangeEvent>,
}

impl ExchangeLink {
    pub(crate) fn pair() -> (ExchangeHandle, ExchangeLink) {
        let shared = Arc::new(ExchangeShared::default());
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        (
            ExchangeHandle {
                shared: Arc::clone(&shared),
                events: events_rx,
            },
            ExchangeLink {
                shared,
                events: events_tx,
            },
        )
    }

    /// Returns false if the application dropped its handle.
    pub(crate) fn emit(&self, event: ExchangeEvent) -> bool {
        self.events.send(event).is_ok()
    }

    pub(crate) fn assign(&self, stream_id: StreamId) {
        let _ = self.shared.stream_id.set(stream_id);
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.shared.cancelled.load(Ordering::SeqCst)
    }
}

/// Work for a stream's inbound feeder task, in arrival order.
#[derive(Debug)]
pub(crate) enum InboundChunk {
    Data(Bytes),
    End,
}

/// Correlation table entry for one registered stream.
pub(crate) struct ExchangeEntry {
    pub(crate) link: ExchangeLink,
    /// Stream whose request triggered this push, if the stream is pushed.
    pub(crate) origin: Option<StreamId>,
    pub(crate) send_state: StreamSendState,
    pub(crate) recv_state: StreamRecvState,
    /// Whether the body has been surfaced to the application.
    pub(crate) processed: bool,
    pub(crate) peer_headers: Option<Headers>,
    pub(crate) body: Option<Arc<BodyPipe>>,
    pub(crate) rx_bytes: u64,
    pub(crate) tx_bytes: u64,
    pub(crate) body_task: Option<AbortHandle>,
    /// Set once the body pipe fell behind; later DATA goes through the feeder.
    pub(crate) inbound_feed: Option<mpsc::UnboundedSender<InboundChunk>>,
}

impl ExchangeEntry {
    fn new(
        link: ExchangeLink,
        origin: Option<StreamId>,
        send_state: StreamSendState,
        recv_state: StreamRecvState,
    ) -> Self {
        Self {
            link,
            origin,
            send_state,
            recv_state,
            processed: false,
            peer_headers: None,
            body: None,
            rx_bytes: 0,
            tx_bytes: 0,
            body_task: None,
            inbound_feed: None,
        }
    }

    /// A locally-initiated request; the send side stays open while a body follows.
    pub(crate) fn outbound(link: ExchangeLink, has_body: bool) -> Self {
        let send_state = if has_body {
            StreamSendState::Open
        } else {
            StreamSendState::FinQueued
        };
        Self::new(link, None, send_state, StreamRecvState::Open)
    }

    /// A stream the peer opened with a request.
    pub(crate) fn incoming(link: ExchangeLink) -> Self {
        Self::new(link, None, StreamSendState::Open, StreamRecvState::Open)
    }

    /// A stream the peer promised to push to us; we never send on it.
    pub(crate) fn pushed(link: ExchangeLink, origin: StreamId) -> Self {
        Self::new(
            link,
            Some(origin),
            StreamSendState::FinQueued,
            StreamRecvState::Open,
        )
    }

    /// A stream we promised to push; the peer never sends on it.
    pub(crate) fn promised(link: ExchangeLink, origin: StreamId) -> Self {
        Self::new(
            link,
            Some(origin),
            StreamSendState::Open,
            StreamRecvState::FinReceived,
        )
    }

    pub(crate) fn phase(&self) -> StreamPhase {
        match (self.send_state.is_closed(), self.recv_state.is_closed()) {
            (false, false) => StreamPhase::Open,
            (true, false) => StreamPhase::HalfClosedLocal,
            (false, true) => StreamPhase::HalfClosedRemote,
            (true, true) => StreamPhase::Closed,
        }
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.phase() == StreamPhase::Closed
    }

    pub(crate) fn emit(&self, event: ExchangeEvent) -> bool {
        self.link.emit(event)
    }
}

impl Drop for ExchangeEntry {
    fn drop(&mut self) {
        if let Some(task) = self.body_task.take() {
            task.abort();
        }
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct StreamMetrics {
    pub streams_total: usize,
    pub streams_with_recv_fin: usize,
    pub streams_with_send_fin: usize,
    pub streams_pushed: usize,
    pub streams_with_body: usize,
    pub buffered_bytes_total: u64,
    pub rx_bytes_total: u64,
    pub tx_bytes_total: u64,
}

impl StreamMetrics {
    pub(crate) fn record(&mut self, entry: &ExchangeEntry) {
        self.streams_total = self.streams_total.saturating_add(1);
        if entry.recv_state.is_closed() {
            self.streams_with_recv_fin = self.streams_with_recv_fin.saturating_add(1);
        }
        if entry.send_state.is_closed() {
            self.streams_with_send_fin = self.streams_with_send_fin.saturating_add(1);
        }
        if entry.origin.is_some() {
            self.streams_pushed = self.streams_pushed.saturating_add(1);
        }
        if let Some(body) = entry.body.as_ref() {
            self.streams_with_body = self.streams_with_body.saturating_add(1);
            self.buffered_bytes_total = self
                .buffered_bytes_total
                .saturating_add(body.buffered() as u64);
        }
        self.rx_bytes_total = self.rx_bytes_total.saturating_add(entry.rx_bytes);
        self.tx_bytes_total = self.tx_bytes_total.saturating_add(entry.tx_bytes);
    }
}

/// Logs entries whose halves disagree with their bookkeeping.
pub(crate) fn check_stream_invariants(entry: &ExchangeEntry, stream_id: StreamId, context: &str) {
    if entry.is_closed() {
        error!(
            "invariant violated: closed stream still registered stream={} context={} origin={:?}",
            stream_id, context, entry.origin
        );
    }
    if entry.send_state.is_closed() && entry.body_task.is_some() {
        error!(
            "invariant violated: send fin queued with body task running stream={} context={} tx_bytes={}",
            stream_id, context, entry.tx_bytes
        );
    }
    if entry.processed && entry.body.is_none() {
        error!(
            "invariant violated: body surfaced without pipe stream={} context={} rx_bytes={}",
            stream_id, context, entry.rx_bytes
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_without_body_is_half_closed_local() {
        let (_handle, link) = ExchangeLink::pair();
        let entry = ExchangeEntry::outbound(link, false);
        assert_eq!(entry.phase(), StreamPhase::HalfClosedLocal);
        assert!(!entry.send_state.can_queue_fin());
    }

    #[test]
    fn stream_closes_once_both_halves_finish() {
        let (_handle, link) = ExchangeLink::pair();
        let mut entry = ExchangeEntry::incoming(link);
        assert_eq!(entry.phase(), StreamPhase::Open);

        entry.recv_state = StreamRecvState::FinReceived;
        assert_eq!(entry.phase(), StreamPhase::HalfClosedRemote);
        assert!(!entry.is_closed());

        entry.send_state = StreamSendState::FinQueued;
        assert!(entry.is_closed());
    }

    #[test]
    fn pushed_and_promised_streams_are_one_directional() {
        let (_handle, link) = ExchangeLink::pair();
        let pushed = ExchangeEntry::pushed(link, 1);
        assert_eq!(pushed.phase(), StreamPhase::HalfClosedLocal);
        assert_eq!(pushed.origin, Some(1));

        let (_handle, link) = ExchangeLink::pair();
        let promised = ExchangeEntry::promised(link, 3);
        assert_eq!(promised.phase(), StreamPhase::HalfClosedRemote);
    }

    #[test]
    fn handle_sees_assigned_id_and_events() {
        let (mut handle, link) = ExchangeLink::pair();
        assert_eq!(handle.stream_id(), None);
        link.assign(5);
        link.assign(7);
        assert_eq!(handle.stream_id(), Some(5));

        assert!(link.emit(ExchangeEvent::StreamEnded));
        assert!(matches!(
            handle.try_next_event(),
            Some(ExchangeEvent::StreamEnded)
        ));
        assert!(handle.try_next_event().is_none());

        handle.mark_cancelled();
        assert!(link.is_cancelled());
        drop(handle);
        assert!(!link.emit(ExchangeEvent::StreamEnded));
    }

    #[test]
    fn metrics_count_halves_and_bytes() {
        let (_handle, link) = ExchangeLink::pair();
        let mut entry = ExchangeEntry::pushed(link, 1);
        entry.rx_bytes = 10;
        let mut metrics = StreamMetrics::default();
        metrics.record(&entry);
        assert_eq!(metrics.streams_total, 1);
        assert_eq!(metrics.streams_pushed, 1);
        assert_eq!(metrics.streams_with_send_fin, 1);
        assert_eq!(metrics.rx_bytes_total, 10);
    }
}
