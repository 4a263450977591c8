//! Connection Lifecycle Controller.
//!
//! `Handshaking -> Ready -> Draining -> Closed`. Exchanges submitted before the
//! peer's first SETTINGS wait in the pending queue owned by the `Handshaking`
//! state and are written in submission order when it arrives. The state lock is
//! held while an exchange is written, so submissions racing a flush queue up
//! behind it instead of overtaking it.

use crate::config::Role;
use crate::error::MuxError;
use crate::frame::{ErrorCode, Headers, Settings, StreamId};
use crate::pipe::BodyPipe;
use crate::stream_id::is_peer_initiated;
use crate::streams::{check_stream_invariants, ExchangeEvent, ExchangeHandle, ExchangeLink};
use crate::table::CorrelationTable;
use crate::writer::OutboundWriter;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

/// Observable connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Handshaking,
    Ready,
    Draining { last_stream_id: StreamId },
    Closed,
}

pub(crate) struct PendingExchange {
    link: ExchangeLink,
    headers: Headers,
    body: Option<Arc<BodyPipe>>,
}

enum LifecycleState {
    Handshaking { pending: VecDeque<PendingExchange> },
    Ready,
    Draining { last_stream_id: StreamId },
    Closed,
}

impl LifecycleState {
    fn snapshot(&self) -> ConnectionState {
        match self {
            LifecycleState::Handshaking { .. } => ConnectionState::Handshaking,
            LifecycleState::Ready => ConnectionState::Ready,
            LifecycleState::Draining { last_stream_id } => ConnectionState::Draining {
                last_stream_id: *last_stream_id,
            },
            LifecycleState::Closed => ConnectionState::Closed,
        }
    }
}

pub(crate) struct Lifecycle {
    role: Role,
    state: Mutex<LifecycleState>,
    state_tx: watch::Sender<ConnectionState>,
    writer: OutboundWriter,
    table: Arc<CorrelationTable>,
    fatal_tx: mpsc::UnboundedSender<MuxError>,
    peer_push_enabled: AtomicBool,
    /// Highest stream id the peer opened or promised that we processed.
    last_peer_stream_id: Arc<AtomicU32>,
}

impl Lifecycle {
    pub(crate) fn new(
        role: Role,
        writer: OutboundWriter,
        table: Arc<CorrelationTable>,
        fatal_tx: mpsc::UnboundedSender<MuxError>,
    ) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Handshaking);
        Self {
            role,
            state: Mutex::new(LifecycleState::Handshaking {
                pending: VecDeque::new(),
            }),
            state_tx,
            writer,
            table,
            fatal_tx,
            peer_push_enabled: AtomicBool::new(true),
            last_peer_stream_id: Arc::new(AtomicU32::new(0)),
        }
    }

    fn lock(&self) -> MutexGuard<'_, LifecycleState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn publish(&self, state: &LifecycleState) {
        self.state_tx.send_replace(state.snapshot());
    }

    pub(crate) fn state(&self) -> ConnectionState {
        self.lock().snapshot()
    }

    pub(crate) fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    pub(crate) fn is_closed(&self) -> bool {
        matches!(*self.lock(), LifecycleState::Closed)
    }

    pub(crate) fn peer_stream_watermark(&self) -> Arc<AtomicU32> {
        Arc::clone(&self.last_peer_stream_id)
    }

    pub(crate) fn peer_push_enabled(&self) -> bool {
        self.peer_push_enabled.load(Ordering::SeqCst)
    }

    pub(crate) fn pending_len(&self) -> usize {
        match &*self.lock() {
            LifecycleState::Handshaking { pending } => pending.len(),
            _ => 0,
        }
    }

    /// Queue or write a new exchange depending on the connection state.
    pub(crate) fn submit_request(
        &self,
        headers: Headers,
        body: Option<Arc<BodyPipe>>,
    ) -> Result<ExchangeHandle, MuxError> {
        let mut state = self.lock();
        let result = match &mut *state {
            LifecycleState::Handshaking { pending } => {
                let (handle, link) = ExchangeLink::pair();
                pending.push_back(PendingExchange {
                    link,
                    headers,
                    body,
                });
                debug!("queued exchange until settings arrive (pending={})", pending.len());
                Ok(handle)
            }
            LifecycleState::Ready => {
                let (handle, link) = ExchangeLink::pair();
                self.writer
                    .write_request(link, &headers, body)
                    .map(|_| handle)
            }
            LifecycleState::Draining { last_stream_id } => Err(MuxError::GoingAway {
                last_stream_id: *last_stream_id,
            }),
            LifecycleState::Closed => Err(MuxError::Closed),
        };
        drop(state);
        if let Err(err) = &result {
            self.escalate(err);
        }
        result
    }

    /// Promise a pushed response on `origin`.
    pub(crate) fn submit_push(
        &self,
        origin: StreamId,
        request_headers: &Headers,
    ) -> Result<ExchangeHandle, MuxError> {
        if !self.peer_push_enabled() {
            return Err(MuxError::PushDisabled);
        }
        let state = self.lock();
        let result = match &*state {
            LifecycleState::Ready => self.writer.write_push_promise(origin, request_headers),
            LifecycleState::Handshaking { .. } => Err(MuxError::UnknownStream(origin)),
            LifecycleState::Draining { last_stream_id } => Err(MuxError::GoingAway {
                last_stream_id: *last_stream_id,
            }),
            LifecycleState::Closed => Err(MuxError::Closed),
        };
        drop(state);
        if let Err(err) = &result {
            self.escalate(err);
        }
        result
    }

    /// Cancel one exchange: a queued one is skipped at flush, a written one is reset.
    pub(crate) fn cancel(&self, exchange: &ExchangeHandle, code: ErrorCode) -> Result<(), MuxError> {
        let state = self.lock();
        if matches!(*state, LifecycleState::Closed) {
            return Err(MuxError::Closed);
        }
        exchange.mark_cancelled();
        drop(state);
        match exchange.stream_id() {
            Some(stream_id) => self.reset_stream(stream_id, code),
            None => {
                debug!("cancelled queued exchange before it was written");
                Ok(())
            }
        }
    }

    /// Reset a single stream; the owning exchange fails, others continue.
    pub(crate) fn reset_stream(&self, stream_id: StreamId, code: ErrorCode) -> Result<(), MuxError> {
        {
            let state = self.lock();
            match &*state {
                LifecycleState::Closed => return Err(MuxError::Closed),
                LifecycleState::Handshaking { .. } => {
                    return Err(MuxError::UnknownStream(stream_id))
                }
                LifecycleState::Ready | LifecycleState::Draining { .. } => {}
            }
        }
        if let Some(entry) = self.table.remove(stream_id) {
            if let Some(body) = entry.body.as_ref() {
                body.fail(format!("stream {} reset locally", stream_id));
            }
            entry.emit(ExchangeEvent::Failed(MuxError::StreamReset { stream_id, code }));
        }
        info!("stream {}: reset locally code={}", stream_id, code);
        if let Err(err) = self.writer.write_stream_reset(stream_id, code) {
            self.escalate(&err);
            return Err(err);
        }
        Ok(())
    }

    /// Send GOAWAY and close: every pending and registered exchange fails exactly once.
    pub(crate) fn terminate(&self, last_stream_id: StreamId, code: ErrorCode) -> Result<(), MuxError> {
        let mut state = self.lock();
        if matches!(*state, LifecycleState::Closed) {
            return Err(MuxError::Closed);
        }
        info!(
            "terminating connection last_stream_id={} code={} streams={}",
            last_stream_id,
            code,
            self.table.len()
        );
        let written = self.writer.write_connection_terminate(last_stream_id, code);
        let previous = std::mem::replace(&mut *state, LifecycleState::Closed);
        self.publish(&state);
        drop(state);
        self.fail_everything(previous, || MuxError::ConnectionTerminated {
            last_stream_id,
            code,
        });
        written
    }

    /// The transport is gone; fail whatever is left.
    pub(crate) fn close(&self, make_err: impl Fn() -> MuxError) {
        let mut state = self.lock();
        if matches!(*state, LifecycleState::Closed) {
            return;
        }
        let previous = std::mem::replace(&mut *state, LifecycleState::Closed);
        self.publish(&state);
        drop(state);
        let failed = self.fail_everything(previous, make_err);
        if failed > 0 {
            warn!("connection closed with {} exchanges in flight", failed);
        } else {
            info!("connection closed");
        }
    }

    fn fail_everything(&self, previous: LifecycleState, make_err: impl Fn() -> MuxError) -> usize {
        let mut failed = 0usize;
        if let LifecycleState::Handshaking { pending } = previous {
            for exchange in pending {
                if !exchange.link.is_cancelled() {
                    exchange.link.emit(ExchangeEvent::Failed(make_err()));
                    failed += 1;
                }
            }
        }
        for (stream_id, entry) in self.table.drain() {
            if let Some(body) = entry.body.as_ref() {
                body.fail(format!("stream {} closed with connection", stream_id));
            }
            entry.emit(ExchangeEvent::Failed(make_err()));
            failed += 1;
        }
        failed
    }

    /// Apply peer SETTINGS; the first one makes the connection ready and flushes the queue.
    pub(crate) fn on_settings(&self, settings: &Settings) {
        self.writer
            .set_max_frame_size(settings.max_frame_size as usize);
        self.peer_push_enabled
            .store(settings.enable_push, Ordering::SeqCst);

        let mut state = self.lock();
        let LifecycleState::Handshaking { pending } = &mut *state else {
            return;
        };
        let pending = std::mem::take(pending);
        *state = LifecycleState::Ready;
        self.publish(&state);
        info!("connection ready; flushing {} queued exchanges", pending.len());

        let mut pending = pending.into_iter();
        for exchange in pending.by_ref() {
            if exchange.link.is_cancelled() {
                debug!("skipping cancelled exchange at flush");
                continue;
            }
            if let Err(err) = self
                .writer
                .write_request(exchange.link, &exchange.headers, exchange.body)
            {
                let exhausted = match err {
                    MuxError::Codec(_) => false,
                    MuxError::StreamIdsExhausted => true,
                    _ => {
                        warn!("queued exchange failed at flush: {}", err);
                        continue;
                    }
                };
                drop(state);
                self.escalate(&err);
                for rest in pending.filter(|rest| !rest.link.is_cancelled()) {
                    let err = if exhausted {
                        MuxError::StreamIdsExhausted
                    } else {
                        MuxError::TransportClosed
                    };
                    rest.link.emit(ExchangeEvent::Failed(err));
                }
                return;
            }
        }
    }

    /// Peer GOAWAY: refuse new streams, fail the ones it will never process,
    /// and let the rest finish.
    pub(crate) fn on_go_away(&self, last_stream_id: StreamId, code: ErrorCode) {
        let mut state = self.lock();
        if matches!(*state, LifecycleState::Closed) {
            return;
        }
        let previous = std::mem::replace(&mut *state, LifecycleState::Draining { last_stream_id });
        self.publish(&state);
        drop(state);
        info!(
            "peer sent goaway last_stream_id={} code={}; draining {} streams ({} pushed)",
            last_stream_id,
            code,
            self.table.len(),
            self.table.push_link_count()
        );

        if let LifecycleState::Handshaking { pending } = previous {
            for exchange in pending {
                exchange
                    .link
                    .emit(ExchangeEvent::Failed(MuxError::GoingAway { last_stream_id }));
            }
        }

        let role = self.role;
        for stream_id in self
            .table
            .stream_ids_where(|id| !is_peer_initiated(role, id) && id > last_stream_id)
        {
            if let Some(entry) = self.table.remove(stream_id) {
                debug!("stream {}: not processed by peer; failing as retryable", stream_id);
                if let Some(body) = entry.body.as_ref() {
                    body.fail(format!("stream {} refused by goaway", stream_id));
                }
                entry.emit(ExchangeEvent::Failed(MuxError::GoingAway { last_stream_id }));
            }
        }
        for stream_id in self.table.stream_ids_where(|_| true) {
            self.table.with_entry(stream_id, |entry| {
                check_stream_invariants(entry, stream_id, "goaway");
                entry.emit(ExchangeEvent::ConnectionClosing {
                    last_stream_id,
                    code,
                })
            });
        }
        self.finish_draining();
    }

    /// Close a draining connection once its last stream is gone.
    pub(crate) fn finish_draining(&self) -> bool {
        let mut state = self.lock();
        if !matches!(*state, LifecycleState::Draining { .. }) || !self.table.is_empty() {
            return false;
        }
        *state = LifecycleState::Closed;
        self.publish(&state);
        info!("drained all streams; connection closed");
        true
    }

    /// Our stream ids ran out: announce GOAWAY and drain, letting open streams finish.
    fn go_away_locally(&self) {
        let last_stream_id = self.last_peer_stream_id.load(Ordering::SeqCst);
        let mut state = self.lock();
        if matches!(
            *state,
            LifecycleState::Draining { .. } | LifecycleState::Closed
        ) {
            return;
        }
        warn!(
            "stream ids exhausted; sending goaway last_stream_id={} with {} streams open",
            last_stream_id,
            self.table.len()
        );
        let written = self
            .writer
            .write_connection_terminate(last_stream_id, ErrorCode::NoError);
        let previous = std::mem::replace(
            &mut *state,
            LifecycleState::Draining {
                last_stream_id: self.writer.last_local_stream_id(),
            },
        );
        self.publish(&state);
        drop(state);
        if let LifecycleState::Handshaking { pending } = previous {
            for exchange in pending {
                if !exchange.link.is_cancelled() {
                    exchange
                        .link
                        .emit(ExchangeEvent::Failed(MuxError::StreamIdsExhausted));
                }
            }
        }
        if let Err(err) = written {
            self.escalate(&err);
        }
        self.finish_draining();
    }

    fn escalate(&self, err: &MuxError) {
        match err {
            MuxError::Codec(_) => {
                let _ = self.fatal_tx.send(MuxError::TransportClosed);
            }
            MuxError::StreamIdsExhausted => self.go_away_locally(),
            _ => {}
        }
    }
}
