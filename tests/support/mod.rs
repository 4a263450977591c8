#![allow(dead_code)]

use std::time::Duration;

use h2mux::codec::ChannelEncoder;
use h2mux::{
    ChannelConsumer, ConnectionEvent, ExchangeEvent, ExchangeHandle, Frame, InboundDispatcher,
    MuxBuilder, MuxConfig, MuxHandle, Settings,
};
use tokio::sync::mpsc;
use tokio::time::timeout;

pub const FRAME_TIMEOUT: Duration = Duration::from_secs(2);

/// A multiplexer bound to an in-memory encoder; the test plays the peer by
/// feeding frames to the dispatcher and reading what was written.
pub struct Bound {
    pub mux: MuxHandle,
    pub dispatcher: InboundDispatcher,
    pub written: mpsc::UnboundedReceiver<Frame>,
    pub events: mpsc::UnboundedReceiver<ConnectionEvent>,
}

impl Bound {
    pub fn new(config: MuxConfig, accept_push: bool) -> Self {
        let (encoder, written) = ChannelEncoder::new();
        let (consumer, events) = ChannelConsumer::new(accept_push);
        let (mux, dispatcher) = MuxBuilder::new(config)
            .consumer(consumer)
            .bind(encoder)
            .expect("bind multiplexer");
        Self {
            mux,
            dispatcher,
            written,
            events,
        }
    }

    /// Bound and past the handshake.
    pub fn ready(config: MuxConfig, accept_push: bool) -> Self {
        let mut bound = Self::new(config, accept_push);
        bound.peer(Frame::Settings(Settings::default()));
        bound
    }

    pub fn peer(&mut self, frame: Frame) {
        self.dispatcher.dispatch(frame).expect("dispatch peer frame");
    }

    pub async fn next_written(&mut self) -> Frame {
        timeout(FRAME_TIMEOUT, self.written.recv())
            .await
            .expect("timed out waiting for a written frame")
            .expect("encoder channel closed")
    }

    pub fn drain_written(&mut self) -> Vec<Frame> {
        std::iter::from_fn(|| self.written.try_recv().ok()).collect()
    }
}

pub fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_time()
        .build()
        .expect("build tokio runtime")
}

pub fn pending_events(exchange: &mut ExchangeHandle) -> Vec<ExchangeEvent> {
    std::iter::from_fn(|| exchange.try_next_event()).collect()
}

pub fn event_names(events: &[ExchangeEvent]) -> Vec<&'static str> {
    events
        .iter()
        .map(|event| match event {
            ExchangeEvent::Headers { .. } => "headers",
            ExchangeEvent::Data { .. } => "data",
            ExchangeEvent::PushOffered { .. } => "push_offered",
            ExchangeEvent::StreamEnded => "stream_ended",
            ExchangeEvent::StreamReset { .. } => "stream_reset",
            ExchangeEvent::ConnectionClosing { .. } => "connection_closing",
            ExchangeEvent::Failed(_) => "failed",
        })
        .collect()
}
