use crate::dispatcher::InboundDispatcher;
use crate::error::MuxError;
use crate::frame::Frame;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Drive one connection: dispatch decoded frames in arrival order until the
/// connection closes.
///
/// Returns `Ok(())` when the connection closed cleanly (drained, terminated,
/// or the frame source ended with nothing in flight). The connection consumer
/// always receives a final [`ConnectionEvent::Closed`](crate::ConnectionEvent::Closed).
pub async fn drive(
    mut dispatcher: InboundDispatcher,
    mut frames: mpsc::UnboundedReceiver<Frame>,
) -> Result<(), MuxError> {
    let table = dispatcher.table();
    let mut state_rx = dispatcher.lifecycle().subscribe();
    let Some(mut fatal_rx) = dispatcher.take_fatal_rx() else {
        return Err(MuxError::Closed);
    };
    let mut frames_seen = 0u64;

    let result = loop {
        if dispatcher.is_closed() {
            break Ok(());
        }
        tokio::select! {
            frame = frames.recv() => {
                let Some(frame) = frame else {
                    if table.is_empty() {
                        info!("frame source ended after {} frames; closing", frames_seen);
                        dispatcher.lifecycle().close(|| MuxError::TransportClosed);
                        break Ok(());
                    }
                    warn!(
                        "frame source ended with {} streams open",
                        table.len()
                    );
                    dispatcher.fail_connection(&MuxError::TransportClosed);
                    break Err(MuxError::TransportClosed);
                };
                frames_seen = frames_seen.saturating_add(1);
                if let Err(err) = dispatcher.dispatch(frame) {
                    dispatcher.fail_connection(&err);
                    break Err(err);
                }
                dispatcher.check_invariants();
            }
            fatal = fatal_rx.recv() => {
                if let Some(err) = fatal {
                    warn!("outbound write failed: {}", err);
                    dispatcher.fail_connection(&err);
                    break Err(err);
                }
            }
            _ = table.emptied() => {
                if dispatcher.lifecycle().finish_draining() {
                    debug!("last stream closed while draining");
                }
            }
            changed = state_rx.changed() => {
                if changed.is_err() {
                    break Ok(());
                }
            }
        }
    };

    let error = match &result {
        Ok(()) => None,
        Err(MuxError::Protocol(reason)) => Some(MuxError::Protocol(reason.clone())),
        Err(_) => Some(MuxError::TransportClosed),
    };
    dispatcher.notify_closed(error);
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::ChannelEncoder;
    use crate::config::MuxConfig;
    use crate::connection::{ChannelConsumer, ConnectionEvent, MuxBuilder};
    use crate::frame::{ErrorCode, Headers, Settings};
    use crate::lifecycle::ConnectionState;
    use crate::streams::ExchangeEvent;
    use tokio::time::{timeout, Duration};

    fn runtime() -> tokio::runtime::Runtime {
        tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()
            .expect("build tokio runtime")
    }

    #[test]
    fn drains_after_goaway_then_closes() {
        let rt = runtime();
        rt.block_on(async {
            let (encoder, _written) = ChannelEncoder::new();
            let (consumer, mut events) = ChannelConsumer::new(false);
            let (mux, dispatcher) = MuxBuilder::new(MuxConfig::client())
                .consumer(consumer)
                .bind(encoder)
                .unwrap();
            let (frames_tx, frames_rx) = mpsc::unbounded_channel();
            let driver = tokio::spawn(drive(dispatcher, frames_rx));

            let mut exchange = mux.request(Headers::request("GET", "/a"), None).unwrap();
            frames_tx.send(Frame::Settings(Settings::default())).unwrap();
            frames_tx
                .send(Frame::GoAway {
                    last_stream_id: 1,
                    code: ErrorCode::NoError,
                })
                .unwrap();
            frames_tx
                .send(Frame::Headers {
                    stream_id: 1,
                    headers: Headers::response(200),
                    end_stream: true,
                })
                .unwrap();

            let result = timeout(Duration::from_secs(1), driver)
                .await
                .expect("driver finishes")
                .expect("driver task");
            assert!(result.is_ok());
            assert_eq!(mux.state(), ConnectionState::Closed);

            assert!(matches!(
                exchange.next_event().await,
                Some(ExchangeEvent::ConnectionClosing { .. })
            ));
            assert!(matches!(
                exchange.next_event().await,
                Some(ExchangeEvent::Headers { .. })
            ));
            let last = std::iter::from_fn(|| events.try_recv().ok()).last();
            assert!(matches!(last, Some(ConnectionEvent::Closed { error: None })));
        });
    }

    #[test]
    fn lost_transport_fails_open_exchanges() {
        let rt = runtime();
        rt.block_on(async {
            let (encoder, _written) = ChannelEncoder::new();
            let (consumer, _events) = ChannelConsumer::new(false);
            let (mux, dispatcher) = MuxBuilder::new(MuxConfig::client())
                .consumer(consumer)
                .bind(encoder)
                .unwrap();
            let (frames_tx, frames_rx) = mpsc::unbounded_channel();
            frames_tx.send(Frame::Settings(Settings::default())).unwrap();
            let driver = tokio::spawn(drive(dispatcher, frames_rx));

            let mut exchange = mux.request(Headers::request("GET", "/a"), None).unwrap();
            tokio::task::yield_now().await;
            drop(frames_tx);

            let result = timeout(Duration::from_secs(1), driver)
                .await
                .expect("driver finishes")
                .expect("driver task");
            assert!(matches!(result, Err(MuxError::TransportClosed)));
            match exchange.next_event().await {
                Some(ExchangeEvent::Failed(err)) => assert!(err.is_retryable()),
                other => panic!("unexpected event {:?}", other),
            }
        });
    }

    #[test]
    fn local_terminate_stops_the_driver() {
        let rt = runtime();
        rt.block_on(async {
            let (encoder, _written) = ChannelEncoder::new();
            let (consumer, _events) = ChannelConsumer::new(false);
            let (mux, dispatcher) = MuxBuilder::new(MuxConfig::client())
                .consumer(consumer)
                .bind(encoder)
                .unwrap();
            let (_frames_tx, frames_rx) = mpsc::unbounded_channel();
            let driver = tokio::spawn(drive(dispatcher, frames_rx));
            tokio::task::yield_now().await;

            mux.shutdown(ErrorCode::NoError).unwrap();
            let result = timeout(Duration::from_secs(1), driver)
                .await
                .expect("driver finishes")
                .expect("driver task");
            assert!(result.is_ok());
        });
    }
}
