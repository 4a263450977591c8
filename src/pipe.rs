//! Bounded single-producer / single-consumer byte pipe for message bodies.
//!
//! The producer side either waits for room ([`BodyPipe::produce`]) or is told
//! the pipe is full ([`BodyPipe::try_produce`]); the I/O loop only ever uses the
//! latter so a slow consumer cannot stall other streams. Buffered chunks stay
//! readable after [`BodyPipe::complete`] and [`BodyPipe::fail`], so a consumer
//! that attaches late still drains everything that was accepted.

use crate::error::PipeError;
use bytes::{Bytes, BytesMut};
use std::collections::VecDeque;
use std::future::Future;
use std::io;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::Notify;

pub struct BodyPipe {
    capacity: usize,
    state: Mutex<PipeState>,
    readable: Notify,
    writable: Notify,
}

#[derive(Default)]
struct PipeState {
    chunks: VecDeque<Bytes>,
    buffered: usize,
    produced: u64,
    complete: bool,
    failure: Option<String>,
    consumer_attached: bool,
    consumer_gone: bool,
}

impl PipeState {
    fn check_producible(&self) -> Result<(), PipeError> {
        if self.complete || self.failure.is_some() {
            return Err(PipeError::Completed);
        }
        if self.consumer_gone {
            return Err(PipeError::ConsumerGone);
        }
        Ok(())
    }

    // An empty pipe always admits one chunk so oversized chunks cannot wedge it.
    fn fits(&self, len: usize, capacity: usize) -> bool {
        self.buffered == 0 || self.buffered + len <= capacity
    }

    fn push(&mut self, chunk: Bytes) {
        self.buffered += chunk.len();
        self.produced += chunk.len() as u64;
        self.chunks.push_back(chunk);
    }
}

impl BodyPipe {
    pub fn new(capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            capacity: capacity.max(1),
            state: Mutex::new(PipeState::default()),
            readable: Notify::new(),
            writable: Notify::new(),
        })
    }

    fn lock(&self) -> MutexGuard<'_, PipeState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn buffered(&self) -> usize {
        self.lock().buffered
    }

    /// Total bytes accepted from the producer.
    pub fn produced(&self) -> u64 {
        self.lock().produced
    }

    pub fn is_complete(&self) -> bool {
        self.lock().complete
    }

    /// Append `chunk`, waiting while the pipe is at capacity.
    pub async fn produce(&self, chunk: Bytes) -> Result<(), PipeError> {
        if chunk.is_empty() {
            return self.lock().check_producible();
        }
        loop {
            {
                let mut state = self.lock();
                state.check_producible()?;
                if state.fits(chunk.len(), self.capacity) {
                    state.push(chunk);
                    drop(state);
                    self.readable.notify_one();
                    return Ok(());
                }
            }
            self.writable.notified().await;
        }
    }

    /// Append `chunk` without waiting; a full pipe is reported, not buffered.
    pub fn try_produce(&self, chunk: Bytes) -> Result<(), PipeError> {
        let mut state = self.lock();
        state.check_producible()?;
        if chunk.is_empty() {
            return Ok(());
        }
        if !state.fits(chunk.len(), self.capacity) {
            return Err(PipeError::Full {
                buffered: state.buffered,
                capacity: self.capacity,
            });
        }
        state.push(chunk);
        drop(state);
        self.readable.notify_one();
        Ok(())
    }

    /// Mark the end of the body. Later `produce` calls are rejected.
    pub fn complete(&self) {
        let mut state = self.lock();
        if state.failure.is_none() {
            state.complete = true;
        }
        drop(state);
        self.readable.notify_one();
    }

    /// Abort the transfer. The consumer still reads what was already buffered,
    /// then sees the failure.
    pub fn fail(&self, reason: impl Into<String>) {
        let mut state = self.lock();
        if !state.complete && state.failure.is_none() {
            state.failure = Some(reason.into());
        }
        drop(state);
        self.readable.notify_one();
        self.writable.notify_one();
    }

    /// Bind the single consumer of this pipe. A second call is a usage error.
    pub fn attach_consumer(self: &Arc<Self>) -> Result<PipeConsumer, PipeError> {
        let mut state = self.lock();
        if state.consumer_attached {
            return Err(PipeError::ConsumerAlreadyAttached);
        }
        state.consumer_attached = true;
        Ok(PipeConsumer {
            pipe: Arc::clone(self),
            consumed: 0,
        })
    }
}

/// Destination for a drained body. Writes may suspend.
pub trait BodySink {
    fn write_chunk(&mut self, chunk: Bytes) -> impl Future<Output = io::Result<()>> + Send;
}

impl BodySink for Vec<u8> {
    async fn write_chunk(&mut self, chunk: Bytes) -> io::Result<()> {
        self.extend_from_slice(&chunk);
        Ok(())
    }
}

impl BodySink for BytesMut {
    async fn write_chunk(&mut self, chunk: Bytes) -> io::Result<()> {
        self.extend_from_slice(&chunk);
        Ok(())
    }
}

/// Reading end of a [`BodyPipe`].
pub struct PipeConsumer {
    pipe: Arc<BodyPipe>,
    consumed: u64,
}

impl std::fmt::Debug for PipeConsumer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipeConsumer")
            .field("capacity", &self.pipe.capacity)
            .field("consumed", &self.consumed)
            .finish()
    }
}

impl PipeConsumer {
    /// Next chunk in production order; `None` once the pipe is complete and drained.
    pub async fn next_chunk(&mut self) -> Option<Result<Bytes, PipeError>> {
        loop {
            {
                let mut state = self.pipe.lock();
                if let Some(chunk) = state.chunks.pop_front() {
                    state.buffered -= chunk.len();
                    drop(state);
                    self.consumed += chunk.len() as u64;
                    self.pipe.writable.notify_one();
                    return Some(Ok(chunk));
                }
                if let Some(reason) = state.failure.as_ref() {
                    return Some(Err(PipeError::Failed(reason.clone())));
                }
                if state.complete {
                    return None;
                }
            }
            self.pipe.readable.notified().await;
        }
    }

    /// Drain the whole body into `sink`, returning the number of bytes written.
    pub async fn consume<S: BodySink>(&mut self, sink: &mut S) -> Result<u64, PipeError> {
        let mut written = 0u64;
        while let Some(chunk) = self.next_chunk().await {
            let chunk = chunk?;
            let len = chunk.len() as u64;
            if let Err(err) = sink.write_chunk(chunk).await {
                self.pipe.fail(err.to_string());
                return Err(PipeError::Failed(err.to_string()));
            }
            written += len;
        }
        Ok(written)
    }

    pub async fn read_to_end(&mut self) -> Result<Bytes, PipeError> {
        let mut body = BytesMut::new();
        self.consume(&mut body).await?;
        Ok(body.freeze())
    }

    pub fn consumed(&self) -> u64 {
        self.consumed
    }
}

impl Drop for PipeConsumer {
    fn drop(&mut self) {
        let mut state = self.pipe.lock();
        state.consumer_gone = true;
        state.chunks.clear();
        state.buffered = 0;
        drop(state);
        self.pipe.writable.notify_one();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::{sleep, timeout, Duration};

    fn runtime() -> tokio::runtime::Runtime {
        tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()
            .expect("build tokio runtime")
    }

    #[test]
    fn second_consumer_is_rejected() {
        let pipe = BodyPipe::new(16);
        let _consumer = pipe.attach_consumer().expect("first attach");
        assert!(matches!(
            pipe.attach_consumer(),
            Err(PipeError::ConsumerAlreadyAttached)
        ));
    }

    #[test]
    fn produce_after_complete_is_rejected() {
        let pipe = BodyPipe::new(16);
        pipe.try_produce(Bytes::from_static(b"abc")).expect("produce");
        pipe.complete();
        assert_eq!(
            pipe.try_produce(Bytes::from_static(b"def")),
            Err(PipeError::Completed)
        );
        let rt = runtime();
        rt.block_on(async {
            assert_eq!(
                pipe.produce(Bytes::from_static(b"def")).await,
                Err(PipeError::Completed)
            );
        });
    }

    #[test]
    fn try_produce_reports_full_without_buffering() {
        let pipe = BodyPipe::new(4);
        pipe.try_produce(Bytes::from_static(b"abc")).expect("first chunk");
        assert_eq!(
            pipe.try_produce(Bytes::from_static(b"de")),
            Err(PipeError::Full {
                buffered: 3,
                capacity: 4
            })
        );
        assert_eq!(pipe.buffered(), 3);
    }

    #[test]
    fn oversized_chunk_is_admitted_into_empty_pipe() {
        let pipe = BodyPipe::new(2);
        pipe.try_produce(Bytes::from_static(b"abcdef"))
            .expect("empty pipe admits one chunk");
        assert_eq!(pipe.buffered(), 6);
    }

    #[test]
    fn late_consumer_drains_completed_pipe() {
        let rt = runtime();
        rt.block_on(async {
            let pipe = BodyPipe::new(64);
            pipe.produce(Bytes::from_static(b"hello ")).await.unwrap();
            pipe.produce(Bytes::from_static(b"world")).await.unwrap();
            pipe.complete();

            let mut consumer = pipe.attach_consumer().unwrap();
            let body = consumer.read_to_end().await.unwrap();
            assert_eq!(&body[..], b"hello world");
            assert_eq!(consumer.consumed(), 11);
        });
    }

    #[test]
    fn slow_consumer_throttles_producer_without_loss() {
        let rt = runtime();
        rt.block_on(async {
            let capacity = 10;
            let pipe = BodyPipe::new(capacity);
            let mut consumer = pipe.attach_consumer().unwrap();

            let expected: Vec<u8> = (0..200u32).map(|i| (i % 251) as u8).collect();
            let chunks: Vec<Bytes> = expected
                .chunks(7)
                .map(|chunk| Bytes::copy_from_slice(chunk))
                .collect();

            let producer_pipe = Arc::clone(&pipe);
            let producer = tokio::spawn(async move {
                let mut max_buffered = 0;
                for chunk in chunks {
                    producer_pipe.produce(chunk).await.expect("produce");
                    max_buffered = max_buffered.max(producer_pipe.buffered());
                }
                producer_pipe.complete();
                max_buffered
            });

            let mut received = Vec::new();
            while let Some(chunk) = consumer.next_chunk().await {
                received.extend_from_slice(&chunk.unwrap());
                sleep(Duration::from_millis(1)).await;
            }

            let max_buffered = producer.await.expect("producer task");
            assert_eq!(received, expected);
            assert!(
                max_buffered <= capacity,
                "pipe grew to {} bytes past capacity {}",
                max_buffered,
                capacity
            );
        });
    }

    #[test]
    fn producer_blocks_while_full() {
        let rt = runtime();
        rt.block_on(async {
            let pipe = BodyPipe::new(4);
            let _consumer = pipe.attach_consumer().unwrap();
            pipe.produce(Bytes::from_static(b"abcd")).await.unwrap();
            let blocked = timeout(
                Duration::from_millis(50),
                pipe.produce(Bytes::from_static(b"e")),
            )
            .await;
            assert!(blocked.is_err(), "expected producer to wait for room");
        });
    }

    #[test]
    fn failure_reaches_consumer_and_unblocks_producer() {
        let rt = runtime();
        rt.block_on(async {
            let pipe = BodyPipe::new(4);
            let mut consumer = pipe.attach_consumer().unwrap();
            pipe.produce(Bytes::from_static(b"abcd")).await.unwrap();

            let producer_pipe = Arc::clone(&pipe);
            let producer =
                tokio::spawn(async move { producer_pipe.produce(Bytes::from_static(b"e")).await });
            sleep(Duration::from_millis(10)).await;
            pipe.fail("upstream reset");

            let result = timeout(Duration::from_secs(1), producer)
                .await
                .expect("producer should wake")
                .expect("producer task");
            assert_eq!(result, Err(PipeError::Completed));
            assert_eq!(
                consumer.next_chunk().await,
                Some(Ok(Bytes::from_static(b"abcd")))
            );
            assert!(matches!(
                consumer.next_chunk().await,
                Some(Err(PipeError::Failed(reason))) if reason == "upstream reset"
            ));
        });
    }

    #[test]
    fn dropped_consumer_is_reported_to_producer() {
        let pipe = BodyPipe::new(4);
        let consumer = pipe.attach_consumer().unwrap();
        drop(consumer);
        assert_eq!(
            pipe.try_produce(Bytes::from_static(b"x")),
            Err(PipeError::ConsumerGone)
        );
    }

    struct ClosedSink;

    impl BodySink for ClosedSink {
        async fn write_chunk(&mut self, _chunk: Bytes) -> io::Result<()> {
            Err(io::Error::new(io::ErrorKind::BrokenPipe, "sink closed"))
        }
    }

    #[test]
    fn consume_runs_on_a_spawned_task() {
        let rt = runtime();
        rt.block_on(async {
            let pipe = BodyPipe::new(8);
            let mut consumer = pipe.attach_consumer().unwrap();
            let drain = tokio::spawn(async move {
                let mut sink = Vec::new();
                let written = consumer.consume(&mut sink).await;
                (written, sink)
            });
            for chunk in [&b"spawned "[..], &b"sink"[..]] {
                pipe.produce(Bytes::copy_from_slice(chunk)).await.unwrap();
            }
            pipe.complete();

            let (written, sink) = timeout(Duration::from_secs(1), drain)
                .await
                .expect("drain finishes")
                .expect("drain task");
            assert_eq!(written, Ok(12));
            assert_eq!(sink, b"spawned sink");
        });
    }

    #[test]
    fn sink_error_fails_the_pipe() {
        let rt = runtime();
        rt.block_on(async {
            let pipe = BodyPipe::new(8);
            let mut consumer = pipe.attach_consumer().unwrap();
            pipe.try_produce(Bytes::from_static(b"abc")).unwrap();
            pipe.complete();
            assert!(matches!(
                consumer.consume(&mut ClosedSink).await,
                Err(PipeError::Failed(reason)) if reason == "sink closed"
            ));
        });
    }
}
