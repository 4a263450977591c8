//! In-memory frame codec.
//!
//! [`ChannelEncoder`] turns encoder calls back into [`Frame`] values on a tokio
//! channel. Two of them wired crosswise ([`loopback`]) give a client and a
//! server multiplexer a shared "connection" without any byte framing.

use crate::frame::{ErrorCode, Frame, FrameEncoder, Headers, Settings, StreamId};
use bytes::Bytes;
use std::io;
use tokio::sync::mpsc;

pub struct ChannelEncoder {
    frames_tx: mpsc::UnboundedSender<Frame>,
    frames_written: u64,
}

impl ChannelEncoder {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Frame>) {
        let (frames_tx, frames_rx) = mpsc::unbounded_channel();
        (
            Self {
                frames_tx,
                frames_written: 0,
            },
            frames_rx,
        )
    }

    pub fn frames_written(&self) -> u64 {
        self.frames_written
    }

    fn send(&mut self, frame: Frame) -> io::Result<()> {
        self.frames_tx
            .send(frame)
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "peer frame channel closed"))?;
        self.frames_written = self.frames_written.saturating_add(1);
        Ok(())
    }
}

impl FrameEncoder for ChannelEncoder {
    fn write_headers(
        &mut self,
        stream_id: StreamId,
        headers: &Headers,
        end_stream: bool,
    ) -> io::Result<()> {
        self.send(Frame::Headers {
            stream_id,
            headers: headers.clone(),
            end_stream,
        })
    }

    fn write_data(&mut self, stream_id: StreamId, data: Bytes, end_stream: bool) -> io::Result<()> {
        self.send(Frame::Data {
            stream_id,
            data,
            end_stream,
        })
    }

    fn write_push_promise(
        &mut self,
        stream_id: StreamId,
        promised_id: StreamId,
        headers: &Headers,
    ) -> io::Result<()> {
        self.send(Frame::PushPromise {
            stream_id,
            promised_id,
            headers: headers.clone(),
        })
    }

    fn write_rst_stream(&mut self, stream_id: StreamId, code: ErrorCode) -> io::Result<()> {
        self.send(Frame::Reset { stream_id, code })
    }

    fn write_go_away(&mut self, last_stream_id: StreamId, code: ErrorCode) -> io::Result<()> {
        self.send(Frame::GoAway {
            last_stream_id,
            code,
        })
    }
}

/// One side of a loopback connection.
pub struct LoopbackEnd {
    pub encoder: ChannelEncoder,
    /// Frames written by the other side, starting with its SETTINGS.
    pub frames: mpsc::UnboundedReceiver<Frame>,
}

/// Two connected ends. Each end's frame stream opens with the peer's SETTINGS,
/// standing in for the handshake a byte-level codec performs.
pub fn loopback(client_settings: Settings, server_settings: Settings) -> (LoopbackEnd, LoopbackEnd) {
    let (client_encoder, to_server) = ChannelEncoder::new();
    let (server_encoder, to_client) = ChannelEncoder::new();
    let _ = client_encoder
        .frames_tx
        .send(Frame::Settings(client_settings));
    let _ = server_encoder
        .frames_tx
        .send(Frame::Settings(server_settings));
    (
        LoopbackEnd {
            encoder: client_encoder,
            frames: to_client,
        },
        LoopbackEnd {
            encoder: server_encoder,
            frames: to_server,
        },
    )
}
