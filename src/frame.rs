//! Decoded HTTP/2 frames as seen by the multiplexer, and the encoder seam.
//!
//! Byte-level framing and HPACK live in the codec behind [`FrameEncoder`];
//! this module only models what crosses that boundary.

use bytes::Bytes;
use std::fmt;
use std::io;

/// HTTP/2 stream identifier. Stream 0 is the connection itself.
pub type StreamId = u32;

/// Largest stream identifier representable on the wire (31 bits).
pub const MAX_STREAM_ID: StreamId = 0x7fff_ffff;

pub const MIN_MAX_FRAME_SIZE: u32 = 16_384;
pub const MAX_MAX_FRAME_SIZE: u32 = 16_777_215;
pub const MAX_INITIAL_WINDOW_SIZE: u32 = 0x7fff_ffff;

/// HTTP/2 error codes (RFC 9113 §7).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    NoError,
    ProtocolError,
    InternalError,
    FlowControlError,
    SettingsTimeout,
    StreamClosed,
    FrameSizeError,
    RefusedStream,
    Cancel,
    CompressionError,
    ConnectError,
    EnhanceYourCalm,
    InadequateSecurity,
    Http11Required,
    Unknown(u32),
}

impl ErrorCode {
    pub fn code(self) -> u32 {
        match self {
            ErrorCode::NoError => 0x0,
            ErrorCode::ProtocolError => 0x1,
            ErrorCode::InternalError => 0x2,
            ErrorCode::FlowControlError => 0x3,
            ErrorCode::SettingsTimeout => 0x4,
            ErrorCode::StreamClosed => 0x5,
            ErrorCode::FrameSizeError => 0x6,
            ErrorCode::RefusedStream => 0x7,
            ErrorCode::Cancel => 0x8,
            ErrorCode::CompressionError => 0x9,
            ErrorCode::ConnectError => 0xa,
            ErrorCode::EnhanceYourCalm => 0xb,
            ErrorCode::InadequateSecurity => 0xc,
            ErrorCode::Http11Required => 0xd,
            ErrorCode::Unknown(code) => code,
        }
    }
}

impl From<u32> for ErrorCode {
    fn from(code: u32) -> Self {
        match code {
            0x0 => ErrorCode::NoError,
            0x1 => ErrorCode::ProtocolError,
            0x2 => ErrorCode::InternalError,
            0x3 => ErrorCode::FlowControlError,
            0x4 => ErrorCode::SettingsTimeout,
            0x5 => ErrorCode::StreamClosed,
            0x6 => ErrorCode::FrameSizeError,
            0x7 => ErrorCode::RefusedStream,
            0x8 => ErrorCode::Cancel,
            0x9 => ErrorCode::CompressionError,
            0xa => ErrorCode::ConnectError,
            0xb => ErrorCode::EnhanceYourCalm,
            0xc => ErrorCode::InadequateSecurity,
            0xd => ErrorCode::Http11Required,
            other => ErrorCode::Unknown(other),
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorCode::NoError => "NO_ERROR",
            ErrorCode::ProtocolError => "PROTOCOL_ERROR",
            ErrorCode::InternalError => "INTERNAL_ERROR",
            ErrorCode::FlowControlError => "FLOW_CONTROL_ERROR",
            ErrorCode::SettingsTimeout => "SETTINGS_TIMEOUT",
            ErrorCode::StreamClosed => "STREAM_CLOSED",
            ErrorCode::FrameSizeError => "FRAME_SIZE_ERROR",
            ErrorCode::RefusedStream => "REFUSED_STREAM",
            ErrorCode::Cancel => "CANCEL",
            ErrorCode::CompressionError => "COMPRESSION_ERROR",
            ErrorCode::ConnectError => "CONNECT_ERROR",
            ErrorCode::EnhanceYourCalm => "ENHANCE_YOUR_CALM",
            ErrorCode::InadequateSecurity => "INADEQUATE_SECURITY",
            ErrorCode::Http11Required => "HTTP_1_1_REQUIRED",
            ErrorCode::Unknown(code) => return write!(f, "0x{:x}", code),
        };
        f.write_str(name)
    }
}

/// Ordered header list, pseudo headers included.
///
/// Names are kept lowercase; lookups are exact.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers {
    fields: Vec<(String, String)>,
}

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request(method: &str, path: &str) -> Self {
        let mut headers = Self::new();
        headers.push(":method", method);
        headers.push(":path", path);
        headers
    }

    pub fn response(status: u16) -> Self {
        let mut headers = Self::new();
        headers.push(":status", status.to_string());
        headers
    }

    pub fn push(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.fields
            .push((name.into().to_ascii_lowercase(), value.into()));
    }

    pub fn with(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.push(name, value);
        self
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(field, _)| field == name)
            .map(|(_, value)| value.as_str())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn method(&self) -> Option<&str> {
        self.get(":method")
    }

    pub fn path(&self) -> Option<&str> {
        self.get(":path")
    }

    pub fn status(&self) -> Option<u16> {
        self.get(":status").and_then(|value| value.parse().ok())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.fields
            .iter()
            .map(|(name, value)| (name.as_str(), value.as_str()))
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

impl<N: Into<String>, V: Into<String>> FromIterator<(N, V)> for Headers {
    fn from_iter<I: IntoIterator<Item = (N, V)>>(iter: I) -> Self {
        let mut headers = Headers::new();
        for (name, value) in iter {
            headers.push(name, value);
        }
        headers
    }
}

/// Peer SETTINGS values the multiplexer acts on (RFC 9113 §6.5.2).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    pub ack: bool,
    pub header_table_size: u32,
    pub enable_push: bool,
    pub max_concurrent_streams: Option<u32>,
    pub initial_window_size: u32,
    pub max_frame_size: u32,
    pub max_header_list_size: Option<u32>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            ack: false,
            header_table_size: 4096,
            enable_push: true,
            max_concurrent_streams: None,
            initial_window_size: 65_535,
            max_frame_size: MIN_MAX_FRAME_SIZE,
            max_header_list_size: None,
        }
    }
}

impl Settings {
    /// Rejects values a peer is not allowed to announce.
    pub fn validate(&self) -> Result<(), ErrorCode> {
        if !(MIN_MAX_FRAME_SIZE..=MAX_MAX_FRAME_SIZE).contains(&self.max_frame_size) {
            return Err(ErrorCode::ProtocolError);
        }
        if self.initial_window_size > MAX_INITIAL_WINDOW_SIZE {
            return Err(ErrorCode::FlowControlError);
        }
        Ok(())
    }
}

/// A decoded frame, tagged by kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Headers {
        stream_id: StreamId,
        headers: Headers,
        end_stream: bool,
    },
    Data {
        stream_id: StreamId,
        data: Bytes,
        end_stream: bool,
    },
    PushPromise {
        stream_id: StreamId,
        promised_id: StreamId,
        headers: Headers,
    },
    Settings(Settings),
    GoAway {
        last_stream_id: StreamId,
        code: ErrorCode,
    },
    Reset {
        stream_id: StreamId,
        code: ErrorCode,
    },
}

impl Frame {
    /// Stream the frame belongs to; 0 for connection-level frames.
    pub fn stream_id(&self) -> StreamId {
        match self {
            Frame::Headers { stream_id, .. }
            | Frame::Data { stream_id, .. }
            | Frame::PushPromise { stream_id, .. }
            | Frame::Reset { stream_id, .. } => *stream_id,
            Frame::Settings(_) | Frame::GoAway { .. } => 0,
        }
    }

    pub fn is_end_stream(&self) -> bool {
        match self {
            Frame::Headers { end_stream, .. } | Frame::Data { end_stream, .. } => *end_stream,
            _ => false,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Frame::Headers { .. } => "headers",
            Frame::Data { .. } => "data",
            Frame::PushPromise { .. } => "push_promise",
            Frame::Settings(_) => "settings",
            Frame::GoAway { .. } => "goaway",
            Frame::Reset { .. } => "rst_stream",
        }
    }
}

/// Outbound half of the frame codec.
///
/// Calls are serialized by the connection's write context; an implementation
/// never sees two frames interleaved. An `Err` is connection-fatal.
pub trait FrameEncoder: Send {
    fn write_headers(
        &mut self,
        stream_id: StreamId,
        headers: &Headers,
        end_stream: bool,
    ) -> io::Result<()>;

    fn write_data(&mut self, stream_id: StreamId, data: Bytes, end_stream: bool)
        -> io::Result<()>;

    fn write_push_promise(
        &mut self,
        stream_id: StreamId,
        promised_id: StreamId,
        headers: &Headers,
    ) -> io::Result<()>;

    fn write_rst_stream(&mut self, stream_id: StreamId, code: ErrorCode) -> io::Result<()>;

    fn write_go_away(&mut self, last_stream_id: StreamId, code: ErrorCode) -> io::Result<()>;

    /// Push any bytes the codec is still holding (flow-controlled or buffered).
    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
