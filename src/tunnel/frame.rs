//! Wire frames exchanged over a tunnel connection.
//!
//! Each frame is one JSON text WebSocket message tagged by `"type"`:
//!
//! | Type           | Direction        | Fields                                           |
//! |----------------|------------------|--------------------------------------------------|
//! | `request`      | manager → agent  | `id`, `method`, `path`, `headers`, `body`, `stream` |
//! | `response`     | agent → manager  | `id`, `status`, `headers`, `body`                |
//! | `stream_chunk` | both             | `id`, `data`, `text`, `close`                    |
//! | `event`        | agent → manager  | `event`                                          |
//! | `heartbeat`    | both             | `ack`                                            |
//!
//! Bodies and chunk payloads are base64. A `response` is always terminal for
//! its `id`; a stream ends when either side sends a chunk with `close = true`.

use std::collections::HashMap;

use axum::http::HeaderMap;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::{Deserialize, Serialize};

use crate::error::TunnelError;
use crate::events::TunnelEvent;

/// Header map carried in request/response frames. A repeated header such as
/// `set-cookie` keeps one entry per value.
pub type FrameHeaders = HashMap<String, Vec<String>>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Frame {
    Request {
        id: String,
        method: String,
        path: String,
        #[serde(default)]
        headers: FrameHeaders,
        #[serde(default)]
        body: String,
        #[serde(default)]
        stream: bool,
    },
    Response {
        id: String,
        status: u16,
        #[serde(default)]
        headers: FrameHeaders,
        #[serde(default)]
        body: String,
    },
    StreamChunk {
        id: String,
        #[serde(default)]
        data: String,
        #[serde(default)]
        text: bool,
        #[serde(default)]
        close: bool,
    },
    Event {
        event: TunnelEvent,
    },
    Heartbeat {
        #[serde(default)]
        ack: bool,
    },
}

impl Frame {
    pub fn encode(&self) -> String {
        // Frame holds only strings, maps and scalars, none of which can fail.
        serde_json::to_string(self).unwrap_or_default()
    }

    pub fn decode(text: &str) -> Result<Self, TunnelError> {
        serde_json::from_str(text).map_err(|e| TunnelError::InvalidFrame(e.to_string()))
    }

    /// Correlation id for frames that belong to a request, `None` otherwise.
    pub fn correlation_id(&self) -> Option<&str> {
        match self {
            Self::Request { id, .. } | Self::Response { id, .. } | Self::StreamChunk { id, .. } => {
                Some(id)
            }
            Self::Event { .. } | Self::Heartbeat { .. } => None,
        }
    }

    pub fn chunk(id: &str, data: &[u8], text: bool) -> Self {
        Self::StreamChunk {
            id: id.to_string(),
            data: encode_body(data),
            text,
            close: false,
        }
    }

    pub fn close_stream(id: &str) -> Self {
        Self::StreamChunk {
            id: id.to_string(),
            data: String::new(),
            text: false,
            close: true,
        }
    }
}

/// A request as the router sees it, before it is framed.
#[derive(Debug, Clone, Default)]
pub struct ProxyRequest {
    pub method: String,
    pub path: String,
    pub headers: FrameHeaders,
    pub body: Vec<u8>,
}

impl ProxyRequest {
    pub fn into_frame(self, id: &str, stream: bool) -> Frame {
        Frame::Request {
            id: id.to_string(),
            method: self.method,
            path: self.path,
            headers: self.headers,
            body: encode_body(&self.body),
            stream,
        }
    }
}

/// A decoded `response` frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyResponse {
    pub status: u16,
    pub headers: FrameHeaders,
    pub body: Vec<u8>,
}

impl ProxyResponse {
    pub fn from_parts(status: u16, headers: FrameHeaders, body: &str) -> Result<Self, TunnelError> {
        Ok(Self {
            status,
            headers,
            body: decode_body(body)?,
        })
    }
}

pub fn encode_body(data: &[u8]) -> String {
    if data.is_empty() {
        String::new()
    } else {
        STANDARD.encode(data)
    }
}

pub fn decode_body(data: &str) -> Result<Vec<u8>, TunnelError> {
    if data.is_empty() {
        return Ok(Vec::new());
    }
    STANDARD
        .decode(data)
        .map_err(|e| TunnelError::InvalidFrame(format!("bad base64 payload: {e}")))
}

/// Convert an HTTP header map into frame headers. Non-UTF-8 values are skipped.
pub fn headers_to_frame(headers: &HeaderMap) -> FrameHeaders {
    let mut out = FrameHeaders::new();
    for (name, value) in headers {
        let Ok(value) = value.to_str() else { continue };
        out.entry(name.as_str().to_string())
            .or_default()
            .push(value.to_string());
    }
    out
}

/// Every `(name, value)` pair in `headers`, one per value.
pub fn frame_header_pairs(headers: &FrameHeaders) -> impl Iterator<Item = (&str, &str)> {
    headers.iter().flat_map(|(name, values)| {
        values
            .iter()
            .map(move |value| (name.as_str(), value.as_str()))
    })
}
