//! Edge agent — the outbound side of the tunnel.
//!
//! Dials the manager's `/api/tunnel/connect` with its bearer token, keeps the
//! connection alive with heartbeats, and serves `request` frames against the
//! agent's local API. Streaming requests are bridged to the local WebSocket
//! endpoint chunk by chunk. Reconnects with exponential backoff.

use std::collections::HashMap;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use serde_json::json;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::{client::IntoClientRequest, Message};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::frame::{
    decode_body, encode_body, frame_header_pairs, headers_to_frame, Frame, FrameHeaders,
};
use crate::config::AgentConfig;
use crate::proxy::ws::websocket_url;

type AgentError = Box<dyn std::error::Error + Send + Sync>;

/// Buffered chunks per local stream bridge.
const STREAM_BUFFER: usize = 256;

/// Outbound frames queued for the manager.
const OUTBOUND_QUEUE: usize = 256;

/// Input to a local stream bridge from the manager side.
struct StreamInput {
    data: Vec<u8>,
    text: bool,
}

#[derive(Clone)]
pub struct EdgeAgent {
    config: AgentConfig,
    manager_url: String,
    http: reqwest::Client,
}

impl EdgeAgent {
    pub fn new(config: AgentConfig) -> Result<Self, AgentError> {
        let manager_url = config
            .manager_url
            .clone()
            .ok_or("agent.manager_url is not configured")?;
        if config.token.is_empty() {
            return Err("agent.token is not configured".into());
        }
        let http = reqwest::Client::builder().build()?;
        Ok(Self {
            config,
            manager_url,
            http,
        })
    }

    pub fn spawn(self, cancel: CancellationToken) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move { self.run(cancel).await })
    }

    /// Connect, serve, reconnect until `cancel` fires.
    pub async fn run(&self, cancel: CancellationToken) {
        let base_delay = Duration::from_secs(self.config.reconnect_delay_secs.max(1));
        let max_delay = Duration::from_secs(self.config.reconnect_max_delay_secs.max(1));
        let mut delay = base_delay;

        loop {
            info!("Tunnel: connecting to manager at {}", self.manager_url);
            match self.connect_and_run(&cancel).await {
                Ok(()) => {
                    info!("Tunnel: connection closed, reconnecting...");
                    delay = base_delay;
                }
                Err(e) => {
                    warn!(
                        "Tunnel: connection error: {e}, reconnecting in {}s",
                        delay.as_secs()
                    );
                }
            }
            if cancel.is_cancelled() {
                break;
            }
            tokio::select! {
                () = cancel.cancelled() => break,
                () = tokio::time::sleep(delay) => {}
            }
            delay = next_delay(delay, max_delay);
        }
        info!("Tunnel: agent stopped");
    }

    /// A single connection: authenticate, serve frames until disconnect.
    async fn connect_and_run(&self, cancel: &CancellationToken) -> Result<(), AgentError> {
        let mut request = self.manager_url.as_str().into_client_request()?;
        request.headers_mut().insert(
            "authorization",
            format!("Bearer {}", self.config.token).parse()?,
        );
        let (ws, _response) = tokio_tungstenite::connect_async(request).await?;
        let (mut ws_sink, mut ws_stream) = ws.split();
        info!("Tunnel: connected to manager");

        // Single writer: every task queues frames here.
        let (tx, mut rx) = mpsc::channel::<Frame>(OUTBOUND_QUEUE);
        let writer = tokio::spawn(async move {
            while let Some(frame) = rx.recv().await {
                if ws_sink.send(Message::text(frame.encode())).await.is_err() {
                    break;
                }
            }
            let _ = ws_sink.close().await;
        });

        let heartbeat_tx = tx.clone();
        let heartbeat_interval = Duration::from_secs(self.config.heartbeat_interval_secs.max(1));
        let heartbeat = tokio::spawn(async move {
            let mut interval = tokio::time::interval(heartbeat_interval);
            loop {
                interval.tick().await;
                if heartbeat_tx.send(Frame::Heartbeat { ack: false }).await.is_err() {
                    break;
                }
            }
        });

        let mut streams: HashMap<String, mpsc::Sender<StreamInput>> = HashMap::new();
        let result = loop {
            let msg = tokio::select! {
                () = cancel.cancelled() => break Ok(()),
                msg = ws_stream.next() => msg,
            };
            let Some(msg) = msg else { break Ok(()) };
            let text = match msg {
                Ok(Message::Text(text)) => text,
                Ok(Message::Close(_)) => break Ok(()),
                Ok(_) => continue,
                Err(e) => break Err(e.into()),
            };
            let frame = match Frame::decode(text.as_str()) {
                Ok(frame) => frame,
                Err(e) => {
                    warn!("Tunnel: dropping malformed frame: {e}");
                    continue;
                }
            };
            streams.retain(|_, input| !input.is_closed());
            self.handle_frame(frame, &tx, &mut streams);
        };

        heartbeat.abort();
        writer.abort();
        result
    }

    fn handle_frame(
        &self,
        frame: Frame,
        tx: &mpsc::Sender<Frame>,
        streams: &mut HashMap<String, mpsc::Sender<StreamInput>>,
    ) {
        match frame {
            Frame::Request {
                id,
                method,
                path,
                headers,
                body,
                stream: false,
            } => {
                let agent = self.clone();
                let tx = tx.clone();
                tokio::spawn(async move {
                    let response = agent.forward_local(&id, &method, &path, &headers, &body).await;
                    let _ = tx.send(response).await;
                });
            }
            Frame::Request {
                id,
                path,
                headers,
                stream: true,
                ..
            } => {
                let (input_tx, input_rx) = mpsc::channel(STREAM_BUFFER);
                streams.insert(id.clone(), input_tx);
                let local_url = self.config.local_url.clone();
                let tx = tx.clone();
                tokio::spawn(bridge_local(local_url, id, path, headers, input_rx, tx));
            }
            Frame::StreamChunk {
                id,
                data,
                text,
                close,
            } => {
                if close {
                    // Dropping the sender ends the bridge.
                    streams.remove(&id);
                    return;
                }
                let Some(input) = streams.get(&id) else {
                    debug!(stream_id = %id, "Tunnel: chunk for unknown stream");
                    return;
                };
                match decode_body(&data) {
                    Ok(data) => {
                        if input.try_send(StreamInput { data, text }).is_err() {
                            debug!(stream_id = %id, "Tunnel: local stream backlogged, chunk dropped");
                        }
                    }
                    Err(e) => warn!(stream_id = %id, "Tunnel: bad chunk: {e}"),
                }
            }
            Frame::Heartbeat { ack: false } => {
                let _ = tx.try_send(Frame::Heartbeat { ack: true });
            }
            Frame::Heartbeat { ack: true } => debug!("Tunnel: heartbeat acknowledged"),
            Frame::Response { id, .. } => {
                warn!(request_id = %id, "Tunnel: unexpected response frame from manager");
            }
            Frame::Event { .. } => debug!("Tunnel: ignoring event frame from manager"),
        }
    }

    /// Serve one proxied request against the local API.
    async fn forward_local(
        &self,
        id: &str,
        method: &str,
        path: &str,
        headers: &FrameHeaders,
        body: &str,
    ) -> Frame {
        match self.try_forward_local(method, path, headers, body).await {
            Ok((status, headers, body)) => Frame::Response {
                id: id.to_string(),
                status,
                headers,
                body: encode_body(&body),
            },
            Err(e) => {
                warn!(request_id = %id, path = %path, "Tunnel: local request failed: {e}");
                error_response(id, 502, &format!("local API request failed: {e}"))
            }
        }
    }

    async fn try_forward_local(
        &self,
        method: &str,
        path: &str,
        headers: &FrameHeaders,
        body: &str,
    ) -> Result<(u16, FrameHeaders, Vec<u8>), AgentError> {
        let url = format!("{}{path}", self.config.local_url.trim_end_matches('/'));
        let method = reqwest::Method::from_bytes(method.as_bytes())?;
        let response = self
            .http
            .request(method, &url)
            .headers(local_headers(headers))
            .body(decode_body(body)?)
            .send()
            .await?;
        let status = response.status().as_u16();
        let headers = headers_to_frame(response.headers());
        let body = response.bytes().await?.to_vec();
        Ok((status, headers, body))
    }
}

fn next_delay(delay: Duration, max: Duration) -> Duration {
    (delay * 2).min(max)
}

fn error_response(id: &str, status: u16, message: &str) -> Frame {
    Frame::Response {
        id: id.to_string(),
        status,
        headers: FrameHeaders::from([(
            "content-type".to_string(),
            vec!["application/json".to_string()],
        )]),
        body: encode_body(json!({ "error": message }).to_string().as_bytes()),
    }
}

fn local_headers(headers: &FrameHeaders) -> HeaderMap {
    let mut out = HeaderMap::with_capacity(headers.len());
    for (name, value) in frame_header_pairs(headers) {
        if matches!(name, "host" | "content-length") {
            continue;
        }
        if let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            out.append(name, value);
        }
    }
    out
}

/// Bridge one manager stream to the local WebSocket endpoint at `path`.
async fn bridge_local(
    local_url: String,
    id: String,
    path: String,
    headers: FrameHeaders,
    mut input: mpsc::Receiver<StreamInput>,
    tx: mpsc::Sender<Frame>,
) {
    let connected = async {
        let mut request = websocket_url(&local_url, &path)?.into_client_request()?;
        request.headers_mut().extend(local_headers(&headers));
        let (ws, _) = tokio_tungstenite::connect_async(request).await?;
        Ok::<_, AgentError>(ws)
    }
    .await;
    let ws = match connected {
        Ok(ws) => ws,
        Err(e) => {
            warn!(stream_id = %id, path = %path, "Tunnel: local stream refused: {e}");
            let _ = tx
                .send(error_response(&id, 502, &format!("local stream failed: {e}")))
                .await;
            return;
        }
    };
    debug!(stream_id = %id, path = %path, "Tunnel: local stream opened");

    let (mut local_tx, mut local_rx) = ws.split();
    let local_to_manager = async {
        while let Some(Ok(msg)) = local_rx.next().await {
            let frame = match msg {
                Message::Text(text) => Frame::chunk(&id, text.as_str().as_bytes(), true),
                Message::Binary(data) => Frame::chunk(&id, &data, false),
                Message::Close(_) => break,
                _ => continue,
            };
            if tx.send(frame).await.is_err() {
                break;
            }
        }
    };
    let manager_to_local = async {
        while let Some(chunk) = input.recv().await {
            let msg = if chunk.text {
                Message::text(String::from_utf8_lossy(&chunk.data).into_owned())
            } else {
                Message::binary(chunk.data)
            };
            if local_tx.send(msg).await.is_err() {
                return false;
            }
        }
        // Manager closed its side.
        true
    };

    let manager_closed = tokio::select! {
        () = local_to_manager => false,
        closed = manager_to_local => closed,
    };
    let _ = local_tx.close().await;
    if !manager_closed {
        let _ = tx.send(Frame::close_stream(&id)).await;
    }
    debug!(stream_id = %id, "Tunnel: local stream closed");
}
