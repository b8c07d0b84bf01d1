//! WebSocket bridging for streaming endpoints (logs, stats, exec).
//!
//! Each bridge is two copy loops joined with `select!`: whichever side closes
//! first ends both, and the other side is closed on the way out.

use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{
        ws::{CloseFrame, Message, WebSocket},
        FromRequestParts, Request, WebSocketUpgrade,
    },
    http::HeaderMap,
    response::{IntoResponse, Response},
};
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::{
    self, client::IntoClientRequest, http::HeaderValue, protocol::frame::coding::CloseCode,
};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, info_span, warn, Instrument};

use super::http::forwardable_headers;
use crate::environment::Environment;
use crate::error::TunnelError;
use crate::tunnel::frame::headers_to_frame;
use crate::tunnel::{Connection, ProxyRequest, StreamEvent, TunnelStream};

type RemoteSocket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Close code sent to the client when the far side fails (1011).
const CLOSE_INTERNAL_ERROR: u16 = 1011;

/// Headers for the far side's own handshake: the client's handshake headers
/// are dropped along with the usual hop-by-hop set.
fn stream_headers(headers: &HeaderMap) -> HeaderMap {
    let mut out = forwardable_headers(headers);
    let handshake: Vec<_> = out
        .keys()
        .filter(|name| name.as_str().starts_with("sec-websocket-"))
        .cloned()
        .collect();
    for name in handshake {
        out.remove(name);
    }
    out
}

async fn upgrade(request: Request) -> Result<(WebSocketUpgrade, axum::http::request::Parts), Response> {
    let (mut parts, _body) = request.into_parts();
    match WebSocketUpgrade::from_request_parts(&mut parts, &()).await {
        Ok(ws) => Ok((ws, parts)),
        Err(rejection) => Err(rejection.into_response()),
    }
}

// ─── Through a tunnel ────────────────────────────────────────────────────────

/// Bridge a client WebSocket to a stream opened over `conn`.
pub async fn bridge_tunnel(
    conn: Arc<Connection>,
    request: Request,
    path: String,
    timeout: Duration,
) -> Result<Response, TunnelError> {
    let (ws, parts) = match upgrade(request).await {
        Ok(upgraded) => upgraded,
        Err(rejection) => return Ok(rejection),
    };
    let stream = conn
        .open_stream(
            ProxyRequest {
                method: parts.method.to_string(),
                path: path.clone(),
                headers: headers_to_frame(&stream_headers(&parts.headers)),
                body: Vec::new(),
            },
            timeout,
        )
        .await?;

    let span = info_span!(
        "ws_bridge",
        environment_id = %conn.environment_id(),
        stream_id = %stream.sender.id(),
        path = %path,
    );
    Ok(ws.on_upgrade(move |socket| pump_tunnel(socket, stream).instrument(span)))
}

async fn pump_tunnel(socket: WebSocket, mut stream: TunnelStream) {
    let (mut client_tx, mut client_rx) = socket.split();
    let sender = stream.sender.clone();

    let client_to_agent = async {
        while let Some(Ok(msg)) = client_rx.next().await {
            let sent = match msg {
                Message::Text(text) => sender.send_chunk(text.as_str().as_bytes(), true).await,
                Message::Binary(data) => sender.send_chunk(&data, false).await,
                Message::Close(_) => break,
                Message::Ping(_) | Message::Pong(_) => continue,
            };
            if let Err(e) = sent {
                debug!("Tunnel stream write failed: {e}");
                break;
            }
        }
    };

    let agent_to_client = async {
        while let Some(event) = stream.events.recv().await {
            let msg = match event {
                StreamEvent::Chunk { data, text: true } => {
                    Message::Text(String::from_utf8_lossy(&data).into_owned().into())
                }
                StreamEvent::Chunk { data, text: false } => Message::Binary(data.into()),
                StreamEvent::Rejected(resp) => {
                    warn!(status = resp.status, "Agent refused stream");
                    let reason = format!("remote refused stream ({})", resp.status);
                    let _ = client_tx.send(close_message(CLOSE_INTERNAL_ERROR, reason)).await;
                    return;
                }
                StreamEvent::Failed(e) => {
                    let _ = client_tx
                        .send(close_message(CLOSE_INTERNAL_ERROR, e.to_string()))
                        .await;
                    return;
                }
            };
            if client_tx.send(msg).await.is_err() {
                return;
            }
        }
        let _ = client_tx.send(Message::Close(None)).await;
    };

    tokio::select! {
        () = client_to_agent => {}
        () = agent_to_client => {}
    }
    sender.close().await;
    debug!("Tunnel stream bridge closed");
}

fn close_message(code: u16, reason: String) -> Message {
    Message::Close(Some(CloseFrame {
        code,
        reason: reason.into(),
    }))
}

// ─── Direct remote ───────────────────────────────────────────────────────────

/// `http(s)://host` → `ws(s)://host{path}`.
pub fn websocket_url(address: &str, path: &str) -> Result<String, TunnelError> {
    let address = address.trim_end_matches('/');
    if let Some(host) = address.strip_prefix("https://") {
        Ok(format!("wss://{host}{path}"))
    } else if let Some(host) = address.strip_prefix("http://") {
        Ok(format!("ws://{host}{path}"))
    } else {
        Err(TunnelError::Upstream(format!(
            "unsupported remote address '{address}'"
        )))
    }
}

/// Bridge a client WebSocket to the same endpoint on a direct remote.
///
/// The remote is dialed before the client upgrade so a refused connection
/// still surfaces as a plain `502`.
pub async fn bridge_direct(
    env: &Environment,
    request: Request,
    path: &str,
) -> Result<Response, TunnelError> {
    let (ws, _parts) = match upgrade(request).await {
        Ok(upgraded) => upgraded,
        Err(rejection) => return Ok(rejection),
    };

    let url = websocket_url(&env.address, path)?;
    let mut remote_request = url
        .as_str()
        .into_client_request()
        .map_err(|e| TunnelError::Upstream(e.to_string()))?;
    if let Some(token) = env.access_token.as_deref() {
        let value = HeaderValue::from_str(&format!("Bearer {token}"))
            .map_err(|e| TunnelError::Upstream(e.to_string()))?;
        remote_request.headers_mut().insert("authorization", value);
    }
    let (remote, _) = tokio_tungstenite::connect_async(remote_request)
        .await
        .map_err(|e| TunnelError::Upstream(format!("remote websocket: {e}")))?;

    let span = info_span!("ws_bridge", environment_id = %env.id, url = %url);
    Ok(ws.on_upgrade(move |socket| pump_direct(socket, remote).instrument(span)))
}

async fn pump_direct(socket: WebSocket, remote: RemoteSocket) {
    let (mut client_tx, mut client_rx) = socket.split();
    let (mut remote_tx, mut remote_rx) = remote.split();

    let client_to_remote = async {
        while let Some(Ok(msg)) = client_rx.next().await {
            let closing = matches!(msg, Message::Close(_));
            let Some(msg) = client_to_tungstenite(msg) else {
                continue;
            };
            if remote_tx.send(msg).await.is_err() || closing {
                break;
            }
        }
    };

    let remote_to_client = async {
        while let Some(Ok(msg)) = remote_rx.next().await {
            let closing = msg.is_close();
            let Some(msg) = tungstenite_to_client(msg) else {
                continue;
            };
            if client_tx.send(msg).await.is_err() || closing {
                break;
            }
        }
    };

    tokio::select! {
        () = client_to_remote => {}
        () = remote_to_client => {}
    }
    let _ = remote_tx.close().await;
    let _ = client_tx.close().await;
    debug!("Direct stream bridge closed");
}

fn client_to_tungstenite(msg: Message) -> Option<tungstenite::Message> {
    match msg {
        Message::Text(text) => Some(tungstenite::Message::text(text.as_str().to_owned())),
        Message::Binary(data) => Some(tungstenite::Message::Binary(data)),
        Message::Close(frame) => Some(tungstenite::Message::Close(frame.map(|f| {
            tungstenite::protocol::CloseFrame {
                code: CloseCode::from(f.code),
                reason: f.reason.as_str().to_owned().into(),
            }
        }))),
        Message::Ping(_) | Message::Pong(_) => None,
    }
}

fn tungstenite_to_client(msg: tungstenite::Message) -> Option<Message> {
    match msg {
        tungstenite::Message::Text(text) => Some(Message::Text(text.as_str().to_owned().into())),
        tungstenite::Message::Binary(data) => Some(Message::Binary(data)),
        tungstenite::Message::Close(frame) => Some(Message::Close(frame.map(|f| CloseFrame {
            code: u16::from(f.code),
            reason: f.reason.as_str().to_owned().into(),
        }))),
        tungstenite::Message::Ping(_)
        | tungstenite::Message::Pong(_)
        | tungstenite::Message::Frame(_) => None,
    }
}
