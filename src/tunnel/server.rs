//! Tunnel server — accepts agent connections and owns their lifecycle.
//!
//! Per environment: `Disconnected → Connecting (auth) → Connected → Disconnected`.
//! A second connect for an already-connected environment replaces the old
//! connection and closes it; the displaced connection's exit does not report
//! `connected = false` because the registry no longer points at it.
//!
//! The status callback and event sink are best-effort: failures are logged and
//! never roll back registry state. Status writes for one environment are
//! serialized and always report what the registry holds at that moment, so a
//! reconnect racing an eviction cannot leave a stale `connected = false`.
//! Events reach the sink in the order they were emitted.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use axum::{
    extract::{
        ws::{rejection::WebSocketUpgradeRejection, Message, WebSocket},
        FromRef, Query, State, WebSocketUpgrade,
    },
    http::HeaderMap,
    response::{IntoResponse, Response},
};
use futures::{future, Sink, SinkExt, Stream, StreamExt};
use serde::Deserialize;
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

use super::connection::Connection;
use super::frame::Frame;
use super::registry::TunnelRegistry;
use crate::auth::{bearer_token, TokenResolver};
use crate::config::TunnelConfig;
use crate::environment::StatusCallback;
use crate::error::TunnelError;
use crate::events::{EventSink, TunnelEvent};
use crate::state::AppState;

type EventQueue = mpsc::UnboundedSender<(String, TunnelEvent)>;

#[derive(Clone)]
pub struct TunnelServer {
    registry: Arc<TunnelRegistry>,
    resolver: Arc<dyn TokenResolver>,
    status: Arc<dyn StatusCallback>,
    /// Per-environment lock held across each status write.
    status_locks: Arc<Mutex<HashMap<String, Arc<AsyncMutex<()>>>>>,
    events: Arc<Mutex<Option<EventQueue>>>,
    config: TunnelConfig,
}

impl FromRef<AppState> for TunnelServer {
    fn from_ref(state: &AppState) -> Self {
        state.tunnel.clone()
    }
}

impl TunnelServer {
    pub fn new(
        resolver: Arc<dyn TokenResolver>,
        status: Arc<dyn StatusCallback>,
        config: TunnelConfig,
    ) -> Self {
        Self {
            registry: Arc::new(TunnelRegistry::new()),
            resolver,
            status,
            status_locks: Arc::new(Mutex::new(HashMap::new())),
            events: Arc::new(Mutex::new(None)),
            config,
        }
    }

    /// Install the sink that receives connect/disconnect and agent events.
    ///
    /// Spawns the task that feeds it, so this must run inside a Tokio runtime.
    /// A replaced sink still receives the events queued before the swap.
    pub fn set_event_sink(&self, sink: Arc<dyn EventSink>) {
        let (tx, mut rx) = mpsc::unbounded_channel::<(String, TunnelEvent)>();
        tokio::spawn(async move {
            while let Some((environment_id, event)) = rx.recv().await {
                if let Err(e) = sink.create_event(&environment_id, event).await {
                    warn!(environment_id = %environment_id, "Failed to record tunnel event: {e}");
                }
            }
        });
        *self.events.lock().unwrap_or_else(PoisonError::into_inner) = Some(tx);
    }

    pub fn registry(&self) -> &Arc<TunnelRegistry> {
        &self.registry
    }

    pub fn config(&self) -> &TunnelConfig {
        &self.config
    }

    pub fn proxy_timeout(&self) -> Duration {
        Duration::from_secs(self.config.proxy_timeout_secs)
    }

    pub async fn authenticate(&self, token: Option<&str>) -> Result<String, TunnelError> {
        let token = token.ok_or(TunnelError::Unauthorized)?;
        self.resolver.resolve(token).await
    }

    /// Create and register a connection for an authenticated agent. The
    /// returned receiver feeds the connection's writer in [`TunnelServer::serve`].
    pub async fn open(&self, environment_id: &str) -> (Arc<Connection>, mpsc::Receiver<Frame>) {
        let (conn, outbound_rx) = Connection::new(
            environment_id,
            self.config.outbound_queue,
            self.config.stream_buffer,
        );

        if let Some(old) = self.registry.register(environment_id, conn.clone()).await {
            warn!(
                environment_id,
                "Agent reconnected while a stale tunnel exists, closing old connection"
            );
            old.close();
        }
        info!(environment_id, "Edge agent connected");

        self.sync_status(environment_id).await;
        self.emit(environment_id, TunnelEvent::edge_connected(environment_id));
        (conn, outbound_rx)
    }

    /// Run a registered connection until it ends, then unregister it.
    pub async fn serve<Si, St>(
        &self,
        conn: Arc<Connection>,
        outbound_rx: mpsc::Receiver<Frame>,
        sink: Si,
        stream: St,
    ) where
        Si: Sink<Frame, Error = TunnelError> + Send + 'static,
        St: Stream<Item = Result<Frame, TunnelError>> + Send,
    {
        let environment_id = conn.environment_id().to_string();
        let forwarder = self.clone();
        let event_env = environment_id.clone();
        let reason = conn
            .clone()
            .run(outbound_rx, sink, stream, move |event| {
                forwarder.emit(&event_env, event);
            })
            .await;
        self.finish(&conn, &reason).await;
    }

    /// Authenticated connect: [`TunnelServer::open`] then [`TunnelServer::serve`].
    pub async fn attach<Si, St>(&self, environment_id: &str, sink: Si, stream: St)
    where
        Si: Sink<Frame, Error = TunnelError> + Send + 'static,
        St: Stream<Item = Result<Frame, TunnelError>> + Send,
    {
        let (conn, outbound_rx) = self.open(environment_id).await;
        self.serve(conn, outbound_rx, sink, stream).await;
    }

    async fn attach_websocket(&self, environment_id: String, socket: WebSocket) {
        let (ws_sink, ws_stream) = socket.split();
        self.attach(&environment_id, websocket_sink(ws_sink), websocket_stream(ws_stream))
            .await;
    }

    async fn finish(&self, conn: &Arc<Connection>, reason: &str) {
        let environment_id = conn.environment_id();
        if self.registry.unregister(environment_id, conn).await {
            info!(environment_id, reason, "Edge agent disconnected");
            self.sync_status(environment_id).await;
            self.emit(
                environment_id,
                TunnelEvent::edge_disconnected(environment_id, reason),
            );
        } else {
            debug!(
                environment_id,
                reason, "Replaced or evicted tunnel exited (already unregistered)"
            );
        }
    }

    /// Close the live tunnel for `environment_id`, if any. The connection's
    /// own exit path unregisters it and reports the status change.
    pub async fn disconnect(&self, environment_id: &str) -> bool {
        match self.registry.lookup(environment_id).await {
            Some(conn) => {
                info!(environment_id, "Closing tunnel on request");
                conn.close();
                true
            }
            None => false,
        }
    }

    /// Evict tunnels that have been silent longer than the heartbeat timeout.
    /// Also fails pending requests whose deadline has passed. Returns the
    /// evicted environment ids.
    pub async fn sweep(&self) -> Vec<String> {
        let timeout = Duration::from_secs(self.config.heartbeat_timeout_secs);
        let now = Instant::now();
        let mut evicted = Vec::new();

        for conn in self.registry.snapshot().await {
            let environment_id = conn.environment_id().to_string();
            let expired = conn
                .pending()
                .purge_expired(now, &TunnelError::Timeout(self.proxy_timeout()));
            if expired > 0 {
                debug!(environment_id = %environment_id, count = expired, "Purged expired requests");
            }

            if conn.idle_for() <= timeout {
                continue;
            }
            conn.close();
            if self.registry.unregister(&environment_id, &conn).await {
                warn!(environment_id = %environment_id, "Evicted edge agent (heartbeat timeout)");
                conn.pending()
                    .fail_all(&TunnelError::ConnectionLost("heartbeat timeout".to_string()));
                self.sync_status(&environment_id).await;
                self.emit(
                    &environment_id,
                    TunnelEvent::edge_disconnected(&environment_id, "heartbeat timeout"),
                );
                evicted.push(environment_id);
            }
        }
        evicted
    }

    /// Sweep on a fixed interval until `cancel` fires.
    pub async fn run_cleanup_loop(&self, cancel: CancellationToken) {
        let mut interval =
            tokio::time::interval(Duration::from_secs(self.config.sweep_interval_secs.max(1)));
        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                _ = interval.tick() => {
                    self.sweep().await;
                }
            }
        }
        debug!("Tunnel cleanup loop stopped");
    }

    pub fn spawn_cleanup_loop(&self, cancel: CancellationToken) -> tokio::task::JoinHandle<()> {
        let server = self.clone();
        tokio::spawn(async move { server.run_cleanup_loop(cancel).await })
    }

    /// Close every tunnel (manager shutdown).
    pub async fn shutdown(&self) {
        for conn in self.registry.drain().await {
            let environment_id = conn.environment_id().to_string();
            conn.close();
            conn.pending().fail_all(&TunnelError::ConnectionLost(
                "manager shutting down".to_string(),
            ));
            self.sync_status(&environment_id).await;
            self.emit(
                &environment_id,
                TunnelEvent::edge_disconnected(&environment_id, "manager shutting down"),
            );
            info!(environment_id = %environment_id, "Closed tunnel for shutdown");
        }
    }

    /// Persist whether `environment_id` currently has a registered tunnel.
    async fn sync_status(&self, environment_id: &str) {
        let lock = self
            .status_locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(environment_id.to_string())
            .or_default()
            .clone();
        let _ordered = lock.lock().await;

        let connected = self.registry.lookup(environment_id).await.is_some();
        if let Err(e) = self.status.connection_changed(environment_id, connected).await {
            warn!(
                environment_id,
                connected, "Failed to persist tunnel status: {e}"
            );
        }
    }

    /// Queue an event for the sink without waiting on it.
    fn emit(&self, environment_id: &str, event: TunnelEvent) {
        let events = self.events.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(queue) = events.as_ref() {
            let _ = queue.send((environment_id.to_string(), event));
        }
    }
}

// ─── Agent Connect Endpoint ──────────────────────────────────────────────────

/// Query params for the agent connect WS.
#[derive(Deserialize)]
pub struct ConnectQuery {
    token: Option<String>,
}

/// `GET /api/tunnel/connect` — agent tunnel upgrade.
///
/// The token is checked before the upgrade so a rejected agent gets a plain
/// `401` and the registry is never touched.
pub async fn connect(
    State(server): State<TunnelServer>,
    Query(query): Query<ConnectQuery>,
    headers: HeaderMap,
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    let environment_id = match server
        .authenticate(bearer_token(&headers, query.token.as_deref()))
        .await
    {
        Ok(id) => id,
        Err(e) => {
            warn!("Rejected tunnel connect: {e}");
            return TunnelError::Unauthorized.into_response();
        }
    };

    let ws = match ws {
        Ok(ws) => ws,
        Err(rejection) => return rejection.into_response(),
    };

    info!(environment_id = %environment_id, "Edge agent connecting...");
    ws.on_upgrade(move |socket| {
        let span = info_span!("edge_tunnel", environment_id = %environment_id);
        async move { server.attach_websocket(environment_id, socket).await }.instrument(span)
    })
}

fn websocket_sink(
    sink: futures::stream::SplitSink<WebSocket, Message>,
) -> impl Sink<Frame, Error = TunnelError> + Send + 'static {
    sink.sink_map_err(TunnelError::transport)
        .with(|frame: Frame| future::ready(Ok::<_, TunnelError>(Message::Text(frame.encode().into()))))
}

fn websocket_stream(
    stream: futures::stream::SplitStream<WebSocket>,
) -> impl Stream<Item = Result<Frame, TunnelError>> + Send {
    stream
        .take_while(|msg| future::ready(!matches!(msg, Ok(Message::Close(_)))))
        .filter_map(|msg| {
            future::ready(match msg {
                Ok(Message::Text(text)) => match Frame::decode(text.as_str()) {
                    Ok(frame) => Some(Ok(frame)),
                    Err(e) => {
                        warn!("Dropping malformed tunnel frame: {e}");
                        None
                    }
                },
                Ok(Message::Binary(_)) => {
                    warn!("Dropping unexpected binary tunnel message");
                    None
                }
                Ok(_) => None,
                Err(e) => Some(Err(TunnelError::transport(e))),
            })
        })
}
