//! One live tunnel to one edge agent.
//!
//! Outbound frames go through a bounded queue drained by a single writer task,
//! so concurrent callers never interleave partial writes. Inbound frames are
//! read by [`Connection::run`] and demultiplexed through the connection's
//! [`PendingRequestTable`].

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::{Sink, SinkExt, Stream, StreamExt};
use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::frame::{Frame, ProxyRequest, ProxyResponse};
use super::pending::{Delivery, PendingRequestTable, StreamEvent};
use crate::error::TunnelError;
use crate::events::TunnelEvent;

/// Point-in-time view of a live tunnel.
#[derive(Debug, Clone, Serialize)]
pub struct TunnelStatus {
    pub environment_id: String,
    pub connection_id: String,
    pub connected_secs: u64,
    pub idle_ms: u64,
    pub pending_requests: usize,
    pub dropped_chunks: u64,
}

pub struct Connection {
    environment_id: String,
    /// Distinguishes this instance from a later connection for the same environment.
    connection_id: String,
    outbound: mpsc::Sender<Frame>,
    pending: PendingRequestTable,
    stream_buffer: usize,
    epoch: Instant,
    /// Last inbound activity as ms since `epoch` (lock-free).
    last_activity_ms: AtomicU64,
    dropped_chunks: AtomicU64,
    shutdown_tx: watch::Sender<bool>,
}

impl Connection {
    /// Create a connection and the receiving end of its outbound queue, which
    /// must be handed to [`Connection::run`].
    pub fn new(
        environment_id: &str,
        outbound_queue: usize,
        stream_buffer: usize,
    ) -> (Arc<Self>, mpsc::Receiver<Frame>) {
        let (outbound, outbound_rx) = mpsc::channel(outbound_queue.max(1));
        let (shutdown_tx, _) = watch::channel(false);
        let conn = Arc::new(Self {
            environment_id: environment_id.to_string(),
            connection_id: uuid::Uuid::new_v4().to_string(),
            outbound,
            pending: PendingRequestTable::new(),
            stream_buffer,
            epoch: Instant::now(),
            last_activity_ms: AtomicU64::new(0),
            dropped_chunks: AtomicU64::new(0),
            shutdown_tx,
        });
        (conn, outbound_rx)
    }

    pub fn environment_id(&self) -> &str {
        &self.environment_id
    }

    pub fn connection_id(&self) -> &str {
        &self.connection_id
    }

    pub fn pending(&self) -> &PendingRequestTable {
        &self.pending
    }

    pub fn dropped_chunks(&self) -> u64 {
        self.dropped_chunks.load(Ordering::Relaxed)
    }

    /// Time since the connection was created.
    pub fn connected_for(&self) -> Duration {
        self.epoch.elapsed()
    }

    /// Record inbound activity now.
    pub fn touch(&self) {
        self.last_activity_ms
            .store(self.epoch.elapsed().as_millis() as u64, Ordering::Relaxed);
    }

    /// Time since the last inbound frame (or since creation).
    pub fn idle_for(&self) -> Duration {
        let now_ms = self.epoch.elapsed().as_millis() as u64;
        let last = self.last_activity_ms.load(Ordering::Relaxed);
        Duration::from_millis(now_ms.saturating_sub(last))
    }

    pub fn status(&self) -> TunnelStatus {
        TunnelStatus {
            environment_id: self.environment_id.clone(),
            connection_id: self.connection_id.clone(),
            connected_secs: self.connected_for().as_secs(),
            idle_ms: self.idle_for().as_millis() as u64,
            pending_requests: self.pending.len(),
            dropped_chunks: self.dropped_chunks(),
        }
    }

    pub fn is_closed(&self) -> bool {
        *self.shutdown_tx.borrow()
    }

    /// Signal the read loop to stop. Idempotent.
    pub fn close(&self) {
        self.shutdown_tx.send_replace(true);
    }

    /// Queue a frame for the writer task.
    pub async fn send(&self, frame: Frame) -> Result<(), TunnelError> {
        if self.is_closed() {
            return Err(TunnelError::ConnectionClosed);
        }
        self.outbound
            .send(frame)
            .await
            .map_err(|_| TunnelError::ConnectionClosed)
    }

    /// Issue a request and wait for its correlated response.
    ///
    /// `timeout` bounds the whole call, including the wait for room in the
    /// outbound queue. The pending entry is removed on every exit path,
    /// including the caller being cancelled mid-wait.
    pub async fn request(
        &self,
        request: ProxyRequest,
        timeout: Duration,
    ) -> Result<ProxyResponse, TunnelError> {
        let request_id = uuid::Uuid::new_v4().to_string();
        let deadline = Instant::now() + timeout;
        let rx = self.pending.insert_response(&request_id, deadline);
        let _guard = PendingGuard {
            table: &self.pending,
            id: &request_id,
        };

        debug!(
            environment_id = %self.environment_id,
            request_id = %request_id,
            method = %request.method,
            path = %request.path,
            "Forwarding request through tunnel"
        );
        let exchange = async {
            self.send(request.into_frame(&request_id, false)).await?;
            match rx.await {
                Ok(result) => result,
                Err(_) => Err(TunnelError::ConnectionLost(
                    "response slot dropped".to_string(),
                )),
            }
        };

        if let Ok(result) = tokio::time::timeout_at(deadline, exchange).await {
            result
        } else {
            warn!(
                environment_id = %self.environment_id,
                request_id = %request_id,
                "Edge agent did not respond in time"
            );
            Err(TunnelError::Timeout(timeout))
        }
    }

    /// Open a bidirectional stream (WebSocket bridge) over the tunnel.
    /// Fails with `Timeout` if the request cannot be queued within `timeout`.
    pub async fn open_stream(
        self: &Arc<Self>,
        request: ProxyRequest,
        timeout: Duration,
    ) -> Result<TunnelStream, TunnelError> {
        let stream_id = uuid::Uuid::new_v4().to_string();
        let events = self.pending.insert_stream(&stream_id, self.stream_buffer);
        let stream = TunnelStream {
            sender: StreamSender {
                id: stream_id.clone(),
                connection: self.clone(),
            },
            events,
        };
        // On failure `stream` is dropped, which removes the pending entry.
        tokio::time::timeout(timeout, self.send(request.into_frame(&stream_id, true)))
            .await
            .map_err(|_| TunnelError::Timeout(timeout))??;
        Ok(stream)
    }

    /// Handle one inbound frame. Returns an agent event for the caller to forward.
    pub fn dispatch(&self, frame: Frame) -> Option<TunnelEvent> {
        match frame {
            Frame::Response { .. } | Frame::StreamChunk { .. } => {
                let request_id = frame.correlation_id().unwrap_or_default().to_string();
                match self.pending.deliver(frame) {
                    Delivery::Delivered => {}
                    Delivery::Dropped => {
                        self.dropped_chunks.fetch_add(1, Ordering::Relaxed);
                        debug!(
                            environment_id = %self.environment_id,
                            request_id = %request_id,
                            "Dropped stream chunk (consumer backpressure)"
                        );
                    }
                    Delivery::Unmatched => {
                        warn!(
                            environment_id = %self.environment_id,
                            request_id = %request_id,
                            "Frame for timed-out or unknown request (dropped)"
                        );
                    }
                }
                None
            }
            Frame::Event { event } => Some(event),
            Frame::Heartbeat { ack } => {
                if !ack && self.outbound.try_send(Frame::Heartbeat { ack: true }).is_err() {
                    debug!(environment_id = %self.environment_id, "Heartbeat ack not queued");
                }
                None
            }
            Frame::Request { id, .. } => {
                warn!(
                    environment_id = %self.environment_id,
                    request_id = %id,
                    "Agent sent a request frame (dropped)"
                );
                None
            }
        }
    }

    /// Drive the connection until the transport ends or [`Connection::close`]
    /// is called. On exit every pending entry is failed with `ConnectionLost`.
    /// Returns a human-readable disconnect reason.
    pub async fn run<Si, St, F>(
        self: Arc<Self>,
        mut outbound_rx: mpsc::Receiver<Frame>,
        sink: Si,
        stream: St,
        mut on_event: F,
    ) -> String
    where
        Si: Sink<Frame, Error = TunnelError> + Send + 'static,
        St: Stream<Item = Result<Frame, TunnelError>> + Send,
        F: FnMut(TunnelEvent) + Send,
    {
        self.touch();

        let writer_conn = self.clone();
        let writer = tokio::spawn(async move {
            let mut sink = std::pin::pin!(sink);
            while let Some(frame) = outbound_rx.recv().await {
                if let Err(e) = sink.send(frame).await {
                    warn!(
                        environment_id = %writer_conn.environment_id,
                        "Tunnel write failed: {e}"
                    );
                    break;
                }
            }
            writer_conn.close();
        });

        let mut stream = std::pin::pin!(stream);
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let reason = loop {
            if *shutdown_rx.borrow_and_update() {
                break "connection closed".to_string();
            }
            tokio::select! {
                item = stream.next() => match item {
                    Some(Ok(frame)) => {
                        self.touch();
                        if let Some(event) = self.dispatch(frame) {
                            on_event(event);
                        }
                    }
                    Some(Err(e)) => break e.to_string(),
                    None => break "agent closed the connection".to_string(),
                },
                changed = shutdown_rx.changed() => {
                    if changed.is_err() {
                        break "connection dropped".to_string();
                    }
                }
            }
        };

        self.close();
        writer.abort();
        let failed = self
            .pending
            .fail_all(&TunnelError::ConnectionLost(reason.clone()));
        if failed > 0 {
            info!(
                environment_id = %self.environment_id,
                count = failed,
                "Failed {failed} pending requests: {reason}"
            );
        }
        reason
    }
}

/// Removes a pending entry when the waiting caller goes away.
struct PendingGuard<'a> {
    table: &'a PendingRequestTable,
    id: &'a str,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.table.remove(self.id);
    }
}

/// Sending half of a tunnel stream.
#[derive(Clone)]
pub struct StreamSender {
    id: String,
    connection: Arc<Connection>,
}

impl StreamSender {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub async fn send_chunk(&self, data: &[u8], text: bool) -> Result<(), TunnelError> {
        self.connection.send(Frame::chunk(&self.id, data, text)).await
    }

    /// Close from the manager side. No-op if the agent already closed it.
    pub async fn close(&self) {
        if self.connection.pending.remove(&self.id) {
            let _ = self.connection.send(Frame::close_stream(&self.id)).await;
        }
    }
}

/// A bridged stream: `sender` writes chunks, `events` yields the agent's.
pub struct TunnelStream {
    pub sender: StreamSender,
    pub events: mpsc::Receiver<StreamEvent>,
}

impl Drop for TunnelStream {
    fn drop(&mut self) {
        let conn = &self.sender.connection;
        if conn.pending.remove(&self.sender.id) {
            let _ = conn.outbound.try_send(Frame::close_stream(&self.sender.id));
        }
    }
}
