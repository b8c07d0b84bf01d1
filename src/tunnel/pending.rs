//! Per-connection table of callers waiting on a correlated reply.
//!
//! Plain requests wait on a oneshot for their single `response` frame. Streams
//! get a bounded channel of [`StreamEvent`]s; dropping the sender (on close,
//! failure or removal) ends the receiver's stream.
//!
//! Entries are removed exactly once: by delivery of the terminal frame, by the
//! caller on timeout/cancellation, by deadline purge, or by `fail_all` when
//! the connection is torn down. Whoever removes the entry owns its waiter, so
//! a waiter is never fulfilled twice.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;

use super::frame::{decode_body, Frame, ProxyResponse};
use crate::error::TunnelError;

/// One item delivered to a stream waiter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    Chunk { data: Vec<u8>, text: bool },
    /// The agent answered the stream request with a terminal response
    /// instead of opening the stream.
    Rejected(ProxyResponse),
    Failed(TunnelError),
}

type ResponseSlot = oneshot::Sender<Result<ProxyResponse, TunnelError>>;

enum Waiter {
    Response(ResponseSlot),
    Stream(mpsc::Sender<StreamEvent>),
}

struct PendingEntry {
    waiter: Waiter,
    deadline: Option<Instant>,
}

/// Outcome of routing an inbound frame to its waiter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Delivered,
    /// Stream waiter's buffer was full; the chunk was discarded.
    Dropped,
    /// No waiter for this correlation id (late, unknown or wrong kind).
    Unmatched,
}

#[derive(Default)]
pub struct PendingRequestTable {
    entries: Mutex<HashMap<String, PendingEntry>>,
}

impl PendingRequestTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, PendingEntry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a caller waiting for a single response.
    pub fn insert_response(
        &self,
        id: &str,
        deadline: Instant,
    ) -> oneshot::Receiver<Result<ProxyResponse, TunnelError>> {
        let (tx, rx) = oneshot::channel();
        self.lock().insert(
            id.to_string(),
            PendingEntry {
                waiter: Waiter::Response(tx),
                deadline: Some(deadline),
            },
        );
        rx
    }

    /// Register a stream waiter with a buffer of `capacity` chunks.
    ///
    /// The channel holds one slot more than `capacity`. Chunks never take the
    /// last slot, so a terminal `Failed` or `Rejected` always fits.
    pub fn insert_stream(&self, id: &str, capacity: usize) -> mpsc::Receiver<StreamEvent> {
        let (tx, rx) = mpsc::channel(capacity.max(1) + 1);
        self.lock().insert(
            id.to_string(),
            PendingEntry {
                waiter: Waiter::Stream(tx),
                deadline: None,
            },
        );
        rx
    }

    /// Remove an entry without fulfilling it. Returns whether it was present.
    pub fn remove(&self, id: &str) -> bool {
        self.lock().remove(id).is_some()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.lock().contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Route a `response` or `stream_chunk` frame. Never blocks.
    pub fn deliver(&self, frame: Frame) -> Delivery {
        match frame {
            Frame::Response {
                id,
                status,
                headers,
                body,
            } => {
                let Some(entry) = self.lock().remove(&id) else {
                    return Delivery::Unmatched;
                };
                let response = ProxyResponse::from_parts(status, headers, &body);
                match entry.waiter {
                    Waiter::Response(tx) => {
                        let _ = tx.send(response);
                    }
                    Waiter::Stream(tx) => {
                        let event = match response {
                            Ok(resp) => StreamEvent::Rejected(resp),
                            Err(e) => StreamEvent::Failed(e),
                        };
                        let _ = tx.try_send(event);
                    }
                }
                Delivery::Delivered
            }
            Frame::StreamChunk {
                id, data, text, close,
            } => {
                let mut entries = self.lock();
                let Some(PendingEntry {
                    waiter: Waiter::Stream(tx),
                    ..
                }) = entries.get(&id)
                else {
                    return Delivery::Unmatched;
                };

                if close {
                    // Dropping the sender ends the receiver after buffered chunks.
                    entries.remove(&id);
                    return Delivery::Delivered;
                }

                let data = match decode_body(&data) {
                    Ok(data) => data,
                    Err(e) => {
                        let _ = tx.try_send(StreamEvent::Failed(e));
                        entries.remove(&id);
                        return Delivery::Delivered;
                    }
                };
                if tx.capacity() <= 1 {
                    return if tx.is_closed() {
                        entries.remove(&id);
                        Delivery::Unmatched
                    } else {
                        Delivery::Dropped
                    };
                }
                match tx.try_send(StreamEvent::Chunk { data, text }) {
                    Ok(()) => Delivery::Delivered,
                    Err(mpsc::error::TrySendError::Full(_)) => Delivery::Dropped,
                    Err(mpsc::error::TrySendError::Closed(_)) => {
                        entries.remove(&id);
                        Delivery::Unmatched
                    }
                }
            }
            Frame::Request { .. } | Frame::Event { .. } | Frame::Heartbeat { .. } => {
                Delivery::Unmatched
            }
        }
    }

    /// Fail every outstanding entry with `err`. Returns how many were failed.
    pub fn fail_all(&self, err: &TunnelError) -> usize {
        let drained: Vec<PendingEntry> = self.lock().drain().map(|(_, entry)| entry).collect();
        let count = drained.len();
        for entry in drained {
            fail_entry(entry, err.clone());
        }
        count
    }

    /// Fail entries whose deadline is at or before `now`.
    pub fn purge_expired(&self, now: Instant, err: &TunnelError) -> usize {
        let expired: Vec<PendingEntry> = {
            let mut entries = self.lock();
            let ids: Vec<String> = entries
                .iter()
                .filter(|(_, e)| e.deadline.is_some_and(|d| d <= now))
                .map(|(id, _)| id.clone())
                .collect();
            ids.iter().filter_map(|id| entries.remove(id)).collect()
        };
        let count = expired.len();
        for entry in expired {
            fail_entry(entry, err.clone());
        }
        count
    }
}

fn fail_entry(entry: PendingEntry, err: TunnelError) {
    match entry.waiter {
        Waiter::Response(tx) => {
            let _ = tx.send(Err(err));
        }
        Waiter::Stream(tx) => {
            let _ = tx.try_send(StreamEvent::Failed(err));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tunnel::frame::{encode_body, FrameHeaders};
    use std::time::Duration;

    fn response(id: &str, status: u16, body: &[u8]) -> Frame {
        Frame::Response {
            id: id.to_string(),
            status,
            headers: FrameHeaders::new(),
            body: encode_body(body),
        }
    }

    fn far_deadline() -> Instant {
        Instant::now() + Duration::from_secs(60)
    }

    #[tokio::test]
    async fn test_response_fulfills_and_removes() {
        let table = PendingRequestTable::new();
        let rx = table.insert_response("a", far_deadline());
        assert_eq!(table.deliver(response("a", 200, b"ok")), Delivery::Delivered);
        assert!(table.is_empty());
        let resp = rx.await.unwrap().unwrap();
        assert_eq!(resp.status, 200);
        assert_eq!(resp.body, b"ok");
    }

    #[tokio::test]
    async fn test_out_of_order_delivery() {
        let table = PendingRequestTable::new();
        let rx1 = table.insert_response("one", far_deadline());
        let rx2 = table.insert_response("two", far_deadline());
        table.deliver(response("two", 201, b""));
        table.deliver(response("one", 200, b""));
        assert_eq!(rx1.await.unwrap().unwrap().status, 200);
        assert_eq!(rx2.await.unwrap().unwrap().status, 201);
    }

    #[test]
    fn test_unknown_id_is_unmatched() {
        let table = PendingRequestTable::new();
        assert_eq!(table.deliver(response("ghost", 200, b"")), Delivery::Unmatched);
        assert_eq!(
            table.deliver(Frame::chunk("ghost", b"x", true)),
            Delivery::Unmatched
        );
    }

    #[test]
    fn test_late_response_after_remove_is_unmatched() {
        let table = PendingRequestTable::new();
        let _rx = table.insert_response("late", far_deadline());
        assert!(table.remove("late"));
        assert_eq!(table.deliver(response("late", 200, b"")), Delivery::Unmatched);
    }

    #[tokio::test]
    async fn test_fail_all_fails_each_entry_once() {
        let table = PendingRequestTable::new();
        let rx1 = table.insert_response("a", far_deadline());
        let rx2 = table.insert_response("b", far_deadline());
        let mut stream = table.insert_stream("s", 4);

        let err = TunnelError::ConnectionLost("device gone".into());
        assert_eq!(table.fail_all(&err), 3);
        assert_eq!(table.fail_all(&err), 0);

        assert_eq!(rx1.await.unwrap(), Err(err.clone()));
        assert_eq!(rx2.await.unwrap(), Err(err.clone()));
        assert_eq!(stream.recv().await, Some(StreamEvent::Failed(err)));
        assert_eq!(stream.recv().await, None);
    }

    #[tokio::test]
    async fn test_stream_chunks_then_close() {
        let table = PendingRequestTable::new();
        let mut rx = table.insert_stream("s", 4);
        assert_eq!(table.deliver(Frame::chunk("s", b"line 1", true)), Delivery::Delivered);
        assert_eq!(table.deliver(Frame::close_stream("s")), Delivery::Delivered);
        assert!(!table.contains("s"));

        assert_eq!(
            rx.recv().await,
            Some(StreamEvent::Chunk {
                data: b"line 1".to_vec(),
                text: true
            })
        );
        assert_eq!(rx.recv().await, None);
    }

    #[tokio::test]
    async fn test_stream_full_buffer_drops_without_blocking() {
        let table = PendingRequestTable::new();
        let _rx = table.insert_stream("s", 1);
        assert_eq!(table.deliver(Frame::chunk("s", b"1", false)), Delivery::Delivered);
        assert_eq!(table.deliver(Frame::chunk("s", b"2", false)), Delivery::Dropped);
        assert!(table.contains("s"));
    }

    #[tokio::test]
    async fn test_full_stream_still_receives_failure() {
        let table = PendingRequestTable::new();
        let mut rx = table.insert_stream("s", 1);
        assert_eq!(table.deliver(Frame::chunk("s", b"1", false)), Delivery::Delivered);
        assert_eq!(table.deliver(Frame::chunk("s", b"2", false)), Delivery::Dropped);

        let err = TunnelError::ConnectionLost("agent went away".into());
        assert_eq!(table.fail_all(&err), 1);
        assert_eq!(
            rx.recv().await,
            Some(StreamEvent::Chunk {
                data: b"1".to_vec(),
                text: false
            })
        );
        assert_eq!(rx.recv().await, Some(StreamEvent::Failed(err)));
        assert_eq!(rx.recv().await, None);
    }

    #[tokio::test]
    async fn test_full_stream_still_receives_rejection() {
        let table = PendingRequestTable::new();
        let mut rx = table.insert_stream("s", 1);
        table.deliver(Frame::chunk("s", b"1", false));
        assert_eq!(table.deliver(response("s", 502, b"upstream gone")), Delivery::Delivered);

        assert!(matches!(rx.recv().await, Some(StreamEvent::Chunk { .. })));
        match rx.recv().await {
            Some(StreamEvent::Rejected(resp)) => assert_eq!(resp.status, 502),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_stream_rejected_by_response() {
        let table = PendingRequestTable::new();
        let mut rx = table.insert_stream("s", 4);
        table.deliver(response("s", 404, b"no such container"));
        match rx.recv().await {
            Some(StreamEvent::Rejected(resp)) => assert_eq!(resp.status, 404),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(rx.recv().await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_purge_expired_only_touches_past_deadlines() {
        let table = PendingRequestTable::new();
        let soon = table.insert_response("soon", Instant::now() + Duration::from_secs(1));
        let _later = table.insert_response("later", Instant::now() + Duration::from_secs(30));
        let _stream = table.insert_stream("s", 1);

        tokio::time::advance(Duration::from_secs(2)).await;
        let err = TunnelError::Timeout(Duration::from_secs(1));
        assert_eq!(table.purge_expired(Instant::now(), &err), 1);
        assert_eq!(table.len(), 2);
        assert_eq!(soon.await.unwrap(), Err(err));
    }
}
