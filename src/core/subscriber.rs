//! Subscriber: one WebSocket connection's lifecycle (§4.4).
//!
//! A subscriber owns a bounded outbound [`RingBuffer`] and three cooperating
//! tasks -- reader, writer, pinger -- that share a [`CancellationToken`] and
//! advance the connection through a one-way ACTIVE -> CLOSING -> CLOSED state
//! machine. The hub never talks to the socket directly; it only pushes onto
//! the ring buffer and wakes the writer.

use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::ws::{Message, WebSocket};
use futures::{SinkExt, StreamExt};
use tokio::sync::Notify;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use crate::core::rate_limiter::RateLimiter;
use crate::core::ring_buffer::RingBuffer;
use crate::websocket::{ConnectionId, WebSocketConfig};

/// One-way connection lifecycle state (§4.4).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SubscriberState {
    Active = 0,
    Closing = 1,
    Closed = 2,
}

impl From<u8> for SubscriberState {
    fn from(value: u8) -> Self {
        match value {
            0 => SubscriberState::Active,
            1 => SubscriberState::Closing,
            _ => SubscriberState::Closed,
        }
    }
}

/// A connected subscriber: identity, outbound queue, and activity tracking.
pub struct Subscriber {
    pub id: ConnectionId,
    pub remote_identity: String,
    state: AtomicU8,
    queue: RingBuffer<Message>,
    queue_signal: Notify,
    created_at: Instant,
    last_activity_secs: AtomicU64,
    epoch: Instant,
    shutdown: CancellationToken,
}

impl Subscriber {
    pub fn new(remote_identity: String, queue_capacity: usize, parent_shutdown: &CancellationToken) -> Arc<Self> {
        let epoch = Instant::now();
        Arc::new(Self {
            id: ConnectionId::new(),
            remote_identity,
            state: AtomicU8::new(SubscriberState::Active as u8),
            queue: RingBuffer::new(queue_capacity),
            queue_signal: Notify::new(),
            created_at: epoch,
            last_activity_secs: AtomicU64::new(0),
            epoch,
            shutdown: parent_shutdown.child_token(),
        })
    }

    pub fn state(&self) -> SubscriberState {
        self.state.load(Ordering::Acquire).into()
    }

    pub fn is_active(&self) -> bool {
        self.state() == SubscriberState::Active
    }

    fn touch(&self) {
        self.last_activity_secs
            .store(self.epoch.elapsed().as_secs(), Ordering::Relaxed);
    }

    pub fn idle_for(&self) -> Duration {
        let last = self.last_activity_secs.load(Ordering::Relaxed);
        self.epoch
            .elapsed()
            .saturating_sub(Duration::from_secs(last))
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    /// Enqueue an outbound message for the writer task. Returns `false` if
    /// the queue is full (caller applies the hub's backpressure policy) or
    /// the subscriber is no longer active.
    pub fn enqueue(&self, message: Message) -> bool {
        if !self.is_active() {
            return false;
        }
        let pushed = self.queue.push(message);
        if pushed {
            self.queue_signal.notify_one();
        }
        pushed
    }

    pub fn queue_utilization(&self) -> f64 {
        self.queue.utilization()
    }

    /// Begin graceful teardown. Idempotent: only the ACTIVE -> CLOSING
    /// transition has an effect; later calls are no-ops (§4.4).
    pub fn begin_closing(&self) {
        let _ = self.state.compare_exchange(
            SubscriberState::Active as u8,
            SubscriberState::Closing as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
        self.shutdown.cancel();
    }

    fn mark_closed(&self) {
        self.state.store(SubscriberState::Closed as u8, Ordering::Release);
    }

    /// Split the socket and spawn the reader/writer/pinger tasks. Returns a
    /// handle that resolves once all three have exited and the subscriber
    /// has reached CLOSED.
    pub fn spawn_tasks(
        self: &Arc<Self>,
        socket: WebSocket,
        config: WebSocketConfig,
        rate_limiter: Arc<RateLimiter>,
    ) -> tokio::task::JoinHandle<()> {
        let (mut sink, mut stream) = socket.split();
        let subscriber = self.clone();

        tokio::spawn(async move {
            let writer_shutdown = subscriber.shutdown.clone();
            let writer_sub = subscriber.clone();
            let writer = tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = writer_shutdown.cancelled() => break,
                        _ = writer_sub.queue_signal.notified() => {
                            while let Some(msg) = writer_sub.queue.pop() {
                                if sink.send(msg).await.is_err() {
                                    writer_sub.begin_closing();
                                    return;
                                }
                            }
                        }
                    }
                }
                let _ = sink.send(Message::Close(None)).await;
            });

            let reader_shutdown = subscriber.shutdown.clone();
            let reader_sub = subscriber.clone();
            let reader_limiter = rate_limiter.clone();
            let max_bytes = config.max_message_bytes;
            let reader = tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = reader_shutdown.cancelled() => break,
                        frame = stream.next() => {
                            match frame {
                                Some(Ok(Message::Close(_))) | None => {
                                    reader_sub.begin_closing();
                                    break;
                                }
                                Some(Ok(Message::Text(text))) if !text.is_empty() => {
                                    if text.len() > max_bytes {
                                        reader_sub.begin_closing();
                                        break;
                                    }
                                    reader_sub.touch();
                                    let decision = reader_limiter.check_window(&reader_sub.remote_identity).await;
                                    if !decision.allowed {
                                        tracing::debug!(subscriber = %reader_sub.id, "message rate exceeded, closing connection");
                                        reader_sub.begin_closing();
                                        break;
                                    }
                                }
                                Some(Ok(Message::Binary(data))) if !data.is_empty() => {
                                    if data.len() > max_bytes {
                                        reader_sub.begin_closing();
                                        break;
                                    }
                                    reader_sub.touch();
                                }
                                Some(Ok(Message::Pong(_))) => {
                                    reader_sub.touch();
                                }
                                Some(Ok(_)) => {
                                    // empty text/binary/ping frames are not counted as activity (§4.4)
                                }
                                Some(Err(_)) => {
                                    reader_sub.begin_closing();
                                    break;
                                }
                            }
                        }
                    }
                }
            });

            let pinger_shutdown = subscriber.shutdown.clone();
            let pinger_sub = subscriber.clone();
            let ping_interval = config.ping_interval();
            let pong_timeout = config.pong_timeout();
            let pinger = tokio::spawn(async move {
                let mut ticker = tokio::time::interval(ping_interval);
                loop {
                    tokio::select! {
                        _ = pinger_shutdown.cancelled() => break,
                        _ = ticker.tick() => {
                            if pinger_sub.idle_for() > ping_interval + pong_timeout {
                                pinger_sub.begin_closing();
                                break;
                            }
                            if !pinger_sub.enqueue(Message::Ping(Vec::new().into())) {
                                tracing::debug!(subscriber = %pinger_sub.id, "ping dropped, send queue full");
                            }
                        }
                    }
                }
            });

            let _ = timeout(Duration::from_secs(5), async {
                let _ = reader.await;
                subscriber.begin_closing();
                let _ = writer.await;
                let _ = pinger.await;
            })
            .await;

            subscriber.mark_closed();
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn token() -> CancellationToken {
        CancellationToken::new()
    }

    #[test]
    fn starts_active() {
        let sub = Subscriber::new("127.0.0.1".into(), 8, &token());
        assert_eq!(sub.state(), SubscriberState::Active);
    }

    #[test]
    fn begin_closing_transitions_once() {
        let sub = Subscriber::new("127.0.0.1".into(), 8, &token());
        sub.begin_closing();
        assert_eq!(sub.state(), SubscriberState::Closing);
        // idempotent: calling again does not panic or regress state
        sub.begin_closing();
        assert_eq!(sub.state(), SubscriberState::Closing);
    }

    #[test]
    fn enqueue_rejected_once_not_active() {
        let sub = Subscriber::new("127.0.0.1".into(), 8, &token());
        sub.begin_closing();
        assert!(!sub.enqueue(Message::Text("hi".into())));
    }

    #[test]
    fn enqueue_respects_ring_buffer_capacity() {
        let sub = Subscriber::new("127.0.0.1".into(), 2, &token());
        assert!(sub.enqueue(Message::Text("a".into())));
        assert!(!sub.enqueue(Message::Text("b".into())));
    }

    #[test]
    fn queue_utilization_reflects_fill() {
        let sub = Subscriber::new("127.0.0.1".into(), 4, &token());
        assert_eq!(sub.queue_utilization(), 0.0);
        sub.enqueue(Message::Text("a".into()));
        assert!(sub.queue_utilization() > 0.0);
    }
}
