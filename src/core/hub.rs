//! BroadcastHub: the single source of truth for the active subscriber set
//! (§4.5). All mutations funnel through a serialized event loop so fan-out
//! never contends with register/unregister under a shared lock.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::Message;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::core::subscriber::Subscriber;
use crate::core::types::{MessageEnvelope, Priority};
use crate::websocket::ConnectionId;

/// Fallback drop threshold (§4.5) when a caller doesn't have a
/// `WebSocketConfig` handy (e.g. a quick test hub).
pub const DEFAULT_DROP_THRESHOLD: f64 = 0.8;
const SHUTDOWN_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

enum HubEvent {
    Register(Arc<Subscriber>),
    Unregister(ConnectionId),
    Publish(MessageEnvelope),
    Snapshot(oneshot::Sender<usize>),
    Shutdown(oneshot::Sender<()>),
}

/// Handle used by producers (orchestrator, HTTP handlers) to talk to the
/// hub's event loop. Cloning is cheap; the loop itself owns the registry.
#[derive(Clone)]
pub struct BroadcastHub {
    tx: mpsc::Sender<HubEvent>,
    active_count: Arc<AtomicU64>,
    dropped_messages: Arc<AtomicU64>,
}

impl BroadcastHub {
    /// Spawn the event loop and return a handle plus its join handle.
    /// `drop_threshold` is the queue-utilization fraction above which §4.5's
    /// backpressure policy kicks in (normally `config.websocket.drop_threshold`).
    pub fn spawn(shutdown: CancellationToken, drop_threshold: f64) -> (Self, tokio::task::JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(1024);
        let active_count = Arc::new(AtomicU64::new(0));
        let dropped_messages = Arc::new(AtomicU64::new(0));

        let handle = Self {
            tx,
            active_count: active_count.clone(),
            dropped_messages: dropped_messages.clone(),
        };

        let join = tokio::spawn(Self::run(rx, active_count, dropped_messages, shutdown, drop_threshold));
        (handle, join)
    }

    pub async fn register(&self, subscriber: Arc<Subscriber>) {
        let _ = self.tx.send(HubEvent::Register(subscriber)).await;
    }

    /// Idempotent: unregistering a connection that is already gone is a
    /// no-op inside the event loop.
    pub async fn unregister(&self, connection: ConnectionId) {
        let _ = self.tx.send(HubEvent::Unregister(connection)).await;
    }

    pub async fn publish(&self, envelope: MessageEnvelope) {
        let _ = self.tx.send(HubEvent::Publish(envelope)).await;
    }

    pub async fn connected_subscribers(&self) -> usize {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self.tx.send(HubEvent::Snapshot(reply_tx)).await.is_err() {
            return 0;
        }
        reply_rx.await.unwrap_or(0)
    }

    pub fn dropped_messages(&self) -> u64 {
        self.dropped_messages.load(Ordering::Relaxed)
    }

    pub fn active_count(&self) -> u64 {
        self.active_count.load(Ordering::Relaxed)
    }

    /// Begins CLOSING on every subscriber and waits (up to a deadline) for
    /// the event loop itself to drain and exit (§4.5, §4.10).
    pub async fn shutdown(&self) {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self.tx.send(HubEvent::Shutdown(reply_tx)).await.is_err() {
            return;
        }
        let _ = tokio::time::timeout(SHUTDOWN_DRAIN_TIMEOUT, reply_rx).await;
    }

    async fn run(
        mut rx: mpsc::Receiver<HubEvent>,
        active_count: Arc<AtomicU64>,
        dropped_messages: Arc<AtomicU64>,
        shutdown: CancellationToken,
        drop_threshold: f64,
    ) {
        let mut registry: HashMap<ConnectionId, Arc<Subscriber>> = HashMap::new();

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    Self::close_all(&mut registry, &active_count).await;
                    break;
                }
                event = rx.recv() => {
                    let Some(event) = event else { break };
                    match event {
                        HubEvent::Register(subscriber) => {
                            registry.insert(subscriber.id, subscriber);
                            active_count.store(registry.len() as u64, Ordering::Relaxed);
                        }
                        HubEvent::Unregister(id) => {
                            if let Some(subscriber) = registry.remove(&id) {
                                subscriber.begin_closing();
                            }
                            active_count.store(registry.len() as u64, Ordering::Relaxed);
                        }
                        HubEvent::Publish(envelope) => {
                            Self::fan_out(&registry, &envelope, &dropped_messages, drop_threshold);
                        }
                        HubEvent::Snapshot(reply) => {
                            let _ = reply.send(registry.len());
                        }
                        HubEvent::Shutdown(reply) => {
                            Self::close_all(&mut registry, &active_count).await;
                            let _ = reply.send(());
                            break;
                        }
                    }
                }
            }
        }
    }

    /// Fan-out is O(active subscribers); each subscriber's queue decision
    /// is independent, matching §4.5's backpressure policy.
    fn fan_out(
        registry: &HashMap<ConnectionId, Arc<Subscriber>>,
        envelope: &MessageEnvelope,
        dropped_messages: &AtomicU64,
        drop_threshold: f64,
    ) {
        let payload = match serde_json::to_string(envelope) {
            Ok(text) => text,
            Err(err) => {
                tracing::warn!(error = %err, "failed to encode envelope, skipping publish");
                return;
            }
        };
        let priority = envelope.priority();

        for subscriber in registry.values() {
            if !subscriber.is_active() {
                continue;
            }

            if subscriber.queue_utilization() < drop_threshold {
                subscriber.enqueue(Message::Text(payload.clone().into()));
                continue;
            }

            match priority {
                Priority::High => {
                    if !subscriber.enqueue(Message::Text(payload.clone().into())) {
                        tracing::warn!(subscriber = %subscriber.id, "high-priority delivery failed under backpressure");
                        subscriber.begin_closing();
                    }
                }
                Priority::Normal => {
                    dropped_messages.fetch_add(1, Ordering::Relaxed);
                }
            }
        }
    }

    async fn close_all(registry: &mut HashMap<ConnectionId, Arc<Subscriber>>, active_count: &AtomicU64) {
        for subscriber in registry.values() {
            subscriber.begin_closing();
        }
        registry.clear();
        active_count.store(0, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::EnvelopeKind;

    #[tokio::test]
    async fn register_increments_active_count() {
        let shutdown = CancellationToken::new();
        let (hub, _join) = BroadcastHub::spawn(shutdown.clone(), DEFAULT_DROP_THRESHOLD);
        let sub = Subscriber::new("1.1.1.1".into(), 8, &shutdown);
        hub.register(sub).await;
        assert_eq!(hub.connected_subscribers().await, 1);
    }

    #[tokio::test]
    async fn unregister_is_idempotent() {
        let shutdown = CancellationToken::new();
        let (hub, _join) = BroadcastHub::spawn(shutdown.clone(), DEFAULT_DROP_THRESHOLD);
        let id = ConnectionId::new();
        hub.unregister(id).await;
        hub.unregister(id).await;
        assert_eq!(hub.connected_subscribers().await, 0);
    }

    #[tokio::test]
    async fn publish_enqueues_on_active_subscriber() {
        let shutdown = CancellationToken::new();
        let (hub, _join) = BroadcastHub::spawn(shutdown.clone(), DEFAULT_DROP_THRESHOLD);
        let sub = Subscriber::new("1.1.1.1".into(), 8, &shutdown);
        hub.register(sub.clone()).await;
        hub.publish(MessageEnvelope::new(EnvelopeKind::FullReload)).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(sub.queue_utilization() > 0.0);
    }

    #[tokio::test]
    async fn shutdown_closes_all_subscribers() {
        let shutdown = CancellationToken::new();
        let (hub, _join) = BroadcastHub::spawn(shutdown.clone(), DEFAULT_DROP_THRESHOLD);
        let sub = Subscriber::new("1.1.1.1".into(), 8, &shutdown);
        hub.register(sub.clone()).await;
        hub.shutdown().await;
        assert_eq!(hub.connected_subscribers().await, 0);
    }
}
