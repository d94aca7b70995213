//! Downstream WebSocket connection manager (spec.md §4.4 / C4).
//!
//! Grounded on `original_source/internal/ws/connection_manager.go`'s
//! client/topic registry, restyled on the axum `WebSocketUpgrade` session
//! shape in `indexmaker-backend/src/handlers/orderbook_ws.rs`. Deviates from
//! the teacher's shared `tokio::sync::broadcast` channel
//! (`operations_ws.rs`'s `OperationBroadcaster`): a lagged `broadcast`
//! receiver drops every message it missed, not a per-message choice, so a
//! slow client here cannot be made to drop independently of the others. A
//! bounded `mpsc` per client gives each session its own queue and its own
//! drop policy (see DESIGN.md).

use axum::extract::ws::{CloseFrame, Message};
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use tokio::sync::mpsc;
use tracing::warn;
use uuid::Uuid;

const CLIENT_QUEUE_CAPACITY: usize = 256;

/// Why a session is being unregistered (spec.md §4.4: `unregister`'s
/// documented close status, distinct from the read pump's cancellation
/// status).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    ClientDisconnected,
    ContextCancelled,
}

impl CloseReason {
    fn status_text(self) -> &'static str {
        match self {
            CloseReason::ClientDisconnected => "client disconnected",
            CloseReason::ContextCancelled => "context cancelled",
        }
    }
}

#[derive(Clone)]
pub struct ClientHandle {
    pub id: Uuid,
    sender: mpsc::Sender<Message>,
    /// Unbounded and separate from `sender`'s bounded queue: a close must
    /// reach the write pump even when the outbound queue is full of
    /// undelivered broadcasts.
    close_tx: mpsc::UnboundedSender<CloseReason>,
}

impl ClientHandle {
    /// Non-blocking send. Returns `false` if the queue was full or the
    /// client has gone away; the caller drops the message rather than
    /// stall the broadcast loop (spec.md §4.4 invariant I4).
    pub fn try_send(&self, message: Message) -> bool {
        self.sender.try_send(message).is_ok()
    }
}

#[derive(Default)]
struct Registry {
    clients: HashMap<Uuid, ClientHandle>,
    subscriptions: HashMap<String, HashSet<Uuid>>,
}

/// Tracks connected downstream WebSocket sessions and their topic
/// subscriptions. One instance is shared across the process.
#[derive(Default)]
pub struct ConnectionManager {
    registry: RwLock<Registry>,
}

impl ConnectionManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a new session. Returns the receiving halves of its
    /// outbound message queue and its close signal, for the session's write
    /// pump to select over.
    pub fn register(&self) -> (Uuid, mpsc::Receiver<Message>, mpsc::UnboundedReceiver<CloseReason>) {
        let id = Uuid::new_v4();
        let (tx, rx) = mpsc::channel(CLIENT_QUEUE_CAPACITY);
        let (close_tx, close_rx) = mpsc::unbounded_channel();
        let handle = ClientHandle { id, sender: tx, close_tx };
        self.registry.write().clients.insert(id, handle);
        (id, rx, close_rx)
    }

    /// Removes the session and every subscription it held, and signals the
    /// session's write pump to close the underlying socket with `reason`
    /// (spec.md §4.4). Idempotent: unregistering an already-removed or
    /// unknown id is a no-op.
    pub fn unregister(&self, id: Uuid, reason: CloseReason) {
        let handle = {
            let mut reg = self.registry.write();
            let handle = reg.clients.remove(&id);
            for subscribers in reg.subscriptions.values_mut() {
                subscribers.remove(&id);
            }
            reg.subscriptions.retain(|_, subs| !subs.is_empty());
            handle
        };
        if let Some(handle) = handle {
            // Ignore the error: the write pump may have already exited (the
            // session is tearing itself down on its own), in which case
            // there is nothing left to close.
            let _ = handle.close_tx.send(reason);
        }
    }

    pub fn subscribe(&self, id: Uuid, topic: impl Into<String>) {
        self.registry
            .write()
            .subscriptions
            .entry(topic.into())
            .or_default()
            .insert(id);
    }

    pub fn unsubscribe(&self, id: Uuid, topic: &str) {
        let mut reg = self.registry.write();
        if let Some(subs) = reg.subscriptions.get_mut(topic) {
            subs.remove(&id);
            if subs.is_empty() {
                reg.subscriptions.remove(topic);
            }
        }
    }

    pub fn get_client(&self, id: Uuid) -> Option<ClientHandle> {
        self.registry.read().clients.get(&id).cloned()
    }

    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.registry
            .read()
            .subscriptions
            .get(topic)
            .map(|s| s.len())
            .unwrap_or(0)
    }

    /// Sends `payload` to every client subscribed to `topic`. A full queue
    /// is dropped with a warning rather than blocking the broadcast for
    /// every other subscriber (spec.md §4.4 invariant I4).
    pub fn broadcast(&self, topic: &str, payload: String) {
        let targets: Vec<ClientHandle> = {
            let reg = self.registry.read();
            match reg.subscriptions.get(topic) {
                Some(ids) => ids
                    .iter()
                    .filter_map(|id| reg.clients.get(id).cloned())
                    .collect(),
                None => return,
            }
        };
        for client in targets {
            if !client.try_send(Message::Text(payload.clone().into())) {
                warn!(client_id = %client.id, topic, "client queue full, dropping message");
            }
        }
    }
}

/// Builds the axum close frame for a given reason, normal closure (code
/// 1000) carrying the documented status text (spec.md §4.4).
pub fn close_frame(reason: CloseReason) -> CloseFrame {
    CloseFrame {
        code: 1000,
        reason: reason.status_text().into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn broadcast_reaches_only_subscribed_clients() {
        let mgr = ConnectionManager::new();
        let (a_id, mut a_rx, _a_close) = mgr.register();
        let (b_id, mut b_rx, _b_close) = mgr.register();
        mgr.subscribe(a_id, "btcusdt@depth");

        mgr.broadcast("btcusdt@depth", "hello".to_string());

        assert!(a_rx.try_recv().is_ok());
        assert!(b_rx.try_recv().is_err());
        let _ = b_id;
    }

    #[tokio::test]
    async fn unregister_clears_subscriptions() {
        let mgr = ConnectionManager::new();
        let (id, _rx, _close_rx) = mgr.register();
        mgr.subscribe(id, "ethusdt@depth");
        assert_eq!(mgr.subscriber_count("ethusdt@depth"), 1);

        mgr.unregister(id, CloseReason::ClientDisconnected);
        assert_eq!(mgr.subscriber_count("ethusdt@depth"), 0);
        assert!(mgr.get_client(id).is_none());
    }

    #[tokio::test]
    async fn unregister_is_idempotent() {
        let mgr = ConnectionManager::new();
        let (id, _rx, _close_rx) = mgr.register();
        mgr.unregister(id, CloseReason::ClientDisconnected);
        // second call on an already-removed id must not panic.
        mgr.unregister(id, CloseReason::ClientDisconnected);
    }

    #[tokio::test]
    async fn unregister_signals_close_with_documented_status() {
        let mgr = ConnectionManager::new();
        let (id, _rx, mut close_rx) = mgr.register();

        mgr.unregister(id, CloseReason::ClientDisconnected);

        let reason = close_rx.recv().await.expect("close signal delivered");
        assert_eq!(reason, CloseReason::ClientDisconnected);
        assert_eq!(close_frame(reason).reason.to_string(), "client disconnected");
    }

    #[tokio::test]
    async fn context_cancelled_close_carries_its_own_status() {
        let mgr = ConnectionManager::new();
        let (id, _rx, mut close_rx) = mgr.register();

        mgr.unregister(id, CloseReason::ContextCancelled);

        let reason = close_rx.recv().await.expect("close signal delivered");
        assert_eq!(close_frame(reason).reason.to_string(), "context cancelled");
    }

    #[tokio::test]
    async fn full_queue_drops_without_blocking_other_subscribers() {
        let mgr = ConnectionManager::new();
        let (slow_id, slow_rx, _slow_close) = mgr.register();
        let (fast_id, mut fast_rx, _fast_close) = mgr.register();
        mgr.subscribe(slow_id, "t");
        mgr.subscribe(fast_id, "t");

        for i in 0..CLIENT_QUEUE_CAPACITY + 5 {
            mgr.broadcast("t", format!("msg-{i}"));
        }

        // the fast consumer still got at least one message despite the
        // slow one never draining its queue.
        assert!(fast_rx.try_recv().is_ok());
        drop(slow_rx);
    }
}
