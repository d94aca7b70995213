//! Topic-based publish/subscribe event bus (spec.md §4.3 / C3).
//!
//! Grounded on `original_source/internal/events/bus.go`: an `RwLock`-guarded
//! `map[string][]Handler` where `Publish` fans each matching handler out onto
//! its own goroutine. `tokio::spawn` plays the same role here. Restyled on
//! the `OperationBroadcaster` wrapper in
//! `indexmaker-backend/src/handlers/operations_ws.rs`.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tracing::trace;

/// A subscriber receives an owned clone of the event. Boxed so handlers of
/// different shapes can live in the same topic's subscriber list.
pub type Handler<E> = Arc<dyn Fn(E) -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync>;

/// An in-process event bus keyed by topic name. `E` is the event payload
/// type shared by every topic registered on this bus instance. The process
/// runs exactly one of these (`EventBus<Event>`, see `models::Event`):
/// components with distinct event shapes tag their payload as an
/// `EventData` variant rather than each owning a separately-typed bus,
/// mirroring the single `*events.Bus` in `original_source/internal/events/bus.go`.
pub struct EventBus<E: Clone + Send + 'static> {
    handlers: RwLock<HashMap<String, Vec<Handler<E>>>>,
}

impl<E: Clone + Send + 'static> Default for EventBus<E> {
    fn default() -> Self {
        Self {
            handlers: RwLock::new(HashMap::new()),
        }
    }
}

impl<E: Clone + Send + 'static> EventBus<E> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `handler` under `topic`. Multiple subscribers on the same
    /// topic are invoked in registration order on every publish.
    pub fn subscribe<F, Fut>(&self, topic: impl Into<String>, handler: F)
    where
        F: Fn(E) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let boxed: Handler<E> = Arc::new(move |event| Box::pin(handler(event)));
        self.handlers
            .write()
            .entry(topic.into())
            .or_default()
            .push(boxed);
    }

    /// Fans `event` out to every handler subscribed on `topic`, each on its
    /// own spawned task. Returns immediately; publishers never block on
    /// subscriber work (spec.md §4.3 invariant I3).
    pub fn publish(&self, topic: &str, event: E) {
        let handlers = {
            let guard = self.handlers.read();
            match guard.get(topic) {
                Some(hs) => hs.clone(),
                None => {
                    trace!(topic, "publish with no subscribers");
                    return;
                }
            }
        };
        for handler in handlers {
            let event = event.clone();
            tokio::spawn(async move { handler(event).await });
        }
    }

    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.handlers
            .read()
            .get(topic)
            .map(|hs| hs.len())
            .unwrap_or(0)
    }
}
