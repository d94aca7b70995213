//! Instrument price-change notifier (spec.md §4.8 / C8).
//!
//! Grounded on `original_source/internal/events/instrument_update_event.go`
//! and `internal/instrument/module.go`'s bus registration at startup. The
//! full instrument CRUD service that would emit these events is out of
//! scope (spec.md §1); this module only wires the bus subscriber that
//! repackages the event for downstream clients, plus the publish-side
//! function an admin surface would call.

use std::sync::Arc;

use serde_json::json;
use tracing::debug;

use crate::bus::EventBus;
use crate::connection_manager::ConnectionManager;
use crate::models::{Event, EventData, INSTRUMENT_UPDATED_TOPIC, InstrumentUpdatedEvent};

/// Publishes an instrument price change. Called by whatever administrative
/// surface owns instrument mutation (out of scope here).
pub fn publish_price_change(bus: &EventBus<Event>, event: InstrumentUpdatedEvent) {
    bus.publish(INSTRUMENT_UPDATED_TOPIC, Event::instrument_updated(event));
}

/// Registers the subscriber that turns `instrument.updated` bus events into
/// WebSocket envelopes broadcast under the instrument's own symbol topic.
/// Shares the single process-wide bus with C5's depth events (spec.md §9) —
/// this subscriber simply ignores any `EventData` variant that isn't its own.
pub fn register(bus: &EventBus<Event>, connections: Arc<ConnectionManager>) {
    bus.subscribe(INSTRUMENT_UPDATED_TOPIC, move |event: Event| {
        let connections = Arc::clone(&connections);
        async move {
            let EventData::InstrumentUpdated(event) = event.data else {
                return;
            };
            debug!(symbol = %event.symbol, price = %event.price, "broadcasting instrument price update");
            let envelope = json!({
                "action": "price_update",
                "topic": INSTRUMENT_UPDATED_TOPIC,
                "data": event,
            });
            connections.broadcast(&event_symbol_topic(&event), envelope.to_string());
        }
    });
}

fn event_symbol_topic(event: &InstrumentUpdatedEvent) -> String {
    event.symbol.clone()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[tokio::test]
    async fn publish_reaches_subscribers_on_symbol_topic() {
        let bus: EventBus<Event> = EventBus::new();
        let connections = Arc::new(ConnectionManager::new());
        register(&bus, Arc::clone(&connections));

        let (client_id, mut rx, _close_rx) = connections.register();
        connections.subscribe(client_id, "AAPL");

        publish_price_change(
            &bus,
            InstrumentUpdatedEvent {
                symbol: "AAPL".to_string(),
                price: "123.45".to_string(),
                updated_at: Utc::now(),
            },
        );

        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert!(rx.try_recv().is_ok());
    }
}
