//! Integration test for the C5 -> C3 -> C4 data flow (spec.md §2): a depth
//! event published on the bus under a symbol's topic must reach every
//! downstream client subscribed to that topic through the connection
//! manager, mirroring the wiring performed in `main.rs`.

use axum::extract::ws::Message;
use depth_relay::bus::EventBus;
use depth_relay::connection_manager::ConnectionManager;
use depth_relay::models::{DepthDelta, Event, EventData, PriceLevel, depth_topic};
use std::sync::Arc;

fn sample_delta() -> DepthDelta {
    DepthDelta {
        event_type: "depthUpdate".to_string(),
        event_time: 1_700_000_000_000,
        symbol: "BTCUSDT".to_string(),
        first_update_id: 101,
        final_update_id: 101,
        bids: vec![PriceLevel::new("42000.10", "1.5")],
        asks: vec![],
    }
}

#[tokio::test]
async fn published_depth_event_reaches_subscribed_client_only() {
    // One shared bus keyed by a tagged `Event`, exactly as `main.rs` wires C5
    // into C3 into C4 (spec.md §9) — not a standalone `EventBus<DepthDelta>`.
    let bus: EventBus<Event> = EventBus::new();
    let connections = Arc::new(ConnectionManager::new());

    let topic = depth_topic("BTCUSDT");
    let wired_connections = Arc::clone(&connections);
    let wired_topic = topic.clone();
    bus.subscribe(topic.clone(), move |event: Event| {
        let connections = Arc::clone(&wired_connections);
        let topic = wired_topic.clone();
        async move {
            let EventData::Depth(delta) = event.data else {
                return;
            };
            let payload = serde_json::to_string(&delta).unwrap();
            connections.broadcast(&topic, payload);
        }
    });

    let (subscribed_id, mut subscribed_rx, _subscribed_close) = connections.register();
    let (_other_id, mut other_rx, _other_close) = connections.register();
    connections.subscribe(subscribed_id, topic.clone());

    bus.publish(&topic, Event::depth("BTCUSDT", sample_delta()));

    for _ in 0..20 {
        tokio::task::yield_now().await;
    }

    let message = subscribed_rx.try_recv().expect("subscribed client should receive the event");
    let text = match message {
        Message::Text(t) => t,
        other => panic!("expected text frame, got {other:?}"),
    };
    let decoded: DepthDelta = serde_json::from_str(&text).unwrap();
    assert_eq!(decoded.final_update_id, 101);
    assert_eq!(decoded.bids[0].price, "42000.10");

    assert!(other_rx.try_recv().is_err(), "unsubscribed client must not receive the event");
}
