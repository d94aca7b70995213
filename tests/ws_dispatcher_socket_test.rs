//! Socket-level end-to-end test of the downstream WebSocket dispatcher
//! (spec.md §4.6 / C6): a real client connects over a real TCP socket,
//! exercising `ws_upgrade_handler`/`handle_socket`'s actual read/write pumps
//! rather than calling `handle_subscribe`/`handle_unsubscribe` directly.
//! This is the "embedded `axum` WS echo server" test tooling SPEC_FULL.md
//! §10.4 commits to.

use std::collections::HashMap;
use std::sync::Arc;

use axum::Router;
use axum::routing::get;
use depth_relay::SymbolRegistry;
use depth_relay::connection_manager::ConnectionManager;
use depth_relay::ws_dispatcher::{self, DispatcherState};
use futures_util::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio_tungstenite::tungstenite::Message;

async fn spawn_server() -> String {
    let registry = Arc::new(SymbolRegistry::new(HashMap::new()));
    let dispatcher_state = DispatcherState {
        connections: Arc::new(ConnectionManager::new()),
        router: ws_dispatcher::default_router(registry),
    };

    let app = Router::new()
        .route("/ws", get(ws_dispatcher::ws_upgrade_handler))
        .with_state(dispatcher_state);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    format!("ws://{addr}/ws")
}

#[tokio::test]
async fn greeting_is_sent_on_connect() {
    let url = spawn_server().await;
    let (mut socket, _) = tokio_tungstenite::connect_async(&url).await.unwrap();

    let frame = socket.next().await.expect("connection closed before greeting").unwrap();
    let text = match frame {
        Message::Text(t) => t,
        other => panic!("expected text frame, got {other:?}"),
    };
    let body: Value = serde_json::from_str(&text).unwrap();
    assert!(body["client_id"].is_string());
}

#[tokio::test]
async fn unknown_action_gets_an_error_reply() {
    // spec.md §8 S6
    let url = spawn_server().await;
    let (mut socket, _) = tokio_tungstenite::connect_async(&url).await.unwrap();

    let _greeting = socket.next().await.unwrap().unwrap();

    socket
        .send(Message::Text(json!({"action": "not_a_real_action", "payload": {}}).to_string().into()))
        .await
        .unwrap();

    let frame = socket.next().await.expect("connection closed before reply").unwrap();
    let text = match frame {
        Message::Text(t) => t,
        other => panic!("expected text frame, got {other:?}"),
    };
    let body: Value = serde_json::from_str(&text).unwrap();
    assert_eq!(body["action"], "not_a_real_action");
    assert_eq!(body["success"], false);
    assert_eq!(body["error"], "unknown action");
}

#[tokio::test]
async fn subscribe_over_the_wire_gets_a_success_reply() {
    let url = spawn_server().await;
    let (mut socket, _) = tokio_tungstenite::connect_async(&url).await.unwrap();

    let _greeting = socket.next().await.unwrap().unwrap();

    socket
        .send(Message::Text(
            json!({"action": "subscribe", "payload": {"topic": "btcusdt@depth"}}).to_string().into(),
        ))
        .await
        .unwrap();

    let frame = socket.next().await.expect("connection closed before reply").unwrap();
    let text = match frame {
        Message::Text(t) => t,
        other => panic!("expected text frame, got {other:?}"),
    };
    let body: Value = serde_json::from_str(&text).unwrap();
    assert_eq!(body["action"], "subscribe");
    assert_eq!(body["success"], true);
}
