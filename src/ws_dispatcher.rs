//! Downstream WebSocket dispatcher (spec.md §4.6 / C6).
//!
//! Grounded on `original_source/internal/ws/{router.go,handler.go,ws.go}`;
//! restyled on the axum `ws.on_upgrade` + `tokio::select!` pump in
//! `indexmaker-backend/src/handlers/orderbook_ws.rs`.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::connection_manager::{CloseReason, ConnectionManager, close_frame};

/// Inbound request frame: `{"action": "...", "payload": ...}`.
#[derive(Debug, Deserialize)]
struct RequestFrame {
    action: String,
    #[serde(default)]
    payload: Value,
}

/// A handler receives the session id, the connection manager, and the raw
/// payload; it is responsible for sending its own reply through the
/// manager's outbound queue.
pub type ActionHandler = Arc<
    dyn Fn(Uuid, Arc<ConnectionManager>, Value) -> Pin<Box<dyn Future<Output = ()> + Send>>
        + Send
        + Sync,
>;

/// Maps inbound `action` tags to handlers. Dispatch itself is oblivious to
/// what a handler does beyond routing (spec.md §4.6).
#[derive(Clone, Default)]
pub struct ActionRouter {
    handlers: Arc<HashMap<String, ActionHandler>>,
}

pub struct ActionRouterBuilder {
    handlers: HashMap<String, ActionHandler>,
}

impl ActionRouterBuilder {
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    pub fn handle<F, Fut>(mut self, action: impl Into<String>, handler: F) -> Self
    where
        F: Fn(Uuid, Arc<ConnectionManager>, Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let boxed: ActionHandler = Arc::new(move |id, mgr, payload| {
            Box::pin(handler(id, mgr, payload))
        });
        self.handlers.insert(action.into(), boxed);
        self
    }

    pub fn build(self) -> ActionRouter {
        ActionRouter {
            handlers: Arc::new(self.handlers),
        }
    }
}

/// Standard `subscribe`/`unsubscribe` handlers plus the `get_order_book`
/// domain handler (spec.md §11.4 supplement, grounded on
/// `internal/instrument/ws_handler.go`'s extensible action registration).
pub fn default_router(synchronizers: Arc<super::SymbolRegistry>) -> ActionRouter {
    ActionRouterBuilder::new()
        .handle("subscribe", |id, mgr, payload| async move {
            handle_subscribe(id, mgr, payload).await;
        })
        .handle("unsubscribe", |id, mgr, payload| async move {
            handle_unsubscribe(id, mgr, payload).await;
        })
        .handle("get_order_book", move |id, mgr, payload| {
            let synchronizers = Arc::clone(&synchronizers);
            async move {
                handle_get_order_book(id, mgr, payload, synchronizers).await;
            }
        })
        .build()
}

#[derive(Deserialize)]
struct TopicPayload {
    topic: String,
}

async fn handle_subscribe(id: Uuid, mgr: Arc<ConnectionManager>, payload: Value) {
    let topic = match serde_json::from_value::<TopicPayload>(payload) {
        Ok(t) if !t.topic.is_empty() => t.topic,
        _ => {
            reply(&mgr, id, json!({"action": "subscribe", "success": false, "error": "invalid topic"}));
            return;
        }
    };
    mgr.subscribe(id, topic.clone());
    reply(&mgr, id, json!({"action": "subscribe", "success": true, "topic": topic}));
}

async fn handle_unsubscribe(id: Uuid, mgr: Arc<ConnectionManager>, payload: Value) {
    let topic = match serde_json::from_value::<TopicPayload>(payload) {
        Ok(t) if !t.topic.is_empty() => t.topic,
        _ => {
            reply(&mgr, id, json!({"action": "unsubscribe", "success": false, "error": "invalid topic"}));
            return;
        }
    };
    mgr.unsubscribe(id, &topic);
    reply(&mgr, id, json!({"action": "unsubscribe", "success": true, "topic": topic}));
}

#[derive(Deserialize)]
struct OrderBookQuery {
    symbol: String,
}

async fn handle_get_order_book(
    id: Uuid,
    mgr: Arc<ConnectionManager>,
    payload: Value,
    synchronizers: Arc<super::SymbolRegistry>,
) {
    let query = match serde_json::from_value::<OrderBookQuery>(payload) {
        Ok(q) => q,
        Err(_) => {
            reply(&mgr, id, json!({"action": "get_order_book", "success": false, "error": "invalid payload"}));
            return;
        }
    };
    match synchronizers.order_book(&query.symbol) {
        Some(book) => reply(
            &mgr,
            id,
            json!({"action": "get_order_book", "success": true, "data": book}),
        ),
        None => reply(
            &mgr,
            id,
            json!({"action": "get_order_book", "success": false, "error": "order book not ready"}),
        ),
    }
}

fn reply(mgr: &ConnectionManager, id: Uuid, body: Value) {
    if let Some(client) = mgr.get_client(id) {
        let text = body.to_string();
        if !client.try_send(Message::Text(text.into())) {
            warn!(client_id = %id, "reply queue full, dropping reply");
        }
    }
}

#[derive(Clone)]
pub struct DispatcherState {
    pub connections: Arc<ConnectionManager>,
    pub router: ActionRouter,
}

pub async fn ws_upgrade_handler(
    ws: WebSocketUpgrade,
    State(state): State<DispatcherState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: DispatcherState) {
    let (mut sink, mut stream) = socket.split();
    let (id, mut outbound_rx, mut close_rx) = state.connections.register();

    let greeting = json!({ "client_id": id.to_string() }).to_string();
    if sink.send(Message::Text(greeting.into())).await.is_err() {
        state.connections.unregister(id, CloseReason::ClientDisconnected);
        return;
    }

    // The write pump owns the sink: it is the only task that can actually
    // close the socket. A close request (from `unregister`) always takes
    // priority over queued broadcasts, and is delivered even if the bounded
    // outbound queue is backed up (spec.md §4.4).
    let mut write_task = tokio::spawn(async move {
        loop {
            tokio::select! {
                biased;
                reason = close_rx.recv() => {
                    let reason = reason.unwrap_or(CloseReason::ClientDisconnected);
                    let _ = sink.send(Message::Close(Some(close_frame(reason)))).await;
                    break;
                }
                message = outbound_rx.recv() => {
                    match message {
                        Some(message) => {
                            if sink.send(message).await.is_err() {
                                break;
                            }
                        }
                        None => break,
                    }
                }
            }
        }
    });

    // Selecting on the write task's own `JoinHandle` (it implements
    // `Future`) means a write failure is observed here as soon as it
    // happens, instead of only being noticed once the read side
    // independently detects the broken socket (spec.md §4.4: "a write error
    // terminates the pump, causing the session to be unregistered by the
    // read pump").
    loop {
        tokio::select! {
            _ = &mut write_task => {
                break;
            }
            frame = stream.next() => {
                match frame {
                    Some(Ok(message)) => match message {
                        Message::Text(text) => {
                            let frame: RequestFrame = match serde_json::from_str(&text) {
                                Ok(f) => f,
                                Err(e) => {
                                    debug!(client_id = %id, error = %e, "malformed inbound frame, ignoring");
                                    continue;
                                }
                            };
                            match state.router.handlers.get(&frame.action) {
                                Some(handler) => {
                                    let handler = Arc::clone(handler);
                                    let connections = Arc::clone(&state.connections);
                                    tokio::spawn(async move { handler(id, connections, frame.payload).await });
                                }
                                None => {
                                    reply(
                                        &state.connections,
                                        id,
                                        json!({"action": frame.action, "success": false, "error": "unknown action"}),
                                    );
                                }
                            }
                        }
                        Message::Close(_) => break,
                        _ => {}
                    },
                    _ => break,
                }
            }
        }
    }

    write_task.abort();
    state.connections.unregister(id, CloseReason::ClientDisconnected);
}
