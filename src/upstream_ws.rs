//! Upstream WebSocket client (spec.md §4.2 / C2).
//!
//! Grounded on `original_source/internal/ws/client.go` (`Connect`,
//! `readLoop`, `pingLoop`, `reconnect`), restyled on the
//! `tokio_tungstenite::connect_async` + `tokio::select!` pump shape used by
//! `indexmaker-backend/src/services/bitget_ws_feeder.rs`.

use futures_util::{SinkExt, StreamExt};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, watch};
use tokio_tungstenite::tungstenite::protocol::Message;
use tracing::{debug, error, warn};

use crate::error::AppResult;

const DEFAULT_KEEPALIVE: Duration = Duration::from_secs(20);
const DEFAULT_MAX_MESSAGE_BYTES: usize = 5 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    Text,
    Binary,
}

/// Invoked once per decoded frame, awaited before the read pump resumes
/// reading the next one. This is deliberate: it gives the caller a natural
/// way to apply back-pressure (e.g. a blocking channel send) all the way
/// back to the socket, rather than racing spawned tasks against the wire's
/// delivery order.
type OnMessage =
    Arc<dyn Fn(MessageKind, Vec<u8>) -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync>;

/// Single-endpoint full-duplex client with a message callback, periodic
/// keepalive, and a blocking wait for closure.
pub struct UpstreamWsClient {
    url: String,
    keepalive: Duration,
    max_message_bytes: usize,
    on_message: OnMessage,
    writer: Mutex<Option<futures_util::stream::SplitSink<WsStream, Message>>>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
}

type WsStream = tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

impl UpstreamWsClient {
    pub fn new<F, Fut>(url: impl Into<String>, on_message: F) -> Self
    where
        F: Fn(MessageKind, Vec<u8>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Self {
            url: url.into(),
            keepalive: DEFAULT_KEEPALIVE,
            max_message_bytes: DEFAULT_MAX_MESSAGE_BYTES,
            on_message: Arc::new(move |kind, payload| Box::pin(on_message(kind, payload))),
            writer: Mutex::new(None),
            shutdown_tx,
            shutdown_rx,
        }
    }

    pub fn with_keepalive(mut self, interval: Duration) -> Self {
        self.keepalive = interval;
        self
    }

    pub fn with_max_message_bytes(mut self, max: usize) -> Self {
        self.max_message_bytes = max;
        self
    }

    /// Dials the URL; fails on any handshake error. On success, begins a
    /// read pump and a keepalive pump as background tasks.
    pub async fn connect(self: &Arc<Self>) -> AppResult<()> {
        let (stream, _) = tokio_tungstenite::connect_async(&self.url).await?;
        let (write, read) = stream.split();
        *self.writer.lock().await = Some(write);

        let this = Arc::clone(self);
        tokio::spawn(async move { this.read_pump(read).await });

        let this = Arc::clone(self);
        tokio::spawn(async move { this.keepalive_pump().await });

        Ok(())
    }

    async fn read_pump(
        self: Arc<Self>,
        mut read: futures_util::stream::SplitStream<WsStream>,
    ) {
        loop {
            tokio::select! {
                _ = self.shutdown_rx.clone().changed() => {
                    return;
                }
                msg = read.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => {
                            if text.len() > self.max_message_bytes {
                                warn!(len = text.len(), "upstream message exceeds size cap, dropping");
                                continue;
                            }
                            (self.on_message)(MessageKind::Text, text.into_bytes()).await;
                        }
                        Some(Ok(Message::Binary(data))) => {
                            if data.len() > self.max_message_bytes {
                                warn!(len = data.len(), "upstream message exceeds size cap, dropping");
                                continue;
                            }
                            (self.on_message)(MessageKind::Binary, data.to_vec()).await;
                        }
                        Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => {}
                        Some(Ok(Message::Close(frame))) => {
                            debug!(?frame, "upstream closed the connection");
                            break;
                        }
                        Some(Ok(Message::Frame(_))) => {}
                        Some(Err(e)) => {
                            error!(error = %e, "upstream read error");
                            break;
                        }
                        None => break,
                    }
                }
            }
        }
        let _ = self.shutdown_tx.send(true);
    }

    async fn keepalive_pump(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.keepalive);
        let mut shutdown_rx = self.shutdown_rx.clone();
        loop {
            tokio::select! {
                _ = shutdown_rx.changed() => return,
                _ = ticker.tick() => {
                    let mut guard = self.writer.lock().await;
                    if let Some(writer) = guard.as_mut() {
                        if writer.send(Message::Ping(Vec::new().into())).await.is_err() {
                            return;
                        }
                    }
                }
            }
        }
    }

    /// Serializes `v` and writes a text frame. Writes are serialized under
    /// a mutex so they never interleave on the socket.
    pub async fn send_json<T: serde::Serialize>(&self, v: &T) -> AppResult<()> {
        let data = serde_json::to_string(v)
            .map_err(|e| crate::error::AppError::Decode(e.to_string()))?;
        let mut guard = self.writer.lock().await;
        if let Some(writer) = guard.as_mut() {
            writer
                .send(Message::Text(data.into()))
                .await
                .map_err(crate::error::AppError::Connect)?;
        }
        Ok(())
    }

    /// Suspends until the client's scope is cancelled (connection closed or
    /// explicitly `close()`d).
    ///
    /// Deliberately built on the `shutdown_rx` watch channel rather than a
    /// `Notify`: a freshly cloned `Receiver` already observes whatever value
    /// the sender last stored, so `changed()` resolves immediately if the
    /// closure happened anywhere between `connect()` returning and this call
    /// being awaited — unlike `Notify::notify_waiters()`, which only wakes
    /// waiters registered at the exact moment it fires and permanently loses
    /// the wakeup otherwise.
    pub async fn block_until_closed(&self) {
        let mut rx = self.shutdown_rx.clone();
        if *rx.borrow() {
            return;
        }
        let _ = rx.changed().await;
    }

    /// Cancels the scope and issues a normal-closure frame.
    pub async fn close(&self) {
        let mut guard = self.writer.lock().await;
        if let Some(writer) = guard.as_mut() {
            let _ = writer.close().await;
        }
        let _ = self.shutdown_tx.send(true);
    }

    pub fn is_closed(&self) -> bool {
        *self.shutdown_rx.borrow()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn max_message_bytes_defaults_to_5mib() {
        let client = UpstreamWsClient::new("wss://example.invalid", |_, _| async {});
        assert_eq!(client.max_message_bytes, DEFAULT_MAX_MESSAGE_BYTES);
    }

    #[test]
    fn keepalive_defaults_to_20s() {
        let client = UpstreamWsClient::new("wss://example.invalid", |_, _| async {});
        assert_eq!(client.keepalive, Duration::from_secs(20));
    }

    /// Closure that happens before `block_until_closed` is ever called must
    /// still be observed, not hang forever — the bug this guards against.
    #[tokio::test]
    async fn block_until_closed_returns_immediately_if_already_closed() {
        let client = Arc::new(UpstreamWsClient::new("wss://example.invalid", |_, _| async {}));
        let _ = client.shutdown_tx.send(true);

        tokio::time::timeout(Duration::from_millis(200), client.block_until_closed())
            .await
            .expect("block_until_closed must not hang once the client is already closed");
    }
}
