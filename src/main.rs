//! Process entry point: wires configuration, logging, the per-symbol
//! synchronizers, the event buses, the connection manager, and the axum
//! router, then serves until a shutdown signal is handled within a bounded
//! window.
//!
//! Grounded on `indexmaker-backend/src/main.rs`'s `AppState` + router
//! wiring, and on `original_source/cmd/serve.go`'s signal-bounded shutdown.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::routing::get;
use depth_relay::SymbolRegistry;
use depth_relay::bus::EventBus;
use depth_relay::config::Config;
use depth_relay::connection_manager::ConnectionManager;
use depth_relay::depth_sync::DepthSynchronizer;
use depth_relay::instrument_notifier;
use depth_relay::market;
use depth_relay::models::{Event, EventData, depth_topic};
use depth_relay::ws_dispatcher::{self, ActionRouter, DispatcherState};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::prelude::*;

#[tokio::main]
async fn main() {
    let config_path = std::env::var("DEPTH_RELAY_CONFIG")
        .ok()
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("config.yaml"));

    let config = Config::load(Some(&config_path)).expect("failed to load configuration");

    tracing_subscriber::registry()
        .with(EnvFilter::try_new(&config.log_level).unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!(port = config.listen_port, symbols = ?config.symbols(), "starting depth relay");

    // One shared bus, keyed by topic, carrying a tagged `Event` payload
    // (spec.md §9 design note) — C5's depth events and C8's instrument
    // events ride the same `*events.Bus`-equivalent rather than two
    // independently-typed instances.
    let bus: Arc<EventBus<Event>> = Arc::new(EventBus::new());
    let connections = Arc::new(ConnectionManager::new());

    let mut synchronizers = HashMap::new();
    for symbol in config.symbols() {
        let synchronizer = Arc::new(DepthSynchronizer::new(
            symbol.clone(),
            config.upstream_ws_url.clone(),
            config.upstream_rest_url.clone(),
            Arc::clone(&bus),
        ));

        // C5 -> C3 -> C4: rebroadcast every steady-state depth event to
        // downstream subscribers of this symbol's topic.
        let topic = depth_topic(&symbol);
        let broadcast_connections = Arc::clone(&connections);
        bus.subscribe(topic.clone(), move |event: Event| {
            let connections = Arc::clone(&broadcast_connections);
            let topic = topic.clone();
            async move {
                let EventData::Depth(delta) = event.data else {
                    return;
                };
                match serde_json::to_string(&delta) {
                    Ok(payload) => connections.broadcast(&topic, payload),
                    Err(e) => warn!(error = %e, "failed to encode depth event"),
                }
            }
        });

        Arc::clone(&synchronizer).spawn();
        synchronizers.insert(symbol, synchronizer);
    }

    let registry = Arc::new(SymbolRegistry::new(synchronizers));

    instrument_notifier::register(&bus, Arc::clone(&connections));

    let router: ActionRouter = ws_dispatcher::default_router(Arc::clone(&registry));
    let dispatcher_state = DispatcherState {
        connections: Arc::clone(&connections),
        router,
    };

    let app = Router::new()
        .route("/ws", get(ws_dispatcher::ws_upgrade_handler))
        .with_state(dispatcher_state)
        .merge(
            Router::new()
                .route("/market/depth", get(market::get_depth))
                .with_state(registry),
        )
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http());

    let addr = SocketAddr::from(([0, 0, 0, 0], config.listen_port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .expect("failed to bind listen address");
    info!(%addr, "listening");

    let shutdown_timeout = Duration::from_secs(config.shutdown_timeout_seconds);
    tokio::spawn(async move {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install ctrl_c handler");
        tokio::time::sleep(shutdown_timeout).await;
        warn!("graceful shutdown timeout elapsed, forcing exit");
        std::process::exit(1);
    });

    let shutdown = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install ctrl_c handler");
        info!("shutdown signal received, draining connections");
    };

    if let Err(e) = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
    {
        warn!(error = %e, "server exited with error");
    }
}
