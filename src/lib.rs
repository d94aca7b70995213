pub mod bus;
pub mod config;
pub mod connection_manager;
pub mod depth_sync;
pub mod error;
pub mod instrument_notifier;
pub mod market;
pub mod models;
pub mod rest_client;
pub mod upstream_ws;
pub mod ws_dispatcher;

use std::collections::HashMap;
use std::sync::Arc;

use depth_sync::DepthSynchronizer;
use models::OrderBook;

/// Registry of per-symbol synchronizers, shared by the market query surface
/// (C7) and the `get_order_book` WS handler (C6 supplement).
#[derive(Default)]
pub struct SymbolRegistry {
    synchronizers: HashMap<String, Arc<DepthSynchronizer>>,
}

impl SymbolRegistry {
    pub fn new(synchronizers: HashMap<String, Arc<DepthSynchronizer>>) -> Self {
        Self { synchronizers }
    }

    /// Deep copy of the named symbol's book, or `None` if the symbol is
    /// unknown or has never been snapshot-loaded (spec.md §4.7).
    pub fn order_book(&self, symbol: &str) -> Option<OrderBook> {
        self.synchronizers
            .get(&symbol.to_lowercase())
            .and_then(|s| s.order_book())
    }

    pub fn symbols(&self) -> impl Iterator<Item = &str> {
        self.synchronizers.keys().map(|s| s.as_str())
    }
}
