//! Core data model (spec.md §3), shared by the synchronizer, bus, and
//! connection manager.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// One `(price, quantity)` pair. Both are kept as the exchange's own decimal
/// strings — never round-tripped through `f64` — because downstream
/// consumers expect bit-identical echoes and price-string equality is the
/// identity of a level (spec.md §4.5.3).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriceLevel {
    pub price: String,
    pub quantity: String,
}

impl PriceLevel {
    pub fn new(price: impl Into<String>, quantity: impl Into<String>) -> Self {
        Self {
            price: price.into(),
            quantity: quantity.into(),
        }
    }

    /// `"0"` or any string parsing to a zero decimal removes the level.
    /// A quantity that fails to parse is treated as non-zero (keep the
    /// level, log at the call site) rather than silently dropping data.
    pub fn is_zero_quantity(&self) -> bool {
        Decimal::from_str(&self.quantity)
            .map(|d| d.is_zero())
            .unwrap_or(false)
    }
}

/// Wire form `[price, quantity]` used by both snapshot and delta payloads.
impl From<(String, String)> for PriceLevel {
    fn from((price, quantity): (String, String)) -> Self {
        Self { price, quantity }
    }
}

/// Per-symbol order book (spec.md §3, §4.5).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OrderBook {
    #[serde(rename = "lastUpdateId")]
    pub last_update_id: i64,
    pub bids: Vec<PriceLevel>,
    pub asks: Vec<PriceLevel>,
    #[serde(skip)]
    pub initialized: bool,
}

impl OrderBook {
    /// Apply one side's updates in place: zero quantity removes the level
    /// (matched by exact price-string equality), otherwise replace the
    /// existing level's quantity or append a new one. Ordering as
    /// delivered is preserved — no re-sorting (spec.md §4.5.3).
    pub fn apply_side(levels: &mut Vec<PriceLevel>, updates: &[PriceLevel]) {
        for update in updates {
            if update.is_zero_quantity() {
                levels.retain(|l| l.price != update.price);
                continue;
            }
            if let Some(existing) = levels.iter_mut().find(|l| l.price == update.price) {
                existing.quantity = update.quantity.clone();
            } else {
                levels.push(update.clone());
            }
        }
    }

    pub fn apply_delta(&mut self, delta: &DepthDelta) {
        Self::apply_side(&mut self.bids, &delta.bids);
        Self::apply_side(&mut self.asks, &delta.asks);
        self.last_update_id = delta.final_update_id;
    }

    pub fn install_snapshot(&mut self, snapshot: RestSnapshot) {
        self.last_update_id = snapshot.last_update_id;
        self.bids = snapshot.bids;
        self.asks = snapshot.asks;
        self.initialized = false;
    }
}

/// `GET /depth?symbol=...&limit=1000` response (spec.md §6.1).
#[derive(Debug, Clone, Deserialize)]
pub struct RestSnapshot {
    #[serde(rename = "lastUpdateId")]
    pub last_update_id: i64,
    pub bids: Vec<PriceLevel>,
    pub asks: Vec<PriceLevel>,
}

/// Inbound `depthUpdate` frame (spec.md §6.1).
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DepthDelta {
    #[serde(rename = "e")]
    pub event_type: String,
    #[serde(rename = "E")]
    pub event_time: i64,
    #[serde(rename = "s")]
    pub symbol: String,
    #[serde(rename = "U")]
    pub first_update_id: i64,
    #[serde(rename = "u")]
    pub final_update_id: i64,
    #[serde(rename = "b")]
    pub bids: Vec<PriceLevel>,
    #[serde(rename = "a")]
    pub asks: Vec<PriceLevel>,
}

impl DepthDelta {
    pub fn is_depth_update(&self) -> bool {
        self.event_type == "depthUpdate"
    }
}

/// Subscription acknowledgement frame `{"result":null,"id":1}`.
#[derive(Debug, Clone, Deserialize)]
pub struct SubscribeAck {
    pub id: i64,
    #[allow(dead_code)]
    pub result: Option<serde_json::Value>,
}

/// Outbound event broadcast on the bus under `<symbol>@depth` (spec.md §4.5.4).
/// Field shape mirrors `DepthDelta` deliberately — this is the same event,
/// republished once validated against the book's sequence.
pub type DepthStreamEvent = DepthDelta;

/// Lowercased depth topic for a symbol, e.g. `btcusdt@depth`.
pub fn depth_topic(symbol: &str) -> String {
    format!("{}@depth", symbol.to_lowercase())
}

/// Semantic topic used by the instrument price-change notifier (C8).
pub const INSTRUMENT_UPDATED_TOPIC: &str = "instrument.updated";

/// Administrative price-change event published on [`INSTRUMENT_UPDATED_TOPIC`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstrumentUpdatedEvent {
    pub symbol: String,
    pub price: String,
    pub updated_at: chrono::DateTime<chrono::Utc>,
}

/// Discriminated-union payload carried by the process's single [`crate::bus::EventBus`]
/// (spec.md §9 design note: "tagged variants for `Event` are preferred over a
/// single opaque box"). One bus instance, keyed by topic, shared across C5
/// and C8 — mirroring `original_source/internal/events/bus.go`'s single
/// `*events.Bus` with `Data any`, which both the binance streamer module and
/// the instrument module subscribe to.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "action", content = "data", rename_all = "snake_case")]
pub enum EventData {
    Depth(DepthDelta),
    InstrumentUpdated(InstrumentUpdatedEvent),
}

/// Envelope published on the bus: `topic` selects subscribers the way
/// [`crate::bus::EventBus::publish`] always has, `data` carries the
/// concrete, typed payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub topic: String,
    pub data: EventData,
}

impl Event {
    pub fn depth(symbol: &str, delta: DepthDelta) -> Self {
        Self {
            topic: depth_topic(symbol),
            data: EventData::Depth(delta),
        }
    }

    pub fn instrument_updated(event: InstrumentUpdatedEvent) -> Self {
        Self {
            topic: INSTRUMENT_UPDATED_TOPIC.to_string(),
            data: EventData::InstrumentUpdated(event),
        }
    }
}

/// Minimal bijective status type, kept only to satisfy the round-trip
/// property in spec.md §8 R2. Not wired to any persistence — the user CRUD
/// surface it comes from is out of scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UserStatus {
    Active,
    InActive,
}

impl std::fmt::Display for UserStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            UserStatus::Active => "Active",
            UserStatus::InActive => "InActive",
        };
        write!(f, "{s}")
    }
}

impl FromStr for UserStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Active" => Ok(UserStatus::Active),
            "InActive" => Ok(UserStatus::InActive),
            other => Err(format!("invalid user status: {other}")),
        }
    }
}
