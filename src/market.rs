//! Market query surface (spec.md §4.7 / C7, §6.3).
//!
//! Grounded on `original_source/internal/spot_trading/market/handler.go`.

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json};
use serde::Deserialize;
use std::sync::Arc;

use crate::SymbolRegistry;

#[derive(Debug, Deserialize)]
pub struct DepthQuery {
    pub exchange: String,
    pub symbol: String,
}

/// `GET /market/depth?exchange=binance&symbol=BTCUSDT`.
pub async fn get_depth(
    State(registry): State<Arc<SymbolRegistry>>,
    Query(query): Query<DepthQuery>,
) -> impl IntoResponse {
    if query.exchange.to_lowercase() != "binance" {
        return (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({ "error": "unsupported exchange" })),
        )
            .into_response();
    }

    match registry.order_book(&query.symbol) {
        Some(book) => (StatusCode::OK, Json(book)).into_response(),
        None => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({ "error": "order book not ready" })),
        )
            .into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exchange_match_is_case_insensitive() {
        let q = DepthQuery {
            exchange: "Binance".to_string(),
            symbol: "BTCUSDT".to_string(),
        };
        assert_eq!(q.exchange.to_lowercase(), "binance");
    }
}
