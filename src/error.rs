//! Crate-wide error taxonomy.
//!
//! Mirrors the fault categories in the design doc: transient upstream
//! failures are retried by the caller, `NotReady` surfaces as HTTP 503,
//! `Config` aborts startup. Nothing here is meant to propagate to a panic.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("http status {status}: {body}")]
    HttpStatus { status: u16, body: String },

    #[error("websocket connect failed: {0}")]
    Connect(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("decode error: {0}")]
    Decode(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("order book not ready for {exchange}/{symbol}")]
    NotReady { exchange: String, symbol: String },

    #[error("unsupported exchange: {0}")]
    UnsupportedExchange(String),
}

pub type AppResult<T> = Result<T, AppError>;
