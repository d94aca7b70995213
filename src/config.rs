//! Configuration surface (spec.md §6.4).
//!
//! Loaded from an optional YAML file, then overridden by `DEPTH_RELAY_*`
//! environment variables, the way `indexmaker-backend`'s `main()` layers
//! `dotenvy::dotenv()` ahead of individual `env::var` reads.

use crate::error::{AppError, AppResult};
use serde::Deserialize;
use std::path::Path;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub upstream_ws_url: String,
    pub upstream_rest_url: String,
    #[serde(default = "default_symbols")]
    pub subscribed_symbols: String,
    #[serde(default = "default_listen_port")]
    pub listen_port: u16,
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout_seconds: u64,
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_symbols() -> String {
    "btcusdt".to_string()
}

fn default_listen_port() -> u16 {
    8080
}

fn default_shutdown_timeout() -> u64 {
    10
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Config {
    /// Symbols normalized to lowercase, as used in topic names.
    pub fn symbols(&self) -> Vec<String> {
        self.subscribed_symbols
            .split(',')
            .map(|s| s.trim().to_lowercase())
            .filter(|s| !s.is_empty())
            .collect()
    }

    pub fn load(path: Option<&Path>) -> AppResult<Self> {
        dotenvy::dotenv().ok();

        let mut cfg = if let Some(path) = path.filter(|p| p.exists()) {
            let raw = std::fs::read_to_string(path)
                .map_err(|e| AppError::Config(format!("reading {}: {e}", path.display())))?;
            serde_yaml::from_str::<Config>(&raw)
                .map_err(|e| AppError::Config(format!("parsing {}: {e}", path.display())))?
        } else {
            Config {
                upstream_ws_url: std::env::var("DEPTH_RELAY_UPSTREAM_WS_URL")
                    .unwrap_or_else(|_| "wss://stream.binance.com:9443/ws".to_string()),
                upstream_rest_url: std::env::var("DEPTH_RELAY_UPSTREAM_REST_URL")
                    .unwrap_or_else(|_| "https://api.binance.com/api/v3".to_string()),
                subscribed_symbols: default_symbols(),
                listen_port: default_listen_port(),
                shutdown_timeout_seconds: default_shutdown_timeout(),
                log_level: default_log_level(),
            }
        };

        if let Ok(v) = std::env::var("DEPTH_RELAY_UPSTREAM_WS_URL") {
            cfg.upstream_ws_url = v;
        }
        if let Ok(v) = std::env::var("DEPTH_RELAY_UPSTREAM_REST_URL") {
            cfg.upstream_rest_url = v;
        }
        if let Ok(v) = std::env::var("DEPTH_RELAY_SUBSCRIBED_SYMBOLS") {
            cfg.subscribed_symbols = v;
        }
        if let Ok(v) = std::env::var("DEPTH_RELAY_LISTEN_PORT") {
            cfg.listen_port = v
                .parse()
                .map_err(|_| AppError::Config(format!("invalid listen_port: {v}")))?;
        }
        if let Ok(v) = std::env::var("DEPTH_RELAY_SHUTDOWN_TIMEOUT_SECONDS") {
            cfg.shutdown_timeout_seconds = v
                .parse()
                .map_err(|_| AppError::Config(format!("invalid shutdown_timeout_seconds: {v}")))?;
        }
        if let Ok(v) = std::env::var("DEPTH_RELAY_LOG_LEVEL") {
            cfg.log_level = v;
        }

        if cfg.upstream_ws_url.is_empty() || cfg.upstream_rest_url.is_empty() {
            return Err(AppError::Config(
                "upstream_ws_url and upstream_rest_url must be set".to_string(),
            ));
        }

        Ok(cfg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn symbols_are_normalized_lowercase_and_trimmed() {
        let cfg = Config {
            upstream_ws_url: "wss://x".into(),
            upstream_rest_url: "https://x".into(),
            subscribed_symbols: " BTCUSDT, ethusdt ,".into(),
            listen_port: 8080,
            shutdown_timeout_seconds: 10,
            log_level: "info".into(),
        };
        assert_eq!(cfg.symbols(), vec!["btcusdt", "ethusdt"]);
    }

    #[test]
    fn env_overrides_defaults() {
        // SAFETY: test is single-threaded within this process's env access pattern.
        unsafe {
            std::env::set_var("DEPTH_RELAY_UPSTREAM_WS_URL", "wss://override");
        }
        let cfg = Config::load(None).unwrap();
        assert_eq!(cfg.upstream_ws_url, "wss://override");
        unsafe {
            std::env::remove_var("DEPTH_RELAY_UPSTREAM_WS_URL");
        }
    }
}
