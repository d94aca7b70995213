//! Integration test for YAML configuration loading (spec.md §6.4, §10.2).

use depth_relay::config::Config;
use std::io::Write;

#[test]
fn yaml_file_is_loaded_and_env_still_overrides_it() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(
        file,
        "upstream_ws_url: wss://stream.example.com/ws\n\
         upstream_rest_url: https://api.example.com/api/v3\n\
         subscribed_symbols: \"BTCUSDT,ETHUSDT\"\n\
         listen_port: 9090\n\
         shutdown_timeout_seconds: 5\n\
         log_level: debug\n"
    )
    .unwrap();

    let cfg = Config::load(Some(file.path())).unwrap();
    assert_eq!(cfg.upstream_ws_url, "wss://stream.example.com/ws");
    assert_eq!(cfg.listen_port, 9090);
    assert_eq!(cfg.symbols(), vec!["btcusdt", "ethusdt"]);

    // SAFETY: no other test in this binary touches this variable.
    unsafe {
        std::env::set_var("DEPTH_RELAY_LISTEN_PORT", "7777");
    }
    let overridden = Config::load(Some(file.path())).unwrap();
    assert_eq!(overridden.listen_port, 7777);
    unsafe {
        std::env::remove_var("DEPTH_RELAY_LISTEN_PORT");
    }
}

#[test]
fn missing_upstream_urls_without_file_or_env_uses_binance_defaults() {
    let cfg = Config::load(None).unwrap();
    assert!(cfg.upstream_ws_url.contains("binance"));
    assert!(cfg.upstream_rest_url.contains("binance"));
}
