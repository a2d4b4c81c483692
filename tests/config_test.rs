//! Integration tests for configuration loading

use findmy_history::infra::{Config, LogFormat};
use std::io::Write;
use tempfile::NamedTempFile;

#[test]
fn test_load_config_from_file() {
    let mut temp_file = NamedTempFile::new().unwrap();

    let config_content = r#"
[home_assistant]
url = "http://homeassistant.local:8123/"
token = "file-token"
timeout_secs = 3

[influxdb]
url = "http://influx.local:8086"
database = "locations"
username = "writer"
password = "secret"

[scheduler]
base_tick_secs = 30
zone_refresh_ticks = 20
default_interval_minutes = 10
startup_retries = 2

[preferences]
path = "/tmp/tracked.json"

[api]
port = 9090

[logging]
format = "json"
mask_sensitive = true

[metrics]
interval_secs = 15

[[devices]]
entity_id = "device_tracker.phone"
interval_minutes = 2

[[devices]]
entity_id = "device_tracker.example_phone"
"#;

    temp_file.write_all(config_content.as_bytes()).unwrap();
    temp_file.flush().unwrap();

    let config = Config::from_file(temp_file.path()).unwrap();

    assert_eq!(config.ha_url(), "http://homeassistant.local:8123");
    assert_eq!(config.ha_token(), "file-token");
    assert_eq!(config.ha_timeout_secs(), 3);
    assert_eq!(config.influx_url(), "http://influx.local:8086");
    assert_eq!(config.influx_database(), "locations");
    assert_eq!(config.influx_username(), "writer");
    assert_eq!(config.influx_password(), "secret");
    assert_eq!(config.influx_token(), None);
    assert_eq!(config.base_tick_secs(), 30);
    assert_eq!(config.zone_refresh_ticks(), 20);
    assert_eq!(config.default_interval_minutes(), 10);
    assert_eq!(config.startup_retries(), 2);
    assert_eq!(config.prefs_path(), "/tmp/tracked.json");
    assert_eq!(config.api_port(), 9090);
    assert_eq!(config.log_format(), &LogFormat::Json);
    assert!(config.mask_sensitive_logs());
    assert_eq!(config.metrics_interval_secs(), 15);
    assert_eq!(config.devices().len(), 2);
    assert!(!config.devices()[0].is_placeholder());
    assert!(config.devices()[1].is_placeholder());
    assert_eq!(config.config_file(), temp_file.path().display().to_string());
}

#[test]
fn test_load_from_path_fallback() {
    let config = Config::load_from_path("/nonexistent/config.toml");
    assert_eq!(config.ha_url(), "http://supervisor/core");
    assert_eq!(config.base_tick_secs(), 60);
    assert_eq!(config.api_port(), 8090);
    assert_eq!(config.config_file(), "default");
}

#[test]
fn test_malformed_file_falls_back_to_defaults() {
    let mut temp_file = NamedTempFile::new().unwrap();
    temp_file.write_all(b"[scheduler]\nbase_tick_secs = \"soon\"\n").unwrap();
    temp_file.flush().unwrap();

    assert!(Config::from_file(temp_file.path()).is_err());
    let config = Config::load_from_path(&temp_file.path().display().to_string());
    assert_eq!(config.base_tick_secs(), 60);
}

#[test]
fn test_shipped_dev_config_parses() {
    let path = concat!(env!("CARGO_MANIFEST_DIR"), "/config/dev.toml");
    let config = Config::from_file(path).unwrap();
    assert!(config.api_port() > 0);
    assert!(config.devices().iter().all(|d| d.is_placeholder()));
}
