//! Integration tests for configuration loading

use pos_aggregator::domain::EventTime;
use pos_aggregator::infra::Config;
use std::io::Write;
use std::time::Duration;
use tempfile::NamedTempFile;

#[test]
fn test_load_config_from_file() {
    let mut temp_file = NamedTempFile::new().unwrap();

    let config_content = r#"
[window]
length_ms = 60000
align_to = "2024-01-01T00:00:00Z"
allowed_lateness_ms = 2500
advance_with_system_time = false

[queue]
capacity = 500
poll_batch_size = 32

[pipeline]
workers = 4
reducer_shards = 2

[broker]
host = "broker.internal"
port = 8883
topic = "pos/tx"
username = "aggregator"
password = "secret"

[sink]
protocol = "https"
host = "validation.internal"
port = 8443
username = "api"
password = "api-secret"

[metrics]
interval_secs = 15
"#;

    temp_file.write_all(config_content.as_bytes()).unwrap();
    temp_file.flush().unwrap();

    let config = Config::from_file(temp_file.path()).unwrap();

    assert_eq!(config.window_length_ms(), 60_000);
    assert_eq!(config.align_to(), EventTime::from_millis(1_704_067_200_000));
    assert_eq!(config.allowed_lateness_ms(), 2_500);
    assert!(!config.advance_with_system_time());
    assert_eq!(config.queue_capacity(), 500);
    assert_eq!(config.poll_batch_size(), 32);
    assert_eq!(config.workers(), 4);
    assert_eq!(config.reducer_shards(), 2);
    assert_eq!(config.broker_host(), "broker.internal");
    assert_eq!(config.broker_port(), 8883);
    assert_eq!(config.broker_topic(), "pos/tx");
    assert_eq!(config.broker_username(), Some("aggregator"));
    assert_eq!(config.sink_username(), Some("api"));
    assert_eq!(
        config.sink_url(),
        "https://validation.internal:8443/validation-service/api/v1/pos/amount-per-store"
    );
    assert_eq!(config.metrics_interval_secs(), 15);

    // Unset keys keep their defaults
    assert_eq!(config.close_check_interval(), Duration::from_millis(100));
    assert_eq!(config.reconnect_max_retries(), 20);
}

#[test]
fn test_empty_file_uses_defaults() {
    let temp_file = NamedTempFile::new().unwrap();
    let config = Config::from_file(temp_file.path()).unwrap();
    assert_eq!(config.window_length_ms(), 10_000);
    assert_eq!(config.align_to(), EventTime::from_millis(1_731_685_240_000));
    assert_eq!(config.queue_capacity(), 100_000);
}

#[test]
fn test_invalid_align_to_is_rejected() {
    let mut temp_file = NamedTempFile::new().unwrap();
    temp_file.write_all(b"[window]\nalign_to = \"last tuesday\"\n").unwrap();
    temp_file.flush().unwrap();
    assert!(Config::from_file(temp_file.path()).is_err());
}

#[test]
fn test_zero_workers_is_rejected() {
    let mut temp_file = NamedTempFile::new().unwrap();
    temp_file.write_all(b"[pipeline]\nworkers = 0\n").unwrap();
    temp_file.flush().unwrap();
    assert!(Config::from_file(temp_file.path()).is_err());
}

#[test]
fn test_load_from_path_fallback() {
    let config = Config::load_from_path("/nonexistent/config.toml");
    assert_eq!(config.broker_port(), 1883);
    assert_eq!(config.window_length_ms(), 10_000);
    assert_eq!(config.allowed_lateness_ms(), 1_000);
}

#[test]
fn test_dev_config_parses() {
    let config = Config::from_file("config/dev.toml").unwrap();
    assert_eq!(config.broker_topic(), "sale/pos/transaction");
    assert_eq!(config.window_length_ms(), 10_000);
}
