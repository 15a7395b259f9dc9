//! Configuration loading from TOML files with environment overrides
//!
//! Config file is selected via:
//! 1. --config <path> command line argument
//! 2. CONFIG_FILE environment variable
//! 3. Default: config/dev.toml
//!
//! After the file is loaded, deployment environment variables
//! (`API_HOST`, `BROKER_HOST`, `WINDOW_LENGTH_MS`, ...) override it.

use crate::domain::types::EventTime;
use anyhow::{bail, Context};
use serde::Deserialize;
use std::env;
use std::fs;
use std::path::Path;
use std::time::Duration;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tracing::warn;

/// Alignment epoch of the production pipeline
const DEFAULT_ALIGN_TO: &str = "2024-11-15T15:40:40Z";
const DEFAULT_ALIGN_TO_MS: i64 = 1_731_685_240_000;

#[derive(Debug, Clone, Deserialize)]
pub struct WindowConfig {
    #[serde(default = "default_window_length_ms")]
    pub length_ms: u64,
    /// RFC 3339 instant all windows are aligned to
    #[serde(default = "default_align_to")]
    pub align_to: String,
    #[serde(default = "default_allowed_lateness_ms")]
    pub allowed_lateness_ms: u64,
    /// Let the watermark advance with wall-clock time while a key is idle
    #[serde(default = "default_true")]
    pub advance_with_system_time: bool,
    #[serde(default = "default_close_check_interval_ms")]
    pub close_check_interval_ms: u64,
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            length_ms: default_window_length_ms(),
            align_to: default_align_to(),
            allowed_lateness_ms: default_allowed_lateness_ms(),
            advance_with_system_time: true,
            close_check_interval_ms: default_close_check_interval_ms(),
        }
    }
}

fn default_window_length_ms() -> u64 {
    10_000
}

fn default_align_to() -> String {
    DEFAULT_ALIGN_TO.to_string()
}

fn default_allowed_lateness_ms() -> u64 {
    1_000
}

fn default_close_check_interval_ms() -> u64 {
    100
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize)]
pub struct QueueConfig {
    #[serde(default = "default_queue_capacity")]
    pub capacity: usize,
    #[serde(default = "default_poll_batch_size")]
    pub poll_batch_size: usize,
    #[serde(default = "default_poll_timeout_ms")]
    pub poll_timeout_ms: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            capacity: default_queue_capacity(),
            poll_batch_size: default_poll_batch_size(),
            poll_timeout_ms: default_poll_timeout_ms(),
        }
    }
}

fn default_queue_capacity() -> usize {
    100_000
}

fn default_poll_batch_size() -> usize {
    256
}

fn default_poll_timeout_ms() -> u64 {
    500
}

#[derive(Debug, Clone, Deserialize)]
pub struct PipelineConfig {
    #[serde(default = "default_one")]
    pub workers: usize,
    #[serde(default = "default_one")]
    pub reducer_shards: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self { workers: 1, reducer_shards: 1 }
    }
}

fn default_one() -> usize {
    1
}

#[derive(Debug, Clone, Deserialize)]
pub struct BrokerConfig {
    #[serde(default = "default_broker_host")]
    pub host: String,
    #[serde(default = "default_broker_port")]
    pub port: u16,
    #[serde(default = "default_client_id")]
    pub client_id: String,
    #[serde(default = "default_topic")]
    pub topic: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default = "default_keep_alive_secs")]
    pub keep_alive_secs: u64,
    #[serde(default = "default_reconnect_max_retries")]
    pub reconnect_max_retries: u32,
    #[serde(default = "default_reconnect_backoff_ms")]
    pub reconnect_backoff_ms: u64,
    #[serde(default = "default_reconnect_max_backoff_ms")]
    pub reconnect_max_backoff_ms: u64,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            host: default_broker_host(),
            port: default_broker_port(),
            client_id: default_client_id(),
            topic: default_topic(),
            username: None,
            password: None,
            keep_alive_secs: default_keep_alive_secs(),
            reconnect_max_retries: default_reconnect_max_retries(),
            reconnect_backoff_ms: default_reconnect_backoff_ms(),
            reconnect_max_backoff_ms: default_reconnect_max_backoff_ms(),
        }
    }
}

fn default_broker_host() -> String {
    "localhost".to_string()
}

fn default_broker_port() -> u16 {
    1883
}

fn default_client_id() -> String {
    "sale_pos_transaction_aggregation".to_string()
}

fn default_topic() -> String {
    "sale/pos/transaction".to_string()
}

fn default_keep_alive_secs() -> u64 {
    30
}

fn default_reconnect_max_retries() -> u32 {
    20
}

fn default_reconnect_backoff_ms() -> u64 {
    500
}

fn default_reconnect_max_backoff_ms() -> u64 {
    5_000
}

#[derive(Debug, Clone, Deserialize)]
pub struct SinkConfig {
    #[serde(default = "default_protocol")]
    pub protocol: String,
    #[serde(default = "default_sink_host")]
    pub host: String,
    #[serde(default = "default_sink_port")]
    pub port: u16,
    #[serde(default = "default_sink_path")]
    pub path: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default = "default_sink_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_sink_channel_capacity")]
    pub channel_capacity: usize,
}

impl Default for SinkConfig {
    fn default() -> Self {
        Self {
            protocol: default_protocol(),
            host: default_sink_host(),
            port: default_sink_port(),
            path: default_sink_path(),
            username: None,
            password: None,
            timeout_ms: default_sink_timeout_ms(),
            channel_capacity: default_sink_channel_capacity(),
        }
    }
}

fn default_protocol() -> String {
    "http".to_string()
}

fn default_sink_host() -> String {
    "localhost".to_string()
}

fn default_sink_port() -> u16 {
    8080
}

fn default_sink_path() -> String {
    "/validation-service/api/v1/pos/amount-per-store".to_string()
}

fn default_sink_timeout_ms() -> u64 {
    5_000
}

fn default_sink_channel_capacity() -> usize {
    1024
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    #[serde(default = "default_metrics_interval_secs")]
    pub interval_secs: u64,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self { interval_secs: default_metrics_interval_secs() }
    }
}

fn default_metrics_interval_secs() -> u64 {
    10
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub window: WindowConfig,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub broker: BrokerConfig,
    #[serde(default)]
    pub sink: SinkConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Main configuration struct used throughout the application
#[derive(Debug, Clone)]
pub struct Config {
    window_length_ms: u64,
    align_to: EventTime,
    allowed_lateness_ms: u64,
    advance_with_system_time: bool,
    close_check_interval_ms: u64,
    queue_capacity: usize,
    poll_batch_size: usize,
    poll_timeout_ms: u64,
    workers: usize,
    reducer_shards: usize,
    broker_host: String,
    broker_port: u16,
    broker_client_id: String,
    broker_topic: String,
    broker_username: Option<String>,
    broker_password: Option<String>,
    broker_keep_alive_secs: u64,
    reconnect_max_retries: u32,
    reconnect_backoff_ms: u64,
    reconnect_max_backoff_ms: u64,
    sink_protocol: String,
    sink_host: String,
    sink_port: u16,
    sink_path: String,
    sink_username: Option<String>,
    sink_password: Option<String>,
    sink_timeout_ms: u64,
    sink_channel_capacity: usize,
    metrics_interval_secs: u64,
    config_file: String,
}

impl Default for Config {
    fn default() -> Self {
        let toml_config = TomlConfig::default();
        let align_to = EventTime::from_millis(DEFAULT_ALIGN_TO_MS);
        Self::assemble(toml_config, align_to, "default".to_string())
    }
}

impl Config {
    /// Determine config file path from args or environment
    pub fn resolve_config_path(args: &[String]) -> String {
        for (i, arg) in args.iter().enumerate() {
            if arg == "--config" {
                if let Some(path) = args.get(i + 1) {
                    return path.clone();
                }
            }
            if let Some(path) = arg.strip_prefix("--config=") {
                return path.to_string();
            }
        }

        if let Ok(path) = env::var("CONFIG_FILE") {
            return path;
        }

        "config/dev.toml".to_string()
    }

    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;

        let toml_config: TomlConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;

        Self::from_toml(toml_config, path.display().to_string())
    }

    fn from_toml(toml_config: TomlConfig, config_file: String) -> anyhow::Result<Self> {
        let align_to = parse_align_to(&toml_config.window.align_to)?;
        let config = Self::assemble(toml_config, align_to, config_file);
        config.validate()?;
        Ok(config)
    }

    fn assemble(toml_config: TomlConfig, align_to: EventTime, config_file: String) -> Self {
        Self {
            window_length_ms: toml_config.window.length_ms,
            align_to,
            allowed_lateness_ms: toml_config.window.allowed_lateness_ms,
            advance_with_system_time: toml_config.window.advance_with_system_time,
            close_check_interval_ms: toml_config.window.close_check_interval_ms,
            queue_capacity: toml_config.queue.capacity,
            poll_batch_size: toml_config.queue.poll_batch_size,
            poll_timeout_ms: toml_config.queue.poll_timeout_ms,
            workers: toml_config.pipeline.workers,
            reducer_shards: toml_config.pipeline.reducer_shards,
            broker_host: toml_config.broker.host,
            broker_port: toml_config.broker.port,
            broker_client_id: toml_config.broker.client_id,
            broker_topic: toml_config.broker.topic,
            broker_username: toml_config.broker.username,
            broker_password: toml_config.broker.password,
            broker_keep_alive_secs: toml_config.broker.keep_alive_secs,
            reconnect_max_retries: toml_config.broker.reconnect_max_retries,
            reconnect_backoff_ms: toml_config.broker.reconnect_backoff_ms,
            reconnect_max_backoff_ms: toml_config.broker.reconnect_max_backoff_ms,
            sink_protocol: toml_config.sink.protocol,
            sink_host: toml_config.sink.host,
            sink_port: toml_config.sink.port,
            sink_path: toml_config.sink.path,
            sink_username: toml_config.sink.username,
            sink_password: toml_config.sink.password,
            sink_timeout_ms: toml_config.sink.timeout_ms,
            sink_channel_capacity: toml_config.sink.channel_capacity,
            metrics_interval_secs: toml_config.metrics.interval_secs,
            config_file,
        }
    }

    /// Load configuration from a path, falling back to defaults, then apply env overrides
    pub fn load_from_path(path: &str) -> Self {
        let mut config = match Self::from_file(path) {
            Ok(config) => config,
            Err(e) => {
                warn!(error = %format!("{:#}", e), "config_load_failed_using_defaults");
                Self::default()
            }
        };
        config.apply_env_overrides(|key| env::var(key).ok());
        config
    }

    /// Load configuration - resolves the path from args/env first
    pub fn load(args: &[String]) -> Self {
        Self::load_from_path(&Self::resolve_config_path(args))
    }

    /// Apply environment overrides through `lookup`
    ///
    /// Invalid values are ignored with a warning; an override that would
    /// break validation is reverted.
    pub fn apply_env_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let before = self.clone();

        override_parsed(&lookup, "WINDOW_LENGTH_MS", &mut self.window_length_ms);
        override_parsed(&lookup, "ALLOWED_LATENESS_MS", &mut self.allowed_lateness_ms);
        override_parsed(&lookup, "QUEUE_CAPACITY", &mut self.queue_capacity);
        override_parsed(&lookup, "BROKER_PORT", &mut self.broker_port);
        override_parsed(&lookup, "API_PORT", &mut self.sink_port);
        if let Some(value) = lookup("WINDOW_ALIGN_TO") {
            match parse_align_to(&value) {
                Ok(t) => self.align_to = t,
                Err(e) => warn!(key = "WINDOW_ALIGN_TO", error = %e, "config_env_override_ignored"),
            }
        }
        override_string(&lookup, "BROKER_HOST", &mut self.broker_host);
        override_string(&lookup, "BROKER_TOPIC", &mut self.broker_topic);
        override_string(&lookup, "API_PROTOCOL", &mut self.sink_protocol);
        override_string(&lookup, "API_HOST", &mut self.sink_host);
        override_optional(&lookup, "BROKER_USERNAME", &mut self.broker_username);
        override_optional(&lookup, "BROKER_PASSWORD", &mut self.broker_password);
        override_optional(&lookup, "API_USERNAME", &mut self.sink_username);
        override_optional(&lookup, "API_PASSWORD", &mut self.sink_password);

        if let Err(e) = self.validate() {
            warn!(error = %e, "config_env_overrides_rejected");
            *self = before;
        }
    }

    /// Reject settings the pipeline cannot run with
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.window_length_ms == 0 {
            bail!("window length must be > 0");
        }
        // Window arithmetic runs in event-time microseconds
        let length_us = i64::try_from(self.window_length_ms).ok().and_then(|ms| ms.checked_mul(1_000));
        if length_us.is_none() {
            bail!("window length {} ms is out of range", self.window_length_ms);
        }
        if self.queue_capacity == 0 {
            bail!("queue capacity must be > 0");
        }
        if self.poll_batch_size == 0 {
            bail!("poll batch size must be > 0");
        }
        if self.workers == 0 {
            bail!("pipeline needs at least one worker");
        }
        if self.reducer_shards == 0 {
            bail!("pipeline needs at least one reducer shard");
        }
        if self.sink_channel_capacity == 0 {
            bail!("sink channel capacity must be > 0");
        }
        Ok(())
    }

    /// Full URL of the amount-per-store endpoint
    pub fn sink_url(&self) -> String {
        format!("{}://{}:{}{}", self.sink_protocol, self.sink_host, self.sink_port, self.sink_path)
    }

    // Getters for all config fields
    pub fn window_length_ms(&self) -> u64 {
        self.window_length_ms
    }

    pub fn window_length(&self) -> Duration {
        Duration::from_millis(self.window_length_ms)
    }

    pub fn align_to(&self) -> EventTime {
        self.align_to
    }

    pub fn allowed_lateness_ms(&self) -> u64 {
        self.allowed_lateness_ms
    }

    pub fn allowed_lateness(&self) -> Duration {
        Duration::from_millis(self.allowed_lateness_ms)
    }

    pub fn advance_with_system_time(&self) -> bool {
        self.advance_with_system_time
    }

    pub fn close_check_interval(&self) -> Duration {
        Duration::from_millis(self.close_check_interval_ms.max(1))
    }

    pub fn queue_capacity(&self) -> usize {
        self.queue_capacity
    }

    pub fn poll_batch_size(&self) -> usize {
        self.poll_batch_size
    }

    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms)
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    pub fn reducer_shards(&self) -> usize {
        self.reducer_shards
    }

    pub fn broker_host(&self) -> &str {
        &self.broker_host
    }

    pub fn broker_port(&self) -> u16 {
        self.broker_port
    }

    pub fn broker_client_id(&self) -> &str {
        &self.broker_client_id
    }

    pub fn broker_topic(&self) -> &str {
        &self.broker_topic
    }

    pub fn broker_username(&self) -> Option<&str> {
        self.broker_username.as_deref()
    }

    pub fn broker_password(&self) -> Option<&str> {
        self.broker_password.as_deref()
    }

    pub fn broker_keep_alive(&self) -> Duration {
        Duration::from_secs(self.broker_keep_alive_secs)
    }

    pub fn reconnect_max_retries(&self) -> u32 {
        self.reconnect_max_retries
    }

    pub fn reconnect_backoff(&self) -> Duration {
        Duration::from_millis(self.reconnect_backoff_ms)
    }

    pub fn reconnect_max_backoff(&self) -> Duration {
        Duration::from_millis(self.reconnect_max_backoff_ms)
    }

    pub fn sink_username(&self) -> Option<&str> {
        self.sink_username.as_deref()
    }

    pub fn sink_password(&self) -> Option<&str> {
        self.sink_password.as_deref()
    }

    pub fn sink_timeout(&self) -> Duration {
        Duration::from_millis(self.sink_timeout_ms)
    }

    pub fn sink_channel_capacity(&self) -> usize {
        self.sink_channel_capacity
    }

    pub fn metrics_interval_secs(&self) -> u64 {
        self.metrics_interval_secs
    }

    pub fn config_file(&self) -> &str {
        &self.config_file
    }

    /// Builder method for tests to set window parameters
    pub fn with_window(mut self, length_ms: u64, align_to: EventTime, lateness_ms: u64) -> Self {
        self.window_length_ms = length_ms;
        self.align_to = align_to;
        self.allowed_lateness_ms = lateness_ms;
        self
    }

    /// Builder method for tests to pin the watermark to event time only
    pub fn with_advance_with_system_time(mut self, enabled: bool) -> Self {
        self.advance_with_system_time = enabled;
        self
    }

    /// Builder method for tests to size the queue and poll loop
    pub fn with_queue(mut self, capacity: usize, poll_timeout_ms: u64) -> Self {
        self.queue_capacity = capacity;
        self.poll_timeout_ms = poll_timeout_ms;
        self
    }

    /// Builder method for tests to set parallelism
    pub fn with_parallelism(mut self, workers: usize, reducer_shards: usize) -> Self {
        self.workers = workers;
        self.reducer_shards = reducer_shards;
        self
    }

    /// Builder method for tests to point at a local broker
    pub fn with_broker(mut self, host: &str, port: u16, topic: &str, client_id: &str) -> Self {
        self.broker_host = host.to_string();
        self.broker_port = port;
        self.broker_topic = topic.to_string();
        self.broker_client_id = client_id.to_string();
        self
    }

    /// Builder method for tests to shorten the reconnect budget
    pub fn with_reconnect(mut self, max_retries: u32, backoff_ms: u64, max_backoff_ms: u64) -> Self {
        self.reconnect_max_retries = max_retries;
        self.reconnect_backoff_ms = backoff_ms;
        self.reconnect_max_backoff_ms = max_backoff_ms;
        self
    }
}

fn parse_align_to(value: &str) -> anyhow::Result<EventTime> {
    let dt = OffsetDateTime::parse(value, &Rfc3339)
        .with_context(|| format!("invalid window align_to '{}'", value))?;
    let micros = dt.unix_timestamp_nanos().div_euclid(1_000);
    i64::try_from(micros)
        .map(EventTime)
        .with_context(|| format!("window align_to '{}' is out of range", value))
}

fn override_parsed<F, T>(lookup: &F, key: &str, target: &mut T)
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
{
    if let Some(value) = lookup(key) {
        match value.trim().parse::<T>() {
            Ok(parsed) => *target = parsed,
            Err(_) => warn!(key = %key, value = %value, "config_env_override_ignored"),
        }
    }
}

fn override_string<F>(lookup: &F, key: &str, target: &mut String)
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(value) = lookup(key).filter(|v| !v.is_empty()) {
        *target = value;
    }
}

fn override_optional<F>(lookup: &F, key: &str, target: &mut Option<String>)
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(value) = lookup(key).filter(|v| !v.is_empty()) {
        *target = Some(value);
    }
}
