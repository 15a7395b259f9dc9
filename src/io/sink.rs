//! Aggregate egress - posts closed-window aggregates downstream
//!
//! Reducers hand finished `AggregatedEvent`s to a bounded channel via
//! `SinkSender::send` (never blocks). A single `SinkWorker` drains the
//! channel and delivers each record through an `AggregateSink`. Delivery
//! failures are logged and counted, never retried.

use crate::domain::aggregate::AggregatedEvent;
use crate::infra::config::Config;
use crate::infra::metrics::Metrics;
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, error, info, warn};

#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("downstream returned status {status}: {body}")]
    Status { status: u16, body: String },
    #[error("sink channel full, aggregate dropped")]
    ChannelFull,
    #[error("sink channel closed")]
    Closed,
}

/// Destination for finished aggregates
#[async_trait]
pub trait AggregateSink: Send + Sync {
    async fn send(&self, event: &AggregatedEvent) -> Result<(), SinkError>;
}

/// POSTs aggregates as JSON to the amount-per-store endpoint
pub struct HttpSink {
    client: reqwest::Client,
    url: String,
    authorization: Option<String>,
}

impl HttpSink {
    pub fn new(config: &Config) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.sink_timeout())
            .http1_only()
            .build()?;
        Ok(Self::with_client(
            client,
            config.sink_url(),
            config.sink_username(),
            config.sink_password(),
        ))
    }

    pub fn with_client(
        client: reqwest::Client,
        url: String,
        username: Option<&str>,
        password: Option<&str>,
    ) -> Self {
        let authorization = basic_auth_header(username, password);
        info!(url = %url, auth = %authorization.is_some(), "http_sink_initialized");
        Self { client, url, authorization }
    }
}

/// `Basic <base64(user:pass)>`, only when both parts are configured
fn basic_auth_header(username: Option<&str>, password: Option<&str>) -> Option<String> {
    match (username, password) {
        (Some(username), Some(password)) => {
            let credentials = format!("{}:{}", username, password);
            Some(format!("Basic {}", STANDARD.encode(credentials.as_bytes())))
        }
        _ => None,
    }
}

#[async_trait]
impl AggregateSink for HttpSink {
    async fn send(&self, event: &AggregatedEvent) -> Result<(), SinkError> {
        let mut request = self
            .client
            .post(&self.url)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(event.to_json());

        if let Some(ref auth) = self.authorization {
            request = request.header(reqwest::header::AUTHORIZATION, auth);
        }

        let response = request.send().await?;
        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        let body = response.text().await.unwrap_or_default();
        Err(SinkError::Status { status: status.as_u16(), body })
    }
}

/// Keeps every aggregate in memory; used by tests and dry runs
#[derive(Default)]
pub struct CollectingSink {
    events: Mutex<Vec<AggregatedEvent>>,
}

impl CollectingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<AggregatedEvent> {
        self.events.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.events.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.lock().is_empty()
    }
}

#[async_trait]
impl AggregateSink for CollectingSink {
    async fn send(&self, event: &AggregatedEvent) -> Result<(), SinkError> {
        self.events.lock().push(event.clone());
        Ok(())
    }
}

/// Non-blocking handle used by reducers
#[derive(Clone)]
pub struct SinkSender {
    tx: mpsc::Sender<AggregatedEvent>,
    metrics: Arc<Metrics>,
    last_drop_warn: Arc<Mutex<Option<Instant>>>,
}

impl SinkSender {
    pub fn send(&self, event: AggregatedEvent) -> Result<(), SinkError> {
        match self.tx.try_send(event) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(event)) => {
                self.metrics.record_sink_dropped();
                let mut last = self.last_drop_warn.lock();
                if last.map_or(true, |t| t.elapsed() >= Duration::from_secs(1)) {
                    warn!(store_id = %event.store_id, event_id = %event.event_id, "sink_channel_full_dropping");
                    *last = Some(Instant::now());
                }
                Err(SinkError::ChannelFull)
            }
            Err(TrySendError::Closed(_)) => Err(SinkError::Closed),
        }
    }
}

/// Drains the sink channel until every `SinkSender` is gone
pub struct SinkWorker {
    sink: Arc<dyn AggregateSink>,
    rx: mpsc::Receiver<AggregatedEvent>,
    metrics: Arc<Metrics>,
}

impl SinkWorker {
    pub async fn run(mut self) {
        info!("sink_worker_started");

        while let Some(event) = self.rx.recv().await {
            let start = Instant::now();
            match self.sink.send(&event).await {
                Ok(()) => {
                    self.metrics.record_sink_sent();
                    info!(
                        event_id = %event.event_id,
                        store_id = %event.store_id,
                        total_amount = %event.total_amount,
                        begin = %event.begin_stream_aggregator,
                        end = %event.end_stream_aggregator,
                        latency_us = %start.elapsed().as_micros(),
                        "aggregate_sent"
                    );
                }
                Err(e) => {
                    self.metrics.record_sink_failed();
                    error!(
                        event_id = %event.event_id,
                        store_id = %event.store_id,
                        error = %e,
                        "aggregate_send_failed"
                    );
                }
            }
        }

        debug!("sink_channel_closed");
        info!("sink_worker_stopped");
    }
}

/// Create the sink channel and its worker
///
/// Returns the sender (cloned into each reducer) and the worker (to be spawned)
pub fn create_sink_worker(
    sink: Arc<dyn AggregateSink>,
    metrics: Arc<Metrics>,
    buffer_size: usize,
) -> (SinkSender, SinkWorker) {
    let (tx, rx) = mpsc::channel(buffer_size.max(1));
    let sender = SinkSender { tx, metrics: metrics.clone(), last_drop_warn: Arc::new(Mutex::new(None)) };
    (sender, SinkWorker { sink, rx, metrics })
}
