//! MQTT ingestion task for POS transactions
//!
//! Subscribes with QoS 1 and manual acknowledgments. A publish is acked
//! only once its payload is in the ingestion queue; a publish rejected by a
//! full queue stays unacked so the broker can redeliver it. Connection
//! errors are retried with exponential backoff up to a fixed budget, after
//! which the task fails and the process is expected to exit.

use crate::domain::types::RawMessage;
use crate::infra::config::Config;
use crate::infra::metrics::Metrics;
use crate::io::ingest_queue::{EnqueueError, IngestQueue};
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Outgoing, Packet, Publish, QoS};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// How long shutdown waits for the broker disconnect to be written
const DISCONNECT_FLUSH_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    #[error("broker unreachable after {attempts} attempts: {last_error}")]
    RetriesExhausted { attempts: u32, last_error: String },
    #[error("broker request rejected: {0}")]
    Client(#[from] rumqttc::ClientError),
}

/// Delay before reconnect attempt `attempt` (1-based): `base * 2^(attempt-1)`, capped
pub fn backoff_delay(base: Duration, cap: Duration, attempt: u32) -> Duration {
    let exp = attempt.saturating_sub(1).min(31);
    base.checked_mul(1u32 << exp).unwrap_or(cap).min(cap)
}

/// Broker-facing producer for the ingestion queue
pub struct MqttIngest {
    options: MqttOptions,
    topic: String,
    queue: Arc<IngestQueue<RawMessage>>,
    metrics: Arc<Metrics>,
    max_retries: u32,
    backoff: Duration,
    max_backoff: Duration,
}

impl MqttIngest {
    pub fn new(config: &Config, queue: Arc<IngestQueue<RawMessage>>, metrics: Arc<Metrics>) -> Self {
        let mut options =
            MqttOptions::new(config.broker_client_id(), config.broker_host(), config.broker_port());
        options.set_keep_alive(config.broker_keep_alive());
        // Persistent session so unacked publishes are redelivered after a reconnect
        options.set_clean_session(false);
        options.set_manual_acks(true);

        if let (Some(username), Some(password)) = (config.broker_username(), config.broker_password()) {
            options.set_credentials(username, password);
        }

        Self {
            options,
            topic: config.broker_topic().to_string(),
            queue,
            metrics,
            max_retries: config.reconnect_max_retries(),
            backoff: config.reconnect_backoff(),
            max_backoff: config.reconnect_max_backoff(),
        }
    }

    /// Run until shutdown or until the reconnect budget is spent.
    ///
    /// The ingestion queue is closed on return either way, so the pipeline
    /// drains what was accepted and stops.
    pub async fn run(self, shutdown: watch::Receiver<bool>) -> Result<(), BrokerError> {
        let queue = self.queue.clone();
        let result = self.run_inner(shutdown).await;
        queue.close().await;
        info!(queue_depth = %queue.len(), "ingest_queue_closed");
        result
    }

    async fn run_inner(self, mut shutdown: watch::Receiver<bool>) -> Result<(), BrokerError> {
        let (client, mut eventloop) = AsyncClient::new(self.options.clone(), 100);
        client.try_subscribe(self.topic.as_str(), QoS::AtLeastOnce)?;

        info!(
            host = %self.options.broker_address().0,
            port = %self.options.broker_address().1,
            topic = %self.topic,
            client_id = %self.options.client_id(),
            "mqtt_ingest_started"
        );

        let mut failures: u32 = 0;

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("mqtt_ingest_shutdown");
                        disconnect(&client, &mut eventloop).await;
                        return Ok(());
                    }
                }
                result = eventloop.poll() => {
                    match result {
                        Ok(Event::Incoming(Packet::Publish(publish))) => {
                            if !self.handle_publish(&client, &publish)? {
                                // Queue closed underneath us
                                disconnect(&client, &mut eventloop).await;
                                return Ok(());
                            }
                        }
                        Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                            info!(session_present = %ack.session_present, "mqtt_connected");
                            failures = 0;
                            if !ack.session_present {
                                client.try_subscribe(self.topic.as_str(), QoS::AtLeastOnce)?;
                            }
                        }
                        Ok(Event::Incoming(Packet::SubAck(_))) => {
                            info!(topic = %self.topic, "mqtt_subscribed");
                        }
                        Ok(_) => {}
                        Err(e) => {
                            failures += 1;
                            self.metrics.record_broker_reconnect();
                            if failures > self.max_retries {
                                error!(attempts = %failures, error = %e, "mqtt_reconnect_exhausted");
                                return Err(BrokerError::RetriesExhausted {
                                    attempts: failures,
                                    last_error: e.to_string(),
                                });
                            }
                            let delay = backoff_delay(self.backoff, self.max_backoff, failures);
                            warn!(
                                attempt = %failures,
                                max_retries = %self.max_retries,
                                delay_ms = %delay.as_millis(),
                                error = %e,
                                "mqtt_connection_error"
                            );
                            tokio::select! {
                                _ = tokio::time::sleep(delay) => {}
                                changed = shutdown.changed() => {
                                    if changed.is_err() || *shutdown.borrow() {
                                        info!("mqtt_ingest_shutdown");
                                        return Ok(());
                                    }
                                }
                            }
                        }
                    }
                }
            }
        }
    }

    /// Enqueue one publish, acking it only on success.
    ///
    /// Returns `false` once the queue no longer accepts items.
    fn handle_publish(&self, client: &AsyncClient, publish: &Publish) -> Result<bool, BrokerError> {
        self.metrics.record_message_received();

        let payload = match std::str::from_utf8(&publish.payload) {
            Ok(payload) => payload,
            Err(e) => {
                // Redelivery cannot fix a malformed payload
                self.metrics.record_parse_error();
                warn!(topic = %publish.topic, error = %e, "mqtt_payload_not_utf8");
                client.try_ack(publish)?;
                return Ok(true);
            }
        };

        match self.queue.try_push(RawMessage::new(payload)) {
            Ok(()) => {
                self.metrics.record_message_enqueued();
                client.try_ack(publish)?;
                debug!(topic = %publish.topic, pkid = %publish.pkid, bytes = %payload.len(), "mqtt_message_enqueued");
                Ok(true)
            }
            Err(EnqueueError::QueueFull { .. }) => {
                self.metrics.record_queue_dropped();
                Ok(true)
            }
            Err(EnqueueError::Closed) => Ok(false),
        }
    }
}

/// Queue a disconnect behind any pending acks and poll until it is written
async fn disconnect(client: &AsyncClient, eventloop: &mut EventLoop) {
    if let Err(e) = client.try_disconnect() {
        warn!(error = %e, "mqtt_disconnect_request_failed");
        return;
    }

    let flushed = tokio::time::timeout(DISCONNECT_FLUSH_TIMEOUT, async {
        loop {
            match eventloop.poll().await {
                Ok(Event::Outgoing(Outgoing::Disconnect)) => return true,
                Ok(_) => {}
                Err(_) => return false,
            }
        }
    })
    .await;

    match flushed {
        Ok(true) => info!("mqtt_disconnected"),
        Ok(false) => warn!("mqtt_disconnect_connection_lost"),
        Err(_) => warn!(timeout_ms = %DISCONNECT_FLUSH_TIMEOUT.as_millis(), "mqtt_disconnect_timeout"),
    }
}
