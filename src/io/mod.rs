//! IO modules - external system interfaces
//!
//! - `mqtt` - MQTT ingestion task (QoS 1, ack after enqueue)
//! - `ingest_queue` - Bounded queue between the broker and the pipeline
//! - `sink` - Aggregate egress (HTTP POST, in-memory collector)

pub mod ingest_queue;
pub mod mqtt;
pub mod sink;

// Re-export commonly used types
pub use ingest_queue::{EnqueueError, IngestQueue};
pub use mqtt::{BrokerError, MqttIngest};
pub use sink::{create_sink_worker, AggregateSink, CollectingSink, HttpSink, SinkError, SinkSender};
