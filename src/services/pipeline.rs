//! Aggregation pipeline tasks
//!
//! ```text
//! IngestQueue ──► worker × N ──(partials by shard)──► reducer × M ──► SinkWorker
//!                normalize, assign,                  merge, watermark,
//!                fold into PartialStore              close, format
//! ```
//!
//! Shutdown cascades through channel closure: closing the queue ends the
//! workers once it is drained, the workers dropping their senders ends the
//! reducers, and the reducers dropping theirs ends the sink worker. Windows
//! still open at that point are not flushed.

use crate::domain::accumulator::Accumulator;
use crate::domain::aggregate::AggregatedEvent;
use crate::domain::types::{epoch_us, RawMessage, WindowKey};
use crate::infra::config::Config;
use crate::infra::metrics::Metrics;
use crate::io::ingest_queue::IngestQueue;
use crate::io::sink::{create_sink_worker, AggregateSink, SinkError, SinkSender};
use crate::services::accumulator_store::{PartialStore, WindowStore};
use crate::services::normalizer::{normalize, NormalizeError};
use crate::services::watermark::WatermarkPolicy;
use crate::services::window::TumblingWindower;
use anyhow::anyhow;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Partials bound for one reducer shard
pub type PartialBatch = Vec<(WindowKey, Accumulator)>;

/// Buffered partial batches per reducer before workers wait
const REDUCER_CHANNEL_CAPACITY: usize = 64;

/// Consumer task: queue → normalize → window → partial fold → reducers
pub struct PipelineWorker {
    id: usize,
    queue: Arc<IngestQueue<RawMessage>>,
    partials: PartialStore,
    reducers: Vec<mpsc::Sender<PartialBatch>>,
    batch_size: usize,
    poll_timeout: Duration,
    metrics: Arc<Metrics>,
}

impl PipelineWorker {
    pub async fn run(mut self) {
        info!(worker = %self.id, "pipeline_worker_started");

        while let Some(batch) = self.queue.poll_batch(self.batch_size, self.poll_timeout).await {
            self.metrics.set_queue_depth(self.queue.len() as u64);
            if batch.is_empty() {
                continue;
            }

            for message in &batch {
                self.process(message);
            }

            if !self.flush().await {
                warn!(worker = %self.id, "reducer_channel_closed");
                return;
            }
        }

        info!(worker = %self.id, "pipeline_worker_stopped");
    }

    fn process(&mut self, message: &RawMessage) {
        match normalize(&message.payload) {
            Ok(event) => match self.partials.fold(&event) {
                Ok(key) => {
                    self.metrics.record_event_folded();
                    debug!(
                        worker = %self.id,
                        store_id = %event.store_id,
                        window = %key.window,
                        amount = %event.total_amount,
                        "event_folded"
                    );
                }
                Err(e) => {
                    self.metrics.record_overflow_dropped(1);
                    warn!(
                        worker = %self.id,
                        kind = "amount_overflow",
                        store_id = %event.store_id,
                        error = %e,
                        "event_dropped"
                    );
                }
            },
            Err(e) => {
                match &e {
                    NormalizeError::Parse(_) => self.metrics.record_parse_error(),
                    NormalizeError::MissingField(_) => self.metrics.record_missing_field(),
                    NormalizeError::InvalidField { .. } => self.metrics.record_invalid_field(),
                }
                warn!(
                    worker = %self.id,
                    kind = %e.kind(),
                    error = %e,
                    received_at = %message.received_at,
                    "event_dropped"
                );
            }
        }
    }

    /// Transfer ownership of every partial to its reducer shard
    async fn flush(&mut self) -> bool {
        if self.partials.is_empty() {
            return true;
        }
        let groups = self.partials.drain_by_shard(self.reducers.len());
        for (shard, group) in groups.into_iter().enumerate() {
            if group.is_empty() {
                continue;
            }
            if self.reducers[shard].send(group).await.is_err() {
                return false;
            }
        }
        true
    }
}

/// Owner of one shard's window state
pub struct Reducer {
    shard: usize,
    store: WindowStore,
    rx: mpsc::Receiver<PartialBatch>,
    sink: SinkSender,
    close_check_interval: Duration,
    metrics: Arc<Metrics>,
    open_reported: usize,
}

impl Reducer {
    pub async fn run(mut self) {
        info!(shard = %self.shard, "reducer_started");

        let mut tick = tokio::time::interval(self.close_check_interval);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                maybe_batch = self.rx.recv() => {
                    let Some(batch) = maybe_batch else { break };
                    let now = epoch_us();
                    self.merge(batch, now);
                    self.emit_closed(now);
                }
                _ = tick.tick() => {
                    self.emit_closed(epoch_us());
                }
            }
        }

        info!(shard = %self.shard, open_windows = %self.store.open_windows(), "reducer_stopped");
        self.report_open_windows();
    }

    fn merge(&mut self, batch: PartialBatch, now_us: i64) {
        let report = self.store.merge_partials(batch, now_us);
        if report.late_events > 0 {
            self.metrics.record_late_events(report.late_events);
            warn!(
                shard = %self.shard,
                late_partials = %report.late_partials,
                late_events = %report.late_events,
                "late_events_dropped"
            );
        }
        if report.overflowed_events > 0 {
            self.metrics.record_overflow_dropped(report.overflowed_events);
            warn!(
                shard = %self.shard,
                overflowed_partials = %report.overflowed_partials,
                overflowed_events = %report.overflowed_events,
                "overflowing_partials_dropped"
            );
        }
        if report.opened > 0 {
            debug!(shard = %self.shard, opened = %report.opened, "windows_opened");
        }
        self.report_open_windows();
    }

    fn emit_closed(&mut self, now_us: i64) {
        let closed = self.store.close_ready(now_us);
        if closed.is_empty() {
            return;
        }

        for (key, acc) in closed {
            match AggregatedEvent::from_closed(&key, &acc) {
                Ok(event) => {
                    self.metrics.record_window_emitted();
                    info!(
                        shard = %self.shard,
                        store_id = %key.store_id,
                        window = %key.window,
                        watermark = ?self.store.watermark(&key.store_id),
                        events = %acc.event_count,
                        total_amount = %event.total_amount,
                        "window_closed"
                    );
                    match self.sink.send(event) {
                        Ok(()) | Err(SinkError::ChannelFull) => {}
                        Err(e) => warn!(shard = %self.shard, error = %e, "aggregate_not_forwarded"),
                    }
                }
                Err(e) => {
                    self.metrics.record_aggregate_skipped();
                    warn!(shard = %self.shard, error = %e, "aggregate_skipped");
                }
            }
        }
        self.report_open_windows();
    }

    fn report_open_windows(&mut self) {
        let open = self.store.open_windows();
        self.metrics.add_open_windows(open as i64 - self.open_reported as i64);
        self.open_reported = open;
    }
}

/// Handles for every spawned pipeline task
pub struct Pipeline {
    workers: Vec<JoinHandle<()>>,
    reducers: Vec<JoinHandle<()>>,
    sink: JoinHandle<()>,
}

impl Pipeline {
    /// Wait for the shutdown cascade to finish
    pub async fn join(self) {
        for handle in self.workers.into_iter().chain(self.reducers).chain(std::iter::once(self.sink)) {
            if let Err(e) = handle.await {
                warn!(error = %e, "pipeline_task_failed");
            }
        }
    }
}

/// Spawn the sink worker, `reducer_shards` reducers and `workers` workers
pub fn spawn_pipeline(
    config: &Config,
    queue: Arc<IngestQueue<RawMessage>>,
    sink: Arc<dyn AggregateSink>,
    metrics: Arc<Metrics>,
) -> anyhow::Result<Pipeline> {
    let windower = TumblingWindower::new(config.window_length(), config.align_to())
        .ok_or_else(|| anyhow!("invalid window length {} ms", config.window_length_ms()))?;
    let policy = WatermarkPolicy::new(config.allowed_lateness(), config.advance_with_system_time());

    let (sink_sender, sink_worker) =
        create_sink_worker(sink, metrics.clone(), config.sink_channel_capacity());
    let sink = tokio::spawn(sink_worker.run());

    let shards = config.reducer_shards().max(1);
    let mut reducer_txs = Vec::with_capacity(shards);
    let mut reducers = Vec::with_capacity(shards);
    for shard in 0..shards {
        let (tx, rx) = mpsc::channel(REDUCER_CHANNEL_CAPACITY);
        reducer_txs.push(tx);
        let reducer = Reducer {
            shard,
            store: WindowStore::new(policy),
            rx,
            sink: sink_sender.clone(),
            close_check_interval: config.close_check_interval(),
            metrics: metrics.clone(),
            open_reported: 0,
        };
        reducers.push(tokio::spawn(reducer.run()));
    }
    // Reducers hold the only sink senders from here on
    drop(sink_sender);

    let mut workers = Vec::with_capacity(config.workers());
    for id in 0..config.workers().max(1) {
        let worker = PipelineWorker {
            id,
            queue: queue.clone(),
            partials: PartialStore::new(windower),
            reducers: reducer_txs.clone(),
            batch_size: config.poll_batch_size(),
            poll_timeout: config.poll_timeout(),
            metrics: metrics.clone(),
        };
        workers.push(tokio::spawn(worker.run()));
    }

    info!(
        workers = %workers.len(),
        reducer_shards = %shards,
        window_length_ms = %windower.length().as_millis(),
        align_to = %windower.align_to(),
        allowed_lateness_ms = %policy.allowed_lateness().as_millis(),
        advance_with_system_time = %policy.advance_with_system_time,
        "pipeline_started"
    );

    Ok(Pipeline { workers, reducers, sink })
}
