//! Lock-free metrics collection and periodic reporting
//!
//! Uses atomics for hot-path operations to avoid mutex contention.
//! Counters are monotonic; only the per-interval event count is swapped
//! on report to compute a rate.
//!
//! NOTE: All atomics use Relaxed ordering; these are statistical
//! counters only. Do NOT use these atomics for coordination or logic decisions.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tracing::info;

/// Lock-free metrics collector
pub struct Metrics {
    /// Broker messages received (monotonic)
    messages_received: AtomicU64,
    /// Messages accepted into the ingestion queue (monotonic)
    messages_enqueued: AtomicU64,
    /// Messages dropped because the ingestion queue was full (monotonic)
    queue_dropped: AtomicU64,
    /// Payloads that were not valid JSON / UTF-8 (monotonic)
    parse_errors: AtomicU64,
    /// Payloads missing a required field (monotonic)
    missing_field_errors: AtomicU64,
    /// Payloads with an unusable field value (monotonic)
    invalid_field_errors: AtomicU64,
    /// Events folded into a worker partial (monotonic)
    events_folded: AtomicU64,
    /// Events folded since last report (reset on report)
    events_since_report: AtomicU64,
    /// Events dropped because their window had already closed (monotonic)
    late_events_dropped: AtomicU64,
    /// Events dropped because their window total would overflow (monotonic)
    overflow_dropped: AtomicU64,
    /// Aggregates emitted (monotonic)
    windows_emitted: AtomicU64,
    /// Closed windows whose rounded total was not > 0 (monotonic)
    aggregates_skipped: AtomicU64,
    /// Aggregates accepted by the downstream API (monotonic)
    sink_sent: AtomicU64,
    /// Aggregates the downstream API rejected or never received (monotonic)
    sink_failed: AtomicU64,
    /// Aggregates dropped because the sink channel was full (monotonic)
    sink_dropped: AtomicU64,
    /// Broker reconnect attempts (monotonic)
    broker_reconnects: AtomicU64,
    /// Current ingestion queue depth (updated by sampler)
    queue_depth: AtomicU64,
    /// Currently open windows across reducers (updated by reducers)
    open_windows: AtomicU64,
    /// Last report time (only accessed from reporter)
    last_report_time: parking_lot::Mutex<Instant>,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            messages_received: AtomicU64::new(0),
            messages_enqueued: AtomicU64::new(0),
            queue_dropped: AtomicU64::new(0),
            parse_errors: AtomicU64::new(0),
            missing_field_errors: AtomicU64::new(0),
            invalid_field_errors: AtomicU64::new(0),
            events_folded: AtomicU64::new(0),
            events_since_report: AtomicU64::new(0),
            late_events_dropped: AtomicU64::new(0),
            overflow_dropped: AtomicU64::new(0),
            windows_emitted: AtomicU64::new(0),
            aggregates_skipped: AtomicU64::new(0),
            sink_sent: AtomicU64::new(0),
            sink_failed: AtomicU64::new(0),
            sink_dropped: AtomicU64::new(0),
            broker_reconnects: AtomicU64::new(0),
            queue_depth: AtomicU64::new(0),
            open_windows: AtomicU64::new(0),
            last_report_time: parking_lot::Mutex::new(Instant::now()),
        }
    }

    #[inline]
    pub fn record_message_received(&self) {
        self.messages_received.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_message_enqueued(&self) {
        self.messages_enqueued.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_queue_dropped(&self) {
        self.queue_dropped.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_parse_error(&self) {
        self.parse_errors.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_missing_field(&self) {
        self.missing_field_errors.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_invalid_field(&self) {
        self.invalid_field_errors.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_event_folded(&self) {
        self.events_folded.fetch_add(1, Ordering::Relaxed);
        self.events_since_report.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_late_events(&self, count: u64) {
        self.late_events_dropped.fetch_add(count, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_overflow_dropped(&self, count: u64) {
        self.overflow_dropped.fetch_add(count, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_window_emitted(&self) {
        self.windows_emitted.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_aggregate_skipped(&self) {
        self.aggregates_skipped.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_sink_sent(&self) {
        self.sink_sent.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_sink_failed(&self) {
        self.sink_failed.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_sink_dropped(&self) {
        self.sink_dropped.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_broker_reconnect(&self) {
        self.broker_reconnects.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn set_queue_depth(&self, depth: u64) {
        self.queue_depth.store(depth, Ordering::Relaxed);
    }

    #[inline]
    pub fn add_open_windows(&self, delta: i64) {
        if delta >= 0 {
            self.open_windows.fetch_add(delta as u64, Ordering::Relaxed);
        } else {
            // Saturate at zero; reducers race only on statistics here
            let dec = delta.unsigned_abs();
            let _ = self.open_windows.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| {
                Some(v.saturating_sub(dec))
            });
        }
    }

    pub fn queue_dropped(&self) -> u64 {
        self.queue_dropped.load(Ordering::Relaxed)
    }

    pub fn late_events_dropped(&self) -> u64 {
        self.late_events_dropped.load(Ordering::Relaxed)
    }

    pub fn windows_emitted(&self) -> u64 {
        self.windows_emitted.load(Ordering::Relaxed)
    }

    pub fn events_folded(&self) -> u64 {
        self.events_folded.load(Ordering::Relaxed)
    }

    pub fn parse_errors(&self) -> u64 {
        self.parse_errors.load(Ordering::Relaxed)
    }

    pub fn missing_field_errors(&self) -> u64 {
        self.missing_field_errors.load(Ordering::Relaxed)
    }

    pub fn invalid_field_errors(&self) -> u64 {
        self.invalid_field_errors.load(Ordering::Relaxed)
    }

    /// Take a snapshot; resets the per-interval event counter
    pub fn report(&self) -> MetricsSummary {
        let now = Instant::now();
        let elapsed_secs = {
            let mut last = self.last_report_time.lock();
            let elapsed = now.duration_since(*last).as_secs_f64();
            *last = now;
            elapsed
        };

        let interval_events = self.events_since_report.swap(0, Ordering::Relaxed);
        let events_per_sec =
            if elapsed_secs > 0.0 { interval_events as f64 / elapsed_secs } else { 0.0 };

        MetricsSummary {
            messages_received: self.messages_received.load(Ordering::Relaxed),
            messages_enqueued: self.messages_enqueued.load(Ordering::Relaxed),
            queue_dropped: self.queue_dropped.load(Ordering::Relaxed),
            parse_errors: self.parse_errors.load(Ordering::Relaxed),
            missing_field_errors: self.missing_field_errors.load(Ordering::Relaxed),
            invalid_field_errors: self.invalid_field_errors.load(Ordering::Relaxed),
            events_folded: self.events_folded.load(Ordering::Relaxed),
            events_per_sec,
            late_events_dropped: self.late_events_dropped.load(Ordering::Relaxed),
            overflow_dropped: self.overflow_dropped.load(Ordering::Relaxed),
            windows_emitted: self.windows_emitted.load(Ordering::Relaxed),
            aggregates_skipped: self.aggregates_skipped.load(Ordering::Relaxed),
            sink_sent: self.sink_sent.load(Ordering::Relaxed),
            sink_failed: self.sink_failed.load(Ordering::Relaxed),
            sink_dropped: self.sink_dropped.load(Ordering::Relaxed),
            broker_reconnects: self.broker_reconnects.load(Ordering::Relaxed),
            queue_depth: self.queue_depth.load(Ordering::Relaxed),
            open_windows: self.open_windows.load(Ordering::Relaxed),
        }
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone)]
pub struct MetricsSummary {
    pub messages_received: u64,
    pub messages_enqueued: u64,
    pub queue_dropped: u64,
    pub parse_errors: u64,
    pub missing_field_errors: u64,
    pub invalid_field_errors: u64,
    pub events_folded: u64,
    /// Folded events per second over the last interval
    pub events_per_sec: f64,
    pub late_events_dropped: u64,
    pub overflow_dropped: u64,
    pub windows_emitted: u64,
    pub aggregates_skipped: u64,
    pub sink_sent: u64,
    pub sink_failed: u64,
    pub sink_dropped: u64,
    pub broker_reconnects: u64,
    /// Ingestion queue depth (snapshot)
    pub queue_depth: u64,
    /// Open windows across reducers (snapshot)
    pub open_windows: u64,
}

impl MetricsSummary {
    pub fn log(&self) {
        info!(
            received = %self.messages_received,
            enqueued = %self.messages_enqueued,
            queue_dropped = %self.queue_dropped,
            queue_depth = %self.queue_depth,
            parse_errors = %self.parse_errors,
            missing_field = %self.missing_field_errors,
            invalid_field = %self.invalid_field_errors,
            events_folded = %self.events_folded,
            events_per_sec = format!("{:.1}", self.events_per_sec),
            late_dropped = %self.late_events_dropped,
            overflow_dropped = %self.overflow_dropped,
            open_windows = %self.open_windows,
            windows_emitted = %self.windows_emitted,
            sink_sent = %self.sink_sent,
            sink_failed = %self.sink_failed,
            sink_dropped = %self.sink_dropped,
            broker_reconnects = %self.broker_reconnects,
            "metrics"
        );
    }
}
