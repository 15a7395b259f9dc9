//! End-to-end pipeline runs: ingestion queue in, collecting sink out

use pos_aggregator::domain::{EventTime, RawMessage};
use pos_aggregator::infra::{Config, Metrics};
use pos_aggregator::io::{CollectingSink, IngestQueue};
use pos_aggregator::services::{spawn_pipeline, Pipeline};
use std::sync::Arc;
use std::time::Duration;

/// 2024-11-15T15:40:40Z
const T0: i64 = 1_731_685_240_000;

struct Harness {
    queue: Arc<IngestQueue<RawMessage>>,
    sink: Arc<CollectingSink>,
    metrics: Arc<Metrics>,
    pipeline: Pipeline,
}

impl Harness {
    /// Watermark driven purely by event time so runs are deterministic
    fn start(config: Config) -> Self {
        let config = config.with_advance_with_system_time(false);
        let queue = Arc::new(IngestQueue::new(config.queue_capacity()));
        let sink = Arc::new(CollectingSink::new());
        let metrics = Arc::new(Metrics::new());
        let pipeline = spawn_pipeline(&config, queue.clone(), sink.clone(), metrics.clone()).unwrap();
        Self { queue, sink, metrics, pipeline }
    }

    fn push(&self, payload: String) {
        self.queue.try_push(RawMessage::new(payload)).unwrap();
    }

    async fn wait_for(&self, what: &str, cond: impl Fn(&Self) -> bool) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
        while !cond(self) {
            assert!(tokio::time::Instant::now() < deadline, "timed out waiting for {}", what);
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    async fn shutdown(self) -> (Arc<CollectingSink>, Arc<Metrics>) {
        self.queue.close().await;
        self.pipeline.join().await;
        (self.sink, self.metrics)
    }
}

fn config() -> Config {
    Config::default().with_window(10_000, EventTime::from_millis(T0), 1_000).with_queue(1_000, 20)
}

/// Transaction at `T0 + offset_ms`
fn tx(store_id: &str, offset_ms: i64, amount: f64) -> String {
    let ts = EventTime::from_millis(T0 + offset_ms).to_iso8601();
    format!(
        r#"{{"transaction_id": "{store_id}-{offset_ms}", "timestamp": "{ts}", "store_id": "{store_id}", "total_amount": {amount}, "items": []}}"#
    )
}

#[tokio::test]
async fn test_window_emits_sum_and_event_time_bounds() {
    let harness = Harness::start(config());

    harness.push(tx("S1", 1_000, 3.16));
    harness.push(tx("S1", 2_000, 3.16));
    // watermark = T0+12s - 1s passes the first window end
    harness.push(tx("S1", 12_000, 1.00));

    harness.wait_for("first aggregate", |h| h.sink.len() == 1).await;
    let (sink, metrics) = harness.shutdown().await;

    let events = sink.events();
    assert_eq!(events.len(), 1);
    let out = &events[0];
    assert_eq!(out.store_id, "S1");
    assert_eq!(out.total_amount, 6.32);
    assert_eq!(out.begin_stream_aggregator, "2024-11-15T15:40:41+00:00");
    assert_eq!(out.end_stream_aggregator, "2024-11-15T15:40:42+00:00");
    assert!(uuid::Uuid::parse_str(&out.event_id).is_ok());

    assert_eq!(metrics.events_folded(), 3);
    assert_eq!(metrics.windows_emitted(), 1);
}

#[tokio::test]
async fn test_microsecond_event_times_are_emitted_verbatim() {
    let harness = Harness::start(config());

    let at = |ts: &str, amount: f64| {
        format!(r#"{{"timestamp": "{ts}", "store_id": "S1", "total_amount": {amount}}}"#)
    };
    harness.push(at("2024-11-15T15:40:41.201465Z", 1.00));
    harness.push(at("2024-11-15T15:40:49.999999Z", 2.00));
    harness.push(at("2024-11-15T15:40:52Z", 1.00));

    harness.wait_for("aggregate", |h| h.sink.len() == 1).await;
    let (sink, _) = harness.shutdown().await;

    let out = &sink.events()[0];
    assert_eq!(out.total_amount, 3.00);
    assert_eq!(out.begin_stream_aggregator, "2024-11-15T15:40:41.201465+00:00");
    assert_eq!(out.end_stream_aggregator, "2024-11-15T15:40:49.999999+00:00");
}

#[tokio::test]
async fn test_overflowing_amount_is_dropped_and_window_still_emitted() {
    let harness = Harness::start(config());

    harness.push(tx("S1", 1_000, 5e12));
    harness.push(tx("S1", 2_000, 5e12));
    harness.push(tx("S1", 15_000, 1.00));

    harness.wait_for("aggregate", |h| h.sink.len() == 1).await;
    let (sink, metrics) = harness.shutdown().await;

    assert_eq!(sink.events()[0].total_amount, 5e12);
    assert_eq!(metrics.report().overflow_dropped, 1);
}

#[tokio::test]
async fn test_malformed_payload_does_not_affect_later_events() {
    let harness = Harness::start(config());

    harness.push("{ this is not json".to_string());
    harness.push(tx("S1", 1_000, 2.00));
    harness.push(r#"{"store_id": "S1", "total_amount": 5.0}"#.to_string());
    harness.push(tx("S1", 3_000, 0.0));
    harness.push(tx("S1", 4_000, 2.50));
    harness.push(tx("S1", 20_000, 1.00));

    harness.wait_for("aggregate", |h| h.sink.len() == 1).await;
    let (sink, metrics) = harness.shutdown().await;

    assert_eq!(sink.events()[0].total_amount, 4.50);
    assert_eq!(metrics.parse_errors(), 1);
    assert_eq!(metrics.missing_field_errors(), 1);
    assert_eq!(metrics.invalid_field_errors(), 1);
    assert_eq!(metrics.events_folded(), 3);
}

#[tokio::test]
async fn test_late_event_is_dropped_and_window_emitted_once() {
    let harness = Harness::start(config());

    harness.push(tx("S1", 1_000, 3.16));
    harness.push(tx("S1", 15_000, 2.00));
    harness.wait_for("first window", |h| h.sink.len() == 1).await;

    // First window is gone; this one must not reopen or re-emit it
    harness.push(tx("S1", 3_000, 9.99));
    harness.push(tx("S1", 30_000, 1.00));
    harness.wait_for("second window", |h| h.sink.len() == 2).await;
    let (sink, metrics) = harness.shutdown().await;

    let events = sink.events();
    assert_eq!(events.len(), 2);
    assert_eq!(events[0].total_amount, 3.16);
    assert_eq!(events[1].total_amount, 2.00);
    assert_eq!(events[1].begin_stream_aggregator, "2024-11-15T15:40:55+00:00");
    assert_eq!(metrics.late_events_dropped(), 1);
}

#[tokio::test]
async fn test_stores_are_aggregated_independently() {
    let harness = Harness::start(config());

    harness.push(tx("STORE_1", 500, 10.00));
    harness.push(tx("STORE_2", 700, 0.79));
    harness.push(tx("STORE_1", 9_999, 5.25));
    harness.push(tx("STORE_2", 10_000, 4.00));
    harness.push(tx("STORE_1", 11_500, 1.00));
    harness.push(tx("STORE_2", 11_500, 1.00));

    harness.wait_for("both stores", |h| h.sink.len() == 2).await;
    let (sink, _) = harness.shutdown().await;

    let mut events = sink.events();
    events.sort_by(|a, b| a.store_id.cmp(&b.store_id));
    assert_eq!(events[0].store_id, "STORE_1");
    assert_eq!(events[0].total_amount, 15.25);
    assert_eq!(events[0].end_stream_aggregator, "2024-11-15T15:40:49.999+00:00");
    // T0+10s belongs to the next window
    assert_eq!(events[1].store_id, "STORE_2");
    assert_eq!(events[1].total_amount, 0.79);
}

#[tokio::test]
async fn test_amount_rounding_to_zero_is_not_sent() {
    let harness = Harness::start(config());

    harness.push(tx("S1", 1_000, 0.001));
    harness.push(tx("S1", 1_500, 0.002));
    harness.push(tx("S1", 25_000, 1.00));

    harness.wait_for("skip", |h| h.metrics.report().aggregates_skipped == 1).await;
    let (sink, metrics) = harness.shutdown().await;

    assert!(sink.is_empty());
    assert_eq!(metrics.windows_emitted(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_parallel_workers_and_shards_match_sequential_total() {
    let config = Config::default()
        .with_window(10_000, EventTime::from_millis(T0), 60_000)
        .with_queue(10_000, 20)
        .with_parallelism(4, 3);
    let harness = Harness::start(config);

    let stores = ["A", "B", "C", "D", "E"];
    for i in 0..200 {
        for store in stores {
            harness.push(tx(store, (i * 37) % 10_000, 1.25));
        }
    }
    harness.wait_for("all folded", |h| h.metrics.events_folded() == 1_000).await;
    // Partials are handed off right after each batch; give the reducers a moment
    tokio::time::sleep(Duration::from_millis(300)).await;

    // watermark = T0+75s - 60s closes the first window everywhere
    for store in stores {
        harness.push(tx(store, 75_000, 1.00));
    }
    harness.wait_for("all stores", |h| h.sink.len() == stores.len()).await;
    let (sink, metrics) = harness.shutdown().await;

    let mut events = sink.events();
    events.sort_by(|a, b| a.store_id.cmp(&b.store_id));
    for (event, store) in events.iter().zip(stores) {
        assert_eq!(event.store_id, store);
        assert_eq!(event.total_amount, 250.0);
        assert_eq!(event.begin_stream_aggregator, "2024-11-15T15:40:40+00:00");
    }
    assert_eq!(metrics.late_events_dropped(), 0);
    assert_eq!(metrics.windows_emitted(), 5);
}
