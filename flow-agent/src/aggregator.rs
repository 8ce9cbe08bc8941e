//! Flow metric aggregation.
//!
//! Raw per-packet records accumulate in an active buffer; every tick the
//! buffers flip and the previous window is folded into per-flow buckets
//! keyed by a hash of `subject || remote || port`. Bucket snapshots are
//! stamped with the wall-clock second and handed to the sink.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use log::debug;
use std::collections::HashMap;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use xxhash_rust::xxh64::Xxh64;

use crate::sink::MetricSink;
use crate::sketch::RttSketch;

const RECORD_CAPACITY: usize = 512;

/// A decorated per-packet record.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Record {
    /// Kernel monotonic timestamp, nanoseconds.
    pub timestamp: u64,
    /// Name of the local endpoint whose cgroup was hooked.
    pub subject: String,
    /// Name of the other side.
    pub remote: String,
    /// Service-side port heuristic: min(src, dest).
    pub port: u16,
    pub protocol: String,
    pub bytes_in: u64,
    pub bytes_out: u64,
    /// Round-trip time in milliseconds; 0 when unknown.
    pub rtt_ms: f64,
}

/// An emitted per-flow bucket.
#[derive(Debug, Clone)]
pub struct Metric {
    /// Wall-clock unix seconds at emission.
    pub timestamp: i64,
    pub subject: String,
    pub remote: String,
    pub port: u16,
    pub protocol: String,
    pub bytes_in: u64,
    pub bytes_out: u64,
    pub rtt: RttSketch,
}

/// Double-buffered record sink.
///
/// `add` is meant for a single producer task; readers fanning out across
/// tasks must funnel records through one owner. The tick task flips the
/// active index and folds the inactive buffer, so `add` never contends with
/// the fold for more than the buffer mutex.
pub struct Aggregator {
    buffers: [Mutex<Vec<Record>>; 2],
    active: AtomicUsize,
}

impl Default for Aggregator {
    fn default() -> Self {
        Self::new()
    }
}

impl Aggregator {
    pub fn new() -> Self {
        Self {
            buffers: [
                Mutex::new(Vec::with_capacity(RECORD_CAPACITY)),
                Mutex::new(Vec::with_capacity(RECORD_CAPACITY)),
            ],
            active: AtomicUsize::new(0),
        }
    }

    /// Buffer a record for the current window.
    pub fn add(&self, record: Record) {
        let idx = self.active.load(Ordering::Acquire);
        self.buffers[idx]
            .lock()
            .expect("record buffer poisoned")
            .push(record);
    }

    /// Flip buffers and fold the closed window into flow buckets.
    pub fn drain(&self) -> Vec<Metric> {
        let old = self.active.load(Ordering::Acquire);
        self.active.store(1 - old, Ordering::Release);

        let mut buffer = self.buffers[old].lock().expect("record buffer poisoned");

        let mut buckets: HashMap<u64, Metric> = HashMap::new();
        for record in buffer.drain(..) {
            let key = bucket_key(&record.subject, &record.remote, record.port);
            let bucket = buckets.entry(key).or_insert_with(|| Metric {
                timestamp: 0,
                subject: record.subject.clone(),
                remote: record.remote.clone(),
                port: record.port,
                protocol: record.protocol.clone(),
                bytes_in: 0,
                bytes_out: 0,
                rtt: RttSketch::new(),
            });

            bucket.bytes_in += record.bytes_in;
            bucket.bytes_out += record.bytes_out;
            if record.rtt_ms > 0.0 {
                bucket.rtt.add(record.rtt_ms, 1);
            }
        }

        let ts = Utc::now().timestamp();
        let mut metrics: Vec<Metric> = buckets.into_values().collect();
        for metric in &mut metrics {
            metric.timestamp = ts;
            metric.rtt.compress();
        }
        metrics
    }
}

/// Bucket identity: xxhash-64 over subject, remote, and the big-endian port.
fn bucket_key(subject: &str, remote: &str, port: u16) -> u64 {
    let mut hasher = Xxh64::new(0);
    hasher.update(subject.as_bytes());
    hasher.update(remote.as_bytes());
    hasher.update(&port.to_be_bytes());
    hasher.digest()
}

/// Run the tick loop, folding and emitting a window every `interval` until
/// shutdown.
///
/// Records buffered in the window that is active at shutdown are discarded.
pub fn spawn_ticker(
    aggregator: Arc<Aggregator>,
    interval: Duration,
    sink: Arc<dyn MetricSink>,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick of a tokio interval fires immediately.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let metrics = aggregator.drain();
                    debug!("emitting {} flow buckets", metrics.len());
                    sink.emit(&metrics);
                }
                _ = shutdown.changed() => {
                    debug!("aggregator ticker stopped");
                    return;
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(subject: &str, remote: &str, port: u16, bytes_in: u64, bytes_out: u64) -> Record {
        Record {
            subject: subject.to_string(),
            remote: remote.to_string(),
            port,
            protocol: "tcp".to_string(),
            bytes_in,
            bytes_out,
            ..Record::default()
        }
    }

    #[test]
    fn bytes_accumulate_per_flow() {
        let agg = Aggregator::new();
        agg.add(record("A", "B", 80, 100, 0));
        agg.add(record("A", "B", 80, 0, 40));
        agg.add(record("A", "B", 80, 200, 0));

        let metrics = agg.drain();
        assert_eq!(metrics.len(), 1);
        assert_eq!(metrics[0].bytes_in, 300);
        assert_eq!(metrics[0].bytes_out, 40);
        assert_eq!(metrics[0].port, 80);
        assert!(metrics[0].timestamp > 0);
    }

    #[test]
    fn distinct_flows_get_distinct_buckets() {
        let agg = Aggregator::new();
        agg.add(record("A", "B", 80, 10, 0));
        agg.add(record("A", "B", 443, 20, 0));
        agg.add(record("A", "C", 80, 30, 0));

        let metrics = agg.drain();
        assert_eq!(metrics.len(), 3);
    }

    #[test]
    fn zero_rtt_does_not_enter_the_sketch() {
        let agg = Aggregator::new();
        let rtts_ns: [u32; 6] = [1_000_000, 2_000_000, 3_000_000, 0, 4_000_000, 5_000_000];
        for rtt in rtts_ns {
            let mut r = record("A", "B", 80, 100, 0);
            r.rtt_ms = rtt as f64 / 1_000_000.0;
            agg.add(r);
        }

        let metrics = agg.drain();
        assert_eq!(metrics.len(), 1);
        assert_eq!(metrics[0].rtt.count(), 5);
        let p50 = metrics[0].rtt.quantile(0.5);
        assert!((p50 - 3.0).abs() < 0.5, "p50 was {p50}");
    }

    #[test]
    fn window_resets_between_drains() {
        let agg = Aggregator::new();
        agg.add(record("A", "B", 80, 100, 0));
        assert_eq!(agg.drain().len(), 1);
        assert!(agg.drain().is_empty());

        // Records added after a drain land in the next window.
        agg.add(record("A", "B", 80, 50, 0));
        let metrics = agg.drain();
        assert_eq!(metrics.len(), 1);
        assert_eq!(metrics[0].bytes_in, 50);
    }

    #[test]
    fn bucket_key_is_deterministic_and_order_sensitive() {
        assert_eq!(bucket_key("A", "B", 80), bucket_key("A", "B", 80));
        assert_ne!(bucket_key("A", "B", 80), bucket_key("B", "A", 80));
        assert_ne!(bucket_key("A", "B", 80), bucket_key("A", "B", 443));
    }
}
