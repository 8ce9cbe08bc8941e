//! Metric sinks.
//!
//! The aggregator hands each window's flow buckets to a sink. The default
//! sink writes one JSON object per bucket to stdout; the format is
//! observable but not contractual.

use std::io::Write;

use log::warn;
use serde::Serialize;

use crate::aggregator::Metric;

pub trait MetricSink: Send + Sync {
    fn emit(&self, metrics: &[Metric]);
}

/// Serialized view of a flow bucket.
#[derive(Debug, Serialize)]
struct MetricLine<'a> {
    timestamp: i64,
    subject: &'a str,
    remote: &'a str,
    port: u16,
    protocol: &'a str,
    bytes_in: u64,
    bytes_out: u64,
    rtt_samples: u64,
    rtt_ms_p50: f64,
    rtt_ms_p90: f64,
    rtt_ms_p95: f64,
}

impl<'a> From<&'a Metric> for MetricLine<'a> {
    fn from(m: &'a Metric) -> Self {
        Self {
            timestamp: m.timestamp,
            subject: &m.subject,
            remote: &m.remote,
            port: m.port,
            protocol: &m.protocol,
            bytes_in: m.bytes_in,
            bytes_out: m.bytes_out,
            rtt_samples: m.rtt.count(),
            rtt_ms_p50: m.rtt.quantile(0.5),
            rtt_ms_p90: m.rtt.quantile(0.9),
            rtt_ms_p95: m.rtt.quantile(0.95),
        }
    }
}

/// Writes one JSON line per flow bucket to stdout.
#[derive(Debug, Default)]
pub struct JsonLinesSink;

impl MetricSink for JsonLinesSink {
    fn emit(&self, metrics: &[Metric]) {
        let stdout = std::io::stdout();
        let mut out = stdout.lock();
        for metric in metrics {
            let line = MetricLine::from(metric);
            match serde_json::to_string(&line) {
                Ok(json) => {
                    if writeln!(out, "{json}").is_err() {
                        return;
                    }
                }
                Err(err) => warn!("unable to serialize metric: {err}"),
            }
        }
        let _ = out.flush();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sketch::RttSketch;

    #[test]
    fn metric_line_carries_quantiles() {
        let mut rtt = RttSketch::new();
        for ms in [1.0, 2.0, 3.0] {
            rtt.add(ms, 1);
        }
        let metric = Metric {
            timestamp: 1_700_000_000,
            subject: "ns/a".to_string(),
            remote: "ns/b".to_string(),
            port: 443,
            protocol: "tcp".to_string(),
            bytes_in: 300,
            bytes_out: 40,
            rtt,
        };

        let value = serde_json::to_value(MetricLine::from(&metric)).unwrap();
        assert_eq!(value["subject"], "ns/a");
        assert_eq!(value["remote"], "ns/b");
        assert_eq!(value["port"], 443);
        assert_eq!(value["bytes_in"], 300);
        assert_eq!(value["bytes_out"], 40);
        assert_eq!(value["rtt_samples"], 3);
        assert!(value["rtt_ms_p50"].as_f64().unwrap() > 0.0);
    }
}
