//! Named metric registry

use crate::Histogram;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;

/// Thread-safe registry of counters, gauges, and histograms
pub struct Metrics {
    counters: RwLock<HashMap<String, Arc<AtomicU64>>>,
    gauges: RwLock<HashMap<String, Arc<AtomicI64>>>,
    histograms: RwLock<HashMap<String, Arc<Histogram>>>,
}

impl Metrics {
    /// Create an empty registry
    pub fn new() -> Self {
        Self {
            counters: RwLock::new(HashMap::new()),
            gauges: RwLock::new(HashMap::new()),
            histograms: RwLock::new(HashMap::new()),
        }
    }

    /// Increment a counter
    pub fn counter(&self, name: &str, delta: u64) {
        let counters = self.counters.read();
        if let Some(c) = counters.get(name) {
            c.fetch_add(delta, Ordering::Relaxed);
            return;
        }
        drop(counters);

        let mut counters = self.counters.write();
        counters
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(AtomicU64::new(0)))
            .fetch_add(delta, Ordering::Relaxed);
    }

    /// Set a gauge value
    pub fn gauge(&self, name: &str, value: i64) {
        let gauges = self.gauges.read();
        if let Some(g) = gauges.get(name) {
            g.store(value, Ordering::Relaxed);
            return;
        }
        drop(gauges);

        let mut gauges = self.gauges.write();
        gauges
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(AtomicI64::new(0)))
            .store(value, Ordering::Relaxed);
    }

    /// Record a histogram observation
    pub fn histogram(&self, name: &str, value: f64) {
        let histograms = self.histograms.read();
        if let Some(h) = histograms.get(name) {
            h.observe(value);
            return;
        }
        drop(histograms);

        let mut histograms = self.histograms.write();
        histograms
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(Histogram::new()))
            .observe(value);
    }

    /// Current value of a counter
    pub fn get_counter(&self, name: &str) -> Option<u64> {
        self.counters
            .read()
            .get(name)
            .map(|c| c.load(Ordering::Relaxed))
    }

    /// Current value of a gauge
    pub fn get_gauge(&self, name: &str) -> Option<i64> {
        self.gauges
            .read()
            .get(name)
            .map(|g| g.load(Ordering::Relaxed))
    }

    /// Mean of a histogram
    pub fn get_histogram_mean(&self, name: &str) -> Option<f64> {
        self.histograms.read().get(name).map(|h| h.mean())
    }

    /// Export everything as a point-in-time snapshot
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            counters: self
                .counters
                .read()
                .iter()
                .map(|(k, v)| (k.clone(), v.load(Ordering::Relaxed)))
                .collect(),
            gauges: self
                .gauges
                .read()
                .iter()
                .map(|(k, v)| (k.clone(), v.load(Ordering::Relaxed)))
                .collect(),
            histograms: self
                .histograms
                .read()
                .iter()
                .map(|(k, v)| {
                    (
                        k.clone(),
                        HistogramSummary {
                            mean: v.mean(),
                            count: v.total_count(),
                        },
                    )
                })
                .collect(),
        }
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Summary of one histogram
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistogramSummary {
    /// Mean value
    pub mean: f64,
    /// Total observation count
    pub count: u64,
}

/// Point-in-time view of all metrics
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    /// Counter values
    pub counters: HashMap<String, u64>,
    /// Gauge values
    pub gauges: HashMap<String, i64>,
    /// Histogram summaries
    pub histograms: HashMap<String, HistogramSummary>,
}

impl MetricsSnapshot {
    /// Export as pretty JSON
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counter_accumulates() {
        let metrics = Metrics::new();
        metrics.counter("consensus.rounds_started", 1);
        metrics.counter("consensus.rounds_started", 2);
        assert_eq!(metrics.get_counter("consensus.rounds_started"), Some(3));
    }

    #[test]
    fn test_gauge_overwrites() {
        let metrics = Metrics::new();
        metrics.gauge("mempool.pending", 42);
        metrics.gauge("mempool.pending", 7);
        assert_eq!(metrics.get_gauge("mempool.pending"), Some(7));
    }

    #[test]
    fn test_histogram_mean() {
        let metrics = Metrics::new();
        metrics.histogram("snapshot.write_ms", 100.0);
        metrics.histogram("snapshot.write_ms", 300.0);
        assert_eq!(metrics.get_histogram_mean("snapshot.write_ms"), Some(200.0));
    }

    #[test]
    fn test_snapshot_export() {
        let metrics = Metrics::new();
        metrics.counter("accept.blocks_accepted", 5);
        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.counters.get("accept.blocks_accepted"), Some(&5));
        assert!(snapshot.to_json().unwrap().contains("accept.blocks_accepted"));
    }
}
