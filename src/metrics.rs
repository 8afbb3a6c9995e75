//! Observability metrics for the event processing pipeline.
//!
//! Provides Prometheus-compatible metrics and JSON export for events
//! processed, errored, and orphaned, plus processing latency. Grounded on
//! the original implementation's `EventMetrics` (`record_event`/
//! `record_error`/`record_orphaned_event`/`get_summary`, a capped
//! `processing_times` list, and `error_rate`/`orphan_rate` computed from
//! it) combined with the teacher's `MetricsCollector` (the same
//! `Registry`/`CounterVec`/`HistogramVec`/`TextEncoder` idiom, here
//! measuring event throughput instead of LLM request throughput).

use prometheus::{CounterVec, Encoder, HistogramOpts, HistogramVec, Opts, Registry, TextEncoder};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};

const EVENT_TYPE_LABEL: &str = "event_type";
const ERROR_TYPE_LABEL: &str = "error_type";

/// Caps the in-memory processing-time sample list, halved on overflow —
/// the same bounded-buffer shape used by `bus.rs`'s history and
/// `security.rs`'s audit log.
const MAX_PROCESSING_TIME_SAMPLES: usize = 10_000;

pub struct EventMetrics {
    registry: Registry,

    processed_total: CounterVec,
    errors_total: CounterVec,
    orphaned_total: CounterVec,
    processing_duration_ms: HistogramVec,

    processing_time_capacity: usize,
    json_data: Arc<RwLock<EventMetricsState>>,
}

#[derive(Debug, Clone, Default)]
struct EventMetricsState {
    events_processed: u64,
    events_errored: u64,
    events_orphaned: u64,
    events_by_type: HashMap<String, u64>,
    errors_by_type: HashMap<String, u64>,
    processing_times_ms: Vec<f64>,
}

impl EventMetrics {
    pub fn new() -> Self {
        Self::with_capacity(MAX_PROCESSING_TIME_SAMPLES)
    }

    /// Same as `new`, but with an explicit cap on the retained processing-time
    /// sample window, configurable via `processor.metrics_capacity`.
    pub fn with_capacity(processing_time_capacity: usize) -> Self {
        let registry = Registry::new();

        let processed_opts = Opts::new("oscore_events_processed_total", "Total events routed and delivered");
        let processed_total = CounterVec::new(processed_opts, &[EVENT_TYPE_LABEL]).expect("failed to create processed counter");
        registry.register(Box::new(processed_total.clone())).expect("failed to register processed counter");

        let errors_opts = Opts::new("oscore_events_errored_total", "Total events that raised during processing");
        let errors_total = CounterVec::new(errors_opts, &[ERROR_TYPE_LABEL]).expect("failed to create errors counter");
        registry.register(Box::new(errors_total.clone())).expect("failed to register errors counter");

        let orphaned_opts = Opts::new("oscore_events_orphaned_total", "Total events with no driver and no subscriber");
        let orphaned_total = CounterVec::new(orphaned_opts, &[EVENT_TYPE_LABEL]).expect("failed to create orphaned counter");
        registry.register(Box::new(orphaned_total.clone())).expect("failed to register orphaned counter");

        let duration_opts = HistogramOpts::new("oscore_event_processing_duration_ms", "Event processing duration in milliseconds")
            .buckets(vec![1.0, 5.0, 10.0, 25.0, 50.0, 100.0, 250.0, 500.0, 1000.0, 5000.0]);
        let processing_duration_ms =
            HistogramVec::new(duration_opts, &[EVENT_TYPE_LABEL]).expect("failed to create duration histogram");
        registry
            .register(Box::new(processing_duration_ms.clone()))
            .expect("failed to register duration histogram");

        Self {
            registry,
            processed_total,
            errors_total,
            orphaned_total,
            processing_duration_ms,
            processing_time_capacity: processing_time_capacity.max(1),
            json_data: Arc::new(RwLock::new(EventMetricsState::default())),
        }
    }

    /// Record a successfully routed event and its processing latency.
    pub fn record_event(&self, event_type: &str, duration_ms: f64) {
        self.processed_total.with_label_values(&[event_type]).inc();
        self.processing_duration_ms.with_label_values(&[event_type]).observe(duration_ms);

        let mut data = self.json_data.write().unwrap();
        data.events_processed += 1;
        *data.events_by_type.entry(event_type.to_string()).or_default() += 1;
        data.processing_times_ms.push(duration_ms);
        if data.processing_times_ms.len() > self.processing_time_capacity {
            let half = self.processing_time_capacity / 2;
            let drop = data.processing_times_ms.len() - half;
            data.processing_times_ms.drain(0..drop);
        }
    }

    /// Record an event that raised during processing.
    pub fn record_error(&self, error_type: &str) {
        self.errors_total.with_label_values(&[error_type]).inc();

        let mut data = self.json_data.write().unwrap();
        data.events_errored += 1;
        *data.errors_by_type.entry(error_type.to_string()).or_default() += 1;
    }

    /// Record an event dropped because it had neither a capable driver nor
    /// a subscriber — the processor's primary misconfiguration indicator.
    pub fn record_orphaned_event(&self, event_type: &str) {
        self.orphaned_total.with_label_values(&[event_type]).inc();

        let mut data = self.json_data.write().unwrap();
        data.events_orphaned += 1;
    }

    pub fn prometheus_metrics(&self) -> String {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&metric_families, &mut buffer).expect("failed to encode metrics");
        String::from_utf8(buffer).expect("metrics should be valid utf-8")
    }

    /// Summarize current counters, matching the original's `get_summary`:
    /// total/errored/orphaned counts, error/orphan rates, and average
    /// processing time over the retained sample window.
    pub fn get_summary(&self) -> EventMetricsSummary {
        let data = self.json_data.read().unwrap();
        let total = data.events_processed;
        let avg_processing_time_ms = if data.processing_times_ms.is_empty() {
            0.0
        } else {
            data.processing_times_ms.iter().sum::<f64>() / data.processing_times_ms.len() as f64
        };
        let denom = (total + data.events_errored + data.events_orphaned).max(1) as f64;

        EventMetricsSummary {
            timestamp: 0,
            events_processed: total,
            events_errored: data.events_errored,
            events_orphaned: data.events_orphaned,
            error_rate: data.events_errored as f64 / denom,
            orphan_rate: data.events_orphaned as f64 / denom,
            avg_processing_time_ms,
            events_by_type: data.events_by_type.clone(),
            errors_by_type: data.errors_by_type.clone(),
        }
    }

    pub fn export_to_json(&self, path: &PathBuf) -> anyhow::Result<()> {
        let snapshot = self.get_summary().with_timestamp();
        let json = serde_json::to_string_pretty(&snapshot)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, json)?;
        Ok(())
    }

    pub fn export_to_default_location(&self) -> anyhow::Result<()> {
        if let Some(home) = dirs::home_dir() {
            let path = home.join(".oscore").join("metrics.json");
            self.export_to_json(&path)
        } else {
            Err(anyhow::anyhow!("cannot determine home directory"))
        }
    }
}

impl Default for EventMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Snapshot of `EventMetrics` suitable for JSON export or a status API.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EventMetricsSummary {
    #[serde(default)]
    pub timestamp: u64,
    pub events_processed: u64,
    pub events_errored: u64,
    pub events_orphaned: u64,
    pub error_rate: f64,
    pub orphan_rate: f64,
    pub avg_processing_time_ms: f64,
    pub events_by_type: HashMap<String, u64>,
    pub errors_by_type: HashMap<String, u64>,
}

impl EventMetricsSummary {
    pub fn with_timestamp(mut self) -> Self {
        self.timestamp = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_processed_and_computes_average_latency() {
        let metrics = EventMetrics::new();
        metrics.record_event("demo.ping", 10.0);
        metrics.record_event("demo.ping", 20.0);

        let summary = metrics.get_summary();
        assert_eq!(summary.events_processed, 2);
        assert!((summary.avg_processing_time_ms - 15.0).abs() < 0.001);
        assert_eq!(summary.events_by_type.get("demo.ping"), Some(&2));
    }

    #[test]
    fn orphan_rate_reflects_dropped_events() {
        let metrics = EventMetrics::new();
        metrics.record_event("demo.ping", 5.0);
        metrics.record_orphaned_event("demo.unrouted");

        let summary = metrics.get_summary();
        assert_eq!(summary.events_orphaned, 1);
        assert!(summary.orphan_rate > 0.0);
    }

    #[test]
    fn error_rate_reflects_recorded_errors() {
        let metrics = EventMetrics::new();
        metrics.record_event("demo.ping", 5.0);
        metrics.record_error("DriverError");

        let summary = metrics.get_summary();
        assert_eq!(summary.events_errored, 1);
        assert_eq!(summary.errors_by_type.get("DriverError"), Some(&1));
        assert!(summary.error_rate > 0.0);
    }

    #[test]
    fn processing_time_samples_are_capped() {
        let metrics = EventMetrics::new();
        for _ in 0..(MAX_PROCESSING_TIME_SAMPLES + 100) {
            metrics.record_event("demo.ping", 1.0);
        }
        let data = metrics.json_data.read().unwrap();
        assert!(data.processing_times_ms.len() <= MAX_PROCESSING_TIME_SAMPLES);
    }

    #[test]
    fn prometheus_output_contains_expected_metric_names() {
        let metrics = EventMetrics::new();
        metrics.record_event("demo.ping", 1.0);
        let text = metrics.prometheus_metrics();
        assert!(text.contains("oscore_events_processed_total"));
        assert!(text.contains("oscore_event_processing_duration_ms"));
    }
}
