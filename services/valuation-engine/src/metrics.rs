//! Observability and metrics for the valuation engine
//!
//! Counters for every stage (ingest, windowing, price join, emission,
//! checkpointing), a bounded latency tracker for per-event processing time,
//! and threshold-based alerts. `export()` produces a sorted map for
//! Prometheus-style exposition.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use tracing::error;

use crate::price_table::{PriceQuote, UpdateOutcome};

/// Core metrics for the engine.
pub struct EngineMetrics {
    // Quantity events
    pub events_processed: AtomicU64,
    pub events_duplicate: AtomicU64,
    pub events_malformed: AtomicU64,
    pub events_late_dropped: AtomicU64,
    pub events_late_merged: AtomicU64,
    pub event_processing_ns: Mutex<LatencyTracker>,

    // Windows
    pub windows_opened: AtomicU64,
    pub windows_closed: AtomicU64,
    pub open_windows: AtomicU64,

    // Price join
    pub default_priced_lookups: AtomicU64,
    pub stale_priced_lookups: AtomicU64,
    pub price_updates_applied: AtomicU64,
    pub price_updates_ignored: AtomicU64,
    pub price_updates_malformed: AtomicU64,

    // Emission
    pub snapshots_emitted: AtomicU64,
    pub snapshot_replays: AtomicU64,
    pub pending_snapshots: AtomicU64,
    pub publish_retries: AtomicU64,
    pub publish_failures: AtomicU64,
    pub integrity_violations: AtomicU64,

    // Checkpoints
    pub checkpoints_written: AtomicU64,
    pub checkpoint_failures: AtomicU64,

    // Alerts
    pub alerts: Mutex<Vec<Alert>>,
}

impl EngineMetrics {
    pub fn new() -> Self {
        Self {
            events_processed: AtomicU64::new(0),
            events_duplicate: AtomicU64::new(0),
            events_malformed: AtomicU64::new(0),
            events_late_dropped: AtomicU64::new(0),
            events_late_merged: AtomicU64::new(0),
            event_processing_ns: Mutex::new(LatencyTracker::new(1000)),
            windows_opened: AtomicU64::new(0),
            windows_closed: AtomicU64::new(0),
            open_windows: AtomicU64::new(0),
            default_priced_lookups: AtomicU64::new(0),
            stale_priced_lookups: AtomicU64::new(0),
            price_updates_applied: AtomicU64::new(0),
            price_updates_ignored: AtomicU64::new(0),
            price_updates_malformed: AtomicU64::new(0),
            snapshots_emitted: AtomicU64::new(0),
            snapshot_replays: AtomicU64::new(0),
            pending_snapshots: AtomicU64::new(0),
            publish_retries: AtomicU64::new(0),
            publish_failures: AtomicU64::new(0),
            integrity_violations: AtomicU64::new(0),
            checkpoints_written: AtomicU64::new(0),
            checkpoint_failures: AtomicU64::new(0),
            alerts: Mutex::new(Vec::new()),
        }
    }

    /// Record an event folded into a window.
    pub fn record_event_processed(&self, latency_ns: u64) {
        self.events_processed.fetch_add(1, Ordering::Relaxed);
        if let Ok(mut tracker) = self.event_processing_ns.lock() {
            tracker.record(latency_ns);
        }
    }

    pub fn record_duplicate(&self) {
        self.events_duplicate.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_malformed(&self) {
        self.events_malformed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_late_dropped(&self) {
        self.events_late_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_late_merged(&self) {
        self.events_late_merged.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_window_opened(&self) {
        self.windows_opened.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_window_closed(&self) {
        self.windows_closed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn set_open_windows(&self, count: u64) {
        self.open_windows.store(count, Ordering::Relaxed);
    }

    /// Record the side channel of one price lookup.
    pub fn record_lookup(&self, quote: &PriceQuote) {
        if quote.is_default {
            self.default_priced_lookups.fetch_add(1, Ordering::Relaxed);
        }
        if quote.is_stale {
            self.stale_priced_lookups.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_price_update(&self, outcome: UpdateOutcome) {
        match outcome {
            UpdateOutcome::Inserted | UpdateOutcome::Replaced => {
                self.price_updates_applied.fetch_add(1, Ordering::Relaxed);
            }
            UpdateOutcome::IgnoredOlder => {
                self.price_updates_ignored.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    pub fn record_price_malformed(&self) {
        self.price_updates_malformed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_snapshot_emitted(&self) {
        self.snapshots_emitted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_snapshot_replay(&self) {
        self.snapshot_replays.fetch_add(1, Ordering::Relaxed);
    }

    pub fn set_pending_snapshots(&self, count: u64) {
        self.pending_snapshots.store(count, Ordering::Relaxed);
    }

    pub fn record_publish_retry(&self) {
        self.publish_retries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_publish_failure(&self) {
        self.publish_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_checkpoint_written(&self) {
        self.checkpoints_written.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_checkpoint_failure(&self) {
        self.checkpoint_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a logical error and raise a critical alert immediately.
    pub fn record_integrity_violation(&self, message: String) {
        self.integrity_violations.fetch_add(1, Ordering::Relaxed);
        error!(alert = "integrity_violation", "{}", message);
        if let Ok(mut alert_store) = self.alerts.lock() {
            alert_store.push(Alert {
                level: AlertLevel::Critical,
                metric: "integrity_violations".to_string(),
                message,
            });
        }
    }

    /// Check alert thresholds and generate alerts.
    pub fn check_thresholds(&self, thresholds: &AlertThresholds) -> Vec<Alert> {
        let mut alerts = Vec::new();

        let late = self.events_late_dropped.load(Ordering::Relaxed);
        if late > thresholds.max_late_dropped {
            alerts.push(Alert {
                level: AlertLevel::Warning,
                metric: "events_late_dropped".to_string(),
                message: format!("Late events dropped: {} > threshold {}", late, thresholds.max_late_dropped),
            });
        }

        let malformed = self.events_malformed.load(Ordering::Relaxed);
        if malformed > thresholds.max_malformed {
            alerts.push(Alert {
                level: AlertLevel::Warning,
                metric: "events_malformed".to_string(),
                message: format!("Malformed events: {} > threshold {}", malformed, thresholds.max_malformed),
            });
        }

        let pending = self.pending_snapshots.load(Ordering::Relaxed);
        if pending > thresholds.max_pending_snapshots {
            alerts.push(Alert {
                level: AlertLevel::Critical,
                metric: "pending_snapshots".to_string(),
                message: format!("Unconfirmed snapshots: {} > threshold {}", pending, thresholds.max_pending_snapshots),
            });
        }

        let ckpt_failures = self.checkpoint_failures.load(Ordering::Relaxed);
        if ckpt_failures > thresholds.max_checkpoint_failures {
            alerts.push(Alert {
                level: AlertLevel::Critical,
                metric: "checkpoint_failures".to_string(),
                message: format!(
                    "Checkpoint failures: {} > threshold {}",
                    ckpt_failures, thresholds.max_checkpoint_failures
                ),
            });
        }

        if let Ok(tracker) = self.event_processing_ns.lock() {
            if let Some(p99) = tracker.percentile(99) {
                if p99 > thresholds.max_event_processing_p99_ns {
                    alerts.push(Alert {
                        level: AlertLevel::Warning,
                        metric: "event_processing_p99".to_string(),
                        message: format!(
                            "Event processing p99: {}ns > threshold {}ns",
                            p99, thresholds.max_event_processing_p99_ns
                        ),
                    });
                }
            }
        }

        if let Ok(mut alert_store) = self.alerts.lock() {
            alert_store.extend(alerts.clone());
        }

        alerts
    }

    /// Every alert raised so far.
    pub fn alerts(&self) -> Vec<Alert> {
        self.alerts.lock().map(|a| a.clone()).unwrap_or_default()
    }

    /// Export metrics as a BTreeMap for Prometheus-style exposition.
    pub fn export(&self) -> BTreeMap<String, u64> {
        let counters: [(&str, &AtomicU64); 21] = [
            ("events_processed", &self.events_processed),
            ("events_duplicate", &self.events_duplicate),
            ("events_malformed", &self.events_malformed),
            ("events_late_dropped", &self.events_late_dropped),
            ("events_late_merged", &self.events_late_merged),
            ("windows_opened", &self.windows_opened),
            ("windows_closed", &self.windows_closed),
            ("open_windows", &self.open_windows),
            ("default_priced_lookups", &self.default_priced_lookups),
            ("stale_priced_lookups", &self.stale_priced_lookups),
            ("price_updates_applied", &self.price_updates_applied),
            ("price_updates_ignored", &self.price_updates_ignored),
            ("price_updates_malformed", &self.price_updates_malformed),
            ("snapshots_emitted", &self.snapshots_emitted),
            ("snapshot_replays", &self.snapshot_replays),
            ("pending_snapshots", &self.pending_snapshots),
            ("publish_retries", &self.publish_retries),
            ("publish_failures", &self.publish_failures),
            ("integrity_violations", &self.integrity_violations),
            ("checkpoints_written", &self.checkpoints_written),
            ("checkpoint_failures", &self.checkpoint_failures),
        ];
        counters
            .iter()
            .map(|(name, value)| (name.to_string(), value.load(Ordering::Relaxed)))
            .collect()
    }
}

impl Default for EngineMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Tracks latency samples for percentile calculation.
pub struct LatencyTracker {
    samples: Vec<u64>,
    max_samples: usize,
}

impl LatencyTracker {
    pub fn new(max_samples: usize) -> Self {
        Self {
            samples: Vec::with_capacity(max_samples),
            max_samples,
        }
    }

    /// Record a latency sample.
    pub fn record(&mut self, value: u64) {
        if self.samples.len() >= self.max_samples {
            self.samples.remove(0);
        }
        self.samples.push(value);
    }

    /// Get a percentile value (0-100).
    pub fn percentile(&self, p: usize) -> Option<u64> {
        if self.samples.is_empty() {
            return None;
        }

        let mut sorted = self.samples.clone();
        sorted.sort_unstable();

        let idx = (p as f64 / 100.0 * (sorted.len() - 1) as f64) as usize;
        Some(sorted[idx.min(sorted.len() - 1)])
    }

    pub fn count(&self) -> usize {
        self.samples.len()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AlertLevel {
    Warning,
    Critical,
}

/// An alert triggered by threshold breach or a logical error.
#[derive(Debug, Clone)]
pub struct Alert {
    pub level: AlertLevel,
    pub metric: String,
    pub message: String,
}

#[derive(Debug, Clone)]
pub struct AlertThresholds {
    pub max_late_dropped: u64,
    pub max_malformed: u64,
    /// Snapshots closed but not yet confirmed published.
    pub max_pending_snapshots: u64,
    pub max_checkpoint_failures: u64,
    pub max_event_processing_p99_ns: u64,
}

impl Default for AlertThresholds {
    fn default() -> Self {
        Self {
            max_late_dropped: 100,
            max_malformed: 100,
            max_pending_snapshots: 1_000,
            max_checkpoint_failures: 0,
            max_event_processing_p99_ns: 1_000_000, // 1ms
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use types::numeric::Price;

    #[test]
    fn test_metrics_recording() {
        let metrics = EngineMetrics::new();

        metrics.record_event_processed(500);
        metrics.record_event_processed(1000);
        metrics.record_duplicate();
        metrics.record_price_update(UpdateOutcome::Inserted);
        metrics.record_price_update(UpdateOutcome::IgnoredOlder);

        let exported = metrics.export();
        assert_eq!(exported["events_processed"], 2);
        assert_eq!(exported["events_duplicate"], 1);
        assert_eq!(exported["price_updates_applied"], 1);
        assert_eq!(exported["price_updates_ignored"], 1);
    }

    #[test]
    fn test_lookup_side_channel_counts() {
        let metrics = EngineMetrics::new();
        metrics.record_lookup(&PriceQuote {
            price: Price::from_u64(5),
            is_default: true,
            is_stale: false,
            observed_at: None,
        });
        assert_eq!(metrics.export()["default_priced_lookups"], 1);
        assert_eq!(metrics.export()["stale_priced_lookups"], 0);
    }

    #[test]
    fn test_latency_tracker_percentile() {
        let mut tracker = LatencyTracker::new(100);
        for i in 1..=100 {
            tracker.record(i);
        }

        let p50 = tracker.percentile(50).unwrap();
        assert!((49..=51).contains(&p50));
        let p99 = tracker.percentile(99).unwrap();
        assert!((98..=100).contains(&p99));
    }

    #[test]
    fn test_latency_tracker_window_eviction() {
        let mut tracker = LatencyTracker::new(3);
        for v in [10, 20, 30, 40] {
            tracker.record(v);
        }
        assert_eq!(tracker.count(), 3);
        assert_eq!(tracker.percentile(0), Some(20));
    }

    #[test]
    fn test_alert_thresholds() {
        let metrics = EngineMetrics::new();
        let thresholds = AlertThresholds {
            max_late_dropped: 5,
            ..AlertThresholds::default()
        };

        assert!(metrics.check_thresholds(&thresholds).is_empty());

        for _ in 0..10 {
            metrics.record_late_dropped();
        }
        let alerts = metrics.check_thresholds(&thresholds);
        assert!(alerts.iter().any(|a| a.metric == "events_late_dropped"));
    }

    #[test]
    fn test_integrity_violation_raises_critical_alert() {
        let metrics = EngineMetrics::new();
        metrics.record_integrity_violation("snapshot x conflicts".to_string());

        assert_eq!(metrics.export()["integrity_violations"], 1);
        let alerts = metrics.alerts();
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].level, AlertLevel::Critical);
    }
}
