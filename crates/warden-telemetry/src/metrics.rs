//! In-process metrics: labelled counters, gauges and windowed histograms.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};

/// Oldest histogram observations are dropped past this many.
const HISTOGRAM_WINDOW: usize = 4096;

#[derive(Default)]
struct Counter(AtomicU64);

/// Stored as f64 bits.
#[derive(Default)]
struct Gauge(AtomicU64);

impl Gauge {
    fn add(&self, delta: f64) {
        let _ = self
            .0
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |bits| {
                Some((f64::from_bits(bits) + delta).to_bits())
            });
    }

    fn get(&self) -> f64 {
        f64::from_bits(self.0.load(Ordering::Relaxed))
    }
}

#[derive(Default)]
struct Histogram(Mutex<VecDeque<f64>>);

impl Histogram {
    fn observe(&self, value: f64) {
        let mut window = self.0.lock();
        if window.len() == HISTOGRAM_WINDOW {
            let _ = window.pop_front();
        }
        window.push_back(value);
    }

    fn summary(&self) -> HistogramSummary {
        let mut sorted: Vec<f64> = self.0.lock().iter().copied().collect();
        if sorted.is_empty() {
            return HistogramSummary::default();
        }
        sorted.sort_by(f64::total_cmp);
        let count = sorted.len();
        let rank = |q: f64| sorted[((count as f64 * q) as usize).min(count - 1)];
        HistogramSummary {
            count: count as u64,
            sum: sorted.iter().sum(),
            p50: rank(0.50),
            p95: rank(0.95),
            p99: rank(0.99),
        }
    }
}

/// Summary statistics from a histogram.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct HistogramSummary {
    pub count: u64,
    pub sum: f64,
    pub p50: f64,
    pub p95: f64,
    pub p99: f64,
}

/// Point-in-time view of every metric, keyed by rendered name
/// (`name` or `name{k=v,...}`).
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub counters: BTreeMap<String, u64>,
    pub gauges: BTreeMap<String, f64>,
    pub histograms: BTreeMap<String, HistogramSummary>,
}

/// Name plus labels sorted by key, so label order at the call site is irrelevant.
#[derive(Clone, Debug, Hash, PartialEq, Eq)]
struct SeriesKey {
    name: String,
    labels: Vec<(String, String)>,
}

impl SeriesKey {
    fn new(name: &str, labels: &[(&str, &str)]) -> Self {
        let mut labels: Vec<(String, String)> = labels
            .iter()
            .map(|&(k, v)| (k.to_owned(), v.to_owned()))
            .collect();
        labels.sort();
        Self {
            name: name.to_owned(),
            labels,
        }
    }

    fn render(&self) -> String {
        if self.labels.is_empty() {
            return self.name.clone();
        }
        let pairs: Vec<String> = self.labels.iter().map(|(k, v)| format!("{k}={v}")).collect();
        format!("{}{{{}}}", self.name, pairs.join(","))
    }
}

/// All series of one metric kind.
struct Family<T>(RwLock<HashMap<SeriesKey, T>>);

impl<T: Default> Family<T> {
    /// Run `f` on the series, creating it on first use. The common path only
    /// takes the read lock.
    fn with(&self, name: &str, labels: &[(&str, &str)], f: impl FnOnce(&T)) {
        let key = SeriesKey::new(name, labels);
        if let Some(series) = self.0.read().get(&key) {
            f(series);
            return;
        }
        f(self.0.write().entry(key).or_default());
    }

    fn read<R>(&self, name: &str, labels: &[(&str, &str)], f: impl FnOnce(&T) -> R) -> Option<R> {
        self.0.read().get(&SeriesKey::new(name, labels)).map(f)
    }

    fn collect<R>(&self, f: impl Fn(&T) -> R) -> BTreeMap<String, R> {
        self.0.read().iter().map(|(k, v)| (k.render(), f(v))).collect()
    }
}

impl<T> Default for Family<T> {
    fn default() -> Self {
        Self(RwLock::new(HashMap::new()))
    }
}

/// Thread-safe in-process metrics recorder.
#[derive(Default)]
pub struct MetricsRecorder {
    counters: Family<Counter>,
    gauges: Family<Gauge>,
    histograms: Family<Histogram>,
}

impl MetricsRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn counter_inc(&self, name: &str, labels: &[(&str, &str)], n: u64) {
        self.counters.with(name, labels, |c| {
            let _ = c.0.fetch_add(n, Ordering::Relaxed);
        });
    }

    /// Add `delta` (may be negative) to a gauge.
    pub fn gauge_inc(&self, name: &str, labels: &[(&str, &str)], delta: f64) {
        self.gauges.with(name, labels, |g| g.add(delta));
    }

    pub fn histogram_observe(&self, name: &str, labels: &[(&str, &str)], value: f64) {
        self.histograms.with(name, labels, |h| h.observe(value));
    }

    pub fn counter_get(&self, name: &str, labels: &[(&str, &str)]) -> u64 {
        self.counters
            .read(name, labels, |c| c.0.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    pub fn gauge_get(&self, name: &str, labels: &[(&str, &str)]) -> f64 {
        self.gauges.read(name, labels, Gauge::get).unwrap_or(0.0)
    }

    pub fn histogram_summary(&self, name: &str, labels: &[(&str, &str)]) -> HistogramSummary {
        self.histograms
            .read(name, labels, Histogram::summary)
            .unwrap_or_default()
    }

    /// Copy every current value out of the recorder.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            counters: self.counters.collect(|c| c.0.load(Ordering::Relaxed)),
            gauges: self.gauges.collect(Gauge::get),
            histograms: self.histograms.collect(Histogram::summary),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counter_basic() {
        let recorder = MetricsRecorder::new();
        recorder.counter_inc("sessions_closed_total", &[("reason", "idle")], 1);
        recorder.counter_inc("sessions_closed_total", &[("reason", "idle")], 1);
        recorder.counter_inc("sessions_closed_total", &[("reason", "explicit")], 1);
        assert_eq!(recorder.counter_get("sessions_closed_total", &[("reason", "idle")]), 2);
        assert_eq!(recorder.counter_get("sessions_closed_total", &[("reason", "explicit")]), 1);
        assert_eq!(recorder.counter_get("sessions_closed_total", &[("reason", "shutdown")]), 0);
    }

    #[test]
    fn gauge_moves_both_ways() {
        let recorder = MetricsRecorder::new();
        recorder.gauge_inc("connections_active", &[], 10.0);
        assert_eq!(recorder.gauge_get("connections_active", &[]), 10.0);
        recorder.gauge_inc("connections_active", &[], 5.0);
        assert_eq!(recorder.gauge_get("connections_active", &[]), 15.0);
        recorder.gauge_inc("connections_active", &[], -3.0);
        assert_eq!(recorder.gauge_get("connections_active", &[]), 12.0);
    }

    #[test]
    fn gauge_inc_from_nothing_starts_at_zero() {
        let recorder = MetricsRecorder::new();
        recorder.gauge_inc("connections_active", &[], 1.0);
        recorder.gauge_inc("connections_active", &[], -1.0);
        assert_eq!(recorder.gauge_get("connections_active", &[]), 0.0);
    }

    #[test]
    fn histogram_summary_percentiles() {
        let recorder = MetricsRecorder::new();
        for i in 1..=100 {
            recorder.histogram_observe("query_duration_ms", &[], f64::from(i));
        }
        let summary = recorder.histogram_summary("query_duration_ms", &[]);
        assert_eq!(summary.count, 100);
        assert_eq!(summary.sum, 5050.0);
        assert_eq!(summary.p50, 51.0);
        assert_eq!(summary.p95, 96.0);
        assert_eq!(summary.p99, 100.0);
    }

    #[test]
    fn empty_histogram_summary_is_default() {
        let recorder = MetricsRecorder::new();
        assert_eq!(
            recorder.histogram_summary("nothing", &[]),
            HistogramSummary::default()
        );
    }

    #[test]
    fn histogram_window_is_bounded() {
        let recorder = MetricsRecorder::new();
        for _ in 0..(HISTOGRAM_WINDOW + 10) {
            recorder.histogram_observe("h", &[], 1.0);
        }
        assert_eq!(recorder.histogram_summary("h", &[]).count, HISTOGRAM_WINDOW as u64);
    }

    #[test]
    fn label_order_does_not_matter() {
        let recorder = MetricsRecorder::new();
        recorder.counter_inc("c", &[("a", "1"), ("b", "2")], 1);
        recorder.counter_inc("c", &[("b", "2"), ("a", "1")], 1);
        assert_eq!(recorder.counter_get("c", &[("a", "1"), ("b", "2")]), 2);
    }

    #[test]
    fn snapshot_renders_labels() {
        let recorder = MetricsRecorder::new();
        recorder.counter_inc("queries_total", &[], 3);
        recorder.counter_inc("sessions_closed_total", &[("reason", "idle")], 1);
        recorder.gauge_inc("connections_active", &[], 2.0);
        recorder.histogram_observe("query_duration_ms", &[], 12.0);

        let snap = recorder.snapshot();
        assert_eq!(snap.counters["queries_total"], 3);
        assert_eq!(snap.counters["sessions_closed_total{reason=idle}"], 1);
        assert_eq!(snap.gauges["connections_active"], 2.0);
        assert_eq!(snap.histograms["query_duration_ms"].count, 1);

        let json = serde_json::to_value(&snap).unwrap();
        assert_eq!(json["counters"]["queries_total"], 3);
    }

    #[test]
    fn concurrent_counter_increments() {
        let recorder = std::sync::Arc::new(MetricsRecorder::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let r = recorder.clone();
                std::thread::spawn(move || {
                    for _ in 0..1000 {
                        r.counter_inc("hits", &[], 1);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(recorder.counter_get("hits", &[]), 8000);
    }
}
