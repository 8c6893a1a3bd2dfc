//! In-process metrics collection
//!
//! Counters, gauges and histograms backed by atomics. A [`Metrics`] registry
//! hands out shared handles by name. Each proxy instance owns its registry,
//! so numbers never leak between instances or tests.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tracing::{info, trace};

/// A counter metric that can only increase
#[derive(Clone, Debug)]
pub struct Counter {
    name: Arc<str>,
    value: Arc<AtomicU64>,
}

impl Counter {
    /// Create a new counter
    pub fn new(name: impl Into<Arc<str>>) -> Self {
        Self {
            name: name.into(),
            value: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Increment the counter by 1
    pub fn increment(&self) {
        self.add(1);
    }

    /// Add a value to the counter
    pub fn add(&self, value: u64) {
        let old = self.value.fetch_add(value, Ordering::Relaxed);
        trace!(metric = "counter", name = %self.name, value, total = old + value);
    }

    /// Get the current value
    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// A gauge metric that can increase or decrease
#[derive(Clone, Debug)]
pub struct Gauge {
    name: Arc<str>,
    value: Arc<AtomicI64>,
}

impl Gauge {
    /// Create a new gauge
    pub fn new(name: impl Into<Arc<str>>) -> Self {
        Self {
            name: name.into(),
            value: Arc::new(AtomicI64::new(0)),
        }
    }

    /// Set the gauge value
    pub fn set(&self, value: i64) {
        self.value.store(value, Ordering::Relaxed);
        trace!(metric = "gauge", name = %self.name, value);
    }

    /// Increment the gauge by 1
    pub fn increment(&self) {
        let value = self.value.fetch_add(1, Ordering::Relaxed) + 1;
        trace!(metric = "gauge", name = %self.name, value);
    }

    /// Decrement the gauge by 1
    pub fn decrement(&self) {
        let value = self.value.fetch_sub(1, Ordering::Relaxed) - 1;
        trace!(metric = "gauge", name = %self.name, value);
    }

    /// Get the current value
    pub fn get(&self) -> i64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// Summary of the observations recorded by a histogram
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HistogramStats {
    pub count: u64,
    pub sum: f64,
    pub mean: f64,
    pub min: f64,
    pub max: f64,
}

#[derive(Debug, Default)]
struct HistogramState {
    count: u64,
    sum: f64,
    min: f64,
    max: f64,
}

/// A histogram metric for recording durations
///
/// Only running aggregates are kept, so memory stays constant no matter how
/// many observations a long-lived process records.
#[derive(Clone, Debug)]
pub struct Histogram {
    name: Arc<str>,
    state: Arc<RwLock<HistogramState>>,
}

impl Histogram {
    /// Create a new histogram
    pub fn new(name: impl Into<Arc<str>>) -> Self {
        Self {
            name: name.into(),
            state: Arc::new(RwLock::new(HistogramState::default())),
        }
    }

    /// Record an observation
    pub fn observe(&self, value: f64) {
        if let Ok(mut state) = self.state.write() {
            if state.count == 0 {
                state.min = value;
                state.max = value;
            } else {
                state.min = state.min.min(value);
                state.max = state.max.max(value);
            }
            state.count += 1;
            state.sum += value;
            trace!(metric = "histogram", name = %self.name, value);
        }
    }

    /// Record a duration in seconds
    pub fn observe_duration(&self, duration: Duration) {
        self.observe(duration.as_secs_f64());
    }

    /// Get statistics for the histogram, `None` until something was observed
    pub fn stats(&self) -> Option<HistogramStats> {
        let state = self.state.read().ok()?;
        if state.count == 0 {
            return None;
        }

        Some(HistogramStats {
            count: state.count,
            sum: state.sum,
            mean: state.sum / state.count as f64,
            min: state.min,
            max: state.max,
        })
    }
}

/// Registry of named metrics
#[derive(Debug, Default)]
pub struct Metrics {
    counters: RwLock<HashMap<String, Counter>>,
    gauges: RwLock<HashMap<String, Gauge>>,
    histograms: RwLock<HashMap<String, Histogram>>,
}

impl Metrics {
    /// Create a new, empty metrics registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Get or create a counter
    pub fn counter(&self, name: &str) -> Counter {
        get_or_insert(&self.counters, name, Counter::new)
    }

    /// Get or create a gauge
    pub fn gauge(&self, name: &str) -> Gauge {
        get_or_insert(&self.gauges, name, Gauge::new)
    }

    /// Get or create a histogram
    pub fn histogram(&self, name: &str) -> Histogram {
        get_or_insert(&self.histograms, name, Histogram::new)
    }

    /// Log every registered metric at info level
    pub fn log_all(&self) {
        for (name, value) in self.all_counters() {
            info!(metric_type = "counter", metric_name = %name, value, "Metric value");
        }

        for (name, value) in self.all_gauges() {
            info!(metric_type = "gauge", metric_name = %name, value, "Metric value");
        }

        for (name, stats) in self.all_histograms() {
            info!(
                metric_type = "histogram",
                metric_name = %name,
                count = stats.count,
                sum = stats.sum,
                mean = stats.mean,
                min = stats.min,
                max = stats.max,
                "Metric value"
            );
        }
    }

    /// Get all counters, sorted by name
    pub fn all_counters(&self) -> BTreeMap<String, u64> {
        self.counters
            .read()
            .map(|counters| counters.iter().map(|(k, v)| (k.clone(), v.get())).collect())
            .unwrap_or_default()
    }

    /// Get all gauges, sorted by name
    pub fn all_gauges(&self) -> BTreeMap<String, i64> {
        self.gauges
            .read()
            .map(|gauges| gauges.iter().map(|(k, v)| (k.clone(), v.get())).collect())
            .unwrap_or_default()
    }

    /// Get all histogram stats, sorted by name
    pub fn all_histograms(&self) -> BTreeMap<String, HistogramStats> {
        self.histograms
            .read()
            .map(|histograms| {
                histograms
                    .iter()
                    .filter_map(|(k, v)| v.stats().map(|stats| (k.clone(), stats)))
                    .collect()
            })
            .unwrap_or_default()
    }
}

fn get_or_insert<T: Clone>(
    map: &RwLock<HashMap<String, T>>,
    name: &str,
    create: impl FnOnce(String) -> T,
) -> T {
    if let Ok(entries) = map.read()
        && let Some(entry) = entries.get(name)
    {
        return entry.clone();
    }

    match map.write() {
        Ok(mut entries) => entries
            .entry(name.to_string())
            .or_insert_with(|| create(name.to_string()))
            .clone(),
        // A poisoned registry still hands out a working, unregistered handle
        Err(_) => create(name.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counter() {
        let counter = Counter::new("test_counter");
        assert_eq!(counter.get(), 0);

        counter.increment();
        assert_eq!(counter.get(), 1);

        counter.add(5);
        assert_eq!(counter.get(), 6);
    }

    #[test]
    fn test_gauge() {
        let gauge = Gauge::new("test_gauge");
        gauge.set(10);
        gauge.increment();
        assert_eq!(gauge.get(), 11);

        gauge.decrement();
        gauge.decrement();
        assert_eq!(gauge.get(), 9);
    }

    #[test]
    fn test_histogram() {
        let histogram = Histogram::new("test_histogram");
        assert!(histogram.stats().is_none());

        for value in [2.0, 1.0, 5.0, 4.0, 3.0] {
            histogram.observe(value);
        }

        let stats = histogram.stats().unwrap();
        assert_eq!(stats.count, 5);
        assert_eq!(stats.sum, 15.0);
        assert_eq!(stats.mean, 3.0);
        assert_eq!(stats.min, 1.0);
        assert_eq!(stats.max, 5.0);
    }

    #[test]
    fn test_registry_returns_shared_handles() {
        let metrics = Metrics::new();
        metrics.counter("sessions_total").increment();
        metrics.counter("sessions_total").increment();
        metrics.gauge("sessions_active").set(3);

        assert_eq!(metrics.all_counters().get("sessions_total"), Some(&2));
        assert_eq!(metrics.all_gauges().get("sessions_active"), Some(&3));
        assert!(metrics.all_histograms().is_empty());
    }

    #[test]
    fn test_separate_registries_are_isolated() {
        let a = Metrics::new();
        let b = Metrics::new();
        a.counter("bytes").add(10);
        assert_eq!(b.counter("bytes").get(), 0);
    }
}
