//! Run-wide metric series
//!
//! Every VU appends into a shared [`MetricsRegistry`]. Series are created on
//! first use and guarded individually, so VUs writing different series never
//! contend. Each observation is also forwarded to the `metrics` facade for an
//! optional Prometheus exporter.

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

/// Kind of accumulator behind a metric name
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MetricKind {
    /// Numeric samples, e.g. durations in milliseconds
    Trend,
    /// Boolean samples; the aggregate is the proportion of `true`
    Rate,
    /// Monotonic sum
    Counter,
    /// Last value plus the maximum seen
    Gauge,
}

#[derive(Debug)]
enum Series {
    Trend(Vec<f64>),
    Rate { trues: u64, total: u64 },
    Counter(f64),
    Gauge { last: f64, max: f64, samples: u64 },
}

impl Series {
    fn empty(kind: MetricKind) -> Self {
        match kind {
            MetricKind::Trend => Series::Trend(Vec::new()),
            MetricKind::Rate => Series::Rate { trues: 0, total: 0 },
            MetricKind::Counter => Series::Counter(0.0),
            MetricKind::Gauge => Series::Gauge {
                last: 0.0,
                max: 0.0,
                samples: 0,
            },
        }
    }

    fn kind(&self) -> MetricKind {
        match self {
            Series::Trend(_) => MetricKind::Trend,
            Series::Rate { .. } => MetricKind::Rate,
            Series::Counter(_) => MetricKind::Counter,
            Series::Gauge { .. } => MetricKind::Gauge,
        }
    }
}

/// Concurrent-safe store of named series
#[derive(Debug, Default, Clone)]
pub struct MetricsRegistry {
    series: Arc<DashMap<String, Arc<Mutex<Series>>>>,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `name` up front so it shows in the summary even with no data
    pub fn declare(&self, name: &str, kind: MetricKind) {
        self.series_for(name, kind);
    }

    /// Append a trend sample (milliseconds for durations)
    pub fn add_trend(&self, name: &str, value: f64) {
        let series = self.series_for(name, MetricKind::Trend);
        if let Ok(mut guard) = series.lock() {
            if let Series::Trend(samples) = &mut *guard {
                samples.push(value);
            }
        }
        ::metrics::histogram!(name.to_string(), value);
    }

    /// Append a boolean sample
    pub fn add_rate(&self, name: &str, value: bool) {
        let series = self.series_for(name, MetricKind::Rate);
        if let Ok(mut guard) = series.lock() {
            if let Series::Rate { trues, total } = &mut *guard {
                *total += 1;
                if value {
                    *trues += 1;
                }
            }
        }
        ::metrics::counter!(name.to_string(), 1, "value" => if value { "true" } else { "false" });
    }

    /// Add to a counter
    pub fn add_counter(&self, name: &str, value: f64) {
        let series = self.series_for(name, MetricKind::Counter);
        if let Ok(mut guard) = series.lock() {
            if let Series::Counter(sum) = &mut *guard {
                *sum += value;
            }
        }
        ::metrics::counter!(name.to_string(), value.max(0.0) as u64);
    }

    /// Set a gauge, keeping track of its maximum
    pub fn set_gauge(&self, name: &str, value: f64) {
        let series = self.series_for(name, MetricKind::Gauge);
        if let Ok(mut guard) = series.lock() {
            if let Series::Gauge { last, max, samples } = &mut *guard {
                *last = value;
                *max = if *samples == 0 { value } else { max.max(value) };
                *samples += 1;
            }
        }
        ::metrics::gauge!(name.to_string(), value);
    }

    pub fn kind_of(&self, name: &str) -> Option<MetricKind> {
        let series = self.series.get(name)?;
        let guard = series.lock().ok()?;
        Some(guard.kind())
    }

    /// Aggregate every series; called once the run has stopped
    pub fn aggregate(&self) -> BTreeMap<String, Aggregate> {
        self.series
            .iter()
            .filter_map(|entry| {
                let guard = entry.value().lock().ok()?;
                Some((entry.key().clone(), Aggregate::from_series(&guard)))
            })
            .collect()
    }

    fn series_for(&self, name: &str, kind: MetricKind) -> Arc<Mutex<Series>> {
        if let Some(existing) = self.series.get(name) {
            return Arc::clone(&existing);
        }
        let entry = self
            .series
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(Series::empty(kind))));
        Arc::clone(&entry)
    }
}

/// Aggregated view of one series
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Aggregate {
    Trend(TrendStats),
    Rate(RateStats),
    Counter(CounterStats),
    Gauge(GaugeStats),
}

impl Aggregate {
    fn from_series(series: &Series) -> Self {
        match series {
            Series::Trend(samples) => Aggregate::Trend(TrendStats::from_samples(samples)),
            Series::Rate { trues, total } => Aggregate::Rate(RateStats {
                hits: *trues,
                misses: total - trues,
                rate: if *total == 0 {
                    0.0
                } else {
                    *trues as f64 / *total as f64
                },
            }),
            Series::Counter(sum) => Aggregate::Counter(CounterStats { count: *sum }),
            Series::Gauge { last, max, samples } => Aggregate::Gauge(GaugeStats {
                value: *last,
                max: *max,
                samples: *samples,
            }),
        }
    }

    pub fn kind(&self) -> MetricKind {
        match self {
            Aggregate::Trend(_) => MetricKind::Trend,
            Aggregate::Rate(_) => MetricKind::Rate,
            Aggregate::Counter(_) => MetricKind::Counter,
            Aggregate::Gauge(_) => MetricKind::Gauge,
        }
    }

    /// Number of observations behind this aggregate
    pub fn observations(&self) -> u64 {
        match self {
            Aggregate::Trend(t) => t.count,
            Aggregate::Rate(r) => r.hits + r.misses,
            Aggregate::Counter(c) => {
                if c.count > 0.0 {
                    1
                } else {
                    0
                }
            }
            Aggregate::Gauge(g) => g.samples,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrendStats {
    pub count: u64,
    pub sum: f64,
    pub min: f64,
    pub max: f64,
    pub avg: f64,
    pub med: f64,
    pub p90: f64,
    pub p95: f64,
    pub p99: f64,
    #[serde(skip)]
    sorted: Vec<f64>,
}

impl TrendStats {
    pub fn from_samples(samples: &[f64]) -> Self {
        let mut sorted: Vec<f64> = samples.iter().copied().filter(|v| v.is_finite()).collect();
        sorted.sort_by(|a, b| a.total_cmp(b));

        let count = sorted.len() as u64;
        let sum: f64 = sorted.iter().sum();
        let avg = if sorted.is_empty() { 0.0 } else { sum / count as f64 };

        Self {
            count,
            sum,
            min: sorted.first().copied().unwrap_or(0.0),
            max: sorted.last().copied().unwrap_or(0.0),
            avg,
            med: percentile(&sorted, 50.0),
            p90: percentile(&sorted, 90.0),
            p95: percentile(&sorted, 95.0),
            p99: percentile(&sorted, 99.0),
            sorted,
        }
    }

    /// Arbitrary percentile over the retained samples
    pub fn percentile(&self, p: f64) -> f64 {
        percentile(&self.sorted, p)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateStats {
    /// Samples recorded as `true`
    pub hits: u64,
    /// Samples recorded as `false`
    pub misses: u64,
    /// `hits / (hits + misses)`
    pub rate: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CounterStats {
    pub count: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GaugeStats {
    pub value: f64,
    pub max: f64,
    pub samples: u64,
}

/// Per-attempt-chain failure flag shared by every profile
pub const HTTP_REQ_FAILED: &str = "http_req_failed";
/// Completed VU iterations
pub const ITERATIONS: &str = "iterations";
/// Active VUs; the aggregate max is the peak concurrency
pub const VUS_MAX: &str = "vus_max";

/// Metric names recorded for one profile
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProfileMetrics {
    prefix: String,
    pub req_duration: String,
    pub error_rate: String,
    pub retries: String,
    /// Serialized request body size per operation call
    pub req_bytes: String,
    /// Response body size per operation call that got a response
    pub res_bytes: String,
}

impl ProfileMetrics {
    pub fn new(profile_name: &str) -> Self {
        Self {
            prefix: profile_name.to_string(),
            req_duration: format!("{}_req_duration", profile_name),
            error_rate: format!("{}_error_rate", profile_name),
            retries: format!("{}_req_retries", profile_name),
            req_bytes: format!("{}_req_bytes", profile_name),
            res_bytes: format!("{}_res_bytes", profile_name),
        }
    }

    pub fn operation_duration(&self, operation: &str) -> String {
        format!("{}_{}_duration", self.prefix, operation)
    }

    /// Declare every series up front so empty ones still reach the summary
    pub fn declare<'a>(&self, registry: &MetricsRegistry, operations: impl IntoIterator<Item = &'a str>) {
        registry.declare(&self.req_duration, MetricKind::Trend);
        registry.declare(&self.error_rate, MetricKind::Rate);
        registry.declare(&self.retries, MetricKind::Counter);
        registry.declare(&self.req_bytes, MetricKind::Trend);
        registry.declare(&self.res_bytes, MetricKind::Trend);
        registry.declare(HTTP_REQ_FAILED, MetricKind::Rate);
        registry.declare(ITERATIONS, MetricKind::Counter);
        registry.declare(VUS_MAX, MetricKind::Gauge);
        for op in operations {
            registry.declare(&self.operation_duration(op), MetricKind::Trend);
        }
    }
}

/// Percentile `p` (0..=100) of ascending `sorted` samples
///
/// Linear interpolation between closest ranks: with `rank = p/100 × (n − 1)`,
/// the result is `s[⌊rank⌋] + frac(rank) × (s[⌈rank⌉] − s[⌊rank⌋])`.
/// Returns 0 for an empty slice.
pub fn percentile(sorted: &[f64], p: f64) -> f64 {
    match sorted.len() {
        0 => 0.0,
        1 => sorted[0],
        n => {
            let rank = (p.clamp(0.0, 100.0) / 100.0) * (n - 1) as f64;
            let lower = rank.floor() as usize;
            let upper = rank.ceil() as usize;
            let frac = rank - lower as f64;
            sorted[lower] + frac * (sorted[upper] - sorted[lower])
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn approx(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    #[test]
    fn test_percentile_interpolates() {
        let mut samples: Vec<f64> = vec![100.0, 150.0, 120.0, 130.0, 3000.0];
        samples.sort_by(|a, b| a.total_cmp(b));
        assert!(approx(percentile(&samples, 95.0), 2430.0));
        assert!(approx(percentile(&samples, 50.0), 130.0));
        assert!(approx(percentile(&samples, 0.0), 100.0));
        assert!(approx(percentile(&samples, 100.0), 3000.0));
    }

    #[test]
    fn test_percentile_edge_sizes() {
        assert_eq!(percentile(&[], 95.0), 0.0);
        assert_eq!(percentile(&[42.0], 95.0), 42.0);
    }

    #[test]
    fn test_trend_stats() {
        let stats = TrendStats::from_samples(&[100.0, 150.0, 120.0, 130.0, 3000.0]);
        assert_eq!(stats.count, 5);
        assert_eq!(stats.min, 100.0);
        assert_eq!(stats.max, 3000.0);
        assert!(approx(stats.sum, 3500.0));
        assert!(approx(stats.avg, 700.0));
        assert!(approx(stats.med, 130.0));
        assert!(approx(stats.p95, 2430.0));
    }

    #[test]
    fn test_error_rate_is_failure_proportion() {
        let registry = MetricsRegistry::new();
        for i in 0..20 {
            registry.add_rate("kroger_error_rate", i % 4 == 0);
        }
        match registry.aggregate().get("kroger_error_rate") {
            Some(Aggregate::Rate(r)) => {
                assert_eq!(r.hits, 5);
                assert_eq!(r.misses, 15);
                assert!(approx(r.rate, 5.0 / 20.0));
            }
            other => panic!("unexpected aggregate {:?}", other),
        }
    }

    #[test]
    fn test_declared_series_without_data() {
        let registry = MetricsRegistry::new();
        registry.declare("heb_req_duration", MetricKind::Trend);
        let aggregates = registry.aggregate();
        let agg = aggregates.get("heb_req_duration").unwrap();
        assert_eq!(agg.kind(), MetricKind::Trend);
        assert_eq!(agg.observations(), 0);
    }

    #[test]
    fn test_counter_accumulates() {
        let registry = MetricsRegistry::new();
        registry.add_counter("iterations", 1.0);
        registry.add_counter("iterations", 2.0);
        assert_eq!(registry.kind_of("iterations"), Some(MetricKind::Counter));
        assert_eq!(
            registry.aggregate().get("iterations"),
            Some(&Aggregate::Counter(CounterStats { count: 3.0 }))
        );
    }

    #[test]
    fn test_gauge_tracks_max() {
        let registry = MetricsRegistry::new();
        for v in [3.0, 7.0, 2.0] {
            registry.set_gauge(VUS_MAX, v);
        }
        assert_eq!(
            registry.aggregate().get(VUS_MAX),
            Some(&Aggregate::Gauge(GaugeStats {
                value: 2.0,
                max: 7.0,
                samples: 3
            }))
        );
    }

    #[test]
    fn test_profile_metric_names() {
        let names = ProfileMetrics::new("Kroger");
        assert_eq!(names.req_duration, "Kroger_req_duration");
        assert_eq!(names.error_rate, "Kroger_error_rate");
        assert_eq!(names.operation_duration("markdown"), "Kroger_markdown_duration");
        assert_eq!(names.req_bytes, "Kroger_req_bytes");
        assert_eq!(names.res_bytes, "Kroger_res_bytes");

        let registry = MetricsRegistry::new();
        names.declare(&registry, ["markdown", "prompted"]);
        assert_eq!(registry.kind_of("Kroger_prompted_duration"), Some(MetricKind::Trend));
        assert_eq!(registry.kind_of(HTTP_REQ_FAILED), Some(MetricKind::Rate));
        assert_eq!(registry.kind_of("Kroger_res_bytes"), Some(MetricKind::Trend));
    }

    #[test]
    fn test_concurrent_appends() {
        let registry = MetricsRegistry::new();
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let registry = registry.clone();
                std::thread::spawn(move || {
                    for i in 0..1000 {
                        registry.add_trend("iceland_req_duration", i as f64);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        match registry.aggregate().get("iceland_req_duration") {
            Some(Aggregate::Trend(t)) => assert_eq!(t.count, 8000),
            other => panic!("unexpected aggregate {:?}", other),
        }
    }
}
