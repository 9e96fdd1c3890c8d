use chrono::{DateTime, Utc};
use hdrhistogram::Histogram;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};

use crate::error::RecorderFault;

pub mod report;
pub mod threshold;

pub use report::RunReport;
pub use threshold::{evaluate, Evaluation, Threshold, ThresholdResult, ThresholdStatus};

/// Histogram values are stored in thousandths of the sample unit so that
/// millisecond trends keep microsecond resolution.
pub const HISTOGRAM_SCALE: f64 = 1000.0;

/// One hour expressed in the histogram's unit when samples are milliseconds.
const HISTOGRAM_MAX: u64 = 60 * 60 * 1000 * 1000;

/// Distinct error messages kept per shard, and again after the shards are
/// merged, before the rest fold into `OTHER_ERRORS`.
const MAX_ERROR_KINDS: usize = 100;
const OTHER_ERRORS: &str = "(other errors)";

/// Well-known metric names emitted by the engine and the scenario bridge.
pub mod names {
    pub const HTTP_REQS: &str = "http_reqs";
    pub const HTTP_REQ_DURATION: &str = "http_req_duration";
    pub const HTTP_REQ_FAILED: &str = "http_req_failed";
    pub const DATA_RECEIVED: &str = "data_received";
    pub const DATA_SENT: &str = "data_sent";
    pub const CHECKS: &str = "checks";
    pub const ITERATIONS: &str = "iterations";
    pub const ITERATION_DURATION: &str = "iteration_duration";
    pub const ITERATION_FAILED: &str = "iteration_failed";
    pub const VUS: &str = "vus";
}

pub type Tags = BTreeMap<String, String>;

fn new_histogram() -> Histogram<u64> {
    Histogram::<u64>::new_with_bounds(1, HISTOGRAM_MAX, 2).expect("histogram bounds are static and valid")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MetricKind {
    /// Values are summed.
    Counter,
    /// Only the latest value matters.
    Gauge,
    /// Fraction of non-zero samples.
    Rate,
    /// Distribution of values (latencies and the like).
    Trend,
}

/// A single immutable observation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Sample {
    pub timestamp: DateTime<Utc>,
    pub metric: String,
    pub kind: MetricKind,
    pub value: f64,
    pub tags: Tags,
}

impl Sample {
    pub fn new(kind: MetricKind, metric: impl Into<String>, value: f64) -> Self {
        Self {
            timestamp: Utc::now(),
            metric: metric.into(),
            kind,
            value,
            tags: Tags::new(),
        }
    }

    pub fn counter(metric: impl Into<String>, value: f64) -> Self {
        Self::new(MetricKind::Counter, metric, value)
    }

    pub fn gauge(metric: impl Into<String>, value: f64) -> Self {
        Self::new(MetricKind::Gauge, metric, value)
    }

    pub fn trend(metric: impl Into<String>, value: f64) -> Self {
        Self::new(MetricKind::Trend, metric, value)
    }

    pub fn rate(metric: impl Into<String>, hit: bool) -> Self {
        Self::new(MetricKind::Rate, metric, if hit { 1.0 } else { 0.0 })
    }

    /// One check outcome, kept both in `checks` and in `checks{check:<name>}`.
    pub fn check(name: &str, ok: bool) -> Self {
        Self::rate(names::CHECKS, ok).with_tag("check", name)
    }

    pub fn with_tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }

    pub fn with_tags(mut self, tags: &Tags) -> Self {
        for (k, v) in tags {
            self.tags.entry(k.clone()).or_insert_with(|| v.clone());
        }
        self
    }

    /// Name of the tagged sub-metric, e.g. `checks{check:status is 200}`.
    fn tagged_name(&self) -> Option<String> {
        if self.tags.is_empty() {
            return None;
        }
        let mut full_name = self.metric.clone();
        full_name.push('{');
        for (i, (k, v)) in self.tags.iter().enumerate() {
            if i > 0 {
                full_name.push(',');
            }
            full_name.push_str(k);
            full_name.push(':');
            full_name.push_str(v);
        }
        full_name.push('}');
        Some(full_name)
    }
}

/// Running statistics for one metric.
#[derive(Debug, Clone)]
pub struct Aggregate {
    kind: MetricKind,
    count: u64,
    passes: u64,
    sum: f64,
    min: f64,
    max: f64,
    latest: Option<(DateTime<Utc>, f64)>,
    histogram: Histogram<u64>,
}

impl Aggregate {
    pub fn new(kind: MetricKind) -> Self {
        Self {
            kind,
            count: 0,
            passes: 0,
            sum: 0.0,
            min: f64::INFINITY,
            max: f64::NEG_INFINITY,
            latest: None,
            histogram: new_histogram(),
        }
    }

    fn add(&mut self, sample: &Sample) {
        let value = sample.value;
        self.count += 1;
        if value != 0.0 {
            self.passes += 1;
        }
        self.sum += value;
        self.min = self.min.min(value);
        self.max = self.max.max(value);
        if self
            .latest
            .is_none_or(|(at, v)| sample.timestamp > at || (sample.timestamp == at && value > v))
        {
            self.latest = Some((sample.timestamp, value));
        }
        let scaled = (value.max(0.0) * HISTOGRAM_SCALE).round() as u64;
        self.histogram.saturating_record(scaled);
    }

    /// Fold `other` into `self`. The result does not depend on merge order.
    pub fn merge(&mut self, other: &Aggregate) -> Result<(), RecorderFault> {
        if self.kind != other.kind {
            return Err(RecorderFault(format!(
                "cannot merge {:?} aggregate into {:?} aggregate",
                other.kind, self.kind
            )));
        }
        self.count += other.count;
        self.passes += other.passes;
        self.sum += other.sum;
        self.min = self.min.min(other.min);
        self.max = self.max.max(other.max);
        self.latest = match (self.latest, other.latest) {
            (Some(a), Some(b)) => {
                if b.0 > a.0 || (b.0 == a.0 && b.1 > a.1) {
                    Some(b)
                } else {
                    Some(a)
                }
            }
            (a, b) => a.or(b),
        };
        self.histogram
            .add(&other.histogram)
            .map_err(|e| RecorderFault(format!("histogram merge failed: {:?}", e)))
    }

    pub fn kind(&self) -> MetricKind {
        self.kind
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    /// Samples with a non-zero value.
    pub fn passes(&self) -> u64 {
        self.passes
    }

    pub fn failures(&self) -> u64 {
        self.count - self.passes
    }

    pub fn sum(&self) -> f64 {
        self.sum
    }

    pub fn min(&self) -> Option<f64> {
        (self.count > 0).then_some(self.min)
    }

    pub fn max(&self) -> Option<f64> {
        (self.count > 0).then_some(self.max)
    }

    pub fn mean(&self) -> Option<f64> {
        (self.count > 0).then(|| self.sum / self.count as f64)
    }

    pub fn rate(&self) -> Option<f64> {
        (self.count > 0).then(|| self.passes as f64 / self.count as f64)
    }

    /// Latest observed value (by sample timestamp).
    pub fn value(&self) -> Option<f64> {
        self.latest.map(|(_, v)| v)
    }

    /// Approximate quantile, `q` in `0.0..=1.0`.
    pub fn percentile(&self, q: f64) -> Option<f64> {
        if self.count == 0 {
            return None;
        }
        Some(self.histogram.value_at_quantile(q.clamp(0.0, 1.0)) as f64 / HISTOGRAM_SCALE)
    }

    pub fn to_report(&self) -> AggregateReport {
        AggregateReport {
            kind: self.kind,
            count: self.count,
            passes: self.passes,
            failures: self.failures(),
            sum: self.sum,
            min: self.min().unwrap_or(0.0),
            max: self.max().unwrap_or(0.0),
            avg: self.mean().unwrap_or(0.0),
            med: self.percentile(0.5).unwrap_or(0.0),
            p90: self.percentile(0.9).unwrap_or(0.0),
            p95: self.percentile(0.95).unwrap_or(0.0),
            p99: self.percentile(0.99).unwrap_or(0.0),
            rate: self.rate().unwrap_or(0.0),
            value: self.value().unwrap_or(0.0),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggregateReport {
    pub kind: MetricKind,
    pub count: u64,
    pub passes: u64,
    pub failures: u64,
    pub sum: f64,
    pub min: f64,
    pub max: f64,
    pub avg: f64,
    pub med: f64,
    pub p90: f64,
    pub p95: f64,
    pub p99: f64,
    pub rate: f64,
    pub value: f64,
}

#[derive(Default)]
struct StatsShard {
    metrics: HashMap<String, Aggregate>,
    errors: HashMap<String, u64>,
}

impl StatsShard {
    fn add(&mut self, key: &str, sample: &Sample) -> Result<(), RecorderFault> {
        let agg = match self.metrics.get_mut(key) {
            Some(agg) => agg,
            None => self
                .metrics
                .entry(key.to_string())
                .or_insert_with(|| Aggregate::new(sample.kind)),
        };
        if agg.kind != sample.kind {
            return Err(RecorderFault(format!(
                "metric '{}' recorded as {:?} but already holds {:?} samples",
                key, sample.kind, agg.kind
            )));
        }
        agg.add(sample);
        Ok(())
    }

    fn add_error(&mut self, message: &str) {
        if let Some(count) = self.errors.get_mut(message) {
            *count += 1;
        } else if self.errors.len() < MAX_ERROR_KINDS {
            self.errors.insert(message.to_string(), 1);
        } else {
            *self.errors.entry(OTHER_ERRORS.to_string()).or_insert(0) += 1;
        }
    }
}

/// Sharded, thread-safe sample sink.
///
/// Each `record` takes exactly one shard write lock for constant work, so
/// concurrent workers contend only when they hash to the same shard.
pub struct MetricsRecorder {
    shards: Vec<RwLock<StatsShard>>,
    next_shard: AtomicUsize,
    track_tagged: bool,
    fault: OnceLock<RecorderFault>,
}

pub type SharedRecorder = Arc<MetricsRecorder>;

impl MetricsRecorder {
    pub fn new(num_shards: usize) -> Self {
        let shards = (0..num_shards.max(1))
            .map(|_| RwLock::new(StatsShard::default()))
            .collect();
        Self {
            shards,
            next_shard: AtomicUsize::new(0),
            track_tagged: true,
            fault: OnceLock::new(),
        }
    }

    /// Target ~100 workers per shard, between 16 and 256 shards.
    pub fn for_workers(max_workers: usize) -> Self {
        Self::new((max_workers / 100).clamp(16, 256))
    }

    /// Disable `metric{tag:value}` sub-aggregates to save memory on
    /// high-cardinality tags.
    pub fn with_tagged_submetrics(mut self, enabled: bool) -> Self {
        self.track_tagged = enabled;
        self
    }

    pub fn num_shards(&self) -> usize {
        self.shards.len()
    }

    pub fn record(&self, sample: Sample) {
        let idx = self.next_shard.fetch_add(1, Ordering::Relaxed);
        self.record_in(idx, sample);
    }

    /// Record on the shard owned by `worker_id`.
    pub fn record_from(&self, worker_id: usize, sample: Sample) {
        self.record_in(worker_id, sample);
    }

    fn record_in(&self, idx: usize, sample: Sample) {
        let tagged = if self.track_tagged { sample.tagged_name() } else { None };
        let result = {
            let mut shard = self.shards[idx % self.shards.len()].write();
            shard
                .add(&sample.metric, &sample)
                .and_then(|_| match &tagged {
                    Some(name) => shard.add(name, &sample),
                    None => Ok(()),
                })
        };
        if let Err(fault) = result {
            self.latch(fault);
        }
    }

    pub fn record_error(&self, worker_id: usize, message: &str) {
        self.shards[worker_id % self.shards.len()]
            .write()
            .add_error(message);
    }

    fn latch(&self, fault: RecorderFault) {
        if self.fault.set(fault.clone()).is_ok() {
            tracing::error!(%fault, "metrics recorder entered a faulted state");
        }
    }

    /// First invariant violation seen, if any.
    pub fn fault(&self) -> Option<RecorderFault> {
        self.fault.get().cloned()
    }

    /// Merge every shard into a point-in-time view.
    pub fn snapshot(&self) -> MetricsSnapshot {
        let mut merged = MetricsSnapshot::default();
        for shard in &self.shards {
            let shard = shard.read();
            for (name, agg) in &shard.metrics {
                match merged.metrics.get_mut(name) {
                    Some(existing) => {
                        if let Err(fault) = existing.merge(agg) {
                            self.latch(RecorderFault(format!("metric '{}': {}", name, fault.0)));
                        }
                    }
                    None => {
                        merged.metrics.insert(name.clone(), agg.clone());
                    }
                }
            }
            for (err, count) in &shard.errors {
                *merged.errors.entry(err.clone()).or_insert(0) += count;
            }
        }
        cap_error_kinds(&mut merged.errors);
        merged
    }
}

/// Keep the `MAX_ERROR_KINDS` most frequent messages (ties by name) and fold
/// the remainder into `OTHER_ERRORS`.
fn cap_error_kinds(errors: &mut BTreeMap<String, u64>) {
    let distinct = errors.len() - usize::from(errors.contains_key(OTHER_ERRORS));
    if distinct <= MAX_ERROR_KINDS {
        return;
    }
    let mut ranked: Vec<(String, u64)> = errors
        .iter()
        .filter(|(message, _)| message.as_str() != OTHER_ERRORS)
        .map(|(message, count)| (message.clone(), *count))
        .collect();
    ranked.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    let folded: u64 = ranked[MAX_ERROR_KINDS..].iter().map(|(_, count)| count).sum();
    for (message, _) in &ranked[MAX_ERROR_KINDS..] {
        errors.remove(message);
    }
    *errors.entry(OTHER_ERRORS.to_string()).or_insert(0) += folded;
}

impl Default for MetricsRecorder {
    fn default() -> Self {
        Self::new(16)
    }
}

/// Merged view of all aggregates at one instant.
#[derive(Debug, Clone, Default)]
pub struct MetricsSnapshot {
    metrics: BTreeMap<String, Aggregate>,
    errors: BTreeMap<String, u64>,
}

impl MetricsSnapshot {
    pub fn get(&self, metric: &str) -> Option<&Aggregate> {
        self.metrics.get(metric)
    }

    pub fn metrics(&self) -> &BTreeMap<String, Aggregate> {
        &self.metrics
    }

    pub fn errors(&self) -> &BTreeMap<String, u64> {
        &self.errors
    }

    pub fn is_empty(&self) -> bool {
        self.metrics.is_empty()
    }

    pub fn to_reports(&self) -> BTreeMap<String, AggregateReport> {
        self.metrics
            .iter()
            .map(|(name, agg)| (name.clone(), agg.to_report()))
            .collect()
    }
}
