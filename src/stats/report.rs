use serde::Serialize;
use std::collections::BTreeMap;
use std::time::Duration;

use super::threshold::{Evaluation, ThresholdResult, ThresholdStatus};
use super::{names, AggregateReport, MetricsSnapshot};

/// Exit status when at least one threshold failed.
pub const EXIT_THRESHOLD_FAILED: i32 = 99;
/// Exit status when strict mode rejects an inconclusive threshold.
pub const EXIT_INCONCLUSIVE: i32 = 98;

/// Final outcome of a run, suitable for JSON export.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    /// No threshold failed.
    pub passed: bool,
    /// Every threshold had samples to judge.
    pub conclusive: bool,
    /// The run was stopped before the stage timeline finished.
    pub cancelled: bool,
    /// An `abort_on_fail` threshold stopped the run.
    pub aborted_by_threshold: bool,
    pub elapsed_ms: u128,
    pub workers_spawned: usize,
    pub peak_workers: usize,
    /// Workers still running when the graceful stop window closed.
    pub workers_interrupted: usize,
    pub metrics: BTreeMap<String, AggregateReport>,
    pub errors: BTreeMap<String, u64>,
    pub thresholds: Vec<ThresholdResult>,
}

/// Run bookkeeping that does not come from the metrics snapshot.
#[derive(Debug, Clone, Copy, Default)]
pub struct RunFacts {
    pub elapsed: Duration,
    pub cancelled: bool,
    pub aborted_by_threshold: bool,
    pub workers_spawned: usize,
    pub peak_workers: usize,
    pub workers_interrupted: usize,
}

impl RunReport {
    pub fn new(snapshot: &MetricsSnapshot, evaluation: Evaluation, facts: RunFacts) -> Self {
        Self {
            passed: evaluation.passed(),
            conclusive: evaluation.is_conclusive(),
            cancelled: facts.cancelled,
            aborted_by_threshold: facts.aborted_by_threshold,
            elapsed_ms: facts.elapsed.as_millis(),
            workers_spawned: facts.workers_spawned,
            peak_workers: facts.peak_workers,
            workers_interrupted: facts.workers_interrupted,
            metrics: snapshot.to_reports(),
            errors: snapshot.errors().clone(),
            thresholds: evaluation.results,
        }
    }

    /// Process exit status. Inconclusive thresholds only fail in strict mode.
    pub fn exit_code(&self, strict: bool) -> i32 {
        if !self.passed {
            EXIT_THRESHOLD_FAILED
        } else if strict && !self.conclusive {
            EXIT_INCONCLUSIVE
        } else {
            0
        }
    }

    pub fn metric(&self, name: &str) -> Option<&AggregateReport> {
        self.metrics.get(name)
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string_pretty(self).unwrap_or_default()
    }

    pub fn print_summary(&self) {
        println!("\n--- Run Summary ---");
        println!("Elapsed:        {:?}", Duration::from_millis(self.elapsed_ms as u64));
        println!("Workers:        {} spawned, {} peak", self.workers_spawned, self.peak_workers);
        if self.cancelled {
            println!("Status:         cancelled (partial data)");
        }
        if self.aborted_by_threshold {
            println!("Status:         aborted by threshold");
        }
        if self.workers_interrupted > 0 {
            println!("Interrupted:    {} worker(s) past graceful stop", self.workers_interrupted);
        }

        if self.metrics.is_empty() {
            println!("No metrics collected.");
        }

        if let Some(d) = self.metric(names::HTTP_REQ_DURATION) {
            println!("\nHTTP Requests:  {}", d.count);
            println!("  Avg:  {:.2} ms", d.avg);
            println!("  Min:  {:.2} ms", d.min);
            println!("  Med:  {:.2} ms", d.med);
            println!("  P90:  {:.2} ms", d.p90);
            println!("  P95:  {:.2} ms", d.p95);
            println!("  P99:  {:.2} ms", d.p99);
            println!("  Max:  {:.2} ms", d.max);
        }
        if let Some(f) = self.metric(names::HTTP_REQ_FAILED) {
            println!("  Failed: {:.2}% ({}/{})", f.rate * 100.0, f.passes, f.count);
        }

        let checks: Vec<_> = self
            .metrics
            .iter()
            .filter(|(name, _)| name.starts_with("checks{check:"))
            .collect();
        if !checks.is_empty() {
            println!("\nChecks:");
            for (name, agg) in checks {
                let label = name
                    .trim_start_matches("checks{check:")
                    .trim_end_matches('}');
                if agg.failures > 0 {
                    println!(
                        "  ✗ {} : {:.2}% ({} passed, {} failed)",
                        label,
                        agg.rate * 100.0,
                        agg.passes,
                        agg.failures
                    );
                } else {
                    println!("  ✓ {} : 100% ({} passed)", label, agg.passes);
                }
            }
        }

        println!("\nMetrics:");
        for (name, agg) in self.metrics.iter().filter(|(name, _)| !name.contains('{')) {
            match agg.kind {
                super::MetricKind::Counter => println!("  {:<22} {:.2}", name, agg.sum),
                super::MetricKind::Gauge => println!("  {:<22} {:.2}", name, agg.value),
                super::MetricKind::Rate => println!(
                    "  {:<22} {:.2}% ({}/{})",
                    name,
                    agg.rate * 100.0,
                    agg.passes,
                    agg.count
                ),
                super::MetricKind::Trend => println!(
                    "  {:<22} avg={:.2} p95={:.2} max={:.2} count={}",
                    name, agg.avg, agg.p95, agg.max, agg.count
                ),
            }
        }

        if !self.errors.is_empty() {
            println!("\nErrors:");
            for (err, count) in &self.errors {
                println!("  {}: {}", err, count);
            }
        }

        if !self.thresholds.is_empty() {
            println!("\nThresholds:");
            for result in &self.thresholds {
                let mark = match result.status {
                    ThresholdStatus::Passed => "✓",
                    ThresholdStatus::Failed => "✗",
                    ThresholdStatus::Inconclusive => "?",
                };
                println!("  {} {}", mark, result);
            }
        }
        println!("-------------------\n");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stats::threshold::{evaluate, Threshold};
    use crate::stats::{MetricsRecorder, Sample};

    fn report_for(thresholds: &[Threshold]) -> RunReport {
        let recorder = MetricsRecorder::new(2);
        recorder.record(Sample::trend(names::HTTP_REQ_DURATION, 100.0));
        recorder.record(Sample::rate(names::CHECKS, true).with_tag("check", "status is 200"));
        let snapshot = recorder.snapshot();
        let eval = evaluate(thresholds, &snapshot);
        RunReport::new(&snapshot, eval, RunFacts::default())
    }

    #[test]
    fn test_exit_codes() {
        let pass = report_for(&[Threshold::parse(names::HTTP_REQ_DURATION, "p(95)<200").unwrap()]);
        assert_eq!(pass.exit_code(true), 0);

        let fail = report_for(&[Threshold::parse(names::HTTP_REQ_DURATION, "p(95)<50").unwrap()]);
        assert_eq!(fail.exit_code(false), EXIT_THRESHOLD_FAILED);

        let unknown = report_for(&[Threshold::parse("http_req_failed", "rate<0.01").unwrap()]);
        assert!(unknown.passed);
        assert!(!unknown.conclusive);
        assert_eq!(unknown.exit_code(false), 0);
        assert_eq!(unknown.exit_code(true), EXIT_INCONCLUSIVE);
    }

    #[test]
    fn test_json_contains_metrics_and_thresholds() {
        let report = report_for(&[Threshold::parse(names::HTTP_REQ_DURATION, "avg<200").unwrap()]);
        let json = report.to_json();
        assert!(json.contains("\"http_req_duration\""));
        assert!(json.contains("\"checks{check:status is 200}\""));
        assert!(json.contains("\"status\": \"passed\""));
        assert!(json.contains("\"passed\": true"));
    }
}
