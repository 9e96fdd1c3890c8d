//! Threshold parsing and evaluation.
//!
//! A threshold pairs a metric name with an expression such as `p(95)<200`,
//! `rate < 0.01` or `count>=100`. Evaluation is a pure function of the
//! threshold list and a [`MetricsSnapshot`].

use serde::{Deserialize, Serialize};
use std::fmt;

use super::{Aggregate, MetricKind, MetricsSnapshot};
use crate::error::ConfigError;

/// Operators ordered so that longer spellings match first.
const OPERATORS: [(&str, Comparison); 7] = [
    ("===", Comparison::Eq),
    ("==", Comparison::Eq),
    ("!=", Comparison::Ne),
    ("<=", Comparison::Le),
    (">=", Comparison::Ge),
    ("<", Comparison::Lt),
    (">", Comparison::Gt),
];

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Statistic {
    Count,
    Rate,
    Avg,
    Min,
    Max,
    Med,
    Sum,
    Value,
    /// Percentile in `(0, 100]`.
    Percentile(f64),
}

impl Statistic {
    fn parse(s: &str) -> Option<Self> {
        let s = s.trim().to_ascii_lowercase();
        let stat = match s.as_str() {
            "count" => Statistic::Count,
            "rate" => Statistic::Rate,
            "avg" | "mean" => Statistic::Avg,
            "min" => Statistic::Min,
            "max" => Statistic::Max,
            "med" | "median" => Statistic::Med,
            "sum" => Statistic::Sum,
            "value" => Statistic::Value,
            other => {
                let rest = other.strip_prefix('p')?;
                let rest = rest
                    .strip_prefix('(')
                    .and_then(|r| r.strip_suffix(')'))
                    .unwrap_or(rest);
                let p: f64 = rest.trim().parse().ok()?;
                if !(p > 0.0 && p <= 100.0) {
                    return None;
                }
                Statistic::Percentile(p)
            }
        };
        Some(stat)
    }

    /// Read this statistic from an aggregate. `None` when it has no samples.
    pub fn of(&self, agg: &Aggregate) -> Option<f64> {
        if agg.count() == 0 {
            return None;
        }
        match self {
            // A counter's count is the accumulated value, not the number of adds.
            Statistic::Count if agg.kind() == MetricKind::Counter => Some(agg.sum()),
            Statistic::Count => Some(agg.count() as f64),
            Statistic::Rate => agg.rate(),
            Statistic::Avg => agg.mean(),
            Statistic::Min => agg.min(),
            Statistic::Max => agg.max(),
            Statistic::Med => agg.percentile(0.5),
            Statistic::Sum => Some(agg.sum()),
            Statistic::Value => agg.value(),
            Statistic::Percentile(p) => agg.percentile(p / 100.0),
        }
    }
}

impl fmt::Display for Statistic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Statistic::Count => write!(f, "count"),
            Statistic::Rate => write!(f, "rate"),
            Statistic::Avg => write!(f, "avg"),
            Statistic::Min => write!(f, "min"),
            Statistic::Max => write!(f, "max"),
            Statistic::Med => write!(f, "med"),
            Statistic::Sum => write!(f, "sum"),
            Statistic::Value => write!(f, "value"),
            Statistic::Percentile(p) => write!(f, "p({})", p),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Comparison {
    Lt,
    Le,
    Gt,
    Ge,
    Eq,
    Ne,
}

impl Comparison {
    /// Split a leading operator off `text`, e.g. `"> 0"` gives `(Gt, " 0")`.
    pub fn split_prefix(text: &str) -> Option<(Comparison, &str)> {
        OPERATORS
            .iter()
            .find_map(|(op, comparison)| text.strip_prefix(op).map(|rest| (*comparison, rest)))
    }

    pub fn holds(self, actual: f64, bound: f64) -> bool {
        match self {
            Comparison::Lt => actual < bound,
            Comparison::Le => actual <= bound,
            Comparison::Gt => actual > bound,
            Comparison::Ge => actual >= bound,
            Comparison::Eq => (actual - bound).abs() < f64::EPSILON,
            Comparison::Ne => (actual - bound).abs() >= f64::EPSILON,
        }
    }
}

/// A pass/fail condition over one metric.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Threshold {
    pub metric: String,
    pub expression: String,
    pub statistic: Statistic,
    pub comparison: Comparison,
    pub bound: f64,
    /// Stop the run as soon as a periodic evaluation fails this threshold.
    pub abort_on_fail: bool,
}

impl Threshold {
    pub fn parse(metric: &str, expression: &str) -> Result<Self, ConfigError> {
        let invalid = |reason: &str| ConfigError::InvalidThreshold {
            metric: metric.to_string(),
            expression: expression.to_string(),
            reason: reason.to_string(),
        };

        if metric.trim().is_empty() {
            return Err(invalid("metric name is empty"));
        }

        let op_start = expression
            .find(['<', '>', '=', '!'])
            .ok_or_else(|| invalid("missing comparison operator"))?;
        let (comparison, rest) = Comparison::split_prefix(&expression[op_start..])
            .ok_or_else(|| invalid("unknown comparison operator"))?;

        let statistic = Statistic::parse(&expression[..op_start])
            .ok_or_else(|| invalid("unknown statistic"))?;
        let bound: f64 = rest
            .trim()
            .parse()
            .map_err(|_| invalid("bound is not a number"))?;

        Ok(Self {
            metric: metric.trim().to_string(),
            expression: expression.trim().to_string(),
            statistic,
            comparison,
            bound,
            abort_on_fail: false,
        })
    }

    pub fn with_abort_on_fail(mut self, abort: bool) -> Self {
        self.abort_on_fail = abort;
        self
    }

    fn check(&self, snapshot: &MetricsSnapshot) -> ThresholdResult {
        let actual = snapshot.get(&self.metric).and_then(|agg| self.statistic.of(agg));
        let status = match actual {
            None => ThresholdStatus::Inconclusive,
            Some(v) if self.comparison.holds(v, self.bound) => ThresholdStatus::Passed,
            Some(_) => ThresholdStatus::Failed,
        };
        ThresholdResult {
            metric: self.metric.clone(),
            expression: self.expression.clone(),
            status,
            actual,
            bound: self.bound,
            abort_on_fail: self.abort_on_fail,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ThresholdStatus {
    Passed,
    Failed,
    /// The metric has no samples, so the threshold could not be judged.
    Inconclusive,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ThresholdResult {
    pub metric: String,
    pub expression: String,
    pub status: ThresholdStatus,
    pub actual: Option<f64>,
    pub bound: f64,
    pub abort_on_fail: bool,
}

impl fmt::Display for ThresholdResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.status, self.actual) {
            (ThresholdStatus::Inconclusive, _) | (_, None) => {
                write!(f, "{} {}: no samples recorded", self.metric, self.expression)
            }
            (_, Some(actual)) => write!(
                f,
                "{} {}: actual {:.3} vs bound {}",
                self.metric, self.expression, actual, self.bound
            ),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Evaluation {
    pub results: Vec<ThresholdResult>,
}

impl Evaluation {
    /// No threshold failed. Inconclusive results do not count as failures here.
    pub fn passed(&self) -> bool {
        !self.results.iter().any(|r| r.status == ThresholdStatus::Failed)
    }

    pub fn is_conclusive(&self) -> bool {
        !self.results.iter().any(|r| r.status == ThresholdStatus::Inconclusive)
    }

    pub fn failures(&self) -> impl Iterator<Item = &ThresholdResult> {
        self.results.iter().filter(|r| r.status == ThresholdStatus::Failed)
    }

    pub fn inconclusive(&self) -> impl Iterator<Item = &ThresholdResult> {
        self.results.iter().filter(|r| r.status == ThresholdStatus::Inconclusive)
    }

    /// A failed threshold asked for the run to stop early.
    pub fn should_abort(&self) -> bool {
        self.failures().any(|r| r.abort_on_fail)
    }
}

/// Judge every threshold against `snapshot`, preserving threshold order.
pub fn evaluate(thresholds: &[Threshold], snapshot: &MetricsSnapshot) -> Evaluation {
    Evaluation {
        results: thresholds.iter().map(|t| t.check(snapshot)).collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stats::{names, MetricsRecorder, Sample};

    fn latency_snapshot() -> MetricsSnapshot {
        let recorder = MetricsRecorder::new(4);
        for i in 1..=100 {
            recorder.record(Sample::trend(names::HTTP_REQ_DURATION, i as f64));
            recorder.record(Sample::rate(names::HTTP_REQ_FAILED, false));
        }
        recorder.snapshot()
    }

    #[test]
    fn test_parse_forms() {
        let t = Threshold::parse("http_req_duration", "p(95)<200").unwrap();
        assert_eq!(t.statistic, Statistic::Percentile(95.0));
        assert_eq!(t.comparison, Comparison::Lt);
        assert_eq!(t.bound, 200.0);

        let t = Threshold::parse("http_req_duration", "p95 < 500").unwrap();
        assert_eq!(t.statistic, Statistic::Percentile(95.0));

        let t = Threshold::parse("http_req_duration", "p(99.9) <= 1000").unwrap();
        assert_eq!(t.statistic, Statistic::Percentile(99.9));
        assert_eq!(t.comparison, Comparison::Le);

        let t = Threshold::parse("http_req_failed", "rate<0.01").unwrap();
        assert_eq!(t.statistic, Statistic::Rate);
        assert_eq!(t.bound, 0.01);

        let t = Threshold::parse("iterations", "count >= 10").unwrap();
        assert_eq!(t.comparison, Comparison::Ge);

        let t = Threshold::parse("vus", "value===5").unwrap();
        assert_eq!(t.comparison, Comparison::Eq);
    }

    #[test]
    fn test_split_prefix_prefers_longest_operator() {
        assert_eq!(Comparison::split_prefix("> 0"), Some((Comparison::Gt, " 0")));
        assert_eq!(Comparison::split_prefix(">=1"), Some((Comparison::Ge, "1")));
        assert_eq!(Comparison::split_prefix("===2"), Some((Comparison::Eq, "2")));
        assert_eq!(Comparison::split_prefix("ok"), None);
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(Threshold::parse("m", "p95 200").is_err());
        assert!(Threshold::parse("m", "p(95) < fast").is_err());
        assert!(Threshold::parse("m", "p(0) < 1").is_err());
        assert!(Threshold::parse("m", "p(101) < 1").is_err());
        assert!(Threshold::parse("m", "median-ish < 1").is_err());
        assert!(Threshold::parse("", "avg < 1").is_err());
    }

    #[test]
    fn test_evaluate_passing_and_failing() {
        let snapshot = latency_snapshot();
        let thresholds = vec![
            Threshold::parse(names::HTTP_REQ_DURATION, "p(95)<200").unwrap(),
            Threshold::parse(names::HTTP_REQ_FAILED, "rate<0.01").unwrap(),
            Threshold::parse(names::HTTP_REQ_DURATION, "p(95)<50").unwrap(),
        ];
        let eval = evaluate(&thresholds, &snapshot);
        assert!(!eval.passed());
        assert!(eval.is_conclusive());
        let failures: Vec<_> = eval.failures().collect();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].expression, "p(95)<50");
        let rendered = failures[0].to_string();
        assert!(rendered.contains("actual"), "{}", rendered);
        assert!(rendered.contains("bound 50"), "{}", rendered);
    }

    #[test]
    fn test_operators() {
        let recorder = MetricsRecorder::new(1);
        recorder.record(Sample::trend("api", 100.0));
        let snapshot = recorder.snapshot();

        let check = |expr: &str| evaluate(&[Threshold::parse("api", expr).unwrap()], &snapshot).passed();
        assert!(check("avg <= 100"));
        assert!(check("avg >= 100"));
        assert!(check("avg == 100"));
        assert!(!check("avg != 100"));
        assert!(!check("avg > 100"));
        assert!(!check("avg < 100"));
    }

    #[test]
    fn test_counter_count_uses_accumulated_value() {
        let recorder = MetricsRecorder::new(1);
        recorder.record(Sample::counter("items_sold", 5.0));
        recorder.record(Sample::counter("items_sold", 3.0));
        let snapshot = recorder.snapshot();
        let eval = evaluate(&[Threshold::parse("items_sold", "count == 8").unwrap()], &snapshot);
        assert!(eval.passed());
    }

    #[test]
    fn test_missing_metric_is_inconclusive_not_passed() {
        let snapshot = latency_snapshot();
        let thresholds = vec![Threshold::parse("checks", "rate>0.99").unwrap()];
        let eval = evaluate(&thresholds, &snapshot);
        assert_eq!(eval.results[0].status, ThresholdStatus::Inconclusive);
        assert!(!eval.is_conclusive());
        assert_eq!(eval.inconclusive().count(), 1);
        assert!(eval.results[0].to_string().contains("no samples"));
    }

    #[test]
    fn test_should_abort_only_for_flagged_failures() {
        let snapshot = latency_snapshot();
        let soft = Threshold::parse(names::HTTP_REQ_DURATION, "max<10").unwrap();
        let hard = soft.clone().with_abort_on_fail(true);
        assert!(!evaluate(&[soft], &snapshot).should_abort());
        assert!(evaluate(&[hard], &snapshot).should_abort());
    }

    #[test]
    fn test_statistic_display_roundtrips_through_parse() {
        for expr in ["count", "rate", "avg", "min", "max", "med", "sum", "value", "p(95)", "p(99.9)"] {
            let stat = Statistic::parse(expr).unwrap();
            assert_eq!(Statistic::parse(&stat.to_string()), Some(stat));
        }
    }
}
