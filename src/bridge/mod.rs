//! The surface scenario code programs against.
//!
//! A [`Scenario`] is invoked once per worker iteration with a [`VuContext`]
//! that carries the worker's identity, the shared fixtures, an instrumented
//! HTTP client and helpers that turn checks and custom measurements into
//! samples.

pub mod data;
mod http;
mod metrics;
pub mod template;

use async_trait::async_trait;
use std::sync::Arc;

use crate::engine::control::ControlState;
use crate::engine::http_client::HttpClient;
use crate::error::ScenarioError;
use crate::stats::{Sample, SharedRecorder};

pub use data::{FixtureSet, FixtureSource};
pub use template::{RequestTemplate, TemplateScenario};

/// Caller supplied unit of work.
///
/// Implementations must not keep mutable state across calls that would
/// couple workers together; anything per-worker belongs in the context.
#[async_trait]
pub trait Scenario: Send + Sync {
    fn name(&self) -> &str {
        "default"
    }

    async fn run(&self, vu: &mut VuContext) -> Result<(), ScenarioError>;
}

/// Per-worker handle passed to every scenario iteration.
pub struct VuContext {
    worker_id: usize,
    iteration: u64,
    fixtures: FixtureSet,
    recorder: SharedRecorder,
    client: HttpClient,
    control: Arc<ControlState>,
}

impl VuContext {
    pub fn new(
        worker_id: usize,
        fixtures: FixtureSet,
        recorder: SharedRecorder,
        client: HttpClient,
        control: Arc<ControlState>,
    ) -> Self {
        Self {
            worker_id,
            iteration: 0,
            fixtures,
            recorder,
            client,
            control,
        }
    }

    pub fn worker_id(&self) -> usize {
        self.worker_id
    }

    /// Zero-based index of the iteration in progress.
    pub fn iteration(&self) -> u64 {
        self.iteration
    }

    pub(crate) fn set_iteration(&mut self, iteration: u64) {
        self.iteration = iteration;
    }

    pub fn fixtures(&self) -> &FixtureSet {
        &self.fixtures
    }

    /// Record a named pass/fail check. Returns `ok` so it can guard
    /// follow-up logic.
    pub fn check(&self, name: &str, ok: bool) -> bool {
        self.record(Sample::check(name, ok));
        ok
    }

    /// Record any sample, with the run's control tags attached.
    pub fn record(&self, sample: Sample) {
        let tags = self.control.tags();
        let sample = if tags.is_empty() { sample } else { sample.with_tags(&tags) };
        self.recorder.record_from(self.worker_id, sample);
    }

    pub(crate) fn record_error(&self, message: &str) {
        self.recorder.record_error(self.worker_id, message);
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::engine::http_client::HttpSettings;
    use crate::stats::MetricsRecorder;

    pub fn context(fixtures: FixtureSet) -> (VuContext, SharedRecorder, Arc<ControlState>) {
        let recorder = Arc::new(MetricsRecorder::new(4));
        let control = Arc::new(ControlState::new());
        let vu = VuContext::new(
            0,
            fixtures,
            recorder.clone(),
            HttpClient::new(&HttpSettings::default()),
            control.clone(),
        );
        (vu, recorder, control)
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::context;
    use super::*;
    use crate::stats::names;

    #[test]
    fn test_check_records_rate_and_returns_outcome() {
        let (vu, recorder, _) = context(FixtureSet::empty());
        assert!(vu.check("status is 200", true));
        assert!(!vu.check("status is 200", false));

        let snapshot = recorder.snapshot();
        let checks = snapshot.get(names::CHECKS).unwrap();
        assert_eq!(checks.count(), 2);
        assert_eq!(checks.rate(), Some(0.5));
        assert!(snapshot.get("checks{check:status is 200}").is_some());
    }

    #[test]
    fn test_record_attaches_control_tags() {
        let (vu, recorder, control) = context(FixtureSet::empty());
        control.add_tag("phase".into(), "warmup".into());
        vu.record(Sample::counter("orders", 1.0));

        let snapshot = recorder.snapshot();
        assert_eq!(snapshot.get("orders").unwrap().sum(), 1.0);
        assert_eq!(snapshot.get("orders{phase:warmup}").unwrap().sum(), 1.0);
    }

    #[test]
    fn test_check_carries_control_tags() {
        let (vu, recorder, control) = context(FixtureSet::empty());
        control.add_tag("phase".into(), "warmup".into());
        assert!(vu.check("status is 200", true));
        assert!(!vu.check("status is 200", false));

        let snapshot = recorder.snapshot();
        assert_eq!(snapshot.get(names::CHECKS).unwrap().count(), 2);
        assert!(snapshot.get("checks{check:status is 200}").is_none());
        let tagged = snapshot.get("checks{check:status is 200,phase:warmup}").unwrap();
        assert_eq!(tagged.passes(), 1);
        assert_eq!(tagged.failures(), 1);
    }
}
