pub mod control;
pub mod http_client;
pub mod scheduler;
pub mod worker;

use futures::FutureExt;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{Instant, MissedTickBehavior};

use crate::bridge::{FixtureSet, FixtureSource, Scenario};
use crate::error::EngineError;
use crate::stats::report::RunFacts;
use crate::stats::{evaluate, names, MetricsRecorder, RunReport, Sample, SharedRecorder, Threshold};
use control::ControlState;
use http_client::{HttpClient, HttpSettings};
use scheduler::{Schedule, WorkerPool};
pub use worker::ThinkTimePolicy;
use worker::{run_worker, WorkerShared};

/// Immutable description of one run.
#[derive(Debug, Clone)]
pub struct RunPlan {
    pub schedule: Schedule,
    pub thresholds: Vec<Threshold>,
    pub think_time: Duration,
    pub think_time_policy: ThinkTimePolicy,
    pub tick_interval: Duration,
    /// Upper bound for draining; `None` waits for every in-flight iteration.
    pub graceful_stop: Option<Duration>,
    /// Evaluate thresholds while ramping, for `abort_on_fail`.
    pub threshold_interval: Option<Duration>,
    /// Inconclusive thresholds fail the run.
    pub strict: bool,
    pub fixtures: Option<FixtureSource>,
    pub http: HttpSettings,
    /// Keep `metric{tag:value}` sub-aggregates.
    pub tagged_submetrics: bool,
}

impl RunPlan {
    pub fn new(schedule: Schedule) -> Self {
        Self {
            schedule,
            thresholds: Vec::new(),
            think_time: Duration::ZERO,
            think_time_policy: ThinkTimePolicy::Complete,
            tick_interval: Duration::from_secs(1),
            graceful_stop: None,
            threshold_interval: None,
            strict: false,
            fixtures: None,
            http: HttpSettings::default(),
            tagged_submetrics: true,
        }
    }

    pub fn with_thresholds(mut self, thresholds: Vec<Threshold>) -> Self {
        self.thresholds = thresholds;
        self
    }

    pub fn with_think_time(mut self, think_time: Duration, policy: ThinkTimePolicy) -> Self {
        self.think_time = think_time;
        self.think_time_policy = policy;
        self
    }

    pub fn with_tick_interval(mut self, tick: Duration) -> Self {
        self.tick_interval = tick;
        self
    }

    pub fn with_graceful_stop(mut self, limit: Option<Duration>) -> Self {
        self.graceful_stop = limit;
        self
    }

    pub fn with_threshold_interval(mut self, interval: Option<Duration>) -> Self {
        self.threshold_interval = interval;
        self
    }

    pub fn with_fixtures(mut self, source: FixtureSource) -> Self {
        self.fixtures = Some(source);
        self
    }

    pub fn with_strict(mut self, strict: bool) -> Self {
        self.strict = strict;
        self
    }
}

/// Run controller phases.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Init,
    LoadingFixtures,
    Ramping,
    Draining,
    Evaluating,
    Done,
    Failed,
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RunState::Init => "init",
            RunState::LoadingFixtures => "loading_fixtures",
            RunState::Ramping => "ramping",
            RunState::Draining => "draining",
            RunState::Evaluating => "evaluating",
            RunState::Done => "done",
            RunState::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Why the ramping phase ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RampEnd {
    Completed,
    Stopped,
    ThresholdAbort,
}

/// Drives one run: fixtures, stage timeline, drain, threshold evaluation.
pub struct Engine {
    plan: Arc<RunPlan>,
    scenario: Arc<dyn Scenario>,
    control: Arc<ControlState>,
    recorder: SharedRecorder,
    state: watch::Sender<RunState>,
}

impl Engine {
    pub fn new(plan: RunPlan, scenario: Arc<dyn Scenario>) -> Self {
        let recorder = MetricsRecorder::for_workers(plan.schedule.peak_target())
            .with_tagged_submetrics(plan.tagged_submetrics);
        let (state, _) = watch::channel(RunState::Init);
        Self {
            plan: Arc::new(plan),
            scenario,
            control: Arc::new(ControlState::new()),
            recorder: Arc::new(recorder),
            state,
        }
    }

    pub fn plan(&self) -> &RunPlan {
        &self.plan
    }

    /// Handle for pause/resume/ramp/tag/stop.
    pub fn control(&self) -> Arc<ControlState> {
        self.control.clone()
    }

    pub fn recorder(&self) -> SharedRecorder {
        self.recorder.clone()
    }

    pub fn state(&self) -> RunState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<RunState> {
        self.state.subscribe()
    }

    fn transition(&self, next: RunState) {
        let prev = self.state.send_replace(next);
        tracing::info!(from = %prev, to = %next, "run state");
    }

    fn fail(&self, err: EngineError) -> EngineError {
        tracing::error!(error = %err, "run failed");
        self.transition(RunState::Failed);
        err
    }

    /// Execute the run. Call once per engine.
    pub async fn run(&self) -> Result<RunReport, EngineError> {
        self.transition(RunState::LoadingFixtures);
        let fixtures = match &self.plan.fixtures {
            Some(source) => FixtureSet::load(source).map_err(|e| self.fail(e.into()))?,
            None => FixtureSet::empty(),
        };

        let shared = Arc::new(WorkerShared {
            scenario: self.scenario.clone(),
            fixtures,
            recorder: self.recorder.clone(),
            client: HttpClient::new(&self.plan.http),
            control: self.control.clone(),
            think_time: self.plan.think_time,
            think_time_policy: self.plan.think_time_policy,
        });
        let mut pool = WorkerPool::new(Box::new(move |id, token| {
            run_worker(id, shared.clone(), token).map(|_| ()).boxed()
        }));

        tracing::info!(
            scenario = self.scenario.name(),
            stages = self.plan.schedule.stages().len(),
            duration = ?self.plan.schedule.total_duration(),
            peak = self.plan.schedule.peak_target(),
            "starting run"
        );
        self.transition(RunState::Ramping);
        let start = Instant::now();

        let ramp_end = match self.ramp(&mut pool, start).await {
            Ok(end) => end,
            Err(err) => {
                pool.abort_all().await;
                return Err(self.fail(err));
            }
        };

        self.transition(RunState::Draining);
        let interrupted = match pool.drain(self.plan.graceful_stop).await {
            Ok(n) => n,
            Err(fault) => {
                pool.abort_all().await;
                return Err(self.fail(fault.into()));
            }
        };
        self.control.set_worker_counts(0, 0);

        self.transition(RunState::Evaluating);
        let snapshot = self.recorder.snapshot();
        if let Some(fault) = self.recorder.fault() {
            return Err(self.fail(fault.into()));
        }
        let evaluation = evaluate(&self.plan.thresholds, &snapshot);
        for result in evaluation.failures() {
            tracing::warn!(%result, "threshold failed");
        }
        for result in evaluation.inconclusive() {
            tracing::warn!(%result, "threshold inconclusive");
        }

        let facts = RunFacts {
            elapsed: start.elapsed(),
            cancelled: ramp_end == RampEnd::Stopped,
            aborted_by_threshold: ramp_end == RampEnd::ThresholdAbort,
            workers_spawned: pool.spawned(),
            peak_workers: pool.peak(),
            workers_interrupted: interrupted,
        };
        let report = RunReport::new(&snapshot, evaluation, facts);
        self.transition(RunState::Done);
        Ok(report)
    }

    /// Follow the stage timeline until it ends, a stop is requested or an
    /// `abort_on_fail` threshold fails. Re-evaluates on every tick and on
    /// every worker exit.
    async fn ramp(&self, pool: &mut WorkerPool, start: Instant) -> Result<RampEnd, EngineError> {
        let schedule = &self.plan.schedule;
        let mut ticker = tokio::time::interval(self.plan.tick_interval.max(Duration::from_millis(1)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut next_evaluation = self.plan.threshold_interval.map(|i| start + i);

        loop {
            if let Some(fault) = self.recorder.fault() {
                return Err(fault.into());
            }
            if self.control.is_stopped() {
                tracing::info!("stop requested, draining");
                return Ok(RampEnd::Stopped);
            }

            // Time spent paused does not advance the timeline.
            let elapsed = start.elapsed().saturating_sub(self.control.total_paused());
            if schedule.is_complete(elapsed) {
                return Ok(RampEnd::Completed);
            }

            let target = self
                .control
                .ramp_override()
                .unwrap_or_else(|| schedule.target_at(elapsed));
            pool.reconcile(target)?;
            self.control.set_worker_counts(pool.live(), target);
            self.recorder.record(Sample::gauge(names::VUS, pool.live() as f64));

            if let (Some(at), Some(interval)) = (next_evaluation, self.plan.threshold_interval) {
                if Instant::now() >= at {
                    let evaluation = evaluate(&self.plan.thresholds, &self.recorder.snapshot());
                    if evaluation.should_abort() {
                        for result in evaluation.failures().filter(|r| r.abort_on_fail) {
                            tracing::warn!(%result, "threshold failed, aborting run");
                        }
                        return Ok(RampEnd::ThresholdAbort);
                    }
                    next_evaluation = Some(at + interval);
                }
            }

            let remaining = schedule.total_duration().saturating_sub(elapsed);
            tokio::select! {
                _ = ticker.tick() => {}
                exit = pool.join_next(), if !pool.is_empty() => {
                    if let Some(Err(fault)) = exit {
                        return Err(fault.into());
                    }
                }
                _ = self.control.stopped() => {}
                _ = tokio::time::sleep(remaining), if !self.control.is_paused() => {}
            }
        }
    }
}
