use futures::FutureExt;
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::control::ControlState;
use super::http_client::HttpClient;
use crate::bridge::{FixtureSet, Scenario, VuContext};
use crate::stats::{names, Sample, SharedRecorder};

/// What a pending cancellation does to a worker sleeping between iterations.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ThinkTimePolicy {
    /// Finish the pause, then observe the cancellation.
    #[default]
    Complete,
    /// Cancellation cuts the pause short.
    Interrupt,
}

/// Everything a worker needs, shared by all workers of one run.
pub struct WorkerShared {
    pub scenario: Arc<dyn Scenario>,
    pub fixtures: FixtureSet,
    pub recorder: SharedRecorder,
    pub client: HttpClient,
    pub control: Arc<ControlState>,
    pub think_time: Duration,
    pub think_time_policy: ThinkTimePolicy,
}

/// Run one virtual user until `token` is cancelled. Returns the number of
/// completed iterations.
pub async fn run_worker(id: usize, shared: Arc<WorkerShared>, token: CancellationToken) -> u64 {
    let mut vu = VuContext::new(
        id,
        shared.fixtures.clone(),
        shared.recorder.clone(),
        shared.client.clone(),
        shared.control.clone(),
    );
    let mut iteration: u64 = 0;

    loop {
        if token.is_cancelled() {
            break;
        }
        if shared.control.is_paused() {
            tokio::select! {
                _ = shared.control.wait_while_paused() => {}
                _ = token.cancelled() => break,
            }
            continue;
        }

        vu.set_iteration(iteration);
        let started = Instant::now();
        let outcome = AssertUnwindSafe(shared.scenario.run(&mut vu)).catch_unwind().await;
        let elapsed = started.elapsed();

        let failed = match outcome {
            Ok(Ok(())) => false,
            Ok(Err(e)) => {
                tracing::debug!(worker = id, iteration, error = %e, "iteration failed");
                vu.record_error(&e.to_string());
                true
            }
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                tracing::warn!(worker = id, iteration, %message, "scenario panicked");
                vu.record_error(&format!("panic: {}", message));
                true
            }
        };
        vu.record(Sample::counter(names::ITERATIONS, 1.0));
        vu.record(Sample::trend(names::ITERATION_DURATION, elapsed.as_secs_f64() * 1000.0));
        vu.record(Sample::rate(names::ITERATION_FAILED, failed));
        iteration += 1;

        if shared.think_time.is_zero() {
            tokio::task::yield_now().await;
            continue;
        }
        match shared.think_time_policy {
            ThinkTimePolicy::Complete => tokio::time::sleep(shared.think_time).await,
            ThinkTimePolicy::Interrupt => {
                tokio::select! {
                    _ = tokio::time::sleep(shared.think_time) => {}
                    _ = token.cancelled() => break,
                }
            }
        }
    }

    tracing::trace!(worker = id, iterations = iteration, "worker exited");
    iteration
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
