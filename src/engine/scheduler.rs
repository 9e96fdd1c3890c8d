use futures::future::BoxFuture;
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::error::{ConfigError, SchedulerFault};

/// One segment of the concurrency ramp.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Stage {
    pub duration: Duration,
    pub target: usize,
}

impl Stage {
    pub fn new(duration: Duration, target: usize) -> Self {
        Self { duration, target }
    }
}

/// Validated, non-empty stage list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Schedule {
    stages: Vec<Stage>,
    total: Duration,
}

impl Schedule {
    pub fn new(stages: Vec<Stage>) -> Result<Self, ConfigError> {
        if stages.is_empty() {
            return Err(ConfigError::NoStages);
        }
        if let Some(index) = stages.iter().position(|s| s.duration.is_zero()) {
            return Err(ConfigError::InvalidStage {
                index,
                reason: "duration must be greater than zero".to_string(),
            });
        }
        let total = stages.iter().map(|s| s.duration).sum();
        Ok(Self { stages, total })
    }

    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    pub fn total_duration(&self) -> Duration {
        self.total
    }

    pub fn is_complete(&self, elapsed: Duration) -> bool {
        elapsed >= self.total
    }

    pub fn peak_target(&self) -> usize {
        self.stages.iter().map(|s| s.target).max().unwrap_or(0)
    }

    /// Index of the stage active at `elapsed`, `None` once the timeline is over.
    pub fn stage_at(&self, elapsed: Duration) -> Option<usize> {
        let mut start = Duration::ZERO;
        for (i, stage) in self.stages.iter().enumerate() {
            if elapsed < start + stage.duration {
                return Some(i);
            }
            start += stage.duration;
        }
        None
    }

    /// Linear ramp from the previous stage's target (0 before the first
    /// stage) to the current one, truncated toward zero. Past the end of the
    /// timeline the last stage's target holds.
    pub fn target_at(&self, elapsed: Duration) -> usize {
        let mut start = Duration::ZERO;
        let mut prev_target = 0;
        for stage in &self.stages {
            if elapsed < start + stage.duration {
                let progress = (elapsed - start).as_secs_f64() / stage.duration.as_secs_f64();
                let diff = stage.target as f64 - prev_target as f64;
                return (prev_target as f64 + diff * progress) as usize;
            }
            start += stage.duration;
            prev_target = stage.target;
        }
        prev_target
    }
}

/// Builds the future a worker runs, given its id and cancellation token.
pub type WorkerSpawner = Box<dyn Fn(usize, CancellationToken) -> BoxFuture<'static, ()> + Send + Sync>;

/// Live set of worker tasks.
///
/// Workers whose token has been cancelled keep running until their current
/// iteration ends; they are "draining" and no longer count as live.
pub struct WorkerPool {
    spawner: WorkerSpawner,
    tasks: JoinSet<usize>,
    live: BTreeMap<usize, CancellationToken>,
    next_id: usize,
    spawned: usize,
    peak: usize,
}

impl WorkerPool {
    pub fn new(spawner: WorkerSpawner) -> Self {
        Self {
            spawner,
            tasks: JoinSet::new(),
            live: BTreeMap::new(),
            next_id: 0,
            spawned: 0,
            peak: 0,
        }
    }

    /// Workers that have not been asked to stop.
    pub fn live(&self) -> usize {
        self.live.len()
    }

    /// Cancelled workers still finishing an iteration.
    pub fn draining(&self) -> usize {
        self.tasks.len().saturating_sub(self.live.len())
    }

    /// No task is running at all.
    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn spawned(&self) -> usize {
        self.spawned
    }

    pub fn peak(&self) -> usize {
        self.peak
    }

    /// Spawn or cancel workers until `live() == target`.
    pub fn reconcile(&mut self, target: usize) -> Result<(), SchedulerFault> {
        if self.live.len() > self.tasks.len() {
            return Err(SchedulerFault(format!(
                "{} live workers tracked but only {} tasks running",
                self.live.len(),
                self.tasks.len()
            )));
        }

        let live = self.live.len();
        if live < target {
            for _ in live..target {
                self.spawn_one();
            }
            tracing::debug!(from = live, to = target, "scaled workers up");
        } else if live > target {
            // Newest workers go first.
            for _ in target..live {
                if let Some((_, token)) = self.live.pop_last() {
                    token.cancel();
                }
            }
            tracing::debug!(from = live, to = target, "scaled workers down");
        }
        self.peak = self.peak.max(self.live.len());
        Ok(())
    }

    fn spawn_one(&mut self) {
        let id = self.next_id;
        self.next_id += 1;
        let token = CancellationToken::new();
        let work = (self.spawner)(id, token.clone());
        self.tasks.spawn(async move {
            work.await;
            id
        });
        self.live.insert(id, token);
        self.spawned += 1;
    }

    /// Wait for the next worker to exit. Returns `None` when no task is
    /// running; callers guard on [`WorkerPool::is_empty`] in a `select!`.
    pub async fn join_next(&mut self) -> Option<Result<usize, SchedulerFault>> {
        let joined = self.tasks.join_next().await?;
        Some(self.handle_exit(joined))
    }

    fn handle_exit(&mut self, joined: Result<usize, tokio::task::JoinError>) -> Result<usize, SchedulerFault> {
        match joined {
            Ok(id) => {
                if self.live.remove(&id).is_some() {
                    tracing::warn!(worker = id, "worker exited without being cancelled");
                }
                Ok(id)
            }
            Err(e) => Err(SchedulerFault(format!("worker task ended abnormally: {}", e))),
        }
    }

    /// Cancel every worker and wait for all of them to exit.
    ///
    /// With `graceful_stop` set, workers still running once it elapses are
    /// aborted; their number is returned.
    pub async fn drain(&mut self, graceful_stop: Option<Duration>) -> Result<usize, SchedulerFault> {
        for (_, token) in std::mem::take(&mut self.live) {
            token.cancel();
        }
        tracing::debug!(workers = self.tasks.len(), "draining workers");

        let wait_all = async {
            while let Some(joined) = self.tasks.join_next().await {
                if let Err(e) = joined {
                    if !e.is_cancelled() {
                        return Err(SchedulerFault(format!("worker task crashed: {}", e)));
                    }
                }
            }
            Ok(())
        };

        match graceful_stop {
            None => wait_all.await.map(|_| 0),
            Some(limit) => {
                let outcome = tokio::time::timeout(limit, wait_all).await;
                match outcome {
                    Ok(result) => result.map(|_| 0),
                    Err(_) => {
                        let remaining = self.tasks.len();
                        tracing::warn!(workers = remaining, ?limit, "graceful stop elapsed, aborting workers");
                        self.abort_all().await;
                        Ok(remaining)
                    }
                }
            }
        }
    }

    /// Abort every task and wait until they are gone.
    pub async fn abort_all(&mut self) {
        self.live.clear();
        self.tasks.abort_all();
        while self.tasks.join_next().await.is_some() {}
    }
}
