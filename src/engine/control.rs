use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::stats::Tags;

/// Commands that can be sent to control a running load test
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlCommand {
    /// Pin the worker count, overriding the stage schedule
    Ramp(usize),
    /// Hold all workers between iterations
    Pause,
    /// Resume execution
    Resume,
    /// Add a tag to all subsequent samples
    Tag(String, String),
    /// Report current status
    Status,
    /// Graceful stop
    Stop,
}

#[derive(Debug, Default)]
struct PauseClock {
    started: Option<Instant>,
    total: Duration,
}

/// Shared state between the controller, the workers and whoever drives
/// commands (stdin, signal handlers, tests).
#[derive(Debug)]
pub struct ControlState {
    paused: watch::Sender<bool>,
    pause_clock: Mutex<PauseClock>,
    ramp_override: Mutex<Option<usize>>,
    tags: Mutex<Tags>,
    stop: CancellationToken,
    live_workers: AtomicUsize,
    target_workers: AtomicUsize,
}

impl ControlState {
    pub fn new() -> Self {
        let (paused, _) = watch::channel(false);
        Self {
            paused,
            pause_clock: Mutex::new(PauseClock::default()),
            ramp_override: Mutex::new(None),
            tags: Mutex::new(Tags::new()),
            stop: CancellationToken::new(),
            live_workers: AtomicUsize::new(0),
            target_workers: AtomicUsize::new(0),
        }
    }

    pub fn apply(&self, command: ControlCommand) {
        tracing::info!(?command, "control command");
        match command {
            ControlCommand::Ramp(n) => self.ramp(n),
            ControlCommand::Pause => self.pause(),
            ControlCommand::Resume => self.resume(),
            ControlCommand::Tag(k, v) => self.add_tag(k, v),
            ControlCommand::Stop => self.stop(),
            ControlCommand::Status => {}
        }
    }

    pub fn pause(&self) {
        let mut clock = self.pause_clock.lock();
        if clock.started.is_none() {
            clock.started = Some(Instant::now());
        }
        self.paused.send_replace(true);
    }

    pub fn resume(&self) {
        let mut clock = self.pause_clock.lock();
        if let Some(started) = clock.started.take() {
            clock.total += started.elapsed();
        }
        self.paused.send_replace(false);
    }

    pub fn is_paused(&self) -> bool {
        *self.paused.borrow()
    }

    /// Total time spent paused, including a pause still in progress.
    pub fn total_paused(&self) -> Duration {
        let clock = self.pause_clock.lock();
        clock.total + clock.started.map(|s| s.elapsed()).unwrap_or_default()
    }

    /// Resolves once the run is not paused (or stopped).
    pub async fn wait_while_paused(&self) {
        let mut rx = self.paused.subscribe();
        tokio::select! {
            _ = rx.wait_for(|paused| !*paused) => {}
            _ = self.stop.cancelled() => {}
        }
    }

    pub fn ramp(&self, workers: usize) {
        *self.ramp_override.lock() = Some(workers);
    }

    pub fn ramp_override(&self) -> Option<usize> {
        *self.ramp_override.lock()
    }

    pub fn add_tag(&self, key: String, value: String) {
        self.tags.lock().insert(key, value);
    }

    pub fn tags(&self) -> Tags {
        self.tags.lock().clone()
    }

    pub fn stop(&self) {
        self.stop.cancel();
    }

    pub fn is_stopped(&self) -> bool {
        self.stop.is_cancelled()
    }

    /// Resolves once `stop` has been called.
    pub async fn stopped(&self) {
        self.stop.cancelled().await
    }

    pub(crate) fn set_worker_counts(&self, live: usize, target: usize) {
        self.live_workers.store(live, Ordering::Relaxed);
        self.target_workers.store(target, Ordering::Relaxed);
    }

    pub fn live_workers(&self) -> usize {
        self.live_workers.load(Ordering::Relaxed)
    }

    pub fn target_workers(&self) -> usize {
        self.target_workers.load(Ordering::Relaxed)
    }
}

impl Default for ControlState {
    fn default() -> Self {
        Self::new()
    }
}

/// Parse a control command from user input
pub fn parse_control_command(input: &str) -> Option<ControlCommand> {
    let parts: Vec<&str> = input.split_whitespace().collect();
    let first = parts.first()?;

    match first.to_lowercase().as_str() {
        "ramp" | "scale" => parts
            .get(1)?
            .parse::<usize>()
            .ok()
            .map(ControlCommand::Ramp),
        "pause" => Some(ControlCommand::Pause),
        "resume" | "unpause" => Some(ControlCommand::Resume),
        "tag" => {
            let (key, value) = parts.get(1)?.split_once('=')?;
            Some(ControlCommand::Tag(key.to_string(), value.to_string()))
        }
        "status" | "stats" => Some(ControlCommand::Status),
        "stop" | "quit" | "exit" => Some(ControlCommand::Stop),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_ramp() {
        assert_eq!(parse_control_command("ramp 50"), Some(ControlCommand::Ramp(50)));
        assert_eq!(parse_control_command("scale 100"), Some(ControlCommand::Ramp(100)));
        assert_eq!(parse_control_command("ramp lots"), None);
    }

    #[test]
    fn test_parse_pause_resume() {
        assert_eq!(parse_control_command("pause"), Some(ControlCommand::Pause));
        assert_eq!(parse_control_command("RESUME"), Some(ControlCommand::Resume));
        assert_eq!(parse_control_command("unpause"), Some(ControlCommand::Resume));
    }

    #[test]
    fn test_parse_tag() {
        assert_eq!(
            parse_control_command("tag region=us-east"),
            Some(ControlCommand::Tag("region".into(), "us-east".into()))
        );
        assert_eq!(parse_control_command("tag region"), None);
    }

    #[test]
    fn test_parse_stop_and_unknown() {
        assert_eq!(parse_control_command("quit"), Some(ControlCommand::Stop));
        assert_eq!(parse_control_command("  "), None);
        assert_eq!(parse_control_command("launch"), None);
    }

    #[test]
    fn test_apply_commands() {
        let state = ControlState::new();
        state.apply(ControlCommand::Ramp(7));
        state.apply(ControlCommand::Tag("env".into(), "prod".into()));
        assert_eq!(state.ramp_override(), Some(7));
        assert_eq!(state.tags().get("env").map(String::as_str), Some("prod"));

        assert!(!state.is_stopped());
        state.apply(ControlCommand::Stop);
        assert!(state.is_stopped());
    }

    #[tokio::test(start_paused = true)]
    async fn test_pause_accumulates_time() {
        let state = ControlState::new();
        state.pause();
        assert!(state.is_paused());
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(state.total_paused(), Duration::from_secs(3));
        state.resume();
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(state.total_paused(), Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_while_paused_releases_on_resume() {
        let state = std::sync::Arc::new(ControlState::new());
        state.pause();

        let waiter = {
            let state = state.clone();
            tokio::spawn(async move { state.wait_while_paused().await })
        };
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(!waiter.is_finished());

        state.resume();
        waiter.await.unwrap();
    }
}
