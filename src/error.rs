//! Error taxonomy for the engine.
//!
//! Per-iteration failures ([`ScenarioError`], [`ExternalCallError`]) are turned
//! into samples by the worker and never abort a run. Setup failures and
//! internal invariant violations surface as [`EngineError`].

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// The fixture source could not produce a usable fixture set.
#[derive(Debug, Error)]
pub enum FixtureLoadError {
    #[error("failed to read fixture file {path}: {source}")]
    Unreadable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("fixture file {path} is malformed: {reason}")]
    Malformed { path: PathBuf, reason: String },
    #[error("fixture source {source_name} contains no records")]
    Empty { source_name: String },
}

/// A network level failure of one external call.
#[derive(Debug, Clone, Error)]
pub enum ExternalCallError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("request timed out after {0:?}")]
    Timeout(Duration),
    #[error("transport error: {0}")]
    Transport(String),
}

/// One scenario iteration failed. Recorded as data, never fatal.
#[derive(Debug, Clone, Error)]
pub enum ScenarioError {
    #[error(transparent)]
    ExternalCall(#[from] ExternalCallError),
    #[error("{0}")]
    Failed(String),
}

impl ScenarioError {
    pub fn msg(message: impl Into<String>) -> Self {
        ScenarioError::Failed(message.into())
    }
}

/// The configuration file or its values are unusable.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config {path}: {reason}")]
    Parse { path: PathBuf, reason: String },
    #[error("invalid duration '{value}' for {field}")]
    InvalidDuration { field: String, value: String },
    #[error("invalid stage #{index}: {reason}")]
    InvalidStage { index: usize, reason: String },
    #[error("at least one stage is required")]
    NoStages,
    #[error("invalid threshold '{expression}' for metric '{metric}': {reason}")]
    InvalidThreshold {
        metric: String,
        expression: String,
        reason: String,
    },
    #[error("invalid request template: {0}")]
    InvalidTemplate(String),
}

/// The scheduler lost track of its workers.
#[derive(Debug, Clone, Error)]
#[error("scheduler fault: {0}")]
pub struct SchedulerFault(pub String);

/// The metrics recorder detected an inconsistent aggregate.
#[derive(Debug, Clone, Error)]
#[error("recorder fault: {0}")]
pub struct RecorderFault(pub String);

/// Anything that aborts a run.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    FixtureLoad(#[from] FixtureLoadError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Scheduler(#[from] SchedulerFault),
    #[error(transparent)]
    Recorder(#[from] RecorderFault),
}
