use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::bridge::{FixtureSource, RequestTemplate, TemplateScenario};
use crate::engine::http_client::HttpSettings;
use crate::engine::scheduler::{Schedule, Stage};
use crate::engine::{RunPlan, ThinkTimePolicy};
use crate::error::ConfigError;
use crate::stats::Threshold;
use crate::utils::{parse_duration_field, parse_optional_duration};

#[derive(Debug, Serialize, Deserialize, Clone, JsonSchema)]
pub struct ScheduleStep {
    pub duration: String,
    pub target: usize,
}

/// A threshold is either a bare expression or an expression with options.
#[derive(Debug, Serialize, Deserialize, Clone, JsonSchema)]
#[serde(untagged)]
pub enum ThresholdEntry {
    Expression(String),
    Detailed {
        threshold: String,
        #[serde(default, alias = "abortOnFail")]
        abort_on_fail: bool,
    },
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum FixtureFormat {
    /// One record per line
    Lines,
    /// A JSON array of records
    Json,
}

#[derive(Debug, Serialize, Deserialize, Clone, JsonSchema)]
pub struct FixtureConfig {
    /// File holding the records
    pub path: PathBuf,
    /// Record format (default: json for *.json files, lines otherwise)
    pub format: Option<FixtureFormat>,
}

impl FixtureConfig {
    pub fn source(&self, base: &Path) -> FixtureSource {
        let path = if self.path.is_absolute() {
            self.path.clone()
        } else {
            base.join(&self.path)
        };
        let format = self.format.unwrap_or_else(|| {
            match path.extension().and_then(|e| e.to_str()) {
                Some("json") => FixtureFormat::Json,
                _ => FixtureFormat::Lines,
            }
        });
        match format {
            FixtureFormat::Lines => FixtureSource::Lines(path),
            FixtureFormat::Json => FixtureSource::Json(path),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Default, JsonSchema)]
pub struct HttpConfig {
    /// Per-request timeout including the body read (default: "60s", "0" disables)
    pub timeout: Option<String>,
    /// Maximum idle connections per host (default: 2000)
    #[serde(alias = "poolSize")]
    pub pool_size: Option<usize>,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default, JsonSchema)]
pub struct Config {
    /// Ramping schedule (k6: stages)
    #[serde(alias = "schedule")]
    pub stages: Option<Vec<ScheduleStep>>,
    /// Pass/Fail criteria per metric (k6: thresholds)
    #[serde(alias = "criteria")]
    pub thresholds: Option<BTreeMap<String, Vec<ThresholdEntry>>>,
    /// Mark every threshold as abort-on-fail
    #[serde(alias = "abortOnFail")]
    pub abort_on_fail: Option<bool>,
    /// How often thresholds are checked during the run (default: the tick interval when any threshold aborts)
    #[serde(alias = "thresholdInterval")]
    pub threshold_interval: Option<String>,
    /// Pause between iterations of one worker (e.g., "1s")
    #[serde(alias = "thinkTime")]
    pub think_time: Option<String>,
    /// Let a stop request cut the think time short
    #[serde(alias = "interruptThinkTime")]
    pub interrupt_think_time: Option<bool>,
    /// Scheduler re-evaluation period (default: "1s")
    #[serde(alias = "tickInterval")]
    pub tick_interval: Option<String>,
    /// Graceful shutdown wait time; unset waits for every in-flight iteration
    #[serde(alias = "stop", alias = "gracefulStop")]
    pub graceful_stop: Option<String>,
    /// Fail the run when a threshold has no samples
    pub strict: Option<bool>,
    /// Disable `metric{tag:value}` sub-metrics to save memory
    #[serde(alias = "noTagTracking")]
    pub no_tag_tracking: Option<bool>,
    /// Shared read-only records
    pub fixtures: Option<FixtureConfig>,
    /// HTTP client settings
    pub http: Option<HttpConfig>,
    /// Request issued on every iteration
    pub request: Option<RequestTemplate>,
}

impl Config {
    /// Load a YAML or JSON file, chosen by extension.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");
        let parsed = if ext == "json" {
            serde_json::from_str(&content).map_err(|e| e.to_string())
        } else {
            serde_yaml::from_str(&content).map_err(|e| e.to_string())
        };
        parsed.map_err(|reason| ConfigError::Parse {
            path: path.to_path_buf(),
            reason,
        })
    }

    pub fn schedule(&self) -> Result<Schedule, ConfigError> {
        let steps = self.stages.as_deref().unwrap_or_default();
        let stages = steps
            .iter()
            .enumerate()
            .map(|(index, step)| {
                let duration = parse_duration_field(&format!("stages[{}].duration", index), &step.duration)?;
                Ok(Stage::new(duration, step.target))
            })
            .collect::<Result<Vec<_>, ConfigError>>()?;
        Schedule::new(stages)
    }

    pub fn parsed_thresholds(&self) -> Result<Vec<Threshold>, ConfigError> {
        let abort_all = self.abort_on_fail.unwrap_or(false);
        let mut out = Vec::new();
        for (metric, entries) in self.thresholds.iter().flatten() {
            for entry in entries {
                let (expression, abort) = match entry {
                    ThresholdEntry::Expression(e) => (e.as_str(), false),
                    ThresholdEntry::Detailed {
                        threshold,
                        abort_on_fail,
                    } => (threshold.as_str(), *abort_on_fail),
                };
                out.push(Threshold::parse(metric, expression)?.with_abort_on_fail(abort || abort_all));
            }
        }
        Ok(out)
    }

    /// Build the run plan. Relative fixture paths resolve against `base`.
    pub fn to_plan(&self, base: &Path) -> Result<RunPlan, ConfigError> {
        let schedule = self.schedule()?;
        let thresholds = self.parsed_thresholds()?;

        let tick_interval = parse_optional_duration("tick_interval", self.tick_interval.as_deref())?
            .unwrap_or(Duration::from_secs(1));
        if tick_interval.is_zero() {
            return Err(ConfigError::InvalidDuration {
                field: "tick_interval".to_string(),
                value: self.tick_interval.clone().unwrap_or_default(),
            });
        }
        let think_time = parse_optional_duration("think_time", self.think_time.as_deref())?.unwrap_or_default();
        let policy = if self.interrupt_think_time.unwrap_or(false) {
            ThinkTimePolicy::Interrupt
        } else {
            ThinkTimePolicy::Complete
        };
        let graceful_stop = parse_optional_duration("graceful_stop", self.graceful_stop.as_deref())?;
        let threshold_interval =
            match parse_optional_duration("threshold_interval", self.threshold_interval.as_deref())? {
                Some(interval) => Some(interval),
                None if thresholds.iter().any(|t| t.abort_on_fail) => Some(tick_interval),
                None => None,
            };

        let mut http = HttpSettings {
            workers: schedule.peak_target(),
            ..HttpSettings::default()
        };
        if let Some(cfg) = &self.http {
            if let Some(timeout) = parse_optional_duration("http.timeout", cfg.timeout.as_deref())? {
                http.timeout = (!timeout.is_zero()).then_some(timeout);
            }
            if let Some(pool_size) = cfg.pool_size {
                http.pool_size = pool_size;
            }
        }

        let mut plan = RunPlan::new(schedule)
            .with_thresholds(thresholds)
            .with_think_time(think_time, policy)
            .with_tick_interval(tick_interval)
            .with_graceful_stop(graceful_stop)
            .with_threshold_interval(threshold_interval)
            .with_strict(self.strict.unwrap_or(false));
        if let Some(fixtures) = &self.fixtures {
            plan = plan.with_fixtures(fixtures.source(base));
        }
        plan.http = http;
        plan.tagged_submetrics = !self.no_tag_tracking.unwrap_or(false);
        Ok(plan)
    }

    /// Compile the request template, if any.
    pub fn scenario(&self) -> Result<Option<TemplateScenario>, ConfigError> {
        let Some(template) = &self.request else {
            return Ok(None);
        };
        let scenario = template.compile()?;
        if scenario.uses_fixture() && self.fixtures.is_none() {
            return Err(ConfigError::InvalidTemplate(
                "request uses {{fixture}} but no 'fixtures' source is configured".to_string(),
            ));
        }
        Ok(Some(scenario))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use schemars::schema_for;
    use std::io::Write;

    const LIST_POSTS: &str = r#"
stages:
  - duration: "20s"
    target: 1000
  - duration: "1m"
    target: 800
  - duration: "20s"
    target: 0
thresholds:
  http_req_failed: ["rate<0.01"]
  http_req_duration: ["p(95)<200"]
think_time: "1s"
fixtures:
  path: pressure_test_tokens.txt
request:
  url: "http://127.0.0.1:4333/v3/contents/post/list?page={{rand:1:10}}"
  headers:
    TOKEN: "{{fixture}}"
  expect_status: 200
  expect_json:
    code: 0
"#;

    #[test]
    fn test_config_schema() {
        let schema = schema_for!(Config);
        let schema_json = serde_json::to_string(&schema).unwrap();
        assert!(schema_json.contains("stages"));
        assert!(schema_json.contains("thresholds"));
        assert!(schema_json.contains("think_time"));
    }

    #[test]
    fn test_full_config_to_plan() {
        let config: Config = serde_yaml::from_str(LIST_POSTS).unwrap();
        let plan = config.to_plan(Path::new("/data")).unwrap();

        assert_eq!(plan.schedule.stages().len(), 3);
        assert_eq!(plan.schedule.total_duration(), Duration::from_secs(100));
        assert_eq!(plan.thresholds.len(), 2);
        assert_eq!(plan.think_time, Duration::from_secs(1));
        assert_eq!(plan.think_time_policy, ThinkTimePolicy::Complete);
        assert_eq!(plan.tick_interval, Duration::from_secs(1));
        assert_eq!(plan.graceful_stop, None);
        assert_eq!(plan.threshold_interval, None);
        assert_eq!(plan.http.workers, 1000);
        match plan.fixtures {
            Some(FixtureSource::Lines(path)) => assert_eq!(path, Path::new("/data/pressure_test_tokens.txt")),
            other => panic!("unexpected fixtures: {:?}", other),
        }

        let scenario = config.scenario().unwrap().unwrap();
        assert!(scenario.uses_fixture());
    }

    #[test]
    fn test_aliases() {
        let yaml = r#"
schedule:
  - duration: "10s"
    target: 5
criteria:
  checks:
    - "rate > 0.95"
stop: "30s"
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        let plan = config.to_plan(Path::new(".")).unwrap();
        assert_eq!(plan.schedule.peak_target(), 5);
        assert_eq!(plan.thresholds[0].metric, "checks");
        assert_eq!(plan.graceful_stop, Some(Duration::from_secs(30)));
    }

    #[test]
    fn test_detailed_thresholds_enable_periodic_checks() {
        let json = r#"{
            "stages": [{"duration": "10s", "target": 5}],
            "thresholds": {
                "http_req_duration": [
                    "avg<100",
                    {"threshold": "p(99)<300", "abortOnFail": true}
                ]
            },
            "tickInterval": "500ms"
        }"#;
        let config: Config = serde_json::from_str(json).unwrap();
        let plan = config.to_plan(Path::new(".")).unwrap();
        assert!(!plan.thresholds[0].abort_on_fail);
        assert!(plan.thresholds[1].abort_on_fail);
        assert_eq!(plan.threshold_interval, Some(Duration::from_millis(500)));
    }

    #[test]
    fn test_global_abort_on_fail() {
        let yaml = r#"
stages: [{duration: "1s", target: 1}]
thresholds:
  http_req_failed: ["rate<0.01"]
abort_on_fail: true
threshold_interval: "5s"
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        let plan = config.to_plan(Path::new(".")).unwrap();
        assert!(plan.thresholds[0].abort_on_fail);
        assert_eq!(plan.threshold_interval, Some(Duration::from_secs(5)));
    }

    #[test]
    fn test_invalid_values_are_reported() {
        let config: Config = serde_yaml::from_str("stages: []").unwrap();
        assert!(matches!(config.to_plan(Path::new(".")), Err(ConfigError::NoStages)));

        let config: Config =
            serde_yaml::from_str("stages: [{duration: \"soon\", target: 1}]").unwrap();
        let err = config.to_plan(Path::new(".")).unwrap_err();
        assert!(err.to_string().contains("stages[0].duration"));

        let yaml = r#"
stages: [{duration: "1s", target: 1}]
thresholds:
  http_req_duration: ["p95 about 200"]
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert!(matches!(
            config.to_plan(Path::new(".")),
            Err(ConfigError::InvalidThreshold { .. })
        ));

        let config: Config =
            serde_yaml::from_str("stages: [{duration: \"1s\", target: 1}]\ntick_interval: \"0s\"").unwrap();
        assert!(config.to_plan(Path::new(".")).is_err());
    }

    #[test]
    fn test_fixture_placeholder_requires_source() {
        let yaml = r#"
stages: [{duration: "1s", target: 1}]
request:
  url: "http://localhost/"
  headers:
    TOKEN: "{{fixture}}"
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert!(matches!(config.scenario(), Err(ConfigError::InvalidTemplate(_))));
    }

    #[test]
    fn test_http_settings() {
        let yaml = r#"
stages: [{duration: "1s", target: 1}]
http:
  timeout: "0"
  poolSize: 16
interrupt_think_time: true
no_tag_tracking: true
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        let plan = config.to_plan(Path::new(".")).unwrap();
        assert_eq!(plan.http.timeout, None);
        assert_eq!(plan.http.pool_size, 16);
        assert_eq!(plan.think_time_policy, ThinkTimePolicy::Interrupt);
        assert!(!plan.tagged_submetrics);
    }

    #[test]
    fn test_fixture_format_inference() {
        let json = FixtureConfig {
            path: "users.json".into(),
            format: None,
        };
        assert!(matches!(json.source(Path::new("/x")), FixtureSource::Json(_)));
        let forced = FixtureConfig {
            path: "users.json".into(),
            format: Some(FixtureFormat::Lines),
        };
        assert!(matches!(forced.source(Path::new("/x")), FixtureSource::Lines(_)));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        file.write_all(LIST_POSTS.as_bytes()).unwrap();
        let config = Config::load(file.path()).unwrap();
        assert!(config.request.is_some());

        let mut bad = tempfile::Builder::new().suffix(".json").tempfile().unwrap();
        bad.write_all(b"{ not json").unwrap();
        assert!(matches!(Config::load(bad.path()), Err(ConfigError::Parse { .. })));
        assert!(matches!(
            Config::load(Path::new("/nonexistent/barrage.yaml")),
            Err(ConfigError::Read { .. })
        ));
    }
}
