use anyhow::Result;
use std::path::Path;

use crate::bridge::FixtureSet;
use crate::cli::config::Config;

/// Validate a run configuration without generating any load.
/// Checks for:
/// - Parse errors
/// - Stage, threshold and duration validity
/// - Request template and fixture availability
pub fn run_validate(config_path: &Path) -> Result<()> {
    println!("Validating {}...", config_path.display());

    let config = match Config::load(config_path) {
        Ok(config) => config,
        Err(e) => {
            println!("  ✗ Config file invalid: {}", e);
            return Err(e.into());
        }
    };
    println!("  ✓ Config file parsed");

    let base = config_path.parent().unwrap_or_else(|| Path::new("."));
    let plan = match config.to_plan(base) {
        Ok(plan) => plan,
        Err(e) => {
            println!("  ✗ Validation failed: {}", e);
            return Err(e.into());
        }
    };
    println!("  ✓ Configuration valid");
    println!(
        "    stages: {} stage(s), {:?} total, peak {} workers",
        plan.schedule.stages().len(),
        plan.schedule.total_duration(),
        plan.schedule.peak_target()
    );
    if !plan.thresholds.is_empty() {
        println!("    thresholds: {}", plan.thresholds.len());
    }

    match config.scenario() {
        Ok(Some(scenario)) => {
            println!("  ✓ Request template compiled");
            if scenario.uses_fixture() {
                println!("    uses {{{{fixture}}}}");
            }
        }
        Ok(None) => println!("  ⚠ No 'request' found (nothing to run)"),
        Err(e) => {
            println!("  ✗ Request template invalid: {}", e);
            return Err(e.into());
        }
    }

    if let Some(source) = &plan.fixtures {
        match FixtureSet::load(source) {
            Ok(set) => println!("  ✓ Fixtures loaded: {} record(s)", set.len()),
            Err(e) => {
                println!("  ✗ Fixtures unavailable: {}", e);
                return Err(e.into());
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    const VALID_CONFIG: &str = r#"
stages:
  - duration: "10s"
    target: 5
thresholds:
  http_req_duration: ["p(95)<200"]
fixtures:
  path: tokens.txt
request:
  url: "http://localhost/posts"
  headers:
    TOKEN: "{{fixture}}"
"#;

    #[test]
    fn test_validate_valid_config() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("barrage.yaml");
        fs::write(&config_path, VALID_CONFIG).unwrap();
        fs::write(temp_dir.path().join("tokens.txt"), "a\nb\n").unwrap();

        assert!(run_validate(&config_path).is_ok());
    }

    #[test]
    fn test_validate_missing_fixture_file() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("barrage.yaml");
        fs::write(&config_path, VALID_CONFIG).unwrap();

        assert!(run_validate(&config_path).is_err());
    }

    #[test]
    fn test_validate_without_request() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("barrage.json");
        fs::write(&config_path, r#"{"stages": [{"duration": "1s", "target": 1}]}"#).unwrap();

        // A config without a request is still well-formed.
        assert!(run_validate(&config_path).is_ok());
    }

    #[test]
    fn test_validate_missing_file() {
        let path = Path::new("/nonexistent/barrage.yaml");
        assert!(run_validate(path).is_err());
    }

    #[test]
    fn test_validate_invalid_config() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("barrage.yaml");
        fs::write(&config_path, "stages: [yaml: content").unwrap();
        assert!(run_validate(&config_path).is_err());

        fs::write(&config_path, "stages: [{duration: \"1s\", target: 1}]\nthresholds:\n  checks: [\"p(95) ~ 3\"]\n")
            .unwrap();
        assert!(run_validate(&config_path).is_err());
    }
}
