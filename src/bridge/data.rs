use rand::Rng;
use serde_json::Value as JsonValue;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::error::FixtureLoadError;

/// Where fixture records come from.
#[derive(Debug, Clone)]
pub enum FixtureSource {
    /// One record per line, blank lines skipped. Each line becomes a JSON string.
    Lines(PathBuf),
    /// A JSON array; each element is one record.
    Json(PathBuf),
    /// Records supplied in memory.
    Inline(Vec<JsonValue>),
}

impl FixtureSource {
    fn describe(&self) -> String {
        match self {
            FixtureSource::Lines(path) | FixtureSource::Json(path) => path.display().to_string(),
            FixtureSource::Inline(_) => "<inline>".to_string(),
        }
    }
}

/// Read-only records shared by every worker.
///
/// Cloning is a reference count bump; there is no way to mutate the records
/// once loaded.
#[derive(Debug, Clone)]
pub struct FixtureSet {
    data: Arc<[JsonValue]>,
}

impl FixtureSet {
    /// Load all records from `source`. Zero records is an error.
    pub fn load(source: &FixtureSource) -> Result<Self, FixtureLoadError> {
        let records = match source {
            FixtureSource::Lines(path) => read_lines(path)?,
            FixtureSource::Json(path) => read_json(path)?,
            FixtureSource::Inline(values) => values.clone(),
        };
        if records.is_empty() {
            return Err(FixtureLoadError::Empty {
                source_name: source.describe(),
            });
        }
        tracing::debug!(source = %source.describe(), records = records.len(), "fixtures loaded");
        Ok(Self { data: records.into() })
    }

    /// Set used when no fixture source is configured.
    pub fn empty() -> Self {
        Self {
            data: Arc::from(Vec::new()),
        }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&JsonValue> {
        self.data.get(index)
    }

    pub fn iter(&self) -> impl Iterator<Item = &JsonValue> {
        self.data.iter()
    }

    /// Uniformly random record, `None` for an empty set.
    pub fn random(&self) -> Option<&JsonValue> {
        if self.data.is_empty() {
            return None;
        }
        let idx = rand::thread_rng().gen_range(0..self.data.len());
        self.data.get(idx)
    }

    /// Random record rendered as text: strings as-is, anything else as JSON.
    pub fn random_str(&self) -> Option<String> {
        self.random().map(render)
    }

    /// Both handles point at the same allocation.
    pub fn shares_storage_with(&self, other: &FixtureSet) -> bool {
        Arc::ptr_eq(&self.data, &other.data)
    }
}

pub(crate) fn render(value: &JsonValue) -> String {
    match value {
        JsonValue::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn read_to_string(path: &Path) -> Result<String, FixtureLoadError> {
    std::fs::read_to_string(path).map_err(|source| FixtureLoadError::Unreadable {
        path: path.to_path_buf(),
        source,
    })
}

fn read_lines(path: &Path) -> Result<Vec<JsonValue>, FixtureLoadError> {
    let content = read_to_string(path)?;
    Ok(content
        .split('\n')
        .map(|line| line.trim_end_matches('\r'))
        .filter(|line| !line.trim().is_empty())
        .map(|line| JsonValue::String(line.to_string()))
        .collect())
}

fn read_json(path: &Path) -> Result<Vec<JsonValue>, FixtureLoadError> {
    let content = read_to_string(path)?;
    let value: JsonValue =
        serde_json::from_str(&content).map_err(|e| FixtureLoadError::Malformed {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
    match value {
        JsonValue::Array(items) => Ok(items),
        other => Err(FixtureLoadError::Malformed {
            path: path.to_path_buf(),
            reason: format!("expected a JSON array, found {}", json_type(&other)),
        }),
    }
}

fn json_type(value: &JsonValue) -> &'static str {
    match value {
        JsonValue::Null => "null",
        JsonValue::Bool(_) => "boolean",
        JsonValue::Number(_) => "number",
        JsonValue::String(_) => "string",
        JsonValue::Array(_) => "array",
        JsonValue::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn temp_file(content: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_load_lines_skips_blank_lines() {
        let file = temp_file("tok-a\r\n\ntok-b\n   \ntok-c");
        let set = FixtureSet::load(&FixtureSource::Lines(file.path().to_path_buf())).unwrap();
        assert_eq!(set.len(), 3);
        assert_eq!(set.get(0), Some(&json!("tok-a")));
        assert_eq!(set.get(2), Some(&json!("tok-c")));
    }

    #[test]
    fn test_load_json_array() {
        let file = temp_file(r#"[{"id": 1}, {"id": 2}]"#);
        let set = FixtureSet::load(&FixtureSource::Json(file.path().to_path_buf())).unwrap();
        assert_eq!(set.len(), 2);
        assert_eq!(set.get(1).unwrap()["id"], 2);
    }

    #[test]
    fn test_empty_source_is_an_error() {
        let file = temp_file("\n\n");
        let err = FixtureSet::load(&FixtureSource::Lines(file.path().to_path_buf())).unwrap_err();
        assert!(matches!(err, FixtureLoadError::Empty { .. }));

        let err = FixtureSet::load(&FixtureSource::Inline(vec![])).unwrap_err();
        assert!(matches!(err, FixtureLoadError::Empty { .. }));
    }

    #[test]
    fn test_missing_file_is_unreadable() {
        let err = FixtureSet::load(&FixtureSource::Lines("/nonexistent/tokens.txt".into())).unwrap_err();
        assert!(matches!(err, FixtureLoadError::Unreadable { .. }));
    }

    #[test]
    fn test_json_must_be_an_array() {
        let file = temp_file(r#"{"id": 1}"#);
        let err = FixtureSet::load(&FixtureSource::Json(file.path().to_path_buf())).unwrap_err();
        match err {
            FixtureLoadError::Malformed { reason, .. } => assert!(reason.contains("object")),
            other => panic!("unexpected error: {other}"),
        }

        let file = temp_file("not json");
        let err = FixtureSet::load(&FixtureSource::Json(file.path().to_path_buf())).unwrap_err();
        assert!(matches!(err, FixtureLoadError::Malformed { .. }));
    }

    #[test]
    fn test_clones_share_storage() {
        let set = FixtureSet::load(&FixtureSource::Inline(vec![json!("a"), json!("b")])).unwrap();
        let clone = set.clone();
        assert!(set.shares_storage_with(&clone));
    }

    #[test]
    fn test_random_pick() {
        let set = FixtureSet::load(&FixtureSource::Inline(vec![json!("only"), json!(7)])).unwrap();
        for _ in 0..20 {
            let s = set.random_str().unwrap();
            assert!(s == "only" || s == "7");
        }
        assert!(FixtureSet::empty().random().is_none());
    }
}
