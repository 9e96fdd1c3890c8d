//! Shared helpers for duration strings used by the config layer.

use std::time::Duration;

use crate::error::ConfigError;

/// Parse a duration string (e.g., "30s", "500ms", "1.5m", "1h") into a [`Duration`].
///
/// Supported formats:
/// - `Nms` - milliseconds (e.g., "500ms")
/// - `Ns` - seconds, fractional allowed (e.g., "1.5s")
/// - `Nm` - minutes (e.g., "5m")
/// - `Nh` - hours (e.g., "1h")
/// - Plain number - milliseconds (e.g., "1000")
///
/// Returns `None` if the string cannot be parsed or is negative.
pub fn parse_duration_str(s: &str) -> Option<Duration> {
    let s = s.trim();
    let (number, unit_ms) = if let Some(n) = s.strip_suffix("ms") {
        (n, 1.0)
    } else if let Some(n) = s.strip_suffix('s') {
        (n, 1_000.0)
    } else if let Some(n) = s.strip_suffix('m') {
        (n, 60_000.0)
    } else if let Some(n) = s.strip_suffix('h') {
        (n, 3_600_000.0)
    } else {
        (s, 1.0)
    };

    let value = number.trim().parse::<f64>().ok()?;
    let nanos = (value * unit_ms * 1_000_000.0).round();
    if !nanos.is_finite() || nanos < 0.0 || nanos > u64::MAX as f64 {
        return None;
    }
    Some(Duration::from_nanos(nanos as u64))
}

/// Parse a required duration field, naming the field in the error.
pub fn parse_duration_field(field: &str, s: &str) -> Result<Duration, ConfigError> {
    parse_duration_str(s).ok_or_else(|| ConfigError::InvalidDuration {
        field: field.to_string(),
        value: s.to_string(),
    })
}

/// Parse an optional duration field.
pub fn parse_optional_duration(field: &str, s: Option<&str>) -> Result<Option<Duration>, ConfigError> {
    s.map(|s| parse_duration_field(field, s)).transpose()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_milliseconds() {
        assert_eq!(parse_duration_str("500ms"), Some(Duration::from_millis(500)));
        assert_eq!(parse_duration_str("1000"), Some(Duration::from_millis(1000)));
    }

    #[test]
    fn test_parse_seconds_minutes_hours() {
        assert_eq!(parse_duration_str("30s"), Some(Duration::from_secs(30)));
        assert_eq!(parse_duration_str("1.5s"), Some(Duration::from_millis(1500)));
        assert_eq!(parse_duration_str("1m"), Some(Duration::from_secs(60)));
        assert_eq!(parse_duration_str("0.5m"), Some(Duration::from_secs(30)));
        assert_eq!(parse_duration_str("2h"), Some(Duration::from_secs(7200)));
    }

    #[test]
    fn test_parse_with_whitespace() {
        assert_eq!(parse_duration_str(" 20s "), Some(Duration::from_secs(20)));
    }

    #[test]
    fn test_parse_invalid() {
        assert_eq!(parse_duration_str("invalid"), None);
        assert_eq!(parse_duration_str("abc123"), None);
        assert_eq!(parse_duration_str("-5s"), None);
        assert_eq!(parse_duration_str(""), None);
    }

    #[test]
    fn test_parse_field_reports_name() {
        let err = parse_duration_field("think_time", "soon").unwrap_err();
        assert!(err.to_string().contains("think_time"));
        assert!(err.to_string().contains("soon"));
    }

    #[test]
    fn test_parse_optional_duration() {
        assert_eq!(parse_optional_duration("x", None).unwrap(), None);
        assert_eq!(
            parse_optional_duration("x", Some("2s")).unwrap(),
            Some(Duration::from_secs(2))
        );
        assert!(parse_optional_duration("x", Some("?")).is_err());
    }
}
