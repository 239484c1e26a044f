//! Per-target overrides read from target metadata.
//!
//! Every override has an allowed range. A value outside its range (or of the
//! wrong type) is ignored and the default applies, so a bad admin edit never
//! stops a target from being checked.

use anyhow::{Result, anyhow};
use serde_json::{Map, Value};
use std::ops::RangeInclusive;
use std::time::Duration;

pub const DEGRADED_THRESHOLD_KEY: &str = "degradedThresholdMs";
pub const TIMEOUT_KEY: &str = "timeoutMs";
pub const POLL_INTERVAL_KEY: &str = "pollIntervalSeconds";
pub const REQUEST_BODY_KEY: &str = "requestBody";

pub const DEGRADED_THRESHOLD_RANGE_MS: RangeInclusive<u64> = 100..=120_000;
pub const DEFAULT_DEGRADED_THRESHOLD_MS: u64 = 6_000;

pub const TIMEOUT_RANGE_MS: RangeInclusive<u64> = 1_000..=300_000;
pub const DEFAULT_TIMEOUT_MS: u64 = 45_000;

pub const POLL_INTERVAL_RANGE_SECONDS: RangeInclusive<u64> = 15..=3_600;

/// Resolved overrides for one target
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TargetSettings {
    pub degraded_threshold_ms: u64,
    pub timeout_ms: u64,
    /// `None` means the target follows the global interval
    pub poll_interval_seconds: Option<u64>,
}

impl Default for TargetSettings {
    fn default() -> Self {
        Self {
            degraded_threshold_ms: DEFAULT_DEGRADED_THRESHOLD_MS,
            timeout_ms: DEFAULT_TIMEOUT_MS,
            poll_interval_seconds: None,
        }
    }
}

impl TargetSettings {
    pub fn from_metadata(metadata: &Map<String, Value>) -> Self {
        let defaults = Self::default();

        let degraded_threshold_ms = read_u64(metadata, DEGRADED_THRESHOLD_KEY)
            .filter(|ms| validate_degraded_threshold(*ms).is_ok())
            .unwrap_or(defaults.degraded_threshold_ms);
        let timeout_ms = read_u64(metadata, TIMEOUT_KEY)
            .filter(|ms| validate_timeout(*ms).is_ok())
            .unwrap_or(defaults.timeout_ms);
        let poll_interval_seconds = read_u64(metadata, POLL_INTERVAL_KEY)
            .filter(|secs| validate_poll_interval(*secs).is_ok());

        Self { degraded_threshold_ms, timeout_ms, poll_interval_seconds }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Interval after which the target is due again.
    pub fn effective_interval(&self, global: Duration) -> Duration {
        self.poll_interval_seconds.map(Duration::from_secs).unwrap_or(global)
    }
}

/// Accepts JSON numbers and numeric strings.
fn read_u64(metadata: &Map<String, Value>, key: &str) -> Option<u64> {
    match metadata.get(key)? {
        Value::Number(n) => n.as_u64().or_else(|| n.as_f64().filter(|f| *f >= 0.0).map(|f| f as u64)),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn validate_range(value: u64, range: &RangeInclusive<u64>, what: &str, unit: &str) -> Result<()> {
    if range.contains(&value) {
        Ok(())
    } else {
        Err(anyhow!(
            "{} out of range: {}{} (allowed: {}{} to {}{})",
            what,
            value,
            unit,
            range.start(),
            unit,
            range.end(),
            unit
        ))
    }
}

pub fn validate_degraded_threshold(ms: u64) -> Result<()> {
    validate_range(ms, &DEGRADED_THRESHOLD_RANGE_MS, "Degraded threshold", "ms")
}

pub fn validate_timeout(ms: u64) -> Result<()> {
    validate_range(ms, &TIMEOUT_RANGE_MS, "Timeout", "ms")
}

pub fn validate_poll_interval(seconds: u64) -> Result<()> {
    validate_range(seconds, &POLL_INTERVAL_RANGE_SECONDS, "Poll interval", "s")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn metadata(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_defaults_without_metadata() {
        let settings = TargetSettings::from_metadata(&Map::new());
        assert_eq!(settings, TargetSettings::default());
        assert_eq!(settings.degraded_threshold_ms, 6_000);
        assert_eq!(settings.timeout_ms, 45_000);
        assert_eq!(settings.effective_interval(Duration::from_secs(60)), Duration::from_secs(60));
    }

    #[test]
    fn test_in_range_overrides_apply() {
        let settings = TargetSettings::from_metadata(&metadata(json!({
            "degradedThresholdMs": 2500,
            "timeoutMs": "10000",
            "pollIntervalSeconds": 20
        })));
        assert_eq!(settings.degraded_threshold_ms, 2_500);
        assert_eq!(settings.timeout(), Duration::from_secs(10));
        assert_eq!(settings.effective_interval(Duration::from_secs(60)), Duration::from_secs(20));
    }

    #[test]
    fn test_out_of_range_overrides_are_ignored() {
        let settings = TargetSettings::from_metadata(&metadata(json!({
            "degradedThresholdMs": 50,
            "timeoutMs": 999_999,
            "pollIntervalSeconds": 5
        })));
        assert_eq!(settings, TargetSettings::default());
    }

    #[test]
    fn test_wrong_types_are_ignored() {
        let settings = TargetSettings::from_metadata(&metadata(json!({
            "degradedThresholdMs": true,
            "timeoutMs": [1],
            "pollIntervalSeconds": "soon"
        })));
        assert_eq!(settings, TargetSettings::default());
    }

    #[test]
    fn test_range_edges() {
        assert!(validate_poll_interval(15).is_ok());
        assert!(validate_poll_interval(3_600).is_ok());
        assert!(validate_poll_interval(14).is_err());
        assert!(validate_timeout(1_000).is_ok());
        assert!(validate_timeout(300_001).is_err());
        assert!(validate_degraded_threshold(100).is_ok());
        assert!(validate_degraded_threshold(120_001).is_err());
    }
}
