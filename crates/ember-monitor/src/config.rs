//! Monitor configuration.
//!
//! Loaded from TOML with every field optional; missing fields take the
//! defaults below. Durations are written the human way (`"100ms"`, `"2s"`,
//! `"1m"`), like byte sizes are in the server's config.
//!
//! ```toml
//! evaluation_interval = "100ms"
//! probe_timeout = "500ms"
//! downtime_policy = "majority"
//! seed_nodes = ["10.0.0.1:7001", "10.0.0.2:7002"]
//! ```

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::liveness::DowntimePolicy;
use crate::session::SessionOptions;
use crate::topology::NodeAddr;
use crate::MonitorError;

/// Parses a human-readable duration string.
///
/// Supports suffixes: ms, s, m, h. Plain numbers are seconds. Case
/// insensitive, surrounding whitespace ignored.
///
/// # Examples
///
/// - "250ms" → 250 milliseconds
/// - "2s" → 2 seconds
/// - "5" → 5 seconds
/// - "1m" → 60 seconds
pub fn parse_duration(input: &str) -> Result<Duration, String> {
    let input = input.trim();
    if input.is_empty() {
        return Err("empty duration string".into());
    }

    let lower = input.to_ascii_lowercase();

    let (num_str, millis_per_unit) = if let Some(n) = lower.strip_suffix("ms") {
        (n, 1)
    } else if let Some(n) = lower.strip_suffix('s') {
        (n, 1_000)
    } else if let Some(n) = lower.strip_suffix('m') {
        (n, 60_000)
    } else if let Some(n) = lower.strip_suffix('h') {
        (n, 3_600_000)
    } else {
        (lower.as_str(), 1_000)
    };

    let num: u64 = num_str
        .trim()
        .parse()
        .map_err(|_| format!("invalid duration: '{input}'"))?;

    num.checked_mul(millis_per_unit)
        .map(Duration::from_millis)
        .ok_or_else(|| format!("duration overflow: '{input}'"))
}

/// Formats a duration in the largest unit that represents it exactly.
///
/// Sub-millisecond precision is dropped.
pub fn format_duration(duration: Duration) -> String {
    let millis = duration.as_millis();
    if millis == 0 {
        return "0ms".into();
    }
    if millis % 3_600_000 == 0 {
        format!("{}h", millis / 3_600_000)
    } else if millis % 60_000 == 0 {
        format!("{}m", millis / 60_000)
    } else if millis % 1_000 == 0 {
        format!("{}s", millis / 1_000)
    } else {
        format!("{millis}ms")
    }
}

/// Serde adapter for durations written as human strings.
mod duration_str {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&super::format_duration(*value))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let raw = String::deserialize(deserializer)?;
        super::parse_duration(&raw).map_err(serde::de::Error::custom)
    }
}

/// Configuration of one monitoring run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MonitorConfig {
    /// Time between evaluation cycles.
    #[serde(with = "duration_str")]
    pub evaluation_interval: Duration,
    /// Bound on a single entity's probe. Expiry counts as a failure.
    #[serde(with = "duration_str")]
    pub probe_timeout: Duration,
    pub downtime_policy: DowntimePolicy,
    /// Time between periodic status summaries.
    #[serde(with = "duration_str")]
    pub status_report_interval: Duration,
    /// Time between topology queries.
    #[serde(with = "duration_str")]
    pub topology_interval: Duration,
    /// Reject snapshots that leave slots unassigned.
    pub require_full_coverage: bool,
    /// Probe replica nodes as well as masters.
    pub probe_replicas: bool,
    /// Probe slot ranges directly, in addition to nodes.
    pub probe_slot_ranges: bool,
    /// Nodes tracked from startup, before any topology is known.
    pub seed_nodes: Vec<NodeAddr>,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            evaluation_interval: Duration::from_millis(100),
            probe_timeout: Duration::from_millis(500),
            downtime_policy: DowntimePolicy::Strict,
            status_report_interval: Duration::from_secs(10),
            topology_interval: Duration::from_secs(1),
            require_full_coverage: true,
            probe_replicas: true,
            probe_slot_ranges: true,
            seed_nodes: Vec::new(),
        }
    }
}

impl MonitorConfig {
    /// Parses and validates a TOML document.
    pub fn from_toml_str(input: &str) -> Result<Self, MonitorError> {
        let config: MonitorConfig = toml::from_str(input)
            .map_err(|e| MonitorError::Configuration(format!("invalid config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Reads, parses and validates a TOML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, MonitorError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            MonitorError::Configuration(format!("failed to read {}: {e}", path.display()))
        })?;
        Self::from_toml_str(&content).map_err(|e| match e {
            MonitorError::Configuration(msg) => {
                MonitorError::Configuration(format!("{}: {msg}", path.display()))
            }
            other => other,
        })
    }

    pub fn to_toml(&self) -> Result<String, MonitorError> {
        toml::to_string_pretty(self)
            .map_err(|e| MonitorError::Configuration(format!("failed to serialize config: {e}")))
    }

    pub fn validate(&self) -> Result<(), MonitorError> {
        let intervals = [
            ("evaluation_interval", self.evaluation_interval),
            ("probe_timeout", self.probe_timeout),
            ("status_report_interval", self.status_report_interval),
            ("topology_interval", self.topology_interval),
        ];
        for (field, value) in intervals {
            if value.is_zero() {
                return Err(MonitorError::Configuration(format!(
                    "{field} must be greater than zero"
                )));
            }
        }

        for (i, addr) in self.seed_nodes.iter().enumerate() {
            if self.seed_nodes[..i].contains(addr) {
                return Err(MonitorError::Configuration(format!(
                    "seed node {addr} listed more than once"
                )));
            }
        }
        Ok(())
    }

    pub fn session_options(&self) -> SessionOptions {
        SessionOptions {
            policy: self.downtime_policy,
            require_full_coverage: self.require_full_coverage,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn parse_plain_seconds() {
        assert_eq!(parse_duration("5").unwrap(), Duration::from_secs(5));
    }

    #[test]
    fn parse_suffixes() {
        assert_eq!(parse_duration("250ms").unwrap(), Duration::from_millis(250));
        assert_eq!(parse_duration("2s").unwrap(), Duration::from_secs(2));
        assert_eq!(parse_duration("1m").unwrap(), Duration::from_secs(60));
        assert_eq!(parse_duration("1h").unwrap(), Duration::from_secs(3600));
    }

    #[test]
    fn parse_case_insensitive_and_trimmed() {
        assert_eq!(parse_duration(" 100MS ").unwrap(), Duration::from_millis(100));
        assert_eq!(parse_duration("3S").unwrap(), Duration::from_secs(3));
    }

    #[test]
    fn parse_rejects_garbage() {
        assert!(parse_duration("").is_err());
        assert!(parse_duration("fast").is_err());
        assert!(parse_duration("1.5s").is_err());
        assert!(parse_duration("-1s").is_err());
        assert!(parse_duration("99999999999999999h").is_err());
    }

    #[test]
    fn format_picks_largest_exact_unit() {
        assert_eq!(format_duration(Duration::from_millis(100)), "100ms");
        assert_eq!(format_duration(Duration::from_millis(1500)), "1500ms");
        assert_eq!(format_duration(Duration::from_secs(10)), "10s");
        assert_eq!(format_duration(Duration::from_secs(120)), "2m");
        assert_eq!(format_duration(Duration::from_secs(7200)), "2h");
        assert_eq!(format_duration(Duration::ZERO), "0ms");
    }

    #[test]
    fn empty_document_is_default() {
        assert_eq!(MonitorConfig::from_toml_str("").unwrap(), MonitorConfig::default());
    }

    #[test]
    fn partial_document_overrides_fields() {
        let config = MonitorConfig::from_toml_str(
            r#"
            evaluation_interval = "250ms"
            downtime_policy = "majority"
            seed_nodes = ["10.0.0.1:7001", "[::1]:7002"]
            "#,
        )
        .unwrap();
        assert_eq!(config.evaluation_interval, Duration::from_millis(250));
        assert_eq!(config.downtime_policy, DowntimePolicy::Majority);
        assert_eq!(config.probe_timeout, Duration::from_millis(500));
        assert_eq!(config.seed_nodes.len(), 2);
        assert_eq!(config.seed_nodes[1].port(), 7002);
        assert_eq!(config.session_options().policy, DowntimePolicy::Majority);
    }

    #[test]
    fn rejects_unknown_fields() {
        let err = MonitorConfig::from_toml_str("check_interval = \"1s\"").unwrap_err();
        assert!(matches!(err, MonitorError::Configuration(_)));
    }

    #[test]
    fn rejects_bad_values() {
        assert!(MonitorConfig::from_toml_str("probe_timeout = \"0ms\"").is_err());
        assert!(MonitorConfig::from_toml_str("downtime_policy = \"lenient\"").is_err());
        assert!(MonitorConfig::from_toml_str("seed_nodes = [\"nohost\"]").is_err());
        assert!(MonitorConfig::from_toml_str(
            "seed_nodes = [\"10.0.0.1:7001\", \"10.0.0.1:7001\"]"
        )
        .is_err());
    }

    #[test]
    fn toml_round_trip() {
        let config = MonitorConfig {
            evaluation_interval: Duration::from_millis(200),
            downtime_policy: DowntimePolicy::Majority,
            seed_nodes: vec!["10.0.0.1:7001".parse().unwrap()],
            ..MonitorConfig::default()
        };
        let text = config.to_toml().unwrap();
        assert!(text.contains("evaluation_interval = \"200ms\""));
        assert_eq!(MonitorConfig::from_toml_str(&text).unwrap(), config);
    }

    #[test]
    fn load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "topology_interval = \"2s\"").unwrap();
        writeln!(file, "require_full_coverage = false").unwrap();

        let config = MonitorConfig::from_file(file.path()).unwrap();
        assert_eq!(config.topology_interval, Duration::from_secs(2));
        assert!(!config.require_full_coverage);
    }

    #[test]
    fn missing_file_names_the_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent.toml");
        let err = MonitorConfig::from_file(&path).unwrap_err();
        assert!(err.to_string().contains("absent.toml"));
    }
}
