//! Error types for monitoring operations.

use crate::EntityId;

/// Errors that can occur while monitoring a cluster.
///
/// None of these are fatal to the monitor. Each one either downgrades an
/// entity to "down" or causes the current cycle to be skipped, and is
/// reflected in a ledger transition or a session counter.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MonitorError {
    /// A single probe failed. Feeds the liveness evaluator as a failure.
    #[error("probe '{probe}' failed: {reason}")]
    ProbeFailure { probe: String, reason: String },

    /// The control-plane topology query could not be completed.
    #[error("cluster topology unavailable: {0}")]
    TopologyUnavailable(String),

    /// A snapshot with overlapping or missing slot coverage.
    #[error("malformed topology snapshot: {0}")]
    MalformedSnapshot(String),

    /// The entity is not tracked by the session.
    #[error("entity {0} is not tracked")]
    UnknownEntity(EntityId),

    /// A node address that is not `host:port`.
    #[error("invalid node address '{0}'")]
    InvalidAddress(String),

    /// Configuration error.
    #[error("invalid monitor configuration: {0}")]
    Configuration(String),
}

impl MonitorError {
    /// Returns true if this error means the current cycle should be skipped
    /// rather than applied.
    pub fn skips_cycle(&self) -> bool {
        matches!(
            self,
            MonitorError::TopologyUnavailable(_) | MonitorError::MalformedSnapshot(_)
        )
    }

    /// Creates a probe failure error.
    pub fn probe(probe: impl Into<String>, reason: impl Into<String>) -> Self {
        MonitorError::ProbeFailure {
            probe: probe.into(),
            reason: reason.into(),
        }
    }

    /// Creates a malformed snapshot error.
    pub fn malformed(reason: impl Into<String>) -> Self {
        MonitorError::MalformedSnapshot(reason.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::SlotRange;

    #[test]
    fn skip_classification() {
        assert!(MonitorError::TopologyUnavailable("refused".into()).skips_cycle());
        assert!(MonitorError::malformed("overlap").skips_cycle());
        assert!(!MonitorError::probe("ping", "timeout").skips_cycle());
    }

    #[test]
    fn display_formats() {
        let err = MonitorError::probe("ping", "connection refused");
        assert_eq!(err.to_string(), "probe 'ping' failed: connection refused");

        let err = MonitorError::UnknownEntity(EntityId::Range(SlotRange::new(0, 99)));
        assert_eq!(err.to_string(), "entity slots 0-99 is not tracked");
    }
}
