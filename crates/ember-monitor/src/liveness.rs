//! Liveness evaluation: turns raw probe outcomes into one up/down verdict.
//!
//! Probing itself (PING, read/write round trips, CLUSTER INFO) happens in the
//! client. This module only sees the final outcome of each probe and is a
//! pure function of them.

use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::{EntityId, MonitorError};

/// How many failing probes make an entity "down".
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DowntimePolicy {
    /// Any single failure means down.
    #[default]
    Strict,
    /// Down once more than half of the probes fail. Exactly half failing
    /// still counts as up.
    Majority,
}

impl FromStr for DowntimePolicy {
    type Err = MonitorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "strict" => Ok(DowntimePolicy::Strict),
            "majority" => Ok(DowntimePolicy::Majority),
            _ => Err(MonitorError::Configuration(format!(
                "unknown downtime policy '{s}'. valid options: strict, majority"
            ))),
        }
    }
}

impl std::fmt::Display for DowntimePolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DowntimePolicy::Strict => write!(f, "strict"),
            DowntimePolicy::Majority => write!(f, "majority"),
        }
    }
}

/// Final result of one probe in one evaluation cycle.
///
/// A probe that timed out is a failure; there is no "unknown".
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeOutcome {
    pub name: String,
    pub success: bool,
}

impl ProbeOutcome {
    pub fn new(name: impl Into<String>, success: bool) -> Self {
        Self {
            name: name.into(),
            success,
        }
    }

    pub fn passed(name: impl Into<String>) -> Self {
        Self::new(name, true)
    }

    pub fn failed(name: impl Into<String>) -> Self {
        Self::new(name, false)
    }
}

impl From<Result<(), MonitorError>> for ProbeOutcome {
    /// Converts a client result; failures are named after the failing probe.
    fn from(result: Result<(), MonitorError>) -> Self {
        match result {
            Ok(()) => ProbeOutcome::passed("probe"),
            Err(MonitorError::ProbeFailure { probe, .. }) => ProbeOutcome::failed(probe),
            Err(_) => ProbeOutcome::failed("probe"),
        }
    }
}

/// Decides the verdict for one cycle. `true` means up.
///
/// An empty outcome list is a down verdict: without a single successful
/// probe there is no evidence the entity is reachable.
pub fn evaluate(policy: DowntimePolicy, outcomes: &[ProbeOutcome]) -> bool {
    if outcomes.is_empty() {
        return false;
    }
    let failed = outcomes.iter().filter(|o| !o.success).count();
    match policy {
        DowntimePolicy::Strict => failed == 0,
        DowntimePolicy::Majority => failed <= outcomes.len() / 2,
    }
}

/// Names of the failed probes, in order.
pub fn failed_probes(outcomes: &[ProbeOutcome]) -> Vec<String> {
    outcomes
        .iter()
        .filter(|o| !o.success)
        .map(|o| o.name.clone())
        .collect()
}

/// Evaluator bound to the policy chosen at session configuration.
#[derive(Debug, Clone, Copy, Default)]
pub struct LivenessEvaluator {
    policy: DowntimePolicy,
}

impl LivenessEvaluator {
    pub fn new(policy: DowntimePolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> DowntimePolicy {
        self.policy
    }

    pub fn evaluate(&self, entity: &EntityId, outcomes: &[ProbeOutcome]) -> bool {
        let verdict = evaluate(self.policy, outcomes);
        trace!(
            "{entity}: {} probes, {} failed, verdict {}",
            outcomes.len(),
            outcomes.iter().filter(|o| !o.success).count(),
            if verdict { "up" } else { "down" }
        );
        verdict
    }
}
