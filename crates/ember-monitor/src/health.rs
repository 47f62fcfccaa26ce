//! Per-entity downtime ledger.
//!
//! Every monitored entity (node or slot range) carries a `HealthState`: a
//! two-state machine that is either up, or down since a known instant. Each
//! completed outage is appended to an ordered ledger of `DowntimeEvent`s.
//!
//! ```text
//!        verdict=false (first only)
//!   UP ──────────────────────────────▶ DOWN
//!    ▲                                   │
//!    └───────────────────────────────────┘
//!     verdict=true | ownership moved | owner recovered | removed | shutdown
//! ```
//!
//! The up/down flag is derived from `downtime_start`, so "down iff a start
//! is set" holds by construction.

use std::time::{Duration, Instant};

use serde::Serialize;

use crate::NodeAddr;

/// Why an outage ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DowntimeContext {
    /// A liveness verdict came back up.
    Probe,
    /// Slot range ownership moved to another node while the range was down.
    Failover {
        old_owner: NodeAddr,
        new_owner: NodeAddr,
    },
    /// The range's owner came back without the range changing hands.
    OwnerRecovered { owner: NodeAddr },
    /// The slot range disappeared from the topology while down.
    Removed,
    /// The session shut down while the entity was still down.
    Shutdown,
}

impl std::fmt::Display for DowntimeContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DowntimeContext::Probe => write!(f, "probe"),
            DowntimeContext::Failover {
                old_owner,
                new_owner,
            } => write!(f, "failover {old_owner} -> {new_owner}"),
            DowntimeContext::OwnerRecovered { owner } => write!(f, "owner {owner} recovered"),
            DowntimeContext::Removed => write!(f, "removed from topology"),
            DowntimeContext::Shutdown => write!(f, "shutdown"),
        }
    }
}

/// A closed interval during which an entity was continuously down.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DowntimeEvent {
    pub start: Instant,
    pub end: Instant,
    pub duration: Duration,
    pub context: DowntimeContext,
    /// Distinct probe names that failed during the outage, in first-seen order.
    pub failed_probes: Vec<String>,
}

/// A state change produced by the ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// UP -> DOWN at the given instant.
    Down { at: Instant },
    /// DOWN -> UP at the given instant after `downtime`.
    Up { at: Instant, downtime: Duration },
}

impl Transition {
    pub fn is_down(&self) -> bool {
        matches!(self, Transition::Down { .. })
    }
}

/// Health and downtime ledger of one entity.
#[derive(Debug, Clone, Default)]
pub struct HealthState {
    downtime_start: Option<Instant>,
    total_downtime: Duration,
    events: Vec<DowntimeEvent>,
    consecutive_failures: u32,
    /// Failed probe names accumulated over the current outage.
    outage_probes: Vec<String>,
    /// Failed probe names of the most recent failing verdict.
    last_failed_probes: Vec<String>,
}

impl HealthState {
    /// Creates a state that starts up.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a state that is already down since `at`.
    ///
    /// Used for entities whose very first observation is a failure, so they
    /// are accounted from the instant they were first seen.
    pub fn down_since(at: Instant) -> Self {
        Self {
            downtime_start: Some(at),
            ..Self::default()
        }
    }

    pub fn is_up(&self) -> bool {
        self.downtime_start.is_none()
    }

    pub fn downtime_start(&self) -> Option<Instant> {
        self.downtime_start
    }

    /// Sum of all completed downtime intervals.
    pub fn total_downtime(&self) -> Duration {
        self.total_downtime
    }

    /// Completed downtime plus the interval in progress, if any.
    pub fn total_downtime_at(&self, now: Instant) -> Duration {
        self.total_downtime + self.current_downtime(now)
    }

    /// Length of the outage in progress, computed live. Zero when up.
    pub fn current_downtime(&self, now: Instant) -> Duration {
        self.downtime_start
            .map(|start| now.saturating_duration_since(start))
            .unwrap_or_default()
    }

    pub fn events(&self) -> &[DowntimeEvent] {
        &self.events
    }

    pub fn last_event(&self) -> Option<&DowntimeEvent> {
        self.events.last()
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    pub fn last_failed_probes(&self) -> &[String] {
        &self.last_failed_probes
    }

    /// Recomputes the total from the ledger instead of the running sum.
    pub fn recomputed_total(&self) -> Duration {
        self.events.iter().map(|e| e.duration).sum()
    }

    pub fn longest_downtime(&self) -> Option<Duration> {
        self.events.iter().map(|e| e.duration).max()
    }

    pub fn shortest_downtime(&self) -> Option<Duration> {
        self.events.iter().map(|e| e.duration).min()
    }

    /// Mean completed outage length, zero with no events.
    pub fn average_downtime(&self) -> Duration {
        match u32::try_from(self.events.len()) {
            Ok(0) | Err(_) => Duration::ZERO,
            Ok(n) => self.total_downtime / n,
        }
    }

    /// Applies one liveness verdict.
    ///
    /// `failed_probes` names the probes that failed in this cycle; it is only
    /// consulted for a down verdict.
    pub fn apply_verdict(
        &mut self,
        up: bool,
        now: Instant,
        failed_probes: &[String],
    ) -> Option<Transition> {
        if up {
            self.consecutive_failures = 0;
            self.last_failed_probes.clear();
            self.recover(now, DowntimeContext::Probe)
        } else {
            self.consecutive_failures = self.consecutive_failures.saturating_add(1);
            self.last_failed_probes = failed_probes.to_vec();
            for probe in failed_probes {
                if !self.outage_probes.contains(probe) {
                    self.outage_probes.push(probe.clone());
                }
            }
            self.mark_down(now)
        }
    }

    /// UP -> DOWN. A no-op when already down.
    pub fn mark_down(&mut self, now: Instant) -> Option<Transition> {
        if self.downtime_start.is_some() {
            return None;
        }
        self.downtime_start = Some(now);
        Some(Transition::Down { at: now })
    }

    /// DOWN -> UP, closing the outage with `context`. A no-op when up.
    ///
    /// An outage that closes at the instant it opened leaves no event, so
    /// every recorded event has `start < end`.
    pub fn recover(&mut self, now: Instant, context: DowntimeContext) -> Option<Transition> {
        let start = self.downtime_start.take()?;
        let failed_probes = std::mem::take(&mut self.outage_probes);
        let end = now.max(start);
        let duration = end - start;

        if !duration.is_zero() {
            self.events.push(DowntimeEvent {
                start,
                end,
                duration,
                context,
                failed_probes,
            });
            self.total_downtime += duration;
        }
        debug_assert_eq!(self.total_downtime, self.recomputed_total());

        Some(Transition::Up {
            at: end,
            downtime: duration,
        })
    }
}
