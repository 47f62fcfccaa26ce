//! The monitoring session: one owned value holding all monitor state.
//!
//! A session is created once when monitoring starts, mutated by every
//! evaluation cycle and topology refresh, read through point-in-time
//! reports, and closed at shutdown. Every operation takes the session
//! explicitly; there is no ambient state.

use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::health::{DowntimeContext, DowntimeEvent, HealthState, Transition};
use crate::liveness::{failed_probes, DowntimePolicy, LivenessEvaluator, ProbeOutcome};
use crate::reconcile::{self, ChangeSet};
use crate::registry::{EntityId, NodeEntity, Registry, SlotRangeEntity};
use crate::topology::{ClusterSnapshot, NodeAddr, NodeRole};
use crate::uptime::SessionReport;
use crate::MonitorError;

/// Settings fixed for the lifetime of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionOptions {
    pub policy: DowntimePolicy,
    /// Reject snapshots that leave any slot unassigned.
    pub require_full_coverage: bool,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            policy: DowntimePolicy::Strict,
            require_full_coverage: true,
        }
    }
}

/// Bookkeeping for cycles that did not produce a normal result.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SessionCounters {
    /// Verdicts applied.
    pub verdicts: u64,
    /// Verdicts that came back down.
    pub down_verdicts: u64,
    /// Evaluation cycles run by the driver.
    pub probe_cycles: u64,
    /// Individual probe outcomes evaluated.
    pub probes_run: u64,
    /// Individual probe outcomes that failed.
    pub probes_failed: u64,
    /// Topology refreshes skipped because the query failed.
    pub skipped_topology_cycles: u64,
    /// Snapshots rejected as malformed.
    pub rejected_snapshots: u64,
    /// Probe tasks that died before producing a result.
    pub lost_probes: u64,
}

/// All state of one monitoring run.
#[derive(Debug, Clone)]
pub struct MonitoringSession {
    start_time: Instant,
    evaluator: LivenessEvaluator,
    require_full_coverage: bool,
    shutdown_at: Option<Instant>,
    pub(crate) registry: Registry,
    /// Ranges dropped from the topology, kept for their recorded downtime.
    pub(crate) retired_ranges: Vec<SlotRangeEntity>,
    pub(crate) topology_change_count: u64,
    pub(crate) counters: SessionCounters,
}

impl MonitoringSession {
    pub fn new(start_time: Instant, options: SessionOptions) -> Self {
        Self {
            start_time,
            evaluator: LivenessEvaluator::new(options.policy),
            require_full_coverage: options.require_full_coverage,
            shutdown_at: None,
            registry: Registry::new(),
            retired_ranges: Vec::new(),
            topology_change_count: 0,
            counters: SessionCounters::default(),
        }
    }

    pub fn start_time(&self) -> Instant {
        self.start_time
    }

    /// The instant `shutdown` was called, if it was.
    pub fn shutdown_at(&self) -> Option<Instant> {
        self.shutdown_at
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn retired_ranges(&self) -> &[SlotRangeEntity] {
        &self.retired_ranges
    }

    pub fn policy(&self) -> DowntimePolicy {
        self.evaluator.policy()
    }

    pub fn require_full_coverage(&self) -> bool {
        self.require_full_coverage
    }

    pub fn topology_change_count(&self) -> u64 {
        self.topology_change_count
    }

    pub fn counters(&self) -> SessionCounters {
        self.counters
    }

    /// Registers a startup node before any topology is known.
    ///
    /// Seeds are assumed to be masters until the first snapshot says
    /// otherwise. Returns false if the node was already tracked.
    pub fn register_seed_node(&mut self, addr: NodeAddr) -> bool {
        if self.registry.node(&addr).is_some() {
            return false;
        }
        info!("tracking seed node {addr}");
        self.registry
            .insert_node(NodeEntity::new(addr, NodeRole::Master));
        true
    }

    /// Evaluates raw probe outcomes for `id` and applies the verdict.
    pub fn apply_probe_results(
        &mut self,
        id: &EntityId,
        outcomes: &[ProbeOutcome],
        now: Instant,
    ) -> Result<Vec<(EntityId, Transition)>, MonitorError> {
        let failed = outcomes.iter().filter(|o| !o.success).count() as u64;
        self.counters.probes_run += outcomes.len() as u64;
        self.counters.probes_failed += failed;
        let up = self.evaluator.evaluate(id, outcomes);
        self.apply_verdict(id, up, &failed_probes(outcomes), now)
    }

    /// Applies one verdict to one entity and returns every transition it
    /// caused, the entity's own first.
    ///
    /// A master going down takes the slot ranges it owns down with it at
    /// the same instant; the same master coming back recovers those of its
    /// ranges that are still down. A node never seen before is registered on
    /// the spot, already down if this first observation is a failure.
    pub fn apply_verdict(
        &mut self,
        id: &EntityId,
        up: bool,
        failed: &[String],
        now: Instant,
    ) -> Result<Vec<(EntityId, Transition)>, MonitorError> {
        self.counters.verdicts += 1;
        if !up {
            self.counters.down_verdicts += 1;
        }

        let mut transitions = Vec::new();
        if let EntityId::Node(addr) = id {
            if up && self.registry.node(addr).is_some_and(|n| n.departed) {
                debug!("ignoring up verdict for departed node {addr}");
                return Ok(transitions);
            }
        }
        match self.registry.health_mut(id) {
            Some(health) => {
                if let Some(t) = health.apply_verdict(up, now, failed) {
                    transitions.push((id.clone(), t));
                }
            }
            None => match id {
                EntityId::Node(addr) => {
                    let mut node = NodeEntity::new(addr.clone(), NodeRole::Replica);
                    if !up {
                        node.health = HealthState::down_since(now);
                        node.health.apply_verdict(false, now, failed);
                        transitions.push((id.clone(), Transition::Down { at: now }));
                    }
                    self.registry.insert_node(node);
                }
                EntityId::Range(_) => return Err(MonitorError::UnknownEntity(id.clone())),
            },
        }

        let own = transitions.first().map(|(_, t)| *t);
        if let (EntityId::Node(addr), Some(transition)) = (id, own) {
            self.cascade_to_owned_ranges(addr, transition, now, &mut transitions);
        }

        for (entity, transition) in &transitions {
            log_transition(entity, transition, failed);
        }
        Ok(transitions)
    }

    fn cascade_to_owned_ranges(
        &mut self,
        owner: &NodeAddr,
        transition: Transition,
        now: Instant,
        out: &mut Vec<(EntityId, Transition)>,
    ) {
        for range in self.registry.ranges_mut() {
            if &range.owner != owner {
                continue;
            }
            let cascaded = match transition {
                Transition::Down { .. } => range.health.mark_down(now),
                Transition::Up { .. } => range.health.recover(
                    now,
                    DowntimeContext::OwnerRecovered {
                        owner: owner.clone(),
                    },
                ),
            };
            if let Some(t) = cascaded {
                out.push((EntityId::Range(range.range), t));
            }
        }
    }

    /// Reconciles a topology snapshot. See [`reconcile::reconcile`].
    pub fn reconcile(
        &mut self,
        snapshot: &ClusterSnapshot,
        now: Instant,
    ) -> Result<ChangeSet, MonitorError> {
        reconcile::reconcile(self, snapshot, now)
    }

    /// Records a topology refresh that could not be completed.
    ///
    /// The registry keeps its prior state; this is not an outage by itself.
    pub fn note_topology_unavailable(&mut self, err: &MonitorError) {
        self.counters.skipped_topology_cycles += 1;
        warn!(
            "skipping topology refresh ({} skipped so far): {err}",
            self.counters.skipped_topology_cycles
        );
    }

    pub(crate) fn note_lost_probe(&mut self) {
        self.counters.lost_probes += 1;
    }

    pub(crate) fn note_probe_cycle(&mut self) {
        self.counters.probe_cycles += 1;
    }

    /// Share of probe outcomes that succeeded, in percent. 100 before any probe.
    pub fn probe_success_rate(&self) -> f64 {
        let SessionCounters {
            probes_run,
            probes_failed,
            ..
        } = self.counters;
        if probes_run == 0 {
            return 100.0;
        }
        100.0 * (probes_run - probes_failed) as f64 / probes_run as f64
    }

    /// Closes every open outage at `now` so final totals are not understated.
    ///
    /// Idempotent: a second call finds nothing open.
    pub fn shutdown(&mut self, now: Instant) -> Vec<(EntityId, Transition)> {
        self.shutdown_at.get_or_insert(now);
        let mut closed = Vec::new();
        for node in self.registry.nodes_mut() {
            if let Some(t) = node.health.recover(now, DowntimeContext::Shutdown) {
                closed.push((EntityId::Node(node.addr.clone()), t));
            }
        }
        for range in self.registry.ranges_mut() {
            if let Some(t) = range.health.recover(now, DowntimeContext::Shutdown) {
                closed.push((EntityId::Range(range.range), t));
            }
        }
        if !closed.is_empty() {
            info!("closed {} open outages at shutdown", closed.len());
        }
        closed
    }

    /// Every completed downtime event across all entities, ordered by start.
    ///
    /// Retired ranges are included.
    pub fn downtime_events(&self) -> Vec<(EntityId, &DowntimeEvent)> {
        let nodes = self
            .registry
            .nodes()
            .flat_map(|n| {
                n.health
                    .events()
                    .iter()
                    .map(move |e| (EntityId::Node(n.addr.clone()), e))
            });
        let ranges = self
            .registry
            .ranges()
            .chain(self.retired_ranges.iter())
            .flat_map(|r| {
                r.health
                    .events()
                    .iter()
                    .map(move |e| (EntityId::Range(r.range), e))
            });
        let mut events: Vec<_> = nodes.chain(ranges).collect();
        events.sort_by_key(|(_, e)| e.start);
        events
    }

    /// Point-in-time copy of everything the session knows.
    pub fn report(&self, now: Instant) -> SessionReport {
        SessionReport::build(self, now)
    }

    /// Time elapsed since the session started, frozen at shutdown.
    pub fn runtime(&self, now: Instant) -> Duration {
        let end = self.shutdown_at.unwrap_or(now);
        end.saturating_duration_since(self.start_time)
    }
}

fn log_transition(entity: &EntityId, transition: &Transition, failed: &[String]) {
    match transition {
        Transition::Down { .. } if failed.is_empty() => info!("{entity} DOWN"),
        Transition::Down { .. } => info!("{entity} DOWN (failed: {})", failed.join(", ")),
        Transition::Up { downtime, .. } => {
            info!("{entity} RECOVERED after {:.3}s", downtime.as_secs_f64())
        }
    }
}
