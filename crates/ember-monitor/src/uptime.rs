//! Uptime aggregation and point-in-time reports.
//!
//! Everything here is read-only over a `MonitoringSession`. Cluster uptime is
//! slot weighted: a range covering half the slot space that was down for ten
//! seconds costs five seconds of cluster downtime.

use std::time::{Duration, Instant};

use serde::Serialize;

use crate::health::{DowntimeContext, HealthState};
use crate::registry::{EntityId, SlotRangeEntity};
use crate::session::{MonitoringSession, SessionCounters};
use crate::topology::{NodeAddr, NodeRole};

/// Converts weighted downtime into an uptime percentage in `[0, 100]`.
///
/// A zero runtime reports 100: nothing could have been down yet.
pub fn uptime_percentage(weighted_downtime: Duration, runtime: Duration) -> f64 {
    let runtime = runtime.as_secs_f64();
    if runtime <= 0.0 {
        return 100.0;
    }
    let uptime = 100.0 * (1.0 - weighted_downtime.as_secs_f64() / runtime);
    uptime.clamp(0.0, 100.0)
}

/// Slot-weighted uptime over completed outages only.
///
/// Retired ranges keep contributing the downtime they recorded.
pub fn cluster_uptime_percentage(session: &MonitoringSession, now: Instant) -> f64 {
    let weighted = weighted_downtime(session, |health| health.total_downtime());
    uptime_percentage(weighted, session.runtime(now))
}

/// Like [`cluster_uptime_percentage`], but an outage still in progress
/// counts up to `now`.
pub fn live_uptime_percentage(session: &MonitoringSession, now: Instant) -> f64 {
    let end = session.shutdown_at().unwrap_or(now);
    let weighted = weighted_downtime(session, |health| health.total_downtime_at(end));
    uptime_percentage(weighted, session.runtime(now))
}

/// Unweighted uptime of a single entity over the session runtime.
pub fn entity_uptime_percentage(health: &HealthState, runtime: Duration, now: Instant) -> f64 {
    uptime_percentage(health.total_downtime_at(now), runtime)
}

fn weighted_downtime(
    session: &MonitoringSession,
    downtime: impl Fn(&HealthState) -> Duration,
) -> Duration {
    let secs: f64 = session
        .registry()
        .ranges()
        .chain(session.retired_ranges())
        .map(|r: &SlotRangeEntity| downtime(&r.health).as_secs_f64() * r.range.weight())
        .sum();
    Duration::from_secs_f64(secs.max(0.0))
}

/// Ledger statistics of one entity, in seconds.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct EntityMetrics {
    pub total_downtime_secs: f64,
    pub event_count: usize,
    pub average_downtime_secs: f64,
    pub longest_downtime_secs: Option<f64>,
    pub shortest_downtime_secs: Option<f64>,
    /// Length of the outage in progress; zero when up.
    pub current_downtime_secs: f64,
    pub consecutive_failures: u32,
}

impl EntityMetrics {
    pub fn of(health: &HealthState, now: Instant) -> Self {
        Self {
            total_downtime_secs: health.total_downtime().as_secs_f64(),
            event_count: health.events().len(),
            average_downtime_secs: health.average_downtime().as_secs_f64(),
            longest_downtime_secs: health.longest_downtime().map(|d| d.as_secs_f64()),
            shortest_downtime_secs: health.shortest_downtime().map(|d| d.as_secs_f64()),
            current_downtime_secs: health.current_downtime(now).as_secs_f64(),
            consecutive_failures: health.consecutive_failures(),
        }
    }
}

/// Current state of one entity.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EntityReport {
    pub entity: EntityId,
    /// Set for nodes.
    pub role: Option<NodeRole>,
    /// Set for slot ranges.
    pub owner: Option<NodeAddr>,
    pub up: bool,
    /// Offset of the current outage's start from session start.
    pub down_since_secs: Option<f64>,
    /// True for ranges no longer present in the topology.
    pub retired: bool,
    pub uptime_percent: f64,
    pub metrics: EntityMetrics,
}

/// A completed outage with timestamps relative to session start.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EventRecord {
    pub entity: EntityId,
    pub start_secs: f64,
    pub end_secs: f64,
    pub duration_secs: f64,
    pub context: DowntimeContext,
    pub failed_probes: Vec<String>,
}

/// Owned snapshot of a session, safe to hand to any presentation layer.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionReport {
    pub runtime_secs: f64,
    pub uptime_percent: f64,
    pub live_uptime_percent: f64,
    pub probe_success_rate: f64,
    pub topology_changes: u64,
    pub node_count: usize,
    pub range_count: usize,
    pub down_count: usize,
    pub counters: SessionCounters,
    pub entities: Vec<EntityReport>,
    /// Every completed outage, ordered by start.
    pub events: Vec<EventRecord>,
}

impl SessionReport {
    pub fn build(session: &MonitoringSession, now: Instant) -> Self {
        let start = session.start_time();
        let end = session.shutdown_at().unwrap_or(now);
        let runtime = session.runtime(now);
        let offset = |t: Instant| t.saturating_duration_since(start).as_secs_f64();

        let entity = |entity: EntityId,
                      role: Option<NodeRole>,
                      owner: Option<NodeAddr>,
                      health: &HealthState,
                      retired: bool| EntityReport {
            entity,
            role,
            owner,
            up: health.is_up(),
            down_since_secs: health.downtime_start().map(&offset),
            retired,
            uptime_percent: entity_uptime_percentage(health, runtime, end),
            metrics: EntityMetrics::of(health, end),
        };

        let registry = session.registry();
        let mut entities = Vec::with_capacity(
            registry.node_count() + registry.range_count() + session.retired_ranges().len(),
        );
        for node in registry.nodes() {
            entities.push(entity(
                EntityId::Node(node.addr.clone()),
                Some(node.role),
                None,
                &node.health,
                false,
            ));
        }
        for range in registry.ranges() {
            entities.push(entity(
                EntityId::Range(range.range),
                None,
                Some(range.owner.clone()),
                &range.health,
                false,
            ));
        }
        for range in session.retired_ranges() {
            entities.push(entity(
                EntityId::Range(range.range),
                None,
                Some(range.owner.clone()),
                &range.health,
                true,
            ));
        }

        let events = session
            .downtime_events()
            .into_iter()
            .map(|(entity, e)| EventRecord {
                entity,
                start_secs: offset(e.start),
                end_secs: offset(e.end),
                duration_secs: e.duration.as_secs_f64(),
                context: e.context.clone(),
                failed_probes: e.failed_probes.clone(),
            })
            .collect();

        Self {
            runtime_secs: runtime.as_secs_f64(),
            uptime_percent: cluster_uptime_percentage(session, now),
            live_uptime_percent: live_uptime_percentage(session, now),
            probe_success_rate: session.probe_success_rate(),
            topology_changes: session.topology_change_count(),
            node_count: registry.node_count(),
            range_count: registry.range_count(),
            down_count: registry.down_count(),
            counters: session.counters(),
            entities,
            events,
        }
    }

    /// Looks up the report line of one entity.
    pub fn entity(&self, id: &EntityId) -> Option<&EntityReport> {
        self.entities.iter().find(|e| &e.entity == id)
    }

    /// Completed events of one entity, in order.
    pub fn events_of<'a>(&'a self, id: &'a EntityId) -> impl Iterator<Item = &'a EventRecord> + 'a {
        self.events.iter().filter(move |e| &e.entity == id)
    }
}
