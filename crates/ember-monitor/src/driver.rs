//! The evaluation loop.
//!
//! A `Monitor` owns one `MonitoringSession` behind a single async mutex and
//! drives it from a cluster client:
//!
//! - every `evaluation_interval`, one probe per tracked entity is dispatched
//!   concurrently, each bounded by `probe_timeout`; the verdicts are applied
//!   afterwards, one by one, under the lock
//! - every `topology_interval`, the topology is queried and reconciled under
//!   the same lock, so reconciliation never interleaves with verdicts
//! - every `status_report_interval`, a summary is logged and the gauges are
//!   refreshed
//!
//! Transitions and topology changes are also pushed to an optional event
//! channel. The channel is best-effort: a slow consumer loses events, it
//! never stalls the loop.

use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use metrics::{counter, gauge};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::config::MonitorConfig;
use crate::health::Transition;
use crate::liveness::ProbeOutcome;
use crate::reconcile::ChangeSet;
use crate::registry::EntityId;
use crate::session::MonitoringSession;
use crate::topology::ClusterSnapshot;
use crate::uptime::SessionReport;
use crate::MonitorError;

/// Probe name recorded when a probe exceeds `probe_timeout`.
pub const TIMEOUT_PROBE: &str = "timeout";

/// The cluster client the monitor observes through.
///
/// Implementations own the transport: connecting to nodes, issuing
/// PING/GET/SET/CLUSTER SLOTS, and normalizing replies into a
/// `ClusterSnapshot`. They should not retry; a failed probe is data.
pub trait ClusterClient: Send + Sync + 'static {
    /// Queries the current slot ownership.
    ///
    /// Returns `TopologyUnavailable` when no node could answer.
    fn get_topology(&self) -> impl Future<Output = Result<ClusterSnapshot, MonitorError>> + Send;

    /// Runs every configured probe against one entity.
    ///
    /// For a node this is typically a PING; for a slot range, a write and a
    /// read of a key hashing into the range.
    fn probe(&self, entity: &EntityId) -> impl Future<Output = Vec<ProbeOutcome>> + Send;
}

/// Something the monitor observed.
#[derive(Debug, Clone, PartialEq)]
pub enum MonitorEvent {
    /// An entity went down or came back.
    Transition {
        entity: EntityId,
        transition: Transition,
    },
    /// A topology refresh changed the registry.
    TopologyChanged(ChangeSet),
    /// A topology refresh was skipped.
    TopologyUnavailable(String),
    /// A snapshot failed validation and was ignored.
    SnapshotRejected(String),
    /// Periodic summary.
    Status(Box<SessionReport>),
}

fn now() -> Instant {
    // tokio's clock, so paused-time tests control the ledger too
    tokio::time::Instant::now().into_std()
}

/// Drives a `MonitoringSession` from a `ClusterClient`.
pub struct Monitor<C> {
    client: Arc<C>,
    config: MonitorConfig,
    session: Arc<Mutex<MonitoringSession>>,
    event_tx: Option<mpsc::Sender<MonitorEvent>>,
}

impl<C: ClusterClient> Monitor<C> {
    /// Creates a monitor and starts its session now.
    ///
    /// Seed nodes from the config are tracked immediately, so a cluster
    /// that is unreachable from the very start is still accounted.
    pub fn new(
        client: C,
        config: MonitorConfig,
        event_tx: Option<mpsc::Sender<MonitorEvent>>,
    ) -> Result<Self, MonitorError> {
        config.validate()?;
        let mut session = MonitoringSession::new(now(), config.session_options());
        for addr in &config.seed_nodes {
            session.register_seed_node(addr.clone());
        }
        Ok(Self {
            client: Arc::new(client),
            config,
            session: Arc::new(Mutex::new(session)),
            event_tx,
        })
    }

    pub fn config(&self) -> &MonitorConfig {
        &self.config
    }

    /// Shared handle to the session, for readers that outlive a report.
    pub fn session(&self) -> Arc<Mutex<MonitoringSession>> {
        Arc::clone(&self.session)
    }

    /// Runs until `shutdown` completes, then closes all open outages and
    /// returns the final report.
    pub async fn run(&self, shutdown: impl Future<Output = ()>) -> SessionReport {
        info!(
            "monitor starting: evaluation every {:?}, probe timeout {:?}, policy {}",
            self.config.evaluation_interval, self.config.probe_timeout, self.config.downtime_policy
        );

        // learn the topology before the first evaluation
        if let Err(e) = self.refresh_topology().await {
            debug!("initial topology refresh failed: {e}");
        }

        let mut evaluation = interval(self.config.evaluation_interval);
        let mut topology = interval(self.config.topology_interval);
        let mut status = interval(self.config.status_report_interval);
        for timer in [&mut evaluation, &mut topology, &mut status] {
            timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
        }
        // the first tick is immediate; topology was just refreshed
        topology.tick().await;
        status.tick().await;

        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                biased;

                _ = &mut shutdown => break,

                _ = topology.tick() => {
                    if let Err(e) = self.refresh_topology().await {
                        debug!("topology refresh failed: {e}");
                    }
                }

                _ = evaluation.tick() => {
                    self.evaluate_once().await;
                }

                _ = status.tick() => {
                    self.publish_status().await;
                }
            }
        }

        self.shutdown().await
    }

    /// Runs one evaluation cycle and returns the transitions it caused.
    pub async fn evaluate_once(&self) -> Vec<(EntityId, Transition)> {
        let targets = {
            let session = self.session.lock().await;
            self.probe_targets(&session)
        };

        let mut probes = JoinSet::new();
        for entity in targets {
            let client = Arc::clone(&self.client);
            let limit = self.config.probe_timeout;
            probes.spawn(async move {
                let outcomes = match tokio::time::timeout(limit, client.probe(&entity)).await {
                    Ok(outcomes) => outcomes,
                    Err(_) => vec![ProbeOutcome::failed(TIMEOUT_PROBE)],
                };
                (entity, outcomes)
            });
        }

        let mut results = Vec::with_capacity(probes.len());
        let mut lost = 0u64;
        while let Some(joined) = probes.join_next().await {
            match joined {
                Ok(result) => results.push(result),
                Err(e) => {
                    lost += 1;
                    warn!("probe task failed: {e}");
                }
            }
        }
        // nodes before ranges, so an owner cascade is applied before the
        // range's own verdict
        results.sort_by(|a, b| a.0.cmp(&b.0));

        // one instant for the whole batch, taken once every probe is final
        let at = now();
        let mut transitions = Vec::new();
        let down_count = {
            let mut session = self.session.lock().await;
            session.note_probe_cycle();
            for _ in 0..lost {
                session.note_lost_probe();
            }
            for (entity, outcomes) in &results {
                match session.apply_probe_results(entity, outcomes, at) {
                    Ok(applied) => transitions.extend(applied),
                    // retired by a topology refresh while the probe ran
                    Err(e) => debug!("dropping verdict: {e}"),
                }
            }
            session.registry().down_count()
        };

        gauge!("ember_monitor_entities_down").set(down_count as f64);
        for (entity, transition) in &transitions {
            record_transition(entity, transition);
            self.emit(MonitorEvent::Transition {
                entity: entity.clone(),
                transition: *transition,
            });
        }
        transitions
    }

    /// Queries the topology and reconciles it into the session.
    ///
    /// Errors are already accounted in the session counters when returned.
    pub async fn refresh_topology(&self) -> Result<ChangeSet, MonitorError> {
        let result = self.client.get_topology().await;
        let at = now();
        let mut session = self.session.lock().await;

        let snapshot = match result {
            Ok(snapshot) => snapshot,
            Err(e) => {
                session.note_topology_unavailable(&e);
                drop(session);
                counter!("ember_monitor_skipped_topology_cycles_total").increment(1);
                self.emit(MonitorEvent::TopologyUnavailable(e.to_string()));
                return Err(e);
            }
        };

        match session.reconcile(&snapshot, at) {
            Ok(changes) => {
                drop(session);
                if !changes.is_empty() {
                    counter!("ember_monitor_topology_changes_total").increment(1);
                    self.emit(MonitorEvent::TopologyChanged(changes.clone()));
                }
                Ok(changes)
            }
            Err(e) => {
                drop(session);
                counter!("ember_monitor_rejected_snapshots_total").increment(1);
                self.emit(MonitorEvent::SnapshotRejected(e.to_string()));
                Err(e)
            }
        }
    }

    /// Logs a status summary, refreshes the gauges and emits the report.
    pub async fn publish_status(&self) -> SessionReport {
        let report = self.report().await;
        gauge!("ember_monitor_uptime_percent").set(report.uptime_percent);
        gauge!("ember_monitor_entities_down").set(report.down_count as f64);
        info!(
            "status after {:.1}s: uptime {:.4}% (live {:.4}%), {} nodes, {} slot ranges, {} down, {} topology changes, probe success {:.2}%",
            report.runtime_secs,
            report.uptime_percent,
            report.live_uptime_percent,
            report.node_count,
            report.range_count,
            report.down_count,
            report.topology_changes,
            report.probe_success_rate,
        );
        self.emit(MonitorEvent::Status(Box::new(report.clone())));
        report
    }

    /// Point-in-time report. Holds the lock only while copying.
    pub async fn report(&self) -> SessionReport {
        let session = self.session.lock().await;
        session.report(now())
    }

    /// Closes every open outage now and returns the final report.
    ///
    /// Safe to call more than once; later calls change nothing.
    pub async fn shutdown(&self) -> SessionReport {
        let at = now();
        let (closed, report) = {
            let mut session = self.session.lock().await;
            let closed = session.shutdown(at);
            (closed, session.report(at))
        };
        for (entity, transition) in &closed {
            record_transition(entity, transition);
            self.emit(MonitorEvent::Transition {
                entity: entity.clone(),
                transition: *transition,
            });
        }
        info!(
            "monitor stopped after {:.1}s: uptime {:.4}%, {} downtime events",
            report.runtime_secs,
            report.uptime_percent,
            report.events.len()
        );
        report
    }

    fn probe_targets(&self, session: &MonitoringSession) -> Vec<EntityId> {
        let registry = session.registry();
        let nodes = registry
            .nodes()
            .filter(|n| !n.departed && (self.config.probe_replicas || n.is_master()))
            .map(|n| EntityId::Node(n.addr.clone()));
        let ranges = registry
            .ranges()
            .filter(|_| self.config.probe_slot_ranges)
            .map(|r| EntityId::Range(r.range));
        nodes.chain(ranges).collect()
    }

    fn emit(&self, event: MonitorEvent) {
        let Some(tx) = &self.event_tx else {
            return;
        };
        match tx.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => debug!("monitor event channel full, dropping event"),
            Err(TrySendError::Closed(_)) => {
                warn!("monitor event channel closed, dropping event")
            }
        }
    }
}

fn record_transition(entity: &EntityId, transition: &Transition) {
    let kind = match entity {
        EntityId::Node(_) => "node",
        EntityId::Range(_) => "range",
    };
    let to = if transition.is_down() { "down" } else { "up" };
    counter!("ember_monitor_transitions_total", "entity" => kind, "to" => to).increment(1);
}
