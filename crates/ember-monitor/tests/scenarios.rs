//! End-to-end monitoring scenarios, driven through `Monitor` against a
//! scripted in-memory cluster under paused tokio time.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use ember_monitor::{
    ClusterClient, ClusterSnapshot, DowntimeContext, DowntimePolicy, EntityId, Monitor,
    MonitorConfig, MonitorError, MonitorEvent, NodeAddr, ProbeOutcome, SlotRange,
};
use tokio::sync::{mpsc, oneshot};
use tokio::time::sleep;

fn addr(port: u16) -> NodeAddr {
    NodeAddr::new("10.0.0.1", port).unwrap()
}

fn node(port: u16) -> EntityId {
    EntityId::Node(addr(port))
}

fn secs(n: u64) -> Duration {
    Duration::from_secs(n)
}

/// Routes monitor logs to the test output. `RUST_LOG=ember_monitor=debug`
/// shows every transition.
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "ember_monitor=warn".into()),
        )
        .with_test_writer()
        .try_init();
}

/// A cluster whose topology and node health are set by the test.
///
/// Slot ranges are reachable exactly when their current owner is.
#[derive(Default)]
struct Script {
    topology: Mutex<Option<ClusterSnapshot>>,
    down: Mutex<HashSet<NodeAddr>>,
    /// Extra probe outcomes per node, on top of the ping.
    extra: Mutex<HashMap<NodeAddr, Vec<ProbeOutcome>>>,
}

#[derive(Clone, Default)]
struct ScriptedCluster(Arc<Script>);

impl ScriptedCluster {
    fn with_topology(snapshot: ClusterSnapshot) -> Self {
        let cluster = Self::default();
        cluster.set_topology(Some(snapshot));
        cluster
    }

    fn set_topology(&self, snapshot: Option<ClusterSnapshot>) {
        *self.0.topology.lock().unwrap() = snapshot;
    }

    fn set_down(&self, port: u16, down: bool) {
        let mut set = self.0.down.lock().unwrap();
        if down {
            set.insert(addr(port));
        } else {
            set.remove(&addr(port));
        }
    }

    fn is_down(&self, addr: &NodeAddr) -> bool {
        self.0.down.lock().unwrap().contains(addr)
    }

    fn owner_of(&self, range: &SlotRange) -> Option<NodeAddr> {
        let topology = self.0.topology.lock().unwrap();
        topology
            .as_ref()?
            .entries
            .iter()
            .find(|e| &e.range == range)
            .map(|e| e.owner.clone())
    }
}

impl ClusterClient for ScriptedCluster {
    async fn get_topology(&self) -> Result<ClusterSnapshot, MonitorError> {
        self.0
            .topology
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| MonitorError::TopologyUnavailable("no node answered".into()))
    }

    async fn probe(&self, entity: &EntityId) -> Vec<ProbeOutcome> {
        match entity {
            EntityId::Node(addr) => {
                let mut outcomes = vec![ProbeOutcome::new("ping", !self.is_down(addr))];
                if let Some(extra) = self.0.extra.lock().unwrap().get(addr) {
                    outcomes.extend(extra.iter().cloned());
                }
                outcomes
            }
            EntityId::Range(range) => {
                let reachable = self.owner_of(range).is_some_and(|o| !self.is_down(&o));
                vec![
                    ProbeOutcome::new("write", reachable),
                    ProbeOutcome::new("read", reachable),
                ]
            }
        }
    }
}

/// Three masters, 7001-7003, with replicas 7004-7006.
fn three_masters() -> ClusterSnapshot {
    ClusterSnapshot::default()
        .with_range(SlotRange::new(0, 5460), addr(7001), [addr(7004)])
        .with_range(SlotRange::new(5461, 10922), addr(7002), [addr(7005)])
        .with_range(SlotRange::new(10923, 16383), addr(7003), [addr(7006)])
}

fn single_master() -> ClusterSnapshot {
    ClusterSnapshot::default().with_range(SlotRange::full(), addr(7001), [addr(7002)])
}

// --- uptime ---

#[tokio::test(start_paused = true)]
async fn full_range_outage_of_five_seconds_in_hundred() {
    init_tracing();
    let cluster = ScriptedCluster::with_topology(single_master());
    let monitor = Monitor::new(cluster.clone(), MonitorConfig::default(), None).unwrap();
    monitor.refresh_topology().await.unwrap();

    cluster.set_down(7001, true);
    monitor.evaluate_once().await;
    sleep(secs(5)).await;
    cluster.set_down(7001, false);
    monitor.evaluate_once().await;
    sleep(secs(95)).await;

    let report = monitor.report().await;
    assert_eq!(report.runtime_secs, 100.0);
    assert!((report.uptime_percent - 95.0).abs() < 1e-6);
    assert_eq!(report.down_count, 0);
}

#[tokio::test(start_paused = true)]
async fn healthy_cluster_reports_full_uptime() {
    let cluster = ScriptedCluster::with_topology(three_masters());
    let monitor = Monitor::new(cluster, MonitorConfig::default(), None).unwrap();
    monitor.refresh_topology().await.unwrap();
    for _ in 0..10 {
        monitor.evaluate_once().await;
        sleep(Duration::from_millis(100)).await;
    }

    let report = monitor.report().await;
    assert_eq!(report.uptime_percent, 100.0);
    assert!(report.events.is_empty());
    assert_eq!(report.probe_success_rate, 100.0);
    assert_eq!(report.counters.probe_cycles, 10);
}

#[tokio::test(start_paused = true)]
async fn one_master_of_three_weighs_a_third() {
    let cluster = ScriptedCluster::with_topology(three_masters());
    let monitor = Monitor::new(cluster.clone(), MonitorConfig::default(), None).unwrap();
    monitor.refresh_topology().await.unwrap();

    cluster.set_down(7002, true);
    monitor.evaluate_once().await;
    sleep(secs(30)).await;
    cluster.set_down(7002, false);
    monitor.evaluate_once().await;
    sleep(secs(70)).await;

    // 5462 of 16384 slots for 30s over 100s
    let expected = 100.0 * (1.0 - 30.0 * 5462.0 / 16384.0 / 100.0);
    let report = monitor.report().await;
    assert!((report.uptime_percent - expected).abs() < 1e-6);
}

// --- liveness policy ---

#[tokio::test(start_paused = true)]
async fn policy_decides_a_single_failed_probe() {
    for (policy, expect_down) in [(DowntimePolicy::Strict, true), (DowntimePolicy::Majority, false)] {
        let cluster = ScriptedCluster::with_topology(single_master());
        cluster.0.extra.lock().unwrap().insert(
            addr(7002),
            vec![
                ProbeOutcome::failed("write"),
                ProbeOutcome::passed("read"),
                ProbeOutcome::passed("info"),
            ],
        );
        let config = MonitorConfig {
            downtime_policy: policy,
            ..MonitorConfig::default()
        };
        let monitor = Monitor::new(cluster, config, None).unwrap();
        monitor.refresh_topology().await.unwrap();
        monitor.evaluate_once().await;

        let report = monitor.report().await;
        let replica = report.entity(&node(7002)).unwrap();
        assert_eq!(!replica.up, expect_down, "policy {policy}");
    }
}

// --- failover ---

#[tokio::test(start_paused = true)]
async fn down_range_recovers_when_ownership_moves() {
    init_tracing();
    let cluster = ScriptedCluster::with_topology(three_masters());
    let monitor = Monitor::new(cluster.clone(), MonitorConfig::default(), None).unwrap();
    monitor.refresh_topology().await.unwrap();
    let first = EntityId::Range(SlotRange::new(0, 5460));

    cluster.set_down(7001, true);
    monitor.evaluate_once().await;
    sleep(secs(4)).await;
    monitor.evaluate_once().await;

    // replica 7004 is promoted; 7001 stays down
    cluster.set_topology(Some(
        ClusterSnapshot::default()
            .with_range(SlotRange::new(0, 5460), addr(7004), [addr(7001)])
            .with_range(SlotRange::new(5461, 10922), addr(7002), [addr(7005)])
            .with_range(SlotRange::new(10923, 16383), addr(7003), [addr(7006)]),
    ));
    let changes = monitor.refresh_topology().await.unwrap();
    assert_eq!(changes.recovered_ranges().count(), 1);
    monitor.evaluate_once().await;

    let report = monitor.report().await;
    let range = report.entity(&first).unwrap();
    assert!(range.up);
    assert_eq!(range.owner, Some(addr(7004)));
    assert!(!report.entity(&node(7001)).unwrap().up);

    let events: Vec<_> = report.events_of(&first).collect();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].duration_secs, 4.0);
    assert_eq!(
        events[0].context,
        DowntimeContext::Failover {
            old_owner: addr(7001),
            new_owner: addr(7004),
        }
    );
    assert_eq!(report.topology_changes, 2);
}

#[tokio::test(start_paused = true)]
async fn resharded_away_range_keeps_its_downtime() {
    let cluster = ScriptedCluster::with_topology(single_master());
    let monitor = Monitor::new(cluster.clone(), MonitorConfig::default(), None).unwrap();
    monitor.refresh_topology().await.unwrap();

    cluster.set_down(7001, true);
    monitor.evaluate_once().await;
    sleep(secs(10)).await;
    cluster.set_down(7001, false);
    monitor.evaluate_once().await;

    cluster.set_topology(Some(
        ClusterSnapshot::default()
            .with_range(SlotRange::new(0, 8191), addr(7001), [])
            .with_range(SlotRange::new(8192, 16383), addr(7002), []),
    ));
    monitor.refresh_topology().await.unwrap();
    sleep(secs(90)).await;

    let report = monitor.report().await;
    assert_eq!(report.range_count, 2);
    assert!(report
        .entity(&EntityId::Range(SlotRange::full()))
        .unwrap()
        .retired);
    assert!((report.uptime_percent - 90.0).abs() < 1e-6);
}

// --- first observation and shutdown ---

#[tokio::test(start_paused = true)]
async fn first_failure_is_dated_at_first_probe() {
    let cluster = ScriptedCluster::with_topology(single_master());
    let monitor = Monitor::new(cluster.clone(), MonitorConfig::default(), None).unwrap();
    cluster.set_down(7002, true);

    sleep(secs(3)).await;
    monitor.refresh_topology().await.unwrap();
    monitor.evaluate_once().await;

    let report = monitor.report().await;
    let replica = report.entity(&node(7002)).unwrap();
    assert!(!replica.up);
    assert_eq!(replica.down_since_secs, Some(3.0));
}

#[tokio::test(start_paused = true)]
async fn unreachable_cluster_at_startup_is_accounted_through_seeds() {
    init_tracing();
    let cluster = ScriptedCluster::default();
    cluster.set_down(7001, true);
    let config = MonitorConfig {
        seed_nodes: vec![addr(7001)],
        ..MonitorConfig::default()
    };
    let monitor = Monitor::new(cluster.clone(), config, None).unwrap();
    assert!(monitor.refresh_topology().await.is_err());
    monitor.evaluate_once().await;
    sleep(secs(2)).await;

    // the cluster comes up with the seed owning every slot
    cluster.set_down(7001, false);
    cluster.set_topology(Some(single_master()));
    monitor.refresh_topology().await.unwrap();
    monitor.evaluate_once().await;

    let report = monitor.report().await;
    assert_eq!(report.counters.skipped_topology_cycles, 1);
    let seed = node(7001);
    let seed_events: Vec<_> = report.events_of(&seed).collect();
    assert_eq!(seed_events.len(), 1);
    assert_eq!(seed_events[0].duration_secs, 2.0);
}

#[tokio::test(start_paused = true)]
async fn shutdown_closes_outage_at_shutdown_time() {
    init_tracing();
    let cluster = ScriptedCluster::with_topology(three_masters());
    let (event_tx, mut events) = mpsc::channel(1024);
    let monitor = Monitor::new(cluster.clone(), MonitorConfig::default(), Some(event_tx)).unwrap();
    let (stop_tx, stop_rx) = oneshot::channel::<()>();

    let handle = tokio::spawn(async move {
        monitor
            .run(async {
                let _ = stop_rx.await;
            })
            .await
    });

    sleep(secs(2)).await;
    cluster.set_down(7003, true);
    sleep(secs(8)).await;
    stop_tx.send(()).unwrap();
    let report = handle.await.unwrap();

    let range = EntityId::Range(SlotRange::new(10923, 16383));
    for entity in [node(7003), range] {
        let closed: Vec<_> = report.events_of(&entity).collect();
        assert_eq!(closed.len(), 1, "{entity}");
        assert_eq!(closed[0].context, DowntimeContext::Shutdown);
        assert_eq!(closed[0].end_secs, report.runtime_secs);
        assert!(closed[0].duration_secs > 7.0 && closed[0].duration_secs <= 8.0);
    }
    assert_eq!(report.down_count, 0);

    let mut saw_down = false;
    let mut saw_shutdown_recovery = false;
    while let Ok(event) = events.try_recv() {
        if let MonitorEvent::Transition { entity, transition } = event {
            if entity == node(7003) {
                if transition.is_down() {
                    saw_down = true;
                } else {
                    saw_shutdown_recovery = true;
                }
            }
        }
    }
    assert!(saw_down);
    assert!(saw_shutdown_recovery);
}
