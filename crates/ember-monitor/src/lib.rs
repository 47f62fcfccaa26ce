//! ember-monitor: slot-aware downtime monitoring for ember clusters.
//!
//! This crate watches a Redis-Cluster compatible deployment from the outside
//! and keeps an exact ledger of when each node and each slot range was
//! unreachable.
//!
//! # Architecture
//!
//! The monitor sits on top of a cluster client and owns no transport itself:
//!
//! - **Topology tracking**: snapshots of slot ownership are reconciled into a
//!   registry of nodes and slot ranges, detecting failovers and resharding
//! - **Liveness**: per-entity probe outcomes are reduced to an up/down verdict
//!   under a strict or majority policy
//! - **Downtime ledger**: every entity carries a non-overlapping record of its
//!   outages; a slot range that changes owner while down recovers through the
//!   failover even if no probe ever succeeded on it
//! - **Uptime**: cluster uptime is weighted by the share of the 16384 slots
//!   each range covers
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use ember_monitor::{ClusterClient, Monitor, MonitorConfig};
//!
//! let config = MonitorConfig::from_file("monitor.toml")?;
//! let monitor = Monitor::new(client, config, None)?;
//! let report = monitor.run(async { tokio::signal::ctrl_c().await.ok(); }).await;
//! println!("uptime: {:.4}%", report.uptime_percent);
//! ```

mod config;
mod driver;
mod error;
mod health;
mod liveness;
mod reconcile;
mod registry;
mod session;
mod slots;
mod topology;
mod uptime;

pub use config::{format_duration, parse_duration, MonitorConfig};
pub use driver::{ClusterClient, Monitor, MonitorEvent, TIMEOUT_PROBE};
pub use error::MonitorError;
pub use health::{DowntimeContext, DowntimeEvent, HealthState, Transition};
pub use liveness::{evaluate, failed_probes, DowntimePolicy, LivenessEvaluator, ProbeOutcome};
pub use reconcile::{reconcile, ChangeSet, TopologyChange};
pub use registry::{EntityId, NodeEntity, Registry, SlotRangeEntity};
pub use session::{MonitoringSession, SessionCounters, SessionOptions};
pub use slots::{check_partition, SlotRange, SLOT_COUNT};
pub use topology::{ClusterSnapshot, NodeAddr, NodeRole, SnapshotEntry};
pub use uptime::{
    cluster_uptime_percentage, entity_uptime_percentage, live_uptime_percentage,
    uptime_percentage, EntityMetrics, EntityReport, EventRecord, SessionReport,
};
