//! Cluster topology as reported by the control plane.
//!
//! Defines node addresses and roles, and the canonical `ClusterSnapshot`
//! value the reconciler diffs against the registry. Normalizing the various
//! wire shapes of `CLUSTER SLOTS` into a snapshot is the client's job; by the
//! time a snapshot reaches this crate it has exactly one owner per range.

use std::collections::{BTreeMap, BTreeSet};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::slots::{check_partition, SlotRange};
use crate::MonitorError;

/// Network address of a cluster node, `host:port`.
///
/// Hosts are kept as strings since clusters commonly announce hostnames.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct NodeAddr {
    host: String,
    port: u16,
}

impl NodeAddr {
    /// Creates an address, rejecting an empty host or a zero port.
    pub fn new(host: impl Into<String>, port: u16) -> Result<Self, MonitorError> {
        let host = host.into();
        if host.is_empty() || port == 0 {
            return Err(MonitorError::InvalidAddress(format!("{host}:{port}")));
        }
        Ok(Self { host, port })
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }
}

impl FromStr for NodeAddr {
    type Err = MonitorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || MonitorError::InvalidAddress(s.to_string());
        let (host, port) = s.trim().rsplit_once(':').ok_or_else(invalid)?;
        // bracketed IPv6, e.g. [::1]:7000
        let host = host
            .strip_prefix('[')
            .and_then(|h| h.strip_suffix(']'))
            .unwrap_or(host);
        let port: u16 = port.parse().map_err(|_| invalid())?;
        NodeAddr::new(host, port).map_err(|_| invalid())
    }
}

impl TryFrom<String> for NodeAddr {
    type Error = MonitorError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<NodeAddr> for String {
    fn from(addr: NodeAddr) -> Self {
        addr.to_string()
    }
}

impl std::fmt::Display for NodeAddr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

/// The role of a node in the cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeRole {
    /// Owns at least one slot range and accepts writes.
    Master,
    /// Mirrors a master's data.
    Replica,
}

impl std::fmt::Display for NodeRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NodeRole::Master => write!(f, "master"),
            NodeRole::Replica => write!(f, "replica"),
        }
    }
}

/// One `(slot_range, owner, replicas)` tuple of a snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotEntry {
    pub range: SlotRange,
    pub owner: NodeAddr,
    #[serde(default)]
    pub replicas: Vec<NodeAddr>,
}

impl SnapshotEntry {
    pub fn new(range: SlotRange, owner: NodeAddr, replicas: Vec<NodeAddr>) -> Self {
        Self {
            range,
            owner,
            replicas,
        }
    }
}

/// Point-in-time mapping of slot ranges to owning nodes and their replicas.
///
/// Ephemeral: produced by the client, consumed by one reconciliation, and
/// then dropped.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterSnapshot {
    pub entries: Vec<SnapshotEntry>,
}

impl ClusterSnapshot {
    pub fn new(entries: Vec<SnapshotEntry>) -> Self {
        Self { entries }
    }

    /// Adds an entry, builder style.
    pub fn with_range(
        mut self,
        range: SlotRange,
        owner: NodeAddr,
        replicas: impl IntoIterator<Item = NodeAddr>,
    ) -> Self {
        self.entries
            .push(SnapshotEntry::new(range, owner, replicas.into_iter().collect()));
        self
    }

    /// Checks the structural invariants the reconciler relies on.
    ///
    /// Ranges must not overlap (so each range has exactly one owner) and,
    /// when `require_full_coverage` is set, must cover all 16384 slots. An
    /// owner listed as its own replica is rejected too, as is any range that
    /// is inverted or reaches past slot 16383.
    pub fn validate(&self, require_full_coverage: bool) -> Result<(), MonitorError> {
        if self.entries.is_empty() {
            return Err(MonitorError::malformed("snapshot contains no slot ranges"));
        }
        for entry in &self.entries {
            SlotRange::try_new(entry.range.start, entry.range.end)?;
            if entry.replicas.contains(&entry.owner) {
                return Err(MonitorError::malformed(format!(
                    "node {} is both owner and replica of slots {}",
                    entry.owner, entry.range
                )));
            }
        }
        let ranges: Vec<SlotRange> = self.entries.iter().map(|e| e.range).collect();
        check_partition(&ranges, require_full_coverage)
    }

    /// Returns `{range: owner}` for every entry.
    pub fn owners(&self) -> BTreeMap<SlotRange, &NodeAddr> {
        self.entries.iter().map(|e| (e.range, &e.owner)).collect()
    }

    /// Returns every node that owns at least one range.
    pub fn masters(&self) -> BTreeSet<&NodeAddr> {
        self.entries.iter().map(|e| &e.owner).collect()
    }

    /// Returns every node mentioned in the snapshot, owners and replicas.
    pub fn nodes(&self) -> BTreeSet<&NodeAddr> {
        self.entries
            .iter()
            .flat_map(|e| std::iter::once(&e.owner).chain(e.replicas.iter()))
            .collect()
    }
}
