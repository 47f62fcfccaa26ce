//! Topology reconciliation.
//!
//! Diffs a fresh `ClusterSnapshot` against the session registry and applies
//! the result:
//!
//! 1. new nodes are registered (master iff they own a range)
//! 2. known nodes change role, go down when they leave the cluster, or are
//!    tracked again when they return
//! 3. new ranges are registered against their owner
//! 4. ranges that changed owner either recover (they were down: failover)
//!    or simply follow the new owner
//! 5. ranges missing from the snapshot are retired
//!
//! A snapshot that fails validation is rejected as a whole, so a partial
//! update can never corrupt the ledgers.

use std::time::Instant;

use serde::Serialize;
use tracing::{info, warn};

use crate::health::{DowntimeContext, HealthState};
use crate::registry::{NodeEntity, SlotRangeEntity};
use crate::session::MonitoringSession;
use crate::slots::SlotRange;
use crate::topology::{ClusterSnapshot, NodeAddr, NodeRole};
use crate::MonitorError;

/// One structural change found by reconciliation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TopologyChange {
    /// A node appeared for the first time.
    NodeAdded { addr: NodeAddr, role: NodeRole },
    /// A known node was promoted or demoted.
    RoleChanged {
        addr: NodeAddr,
        from: NodeRole,
        to: NodeRole,
    },
    /// A node that was up is no longer part of the cluster; it is now down.
    NodeRemoved { addr: NodeAddr },
    /// A slot range appeared for the first time.
    RangeAdded {
        range: SlotRange,
        owner: NodeAddr,
        /// The owner was already down, so the range starts down.
        seeded_down: bool,
    },
    /// A slot range moved to a different owner.
    OwnerChanged {
        range: SlotRange,
        old_owner: NodeAddr,
        new_owner: NodeAddr,
        /// The range was down and recovered through the move.
        recovered: bool,
    },
    /// A slot range is no longer reported. Informational only.
    RangeRemoved { range: SlotRange },
}

impl std::fmt::Display for TopologyChange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TopologyChange::NodeAdded { addr, role } => write!(f, "node {addr} added as {role}"),
            TopologyChange::RoleChanged { addr, from, to } => {
                write!(f, "node {addr} changed role {from} -> {to}")
            }
            TopologyChange::NodeRemoved { addr } => write!(f, "node {addr} removed from cluster"),
            TopologyChange::RangeAdded {
                range,
                owner,
                seeded_down,
            } => {
                write!(f, "slots {range} added, owned by {owner}")?;
                if *seeded_down {
                    write!(f, " (owner down)")?;
                }
                Ok(())
            }
            TopologyChange::OwnerChanged {
                range,
                old_owner,
                new_owner,
                recovered,
            } => {
                write!(f, "slots {range} moved {old_owner} -> {new_owner}")?;
                if *recovered {
                    write!(f, " (recovered)")?;
                }
                Ok(())
            }
            TopologyChange::RangeRemoved { range } => write!(f, "slots {range} removed"),
        }
    }
}

/// Every change produced by one reconciliation, in the order applied.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ChangeSet {
    pub changes: Vec<TopologyChange>,
}

impl ChangeSet {
    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    pub fn len(&self) -> usize {
        self.changes.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &TopologyChange> {
        self.changes.iter()
    }

    /// Ranges that recovered because their ownership moved.
    pub fn recovered_ranges(&self) -> impl Iterator<Item = SlotRange> + '_ {
        self.changes.iter().filter_map(|c| match c {
            TopologyChange::OwnerChanged {
                range,
                recovered: true,
                ..
            } => Some(*range),
            _ => None,
        })
    }

    fn push(&mut self, change: TopologyChange) {
        info!("topology: {change}");
        self.changes.push(change);
    }
}

/// Reconciles `snapshot` into the session at instant `now`.
///
/// On `MalformedSnapshot` the registry is untouched and the session's
/// rejected-snapshot counter is incremented.
pub fn reconcile(
    session: &mut MonitoringSession,
    snapshot: &ClusterSnapshot,
    now: Instant,
) -> Result<ChangeSet, MonitorError> {
    if let Err(e) = snapshot.validate(session.require_full_coverage()) {
        session.counters.rejected_snapshots += 1;
        warn!("rejecting topology snapshot: {e}");
        return Err(e);
    }

    let current_owners = snapshot.owners();
    let current_masters = snapshot.masters();
    let current_nodes = snapshot.nodes();
    let mut changes = ChangeSet::default();
    let registry = &mut session.registry;

    // new nodes
    for &addr in &current_nodes {
        if registry.node(addr).is_none() {
            let role = if current_masters.contains(addr) {
                NodeRole::Master
            } else {
                NodeRole::Replica
            };
            registry.insert_node(NodeEntity::new(addr.clone(), role));
            changes.push(TopologyChange::NodeAdded {
                addr: addr.clone(),
                role,
            });
        }
    }

    // role changes, departures and returns
    for node in registry.nodes_mut() {
        if current_nodes.contains(&node.addr) {
            let role = if current_masters.contains(&node.addr) {
                NodeRole::Master
            } else {
                NodeRole::Replica
            };
            if node.departed {
                // back in the topology; stays down until a probe succeeds
                node.departed = false;
                node.role = role;
                changes.push(TopologyChange::NodeAdded {
                    addr: node.addr.clone(),
                    role,
                });
            } else if node.role != role {
                changes.push(TopologyChange::RoleChanged {
                    addr: node.addr.clone(),
                    from: node.role,
                    to: role,
                });
                node.role = role;
            }
        } else if !node.departed {
            // leaving the cluster counts as an outage
            node.departed = true;
            node.health.mark_down(now);
            changes.push(TopologyChange::NodeRemoved {
                addr: node.addr.clone(),
            });
        }
    }

    // new ranges and ownership moves
    for (&range, &owner) in &current_owners {
        let previous_owner = registry.range(&range).map(|r| r.owner.clone());
        match previous_owner {
            None => {
                let owner_down = registry.node(owner).is_some_and(|n| !n.health.is_up());
                let mut entity = SlotRangeEntity::new(range, owner.clone());
                if owner_down {
                    entity.health = HealthState::down_since(now);
                }
                registry.insert_range(entity);
                changes.push(TopologyChange::RangeAdded {
                    range,
                    owner: owner.clone(),
                    seeded_down: owner_down,
                });
            }
            Some(old_owner) if &old_owner != owner => {
                let Some(entity) = registry.range_mut(&range) else {
                    continue;
                };
                // the range's own flag decides, not the old owner's health
                let recovered = !entity.health.is_up();
                if recovered {
                    entity.health.recover(
                        now,
                        DowntimeContext::Failover {
                            old_owner: old_owner.clone(),
                            new_owner: owner.clone(),
                        },
                    );
                }
                entity.owner = owner.clone();
                changes.push(TopologyChange::OwnerChanged {
                    range,
                    old_owner,
                    new_owner: owner.clone(),
                    recovered,
                });
            }
            Some(_) => {}
        }
    }

    // vanished ranges
    let vanished: Vec<SlotRange> = registry
        .ranges()
        .map(|r| r.range)
        .filter(|range| !current_owners.contains_key(range))
        .collect();
    for range in vanished {
        if let Some(mut entity) = registry.remove_range(&range) {
            entity.health.recover(now, DowntimeContext::Removed);
            session.retired_ranges.push(entity);
            changes.push(TopologyChange::RangeRemoved { range });
        }
    }

    if !changes.is_empty() {
        session.topology_change_count += 1;
        info!(
            "topology change #{} detected ({} changes)",
            session.topology_change_count,
            changes.len()
        );
    }
    Ok(changes)
}
