//! Entity registry: every node and slot range the session tracks.

use std::collections::BTreeMap;

use serde::Serialize;

use crate::health::HealthState;
use crate::slots::SlotRange;
use crate::topology::{NodeAddr, NodeRole};

/// Identifier of a monitored entity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum EntityId {
    Node(NodeAddr),
    Range(SlotRange),
}

impl std::fmt::Display for EntityId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EntityId::Node(addr) => write!(f, "node {addr}"),
            EntityId::Range(range) => write!(f, "slots {range}"),
        }
    }
}

impl From<NodeAddr> for EntityId {
    fn from(addr: NodeAddr) -> Self {
        EntityId::Node(addr)
    }
}

impl From<SlotRange> for EntityId {
    fn from(range: SlotRange) -> Self {
        EntityId::Range(range)
    }
}

/// A cluster node and its health.
#[derive(Debug, Clone)]
pub struct NodeEntity {
    pub addr: NodeAddr,
    /// Mutable: failover can promote a replica.
    pub role: NodeRole,
    pub health: HealthState,
    /// Set while the node is missing from the latest topology. A departed
    /// node stays down and is not probed until a snapshot lists it again.
    pub departed: bool,
}

impl NodeEntity {
    pub fn new(addr: NodeAddr, role: NodeRole) -> Self {
        Self {
            addr,
            role,
            health: HealthState::new(),
            departed: false,
        }
    }

    pub fn is_master(&self) -> bool {
        self.role == NodeRole::Master
    }
}

/// A slot range, the node that currently owns it, and its health.
#[derive(Debug, Clone)]
pub struct SlotRangeEntity {
    pub range: SlotRange,
    /// Looked up in the registry by address; the registry owns the node.
    pub owner: NodeAddr,
    pub health: HealthState,
}

impl SlotRangeEntity {
    pub fn new(range: SlotRange, owner: NodeAddr) -> Self {
        Self {
            range,
            owner,
            health: HealthState::new(),
        }
    }
}

/// Mapping from entity identifier to its current state.
///
/// Both maps are ordered so reports list nodes by address and ranges by
/// starting slot.
#[derive(Debug, Clone, Default)]
pub struct Registry {
    nodes: BTreeMap<NodeAddr, NodeEntity>,
    ranges: BTreeMap<SlotRange, SlotRangeEntity>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn node(&self, addr: &NodeAddr) -> Option<&NodeEntity> {
        self.nodes.get(addr)
    }

    pub fn range(&self, range: &SlotRange) -> Option<&SlotRangeEntity> {
        self.ranges.get(range)
    }

    pub fn range_mut(&mut self, range: &SlotRange) -> Option<&mut SlotRangeEntity> {
        self.ranges.get_mut(range)
    }

    /// Inserts a node, replacing any previous entry for the address.
    pub fn insert_node(&mut self, node: NodeEntity) {
        self.nodes.insert(node.addr.clone(), node);
    }

    /// Inserts a range, replacing any previous entry.
    pub fn insert_range(&mut self, entity: SlotRangeEntity) {
        self.ranges.insert(entity.range, entity);
    }

    pub fn remove_range(&mut self, range: &SlotRange) -> Option<SlotRangeEntity> {
        self.ranges.remove(range)
    }

    pub fn contains(&self, id: &EntityId) -> bool {
        self.health(id).is_some()
    }

    /// Returns the health of any entity.
    pub fn health(&self, id: &EntityId) -> Option<&HealthState> {
        match id {
            EntityId::Node(addr) => self.nodes.get(addr).map(|n| &n.health),
            EntityId::Range(range) => self.ranges.get(range).map(|r| &r.health),
        }
    }

    pub fn health_mut(&mut self, id: &EntityId) -> Option<&mut HealthState> {
        match id {
            EntityId::Node(addr) => self.nodes.get_mut(addr).map(|n| &mut n.health),
            EntityId::Range(range) => self.ranges.get_mut(range).map(|r| &mut r.health),
        }
    }

    pub fn nodes(&self) -> impl Iterator<Item = &NodeEntity> {
        self.nodes.values()
    }

    pub fn ranges(&self) -> impl Iterator<Item = &SlotRangeEntity> {
        self.ranges.values()
    }

    pub(crate) fn nodes_mut(&mut self) -> impl Iterator<Item = &mut NodeEntity> {
        self.nodes.values_mut()
    }

    pub(crate) fn ranges_mut(&mut self) -> impl Iterator<Item = &mut SlotRangeEntity> {
        self.ranges.values_mut()
    }

    /// Returns all master nodes.
    pub fn masters(&self) -> impl Iterator<Item = &NodeEntity> {
        self.nodes.values().filter(|n| n.is_master())
    }

    /// Returns the ranges currently owned by `owner`.
    pub fn ranges_owned_by<'a>(
        &'a self,
        owner: &'a NodeAddr,
    ) -> impl Iterator<Item = &'a SlotRangeEntity> + 'a {
        self.ranges.values().filter(move |r| &r.owner == owner)
    }

    /// Every tracked entity, nodes first.
    pub fn entity_ids(&self) -> Vec<EntityId> {
        self.nodes
            .keys()
            .cloned()
            .map(EntityId::Node)
            .chain(self.ranges.keys().copied().map(EntityId::Range))
            .collect()
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn range_count(&self) -> usize {
        self.ranges.len()
    }

    /// Number of entities currently down.
    pub fn down_count(&self) -> usize {
        self.nodes.values().filter(|n| !n.health.is_up()).count()
            + self.ranges.values().filter(|r| !r.health.is_up()).count()
    }
}
