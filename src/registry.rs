//! Node registry: cluster membership, capacity and liveness.
//!
//! Nodes enter the registry on registration (or on a heartbeat that carries
//! their capacity), fall to [`NodeState::Down`] when heartbeats stop arriving
//! for longer than the configured timeout, and rejoin on the next accepted
//! heartbeat. They leave only through [`NodeRegistry::remove`].

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Result, WlmError};
use crate::ledger::ResourceLedger;
use crate::resources::ResourceVector;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeState {
    Up,
    Down,
    Draining,
    Unknown,
}

impl std::fmt::Display for NodeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NodeState::Up => write!(f, "up"),
            NodeState::Down => write!(f, "down"),
            NodeState::Draining => write!(f, "draining"),
            NodeState::Unknown => write!(f, "unknown"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    pub id: String,
    pub capacity: ResourceVector,
    pub state: NodeState,
    /// Agent endpoint used for dispatch.
    pub address: Option<String>,
    /// Send time of the newest accepted heartbeat, as stamped by the node.
    pub last_heartbeat: Option<DateTime<Utc>>,
    /// Controller-side time the node was last heard from.
    pub last_seen: DateTime<Utc>,
    pub registered_at: DateTime<Utc>,
    /// Administrative drain; survives heartbeats until resumed.
    pub drained: bool,
    pub reason: Option<String>,
}

impl Node {
    fn new(
        id: String,
        capacity: ResourceVector,
        address: Option<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            capacity,
            state: NodeState::Up,
            address,
            last_heartbeat: None,
            last_seen: now,
            registered_at: now,
            drained: false,
            reason: None,
        }
    }

    /// Whether the scheduler may place new work here.
    pub fn is_schedulable(&self) -> bool {
        self.state == NodeState::Up
    }

    fn apply_observed(&mut self, observed: NodeState) {
        let next = match observed {
            NodeState::Up => NodeState::Up,
            NodeState::Draining => NodeState::Draining,
            NodeState::Down => NodeState::Down,
            NodeState::Unknown => match self.state {
                NodeState::Down | NodeState::Unknown => NodeState::Up,
                other => other,
            },
        };
        self.state = if self.drained && next != NodeState::Down {
            NodeState::Draining
        } else {
            next
        };
        if self.state == NodeState::Up {
            self.reason = None;
        }
    }
}

/// A heartbeat as received from a node agent.
#[derive(Debug, Clone)]
pub struct Heartbeat {
    pub node_id: String,
    pub observed_state: NodeState,
    /// Lets a heartbeat from an unknown node register it.
    pub capacity: Option<ResourceVector>,
    /// Agent address, so a node re-created from a heartbeat can be dialed.
    pub address: Option<String>,
    pub sent_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatOutcome {
    Registered,
    Accepted {
        previous: NodeState,
        current: NodeState,
    },
    /// Not newer than the last accepted heartbeat; dropped.
    Stale,
}

/// A node eligible for scheduling together with its current free resources.
#[derive(Debug, Clone, Copy)]
pub struct AvailableNode<'a> {
    pub node: &'a Node,
    pub free: ResourceVector,
}

/// Lazy iterator over schedulable nodes, most free capacity first.
///
/// The ordering is fixed when the iterator is created; node data is read as
/// the iterator advances. `restart` rewinds to the first node.
#[derive(Debug, Clone)]
pub struct AvailableNodes<'a> {
    registry: &'a NodeRegistry,
    order: Vec<(String, ResourceVector)>,
    pos: usize,
}

impl<'a> AvailableNodes<'a> {
    pub fn restart(&mut self) {
        self.pos = 0;
    }
}

impl<'a> Iterator for AvailableNodes<'a> {
    type Item = AvailableNode<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        while self.pos < self.order.len() {
            let (id, free) = &self.order[self.pos];
            self.pos += 1;
            if let Some(node) = self.registry.nodes.get(id) {
                return Some(AvailableNode { node, free: *free });
            }
        }
        None
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (0, Some(self.order.len() - self.pos))
    }
}

#[derive(Debug)]
pub struct NodeRegistry {
    nodes: BTreeMap<String, Node>,
    heartbeat_timeout: Duration,
}

impl NodeRegistry {
    pub fn new(heartbeat_timeout: Duration) -> Self {
        Self {
            nodes: BTreeMap::new(),
            heartbeat_timeout,
        }
    }

    /// Register a node or refresh an existing one's capacity and address.
    pub fn register(
        &mut self,
        node_id: &str,
        capacity: ResourceVector,
        address: Option<String>,
        now: DateTime<Utc>,
    ) -> &Node {
        let node = self
            .nodes
            .entry(node_id.to_string())
            .and_modify(|node| {
                node.capacity = capacity;
                if address.is_some() {
                    node.address = address.clone();
                }
                node.last_seen = now;
                // A restarted agent may run on a clock behind the old one.
                node.last_heartbeat = None;
                node.apply_observed(NodeState::Up);
            })
            .or_insert_with(|| Node::new(node_id.to_string(), capacity, address.clone(), now));
        tracing::info!(node_id, capacity = %node.capacity, state = %node.state, "Node registered");
        node
    }

    pub fn heartbeat(&mut self, beat: Heartbeat, now: DateTime<Utc>) -> Result<HeartbeatOutcome> {
        if !self.nodes.contains_key(&beat.node_id) {
            let capacity = beat
                .capacity
                .ok_or_else(|| WlmError::NodeNotFound(beat.node_id.clone()))?;
            let mut node = Node::new(beat.node_id.clone(), capacity, beat.address.clone(), now);
            node.last_heartbeat = Some(beat.sent_at);
            node.apply_observed(beat.observed_state);
            tracing::info!(node_id = %beat.node_id, capacity = %capacity, "Node registered on heartbeat");
            self.nodes.insert(beat.node_id, node);
            return Ok(HeartbeatOutcome::Registered);
        }
        let node = self
            .nodes
            .get_mut(&beat.node_id)
            .ok_or_else(|| WlmError::NodeNotFound(beat.node_id.clone()))?;

        if let Some(last) = node.last_heartbeat {
            if beat.sent_at <= last {
                tracing::trace!(node_id = %beat.node_id, "Stale heartbeat dropped");
                return Ok(HeartbeatOutcome::Stale);
            }
        }

        let previous = node.state;
        node.last_heartbeat = Some(beat.sent_at);
        node.last_seen = now;
        if let Some(capacity) = beat.capacity {
            node.capacity = capacity;
        }
        if beat.address.is_some() {
            node.address = beat.address;
        }
        node.apply_observed(beat.observed_state);

        if previous != node.state {
            tracing::info!(
                node_id = %beat.node_id,
                previous = %previous,
                current = %node.state,
                "Node state changed"
            );
        }
        Ok(HeartbeatOutcome::Accepted {
            previous,
            current: node.state,
        })
    }

    pub fn get(&self, node_id: &str) -> Result<&Node> {
        self.nodes
            .get(node_id)
            .ok_or_else(|| WlmError::NodeNotFound(node_id.to_string()))
    }

    pub fn contains(&self, node_id: &str) -> bool {
        self.nodes.contains_key(node_id)
    }

    /// Schedulable nodes ordered by descending free capacity, ties by id.
    pub fn list_available<'a>(&'a self, ledger: &ResourceLedger) -> AvailableNodes<'a> {
        let mut order: Vec<(String, ResourceVector)> = self
            .nodes
            .values()
            .filter(|n| n.is_schedulable())
            .filter_map(|n| ledger.free(&n.id).map(|free| (n.id.clone(), free)))
            .collect();
        order.sort_by(|(a_id, a), (b_id, b)| {
            b.magnitude_key()
                .cmp(&a.magnitude_key())
                .then_with(|| a_id.cmp(b_id))
        });
        AvailableNodes {
            registry: self,
            order,
            pos: 0,
        }
    }

    /// Mark nodes silent for longer than the heartbeat timeout as down.
    /// Returns the ids of nodes that went down in this call.
    pub fn check_timeouts(&mut self, now: DateTime<Utc>) -> Vec<String> {
        let timeout = chrono::Duration::from_std(self.heartbeat_timeout)
            .unwrap_or_else(|_| chrono::Duration::weeks(52 * 100));
        let mut down = Vec::new();
        for node in self.nodes.values_mut() {
            if node.state == NodeState::Down {
                continue;
            }
            if now - node.last_seen > timeout {
                node.state = NodeState::Down;
                node.reason = Some("heartbeat timeout".to_string());
                tracing::warn!(
                    node_id = %node.id,
                    last_seen = %node.last_seen,
                    "Node missed heartbeats, marking down"
                );
                down.push(node.id.clone());
            }
        }
        down
    }

    /// Returns true if the node was not already down.
    pub fn mark_down(&mut self, node_id: &str, reason: &str) -> Result<bool> {
        let node = self
            .nodes
            .get_mut(node_id)
            .ok_or_else(|| WlmError::NodeNotFound(node_id.to_string()))?;
        if node.state == NodeState::Down {
            return Ok(false);
        }
        node.state = NodeState::Down;
        node.reason = Some(reason.to_string());
        tracing::warn!(node_id, reason, "Node marked down");
        Ok(true)
    }

    pub fn drain(&mut self, node_id: &str) -> Result<&Node> {
        let node = self
            .nodes
            .get_mut(node_id)
            .ok_or_else(|| WlmError::NodeNotFound(node_id.to_string()))?;
        node.drained = true;
        if node.state != NodeState::Down {
            node.state = NodeState::Draining;
        }
        node.reason = Some("drained by administrator".to_string());
        tracing::info!(node_id, "Node draining");
        Ok(node)
    }

    pub fn resume(&mut self, node_id: &str) -> Result<&Node> {
        let node = self
            .nodes
            .get_mut(node_id)
            .ok_or_else(|| WlmError::NodeNotFound(node_id.to_string()))?;
        node.drained = false;
        if node.state == NodeState::Draining {
            node.state = NodeState::Up;
            node.reason = None;
        }
        tracing::info!(node_id, state = %node.state, "Node resumed");
        Ok(node)
    }

    pub fn remove(&mut self, node_id: &str) -> Result<Node> {
        let node = self
            .nodes
            .remove(node_id)
            .ok_or_else(|| WlmError::NodeNotFound(node_id.to_string()))?;
        tracing::info!(node_id, "Node removed");
        Ok(node)
    }

    /// Whether some registered node, in any state, could hold `request` if it
    /// were completely idle.
    pub fn can_ever_fit(&self, request: &ResourceVector) -> bool {
        self.nodes.values().any(|n| request.fits_within(&n.capacity))
    }

    /// Component-wise maximum of all registered capacities.
    pub fn max_capacity(&self) -> ResourceVector {
        self.nodes
            .values()
            .fold(ResourceVector::ZERO, |acc, n| ResourceVector {
                cpus: acc.cpus.max(n.capacity.cpus),
                memory_mb: acc.memory_mb.max(n.capacity.memory_mb),
                gpus: acc.gpus.max(n.capacity.gpus),
            })
    }

    /// All nodes ordered by id.
    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.nodes.values()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}
