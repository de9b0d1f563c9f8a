//! Node records and the cluster membership table.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::time::Instant;

use super::task::TaskId;

/// Identity a node announces in its Hello. Stable across reconnects.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(pub String);

impl NodeId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for NodeId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for NodeId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Coordinator-side view of one joined node.
#[derive(Debug, Clone)]
pub struct NodeRecord {
    pub id: NodeId,
    pub address: String,
    pub capacity: u32,
    /// Issued per handshake; messages from older sessions are stale.
    pub session: u64,
    pub last_heartbeat: Instant,
    pub joined_at: DateTime<Utc>,
    /// Tasks holding a lease on this node.
    pub leased: BTreeSet<TaskId>,
    /// Tasks reserved for this node but not yet leased, oldest first.
    pub backlog: VecDeque<TaskId>,
    /// False once the connection dropped; the record lingers until timeout.
    pub connected: bool,
}

impl NodeRecord {
    pub fn new(id: NodeId, address: String, capacity: u32, session: u64, now: Instant) -> Self {
        Self {
            id,
            address,
            capacity,
            session,
            last_heartbeat: now,
            joined_at: Utc::now(),
            leased: BTreeSet::new(),
            backlog: VecDeque::new(),
            connected: true,
        }
    }

    /// Leased plus staged work.
    pub fn in_flight(&self) -> usize {
        self.leased.len() + self.backlog.len()
    }

    pub fn free_slots(&self) -> usize {
        (self.capacity as usize).saturating_sub(self.leased.len())
    }

    pub fn summary(&self, now: Instant) -> NodeSummary {
        NodeSummary {
            id: self.id.clone(),
            address: self.address.clone(),
            capacity: self.capacity,
            session: self.session,
            leased: self.leased.len(),
            staged: self.backlog.len(),
            connected: self.connected,
            silent_ms: now.saturating_duration_since(self.last_heartbeat).as_millis() as u64,
            joined_at: self.joined_at,
        }
    }
}

/// Read-only snapshot of a node record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeSummary {
    pub id: NodeId,
    pub address: String,
    pub capacity: u32,
    pub session: u64,
    pub leased: usize,
    pub staged: usize,
    pub connected: bool,
    pub silent_ms: u64,
    pub joined_at: DateTime<Utc>,
}

/// Cluster membership table: node id to record, in id order.
#[derive(Debug, Clone, Default)]
pub struct Membership {
    nodes: BTreeMap<NodeId, NodeRecord>,
}

impl Membership {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, record: NodeRecord) -> Option<NodeRecord> {
        self.nodes.insert(record.id.clone(), record)
    }

    pub fn remove(&mut self, id: &NodeId) -> Option<NodeRecord> {
        self.nodes.remove(id)
    }

    pub fn get(&self, id: &NodeId) -> Option<&NodeRecord> {
        self.nodes.get(id)
    }

    pub fn get_mut(&mut self, id: &NodeId) -> Option<&mut NodeRecord> {
        self.nodes.get_mut(id)
    }

    /// The record for `id` only if `session` is its current session.
    pub fn current(&self, id: &NodeId, session: u64) -> Option<&NodeRecord> {
        self.nodes.get(id).filter(|n| n.session == session)
    }

    pub fn current_mut(&mut self, id: &NodeId, session: u64) -> Option<&mut NodeRecord> {
        self.nodes.get_mut(id).filter(|n| n.session == session)
    }

    pub fn contains(&self, id: &NodeId) -> bool {
        self.nodes.contains_key(id)
    }

    pub fn ids(&self) -> Vec<NodeId> {
        self.nodes.keys().cloned().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &NodeRecord> {
        self.nodes.values()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Busiest node other than `thief` that still has stealable backlog.
    ///
    /// Busiest means most in-flight tasks; ties go to the lowest node id.
    pub fn steal_victim(&self, thief: &NodeId) -> Option<NodeId> {
        self.nodes
            .values()
            .filter(|n| &n.id != thief && !n.backlog.is_empty())
            .fold(None::<&NodeRecord>, |best, n| match best {
                Some(b) if b.in_flight() >= n.in_flight() => Some(b),
                _ => Some(n),
            })
            .map(|n| n.id.clone())
    }

    /// Nodes whose lease set contains `task`.
    pub fn lease_holders(&self, task: &TaskId) -> Vec<NodeId> {
        self.nodes
            .values()
            .filter(|n| n.leased.contains(task))
            .map(|n| n.id.clone())
            .collect()
    }

    pub fn summaries(&self, now: Instant) -> Vec<NodeSummary> {
        self.nodes.values().map(|n| n.summary(now)).collect()
    }
}
