//! Hive Protocol message set.
//!
//! Every message that refers to work carries `(task_id, generation)`; every
//! message sent by a node carries `(node_id, session)`. The coordinator
//! drops anything that does not match its current view.

use serde::{Deserialize, Serialize};

use crate::core::{NodeId, TaskId};
use crate::vcpu::{ExecStats, Fault, Program, VcpuLayout};

/// Bumped on any incompatible change to the message set.
pub const PROTOCOL_VERSION: u16 = 1;

/// A task reference as reported in heartbeats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TaskRef {
    pub task_id: TaskId,
    pub generation: u64,
}

/// Everything a node needs to run one task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskAssignment {
    pub task_id: TaskId,
    pub generation: u64,
    pub program: Program,
    pub layout: VcpuLayout,
    pub lease_ms: u64,
    /// Total cycles the task may retire before it faults.
    pub cycle_budget: u64,
}

impl TaskAssignment {
    pub fn task_ref(&self) -> TaskRef {
        TaskRef {
            task_id: self.task_id,
            generation: self.generation,
        }
    }
}

/// How a task attempt ended on the node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum TaskOutcome {
    Completed { registers: Vec<i64>, memory: Vec<i64> },
    Fault { fault: Fault },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HiveMessage {
    /// Node -> coordinator, first frame on every connection.
    Hello {
        node_id: NodeId,
        capacity: u32,
        protocol_version: u16,
        isa_version: u16,
        cluster_epoch: u64,
    },
    HelloAck {
        cluster_epoch: u64,
        session: u64,
        heartbeat_interval_ms: u64,
    },
    /// Sent before the coordinator closes an incompatible connection.
    HelloReject { reason: String },
    Heartbeat {
        node_id: NodeId,
        session: u64,
        timestamp_ms: u64,
        in_flight: Vec<TaskRef>,
    },
    TaskAssign(TaskAssignment),
    TaskResult {
        node_id: NodeId,
        session: u64,
        task_id: TaskId,
        generation: u64,
        outcome: TaskOutcome,
        stats: ExecStats,
    },
    StealRequest {
        node_id: NodeId,
        session: u64,
        free_capacity: u32,
    },
    /// A task moved from another node's backlog.
    StealGrant {
        victim: NodeId,
        assignment: TaskAssignment,
    },
    /// Graceful departure; leased work is re-queued at once.
    Leave { node_id: NodeId, session: u64 },
}

impl HiveMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            HiveMessage::Hello { .. } => "hello",
            HiveMessage::HelloAck { .. } => "hello_ack",
            HiveMessage::HelloReject { .. } => "hello_reject",
            HiveMessage::Heartbeat { .. } => "heartbeat",
            HiveMessage::TaskAssign(_) => "task_assign",
            HiveMessage::TaskResult { .. } => "task_result",
            HiveMessage::StealRequest { .. } => "steal_request",
            HiveMessage::StealGrant { .. } => "steal_grant",
            HiveMessage::Leave { .. } => "leave",
        }
    }

    /// The `(node_id, session)` a node-originated message claims.
    pub fn sender(&self) -> Option<(&NodeId, u64)> {
        match self {
            HiveMessage::Heartbeat {
                node_id, session, ..
            }
            | HiveMessage::TaskResult {
                node_id, session, ..
            }
            | HiveMessage::StealRequest {
                node_id, session, ..
            }
            | HiveMessage::Leave { node_id, session } => Some((node_id, *session)),
            _ => None,
        }
    }
}
