//! Task data model for the Hive scheduler.
//!
//! A task is one vCPU bound to one program. Tasks are owned by the
//! coordinator's scheduler; nodes only ever see `(task_id, generation)`
//! pairs and the program they run.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;
use uuid::Uuid;

use super::node::NodeId;
use crate::vcpu::{ExecStats, Program};

/// Unique identifier for a task.
///
/// Uses UUID v4 for generation and provides a short form display
/// for human-readable output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(pub Uuid);

impl TaskId {
    /// Create a new unique task identifier.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Return first 8 characters of the UUID for display.
    pub fn short(&self) -> String {
        self.0.to_string()[..8].to_string()
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for TaskId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// Identifier returned to the submitter of a program.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SubmissionId(pub Uuid);

impl SubmissionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn short(&self) -> String {
        self.0.to_string()[..8].to_string()
    }
}

impl Default for SubmissionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SubmissionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for SubmissionId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// A time-bounded exclusive execution grant held by one node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Lease {
    pub expires_at: Instant,
}

impl Lease {
    /// A lease is live until `expires_at + grace`.
    pub fn is_expired(&self, now: Instant, grace: std::time::Duration) -> bool {
        now > self.expires_at + grace
    }
}

/// Scheduler-side lifecycle of a task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskState {
    /// In the global ready queue.
    Queued,
    /// Reserved in a node's backlog. No lease; may be stolen.
    Staged { node: NodeId },
    /// Leased to a node, not yet confirmed by a heartbeat.
    Assigned { node: NodeId, lease: Lease },
    /// Leased and confirmed running by a heartbeat.
    Running { node: NodeId, lease: Lease },
    Completed,
    Failed { reason: String },
    Cancelled,
}

impl TaskState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskState::Completed | TaskState::Failed { .. } | TaskState::Cancelled
        )
    }

    /// The node currently associated with the task, leased or staged.
    pub fn node(&self) -> Option<&NodeId> {
        match self {
            TaskState::Staged { node }
            | TaskState::Assigned { node, .. }
            | TaskState::Running { node, .. } => Some(node),
            _ => None,
        }
    }

    pub fn lease(&self) -> Option<&Lease> {
        match self {
            TaskState::Assigned { lease, .. } | TaskState::Running { lease, .. } => Some(lease),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            TaskState::Queued => "queued",
            TaskState::Staged { .. } => "staged",
            TaskState::Assigned { .. } => "assigned",
            TaskState::Running { .. } => "running",
            TaskState::Completed => "completed",
            TaskState::Failed { .. } => "failed",
            TaskState::Cancelled => "cancelled",
        }
    }
}

/// Task status as seen by a submitter.
///
/// Re-queues, steals and lease renewals are not visible at this level.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "state")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed { error: String },
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed { .. })
    }
}

impl Default for TaskStatus {
    fn default() -> Self {
        Self::Pending
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskStatus::Pending => write!(f, "pending"),
            TaskStatus::Running => write!(f, "running"),
            TaskStatus::Completed => write!(f, "completed"),
            TaskStatus::Failed { error } => write!(f, "failed: {}", error),
        }
    }
}

/// Final architectural state read back from a completed vCPU.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VcpuResult {
    pub registers: Vec<i64>,
    pub memory: Vec<i64>,
    pub stats: ExecStats,
}

/// A single schedulable unit: one vCPU running one program.
#[derive(Debug, Clone)]
pub struct Task {
    pub id: TaskId,
    pub submission: SubmissionId,
    /// Index of this vCPU within its submission.
    pub vcpu: usize,
    pub program: Arc<Program>,
    pub state: TaskState,
    /// Bumped on every re-queue; results carrying an older value are stale.
    pub generation: u64,
    pub cancel_requested: bool,
    /// Set once the task has been leased at least once.
    pub dispatched: bool,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub result: Option<VcpuResult>,
    pub last_fault: Option<String>,
}

impl Task {
    pub fn new(submission: SubmissionId, vcpu: usize, program: Arc<Program>) -> Self {
        Self {
            id: TaskId::new(),
            submission,
            vcpu,
            program,
            state: TaskState::Queued,
            generation: 0,
            cancel_requested: false,
            dispatched: false,
            created_at: Utc::now(),
            completed_at: None,
            result: None,
            last_fault: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// Move back to the ready queue under a fresh generation.
    pub fn requeue(&mut self) {
        self.state = TaskState::Queued;
        self.generation += 1;
    }

    pub fn complete(&mut self, result: VcpuResult) {
        self.state = TaskState::Completed;
        self.result = Some(result);
        self.completed_at = Some(Utc::now());
    }

    pub fn fail(&mut self, reason: &str) {
        self.state = TaskState::Failed {
            reason: reason.to_string(),
        };
        self.completed_at = Some(Utc::now());
    }

    pub fn cancel(&mut self) {
        self.state = TaskState::Cancelled;
        self.completed_at = Some(Utc::now());
    }

    /// Collapse the internal state into the submitter's view.
    pub fn status(&self) -> TaskStatus {
        match &self.state {
            TaskState::Queued | TaskState::Staged { .. } if self.dispatched => TaskStatus::Running,
            TaskState::Queued | TaskState::Staged { .. } => TaskStatus::Pending,
            TaskState::Assigned { .. } | TaskState::Running { .. } => TaskStatus::Running,
            TaskState::Completed => TaskStatus::Completed,
            TaskState::Failed { reason } => TaskStatus::Failed {
                error: reason.clone(),
            },
            TaskState::Cancelled => TaskStatus::Failed {
                error: "cancelled".to_string(),
            },
        }
    }
}
