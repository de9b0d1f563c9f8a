//! Program submissions and the submitter's view of them.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::watch;

use crate::core::{SubmissionId, TaskId, TaskStatus, VcpuResult};
use crate::vcpu::{Program, VcpuLayout};
use crate::{Error, Result};

/// A program plus the number of vCPUs to run it on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmitRequest {
    pub program: Program,
    pub vcpus: usize,
    /// Overrides the cluster's default register file and memory size.
    #[serde(default)]
    pub layout: Option<VcpuLayout>,
    #[serde(default)]
    pub cycle_budget: Option<u64>,
}

impl SubmitRequest {
    pub fn new(program: Program, vcpus: usize) -> Self {
        Self {
            program,
            vcpus,
            layout: None,
            cycle_budget: None,
        }
    }

    pub fn with_layout(mut self, layout: VcpuLayout) -> Self {
        self.layout = Some(layout);
        self
    }

    pub fn with_cycle_budget(mut self, cycles: u64) -> Self {
        self.cycle_budget = Some(cycles);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskReport {
    pub task_id: TaskId,
    pub vcpu: usize,
    pub status: TaskStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<VcpuResult>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmissionReport {
    pub id: SubmissionId,
    pub status: TaskStatus,
    pub tasks: Vec<TaskReport>,
}

impl SubmissionReport {
    pub fn new(id: SubmissionId, tasks: Vec<TaskReport>) -> Self {
        let status = aggregate(&tasks);
        Self { id, status, tasks }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

/// Fold per-task statuses into one submission status.
///
/// Completed only when every task completed; Failed once every task is
/// terminal and at least one failed; Pending while nothing has started.
pub fn aggregate(tasks: &[TaskReport]) -> TaskStatus {
    if tasks.iter().all(|t| t.status.is_terminal()) {
        let failed: Vec<&str> = tasks
            .iter()
            .filter_map(|t| match &t.status {
                TaskStatus::Failed { error } => Some(error.as_str()),
                _ => None,
            })
            .collect();
        return match failed.first() {
            None => TaskStatus::Completed,
            Some(first) => TaskStatus::Failed {
                error: format!("{} of {} vCPUs failed: {}", failed.len(), tasks.len(), first),
            },
        };
    }
    if tasks.iter().all(|t| t.status == TaskStatus::Pending) {
        TaskStatus::Pending
    } else {
        TaskStatus::Running
    }
}

/// Handle returned to a submitter for polling or awaiting its submission.
#[derive(Debug, Clone)]
pub struct SubmissionHandle {
    id: SubmissionId,
    rx: watch::Receiver<SubmissionReport>,
}

impl SubmissionHandle {
    pub fn new(id: SubmissionId, rx: watch::Receiver<SubmissionReport>) -> Self {
        Self { id, rx }
    }

    pub fn id(&self) -> SubmissionId {
        self.id
    }

    pub fn report(&self) -> SubmissionReport {
        self.rx.borrow().clone()
    }

    pub fn status(&self) -> TaskStatus {
        self.rx.borrow().status.clone()
    }

    /// Wait until every task of the submission is terminal.
    pub async fn wait(&mut self) -> Result<SubmissionReport> {
        loop {
            {
                let report = self.rx.borrow_and_update();
                if report.is_terminal() {
                    return Ok(report.clone());
                }
            }
            self.rx
                .changed()
                .await
                .map_err(|_| Error::CoordinatorUnavailable)?;
        }
    }

    pub async fn wait_timeout(&mut self, duration: Duration) -> Result<SubmissionReport> {
        tokio::time::timeout(duration, self.wait())
            .await
            .map_err(|_| Error::Timeout(duration))?
    }
}
