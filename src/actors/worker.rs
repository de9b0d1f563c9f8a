//! vCPU worker slots for a Node Agent.
//!
//! Each leased task runs on its own tokio task in bounded time slices of
//! `slice_cycles`, yielding between slices so many vCPUs share the runtime
//! fairly. Completion is reported over an unbounded channel back to the
//! agent loop, which owns the connection.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::core::TaskId;
use crate::protocol::{TaskAssignment, TaskOutcome, TaskRef};
use crate::vcpu::{ExecOutcome, ExecStats, Fault, Interpreter, VcpuState};
use crate::{hlog_debug, hlog_trace, hlog_warn};

/// Final report of one task attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerReport {
    pub task_id: TaskId,
    pub generation: u64,
    pub outcome: TaskOutcome,
    pub stats: ExecStats,
}

/// Run one assignment to completion, fault or cancellation.
///
/// Returns `None` if cancelled; the coordinator will re-queue the work once
/// its lease lapses.
pub async fn run_task(
    interpreter: &Interpreter,
    assignment: &TaskAssignment,
    slice_cycles: u64,
    cancel: &CancellationToken,
) -> Option<WorkerReport> {
    let mut state = VcpuState::new(&assignment.layout);
    let budget = assignment.cycle_budget;
    let outcome = loop {
        if cancel.is_cancelled() {
            hlog_debug!("Task {} cancelled mid-run", assignment.task_id.short());
            return None;
        }
        let remaining = budget.saturating_sub(state.cycles());
        if remaining == 0 {
            break TaskOutcome::Fault {
                fault: Fault::CycleBudgetExhausted { cycles: budget },
            };
        }
        match interpreter
            .execute(&mut state, &assignment.program, slice_cycles.min(remaining))
            .await
        {
            ExecOutcome::Halted => {
                break TaskOutcome::Completed {
                    registers: state.registers.clone(),
                    memory: state.memory.clone(),
                }
            }
            ExecOutcome::Fault(fault) => break TaskOutcome::Fault { fault },
            ExecOutcome::CycleLimitReached => {
                hlog_trace!(
                    "Task {} yielded at {} cycles",
                    assignment.task_id.short(),
                    state.cycles()
                );
                tokio::task::yield_now().await;
            }
        }
    };
    Some(WorkerReport {
        task_id: assignment.task_id,
        generation: assignment.generation,
        outcome,
        stats: state.stats,
    })
}

struct RunningTask {
    generation: u64,
    cancel: CancellationToken,
}

/// Worker slots of one node.
///
/// Enforces the node's declared capacity and tracks which
/// `(task_id, generation)` pairs are in flight for heartbeats.
pub struct WorkerPool {
    capacity: usize,
    slice_cycles: u64,
    interpreter: Arc<Interpreter>,
    running: HashMap<TaskId, RunningTask>,
    done_tx: mpsc::UnboundedSender<WorkerReport>,
    cancel: CancellationToken,
}

impl WorkerPool {
    pub fn new(
        capacity: usize,
        slice_cycles: u64,
        interpreter: Arc<Interpreter>,
        done_tx: mpsc::UnboundedSender<WorkerReport>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            capacity,
            slice_cycles,
            interpreter,
            running: HashMap::new(),
            done_tx,
            cancel,
        }
    }

    pub fn active_count(&self) -> usize {
        self.running.len()
    }

    pub fn free_slots(&self) -> usize {
        self.capacity.saturating_sub(self.running.len())
    }

    pub fn has_capacity(&self) -> bool {
        self.free_slots() > 0
    }

    pub fn in_flight(&self) -> Vec<TaskRef> {
        let mut refs: Vec<TaskRef> = self
            .running
            .iter()
            .map(|(task_id, t)| TaskRef {
                task_id: *task_id,
                generation: t.generation,
            })
            .collect();
        refs.sort_by_key(|r| r.task_id);
        refs
    }

    /// Start a vCPU for an assignment. A newer generation of a task that is
    /// already running replaces the old attempt.
    pub fn spawn(&mut self, assignment: TaskAssignment) {
        if let Some(old) = self.running.remove(&assignment.task_id) {
            hlog_warn!(
                "Task {} reassigned at generation {}, dropping generation {}",
                assignment.task_id.short(),
                assignment.generation,
                old.generation
            );
            old.cancel.cancel();
        }
        if !self.has_capacity() {
            hlog_warn!(
                "Over capacity: accepting task {} beyond {} slots",
                assignment.task_id.short(),
                self.capacity
            );
        }
        let cancel = self.cancel.child_token();
        self.running.insert(
            assignment.task_id,
            RunningTask {
                generation: assignment.generation,
                cancel: cancel.clone(),
            },
        );

        let interpreter = Arc::clone(&self.interpreter);
        let slice = self.slice_cycles;
        let done_tx = self.done_tx.clone();
        tokio::spawn(async move {
            if let Some(report) = run_task(&interpreter, &assignment, slice, &cancel).await {
                let _ = done_tx.send(report);
            }
        });
    }

    /// Release the slot for a finished attempt. Returns false for a report
    /// from a superseded generation.
    pub fn finish(&mut self, report: &WorkerReport) -> bool {
        match self.running.get(&report.task_id) {
            Some(t) if t.generation == report.generation => {
                self.running.remove(&report.task_id);
                true
            }
            _ => false,
        }
    }

    /// Stop every running vCPU.
    pub fn cancel_all(&mut self) {
        for (_, task) in self.running.drain() {
            task.cancel.cancel();
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.cancel_all();
    }
}
