//! Work-stealing scheduler for the Hive.
//!
//! The `Scheduler` is the single owner of cluster state: tasks, the global
//! ready queue, the membership table and per-node backlogs. It is a plain
//! synchronous state machine. Every operation takes the current `Instant`
//! and returns the messages to send, so the coordinator actor drives it
//! with the wall clock and tests drive it with simulated time.
//!
//! ## Task flow
//!
//! ```text
//!   submit ──► Queued ──dispatch──► Assigned ──heartbeat──► Running
//!                │  ▲                   │                      │
//!          stage │  │ lease expired /   │       TaskResult     │
//!                ▼  │ node lost / retry └──────────┬───────────┘
//!             Staged ─── StealRequest ──► Assigned  ▼
//!          (backlog)     (other node)        Completed | Failed | Cancelled
//! ```
//!
//! A task is never in the ready queue and leased at the same time, and
//! every re-queue bumps its generation so late results from the previous
//! holder are discarded.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::config::Config;
use crate::core::{
    Lease, Membership, NodeId, NodeRecord, SubmissionId, Task, TaskId, TaskState, VcpuResult,
};
use crate::orchestration::health::{HealthConfig, HealthEvent, HealthMonitor, RecoveryAction, RetryTracker};
use crate::orchestration::submission::{SubmissionReport, SubmitRequest, TaskReport};
use crate::orchestration::telemetry::{AttemptOutcome, TelemetryEvent, TelemetrySink};
use crate::protocol::{
    HiveMessage, ProtocolError, TaskAssignment, TaskOutcome, TaskRef, PROTOCOL_VERSION,
};
use crate::vcpu::{ExecStats, VcpuLayout, ISA_VERSION};
use crate::{hlog, hlog_debug, hlog_warn, Error, Result};

/// Scheduler tunables, normally derived from [`Config`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedulerConfig {
    pub cluster_epoch: u64,
    pub lease: Duration,
    pub heartbeat_interval: Duration,
    /// Tasks staged per node beyond the ones it is running.
    pub prefetch_depth: usize,
    pub health: HealthConfig,
    pub layout: VcpuLayout,
    pub cycle_budget: u64,
    pub max_program_len: usize,
    /// Reports kept after a submission is retired.
    pub retained_reports: usize,
}

impl From<&Config> for SchedulerConfig {
    fn from(config: &Config) -> Self {
        Self {
            cluster_epoch: config.coordinator.cluster_epoch,
            lease: config.coordinator.lease(),
            heartbeat_interval: config.coordinator.heartbeat_interval(),
            prefetch_depth: config.coordinator.prefetch_depth,
            health: HealthConfig::from(&config.coordinator),
            layout: VcpuLayout::from(&config.vcpu),
            cycle_budget: config.vcpu.cycle_budget,
            max_program_len: config.vcpu.max_program_len,
            retained_reports: config.coordinator.retained_reports,
        }
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self::from(&Config::default())
    }
}

/// A message addressed to one node session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outbound {
    pub node: NodeId,
    pub session: u64,
    pub message: HiveMessage,
}

/// Result of a successful handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Admission {
    pub node_id: NodeId,
    pub session: u64,
    pub ack: HiveMessage,
}

/// What happened to a `TaskResult`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultDisposition {
    Completed,
    /// Faulted and re-queued for another attempt.
    Retried,
    /// Faulted with the retry budget exhausted.
    Failed,
    /// Faulted after the submitter cancelled.
    Cancelled,
    /// Did not match the current session, lease or generation; ignored.
    Stale,
}

#[derive(Debug, Clone)]
struct SubmissionEntry {
    tasks: Vec<TaskId>,
    layout: VcpuLayout,
    cycle_budget: u64,
}

pub struct Scheduler {
    config: SchedulerConfig,
    tasks: HashMap<TaskId, Task>,
    /// Global FIFO of Queued tasks.
    ready: VecDeque<TaskId>,
    members: Membership,
    submissions: HashMap<SubmissionId, SubmissionEntry>,
    /// Final reports of retired submissions, in retirement order.
    finished: HashMap<SubmissionId, SubmissionReport>,
    finished_order: VecDeque<SubmissionId>,
    retries: RetryTracker,
    health: HealthMonitor,
    telemetry: Option<TelemetrySink>,
    next_session: u64,
    dirty: HashSet<SubmissionId>,
}

impl Scheduler {
    pub fn new(config: SchedulerConfig) -> Self {
        let health = HealthMonitor::new(config.health.clone());
        Self {
            config,
            tasks: HashMap::new(),
            ready: VecDeque::new(),
            members: Membership::new(),
            submissions: HashMap::new(),
            finished: HashMap::new(),
            finished_order: VecDeque::new(),
            retries: RetryTracker::new(),
            health,
            telemetry: None,
            next_session: 1,
            dirty: HashSet::new(),
        }
    }

    pub fn with_telemetry(mut self, sink: TelemetrySink) -> Self {
        self.telemetry = Some(sink);
        self
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    fn emit(&self, event: TelemetryEvent) {
        if let Some(sink) = &self.telemetry {
            sink.record(event);
        }
    }

    // ------------------------------------------------------------------
    // Submissions
    // ------------------------------------------------------------------

    /// Validate a program and enqueue one task per requested vCPU.
    ///
    /// Malformed programs are rejected here with [`Error::Decode`] and never
    /// reach a node.
    pub fn submit(&mut self, request: SubmitRequest) -> Result<SubmissionId> {
        if request.vcpus == 0 {
            return Err(Error::Validation("vcpus must be > 0".to_string()));
        }
        let layout = request.layout.unwrap_or(self.config.layout);
        request
            .program
            .validate(&layout, self.config.max_program_len)?;

        let id = SubmissionId::new();
        let program = Arc::new(request.program);
        let mut ids = Vec::with_capacity(request.vcpus);
        for vcpu in 0..request.vcpus {
            let task = Task::new(id, vcpu, Arc::clone(&program));
            ids.push(task.id);
            self.ready.push_back(task.id);
            self.tasks.insert(task.id, task);
        }
        hlog!(
            "Submission {} accepted: {} vCPU(s), {} instructions",
            id.short(),
            ids.len(),
            program.len()
        );
        self.submissions.insert(
            id,
            SubmissionEntry {
                tasks: ids,
                layout,
                cycle_budget: request.cycle_budget.unwrap_or(self.config.cycle_budget),
            },
        );
        self.dirty.insert(id);
        Ok(id)
    }

    /// Cancel every non-terminal task of a submission.
    ///
    /// Queued and staged tasks retire at once. Leased tasks are marked and
    /// allowed to finish; they are never re-queued again.
    pub fn cancel(&mut self, submission: SubmissionId) -> Result<()> {
        if self.finished.contains_key(&submission) {
            return Ok(());
        }
        let entry = self
            .submissions
            .get(&submission)
            .ok_or(Error::SubmissionNotFound(submission))?;
        for task_id in entry.tasks.clone() {
            let Some(task) = self.tasks.get_mut(&task_id) else {
                continue;
            };
            match &task.state {
                TaskState::Queued => {
                    self.ready.retain(|t| *t != task_id);
                    task.cancel();
                }
                TaskState::Staged { node } => {
                    if let Some(record) = self.members.get_mut(node) {
                        record.backlog.retain(|t| *t != task_id);
                    }
                    task.cancel();
                }
                TaskState::Assigned { .. } | TaskState::Running { .. } => {
                    task.cancel_requested = true;
                }
                TaskState::Completed | TaskState::Failed { .. } | TaskState::Cancelled => {}
            }
            self.retries.reset(&task_id);
        }
        hlog!("Submission {} cancelled", submission.short());
        self.dirty.insert(submission);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Membership
    // ------------------------------------------------------------------

    /// Validate a Hello and admit the node under a fresh session.
    ///
    /// A node id that is already a member has its old session evicted and
    /// that session's work re-queued.
    pub fn handshake(
        &mut self,
        hello: &HiveMessage,
        address: &str,
        now: Instant,
    ) -> std::result::Result<Admission, ProtocolError> {
        let HiveMessage::Hello {
            node_id,
            capacity,
            protocol_version,
            isa_version,
            cluster_epoch,
        } = hello
        else {
            return Err(ProtocolError::UnexpectedMessage(hello.kind().to_string()));
        };
        if *protocol_version != PROTOCOL_VERSION {
            return Err(ProtocolError::IncompatibleVersion {
                expected: PROTOCOL_VERSION,
                got: *protocol_version,
            });
        }
        if *isa_version != ISA_VERSION {
            return Err(ProtocolError::IncompatibleVersion {
                expected: ISA_VERSION,
                got: *isa_version,
            });
        }
        if *cluster_epoch != self.config.cluster_epoch {
            return Err(ProtocolError::IncompatibleEpoch {
                expected: self.config.cluster_epoch,
                got: *cluster_epoch,
            });
        }
        if *capacity == 0 {
            return Err(ProtocolError::InvalidCapacity(*capacity));
        }

        if self.members.contains(node_id) {
            hlog_warn!("Node {} rejoined, replacing previous session", node_id);
            self.evict(node_id);
        }
        let session = self.next_session;
        self.next_session += 1;
        self.members.insert(NodeRecord::new(
            node_id.clone(),
            address.to_string(),
            *capacity,
            session,
            now,
        ));
        self.emit(TelemetryEvent::NodeJoined(node_id.clone()));
        hlog!(
            "Node {} joined from {} (capacity {}, session {})",
            node_id,
            address,
            capacity,
            session
        );
        Ok(Admission {
            node_id: node_id.clone(),
            session,
            ack: HiveMessage::HelloAck {
                cluster_epoch: self.config.cluster_epoch,
                session,
                heartbeat_interval_ms: self.config.heartbeat_interval.as_millis() as u64,
            },
        })
    }

    /// Renew leases named in a heartbeat. Returns false for a stale session.
    pub fn heartbeat(
        &mut self,
        node_id: &NodeId,
        session: u64,
        in_flight: &[TaskRef],
        now: Instant,
    ) -> bool {
        let Some(node) = self.members.current_mut(node_id, session) else {
            hlog_debug!("Discarding heartbeat from stale session {}/{}", node_id, session);
            self.emit(TelemetryEvent::StaleDiscarded(node_id.clone()));
            return false;
        };
        node.last_heartbeat = now;
        let lease = Lease {
            expires_at: now + self.config.lease,
        };
        for r in in_flight {
            if !node.leased.contains(&r.task_id) {
                continue;
            }
            let Some(task) = self.tasks.get_mut(&r.task_id) else {
                continue;
            };
            if task.generation != r.generation {
                continue;
            }
            if let TaskState::Assigned { node, .. } | TaskState::Running { node, .. } = &task.state
            {
                task.state = TaskState::Running {
                    node: node.clone(),
                    lease,
                };
            }
        }
        true
    }

    /// Graceful departure: re-queue the node's work immediately.
    pub fn leave(&mut self, node_id: &NodeId, session: u64) -> bool {
        if self.members.current(node_id, session).is_none() {
            return false;
        }
        hlog!("Node {} left (session {})", node_id, session);
        self.evict(node_id);
        true
    }

    /// The node's connection dropped.
    ///
    /// Staged work goes back to the front of the ready queue at once; leased
    /// work stays until its lease expires or the node times out.
    pub fn disconnected(&mut self, node_id: &NodeId, session: u64) {
        let Some(node) = self.members.current_mut(node_id, session) else {
            return;
        };
        node.connected = false;
        let staged: Vec<TaskId> = node.backlog.drain(..).collect();
        hlog_warn!(
            "Node {} disconnected; {} leased task(s) pending timeout, {} staged returned",
            node_id,
            node.leased.len(),
            staged.len()
        );
        for task_id in staged.into_iter().rev() {
            if let Some(task) = self.tasks.get_mut(&task_id) {
                task.state = TaskState::Queued;
                self.ready.push_front(task_id);
            }
        }
    }

    /// Remove a node and re-queue everything it held.
    fn evict(&mut self, node_id: &NodeId) -> Option<NodeRecord> {
        let record = self.members.remove(node_id)?;
        let held: Vec<TaskId> = record
            .leased
            .iter()
            .copied()
            .chain(record.backlog.iter().copied())
            .collect();
        if !held.is_empty() {
            hlog!("Re-queueing {} task(s) from node {}", held.len(), node_id);
        }
        for task_id in held {
            self.requeue(task_id);
        }
        Some(record)
    }

    /// Return a task to the ready queue under a new generation, or retire
    /// it if the submitter cancelled.
    fn requeue(&mut self, task_id: TaskId) {
        let Some(task) = self.tasks.get_mut(&task_id) else {
            return;
        };
        if task.is_terminal() {
            return;
        }
        self.dirty.insert(task.submission);
        if task.cancel_requested {
            task.cancel();
            hlog_debug!("Task {} retired after cancellation", task_id.short());
            return;
        }
        task.requeue();
        let submission = task.submission;
        hlog_debug!(
            "Task {} re-queued at generation {}",
            task_id.short(),
            task.generation
        );
        self.ready.push_back(task_id);
        self.emit(TelemetryEvent::Requeued(submission));
    }

    // ------------------------------------------------------------------
    // Results
    // ------------------------------------------------------------------

    /// Apply a task result if it matches the current lease and generation.
    pub fn task_result(
        &mut self,
        node_id: &NodeId,
        session: u64,
        task: TaskRef,
        outcome: TaskOutcome,
        stats: ExecStats,
    ) -> ResultDisposition {
        let current = self
            .tasks
            .get(&task.task_id)
            .filter(|t| t.generation == task.generation)
            .is_some_and(|t| {
                t.state.lease().is_some() && t.state.node() == Some(node_id)
            });
        let leased = self
            .members
            .current(node_id, session)
            .is_some_and(|n| n.leased.contains(&task.task_id));
        if !current || !leased {
            hlog_debug!(
                "Discarding stale result for task {} gen {} from {}/{}",
                task.task_id.short(),
                task.generation,
                node_id,
                session
            );
            self.emit(TelemetryEvent::StaleDiscarded(node_id.clone()));
            return ResultDisposition::Stale;
        }

        if let Some(node) = self.members.get_mut(node_id) {
            node.leased.remove(&task.task_id);
        }
        let max_retries = self.config.health.max_retries;
        let Some(entry) = self.tasks.get_mut(&task.task_id) else {
            return ResultDisposition::Stale;
        };
        let submission = entry.submission;
        self.dirty.insert(submission);

        let (disposition, attempt) = match outcome {
            TaskOutcome::Completed { registers, memory } => {
                entry.complete(VcpuResult {
                    registers,
                    memory,
                    stats: stats.clone(),
                });
                self.retries.reset(&task.task_id);
                hlog_debug!("Task {} completed on {}", task.task_id.short(), node_id);
                (ResultDisposition::Completed, AttemptOutcome::Completed)
            }
            TaskOutcome::Fault { fault } => {
                entry.last_fault = Some(fault.to_string());
                if entry.cancel_requested {
                    entry.cancel();
                    (ResultDisposition::Cancelled, AttemptOutcome::Fault)
                } else {
                    match self.retries.on_fault(&task.task_id, max_retries) {
                        RecoveryAction::Retry { attempt } => {
                            hlog_warn!(
                                "Task {} faulted on {} ({}), retry {}/{}",
                                task.task_id.short(),
                                node_id,
                                fault,
                                attempt,
                                max_retries
                            );
                            self.requeue(task.task_id);
                            (ResultDisposition::Retried, AttemptOutcome::Fault)
                        }
                        RecoveryAction::Fail => {
                            hlog_warn!(
                                "Task {} failed permanently after {} retries: {}",
                                task.task_id.short(),
                                max_retries,
                                fault
                            );
                            entry.fail(&fault.to_string());
                            (ResultDisposition::Failed, AttemptOutcome::Failed)
                        }
                    }
                }
            }
        };
        self.emit(TelemetryEvent::Attempt {
            node: node_id.clone(),
            submission,
            stats,
            outcome: attempt,
        });
        disposition
    }

    // ------------------------------------------------------------------
    // Dispatch and stealing
    // ------------------------------------------------------------------

    fn lease_to(&mut self, task_id: TaskId, node_id: &NodeId, now: Instant) -> Option<TaskAssignment> {
        let task = self.tasks.get_mut(&task_id)?;
        let entry = self.submissions.get(&task.submission)?;
        let node = self.members.get_mut(node_id)?;
        task.state = TaskState::Assigned {
            node: node_id.clone(),
            lease: Lease {
                expires_at: now + self.config.lease,
            },
        };
        task.dispatched = true;
        node.leased.insert(task_id);
        self.dirty.insert(task.submission);
        Some(TaskAssignment {
            task_id,
            generation: task.generation,
            program: task.program.as_ref().clone(),
            layout: entry.layout,
            lease_ms: self.config.lease.as_millis() as u64,
            cycle_budget: entry.cycle_budget,
        })
    }

    /// Fill one node's free slots, own backlog first, then the global queue.
    fn dispatch_node(&mut self, node_id: &NodeId, now: Instant) -> Vec<Outbound> {
        let mut out = Vec::new();
        loop {
            let Some(node) = self.members.get(node_id) else {
                break;
            };
            if !node.connected || node.free_slots() == 0 {
                break;
            }
            let session = node.session;
            let next = self
                .members
                .get_mut(node_id)
                .and_then(|n| n.backlog.pop_front())
                .or_else(|| self.ready.pop_front());
            let Some(task_id) = next else {
                break;
            };
            if let Some(assignment) = self.lease_to(task_id, node_id, now) {
                hlog_debug!(
                    "Assigned task {} gen {} to {}",
                    task_id.short(),
                    assignment.generation,
                    node_id
                );
                out.push(Outbound {
                    node: node_id.clone(),
                    session,
                    message: HiveMessage::TaskAssign(assignment),
                });
            }
        }
        out
    }

    /// Lease work to every node with free slots, then stage up to
    /// `prefetch_depth` tasks per node, one node at a time.
    pub fn dispatch(&mut self, now: Instant) -> Vec<Outbound> {
        let ids = self.members.ids();
        let mut out = Vec::new();
        for id in &ids {
            out.extend(self.dispatch_node(id, now));
        }

        let depth = self.config.prefetch_depth;
        loop {
            let mut progressed = false;
            for id in &ids {
                let Some(node) = self.members.get_mut(id) else {
                    continue;
                };
                if !node.connected || node.backlog.len() >= depth {
                    continue;
                }
                let Some(task_id) = self.ready.pop_front() else {
                    return out;
                };
                node.backlog.push_back(task_id);
                if let Some(task) = self.tasks.get_mut(&task_id) {
                    task.state = TaskState::Staged { node: id.clone() };
                }
                progressed = true;
            }
            if !progressed {
                return out;
            }
        }
    }

    /// Answer a StealRequest.
    ///
    /// With work in the global queue (or the thief's own backlog) this is a
    /// normal dispatch. Otherwise at most one task is taken from the tail of
    /// the busiest other node's backlog. Leased tasks are never moved.
    pub fn steal(
        &mut self,
        thief: &NodeId,
        session: u64,
        free_capacity: u32,
        now: Instant,
    ) -> Vec<Outbound> {
        let Some(node) = self.members.current(thief, session) else {
            self.emit(TelemetryEvent::StaleDiscarded(thief.clone()));
            return Vec::new();
        };
        if free_capacity == 0 || node.free_slots() == 0 || !node.connected {
            return Vec::new();
        }
        if !self.ready.is_empty() || !node.backlog.is_empty() {
            return self.dispatch_node(thief, now);
        }

        let Some(victim) = self.members.steal_victim(thief) else {
            hlog_debug!("Steal request from {}: nothing to steal", thief);
            return Vec::new();
        };
        let Some(task_id) = self
            .members
            .get_mut(&victim)
            .and_then(|v| v.backlog.pop_back())
        else {
            return Vec::new();
        };
        let Some(assignment) = self.lease_to(task_id, thief, now) else {
            return Vec::new();
        };
        hlog!(
            "Steal: task {} moved from {} to {}",
            task_id.short(),
            victim,
            thief
        );
        self.emit(TelemetryEvent::Stolen {
            from: victim.clone(),
            to: thief.clone(),
        });
        vec![Outbound {
            node: thief.clone(),
            session,
            message: HiveMessage::StealGrant { victim, assignment },
        }]
    }

    /// Periodic maintenance: drop lost nodes, reclaim expired leases, then
    /// dispatch.
    pub fn tick(&mut self, now: Instant) -> Vec<Outbound> {
        let events = self
            .health
            .check_all(&self.members, self.tasks.values(), now);
        for event in events {
            match event {
                HealthEvent::NodeLost { node_id, silent } => {
                    hlog_warn!("Node {} lost after {:?} without heartbeat", node_id, silent);
                    self.emit(TelemetryEvent::NodeLost(node_id.clone()));
                    self.evict(&node_id);
                }
                HealthEvent::LeaseExpired { task_id, node_id } => {
                    hlog_warn!("Lease on task {} held by {} expired", task_id.short(), node_id);
                    if let Some(node) = self.members.get_mut(&node_id) {
                        node.leased.remove(&task_id);
                    }
                    self.requeue(task_id);
                }
            }
        }
        self.dispatch(now)
    }

    /// Route a post-handshake message from a node.
    pub fn handle_message(
        &mut self,
        message: HiveMessage,
        now: Instant,
    ) -> std::result::Result<Vec<Outbound>, ProtocolError> {
        match message {
            HiveMessage::Heartbeat {
                node_id,
                session,
                in_flight,
                ..
            } => {
                self.heartbeat(&node_id, session, &in_flight, now);
                Ok(Vec::new())
            }
            HiveMessage::TaskResult {
                node_id,
                session,
                task_id,
                generation,
                outcome,
                stats,
            } => {
                let task = TaskRef {
                    task_id,
                    generation,
                };
                if self.task_result(&node_id, session, task, outcome, stats)
                    == ResultDisposition::Stale
                {
                    return Ok(Vec::new());
                }
                Ok(self.dispatch(now))
            }
            HiveMessage::StealRequest {
                node_id,
                session,
                free_capacity,
            } => Ok(self.steal(&node_id, session, free_capacity, now)),
            HiveMessage::Leave { node_id, session } => {
                self.leave(&node_id, session);
                Ok(self.dispatch(now))
            }
            other => Err(ProtocolError::UnexpectedMessage(other.kind().to_string())),
        }
    }

    // ------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------

    pub fn task(&self, id: &TaskId) -> Option<&Task> {
        self.tasks.get(id)
    }

    /// Tasks of a submission in vCPU order.
    pub fn tasks_of(&self, submission: &SubmissionId) -> Vec<&Task> {
        self.submissions
            .get(submission)
            .map(|e| e.tasks.iter().filter_map(|id| self.tasks.get(id)).collect())
            .unwrap_or_default()
    }

    pub fn members(&self) -> &Membership {
        &self.members
    }

    pub fn node(&self, id: &NodeId) -> Option<&NodeRecord> {
        self.members.get(id)
    }

    pub fn ready_len(&self) -> usize {
        self.ready.len()
    }

    pub fn report(&self, submission: &SubmissionId) -> Option<SubmissionReport> {
        if let Some(report) = self.finished.get(submission) {
            return Some(report.clone());
        }
        self.submissions.get(submission)?;
        let tasks = self
            .tasks_of(submission)
            .into_iter()
            .map(|t| TaskReport {
                task_id: t.id,
                vcpu: t.vcpu,
                status: t.status(),
                result: t.result.clone(),
            })
            .collect();
        Some(SubmissionReport::new(*submission, tasks))
    }

    /// Submissions whose report changed since the last call.
    /// Drop the tasks and program of a finished submission, keeping only
    /// its final report. Returns that report, or `None` while any task is
    /// still live.
    ///
    /// Terminal tasks hold no lease or backlog slot, so nothing else in the
    /// scheduler refers to them.
    pub fn retire(&mut self, submission: &SubmissionId) -> Option<SubmissionReport> {
        let report = self
            .report(submission)
            .filter(|r| r.is_terminal() && self.submissions.contains_key(submission))?;
        if let Some(entry) = self.submissions.remove(submission) {
            for task_id in &entry.tasks {
                self.tasks.remove(task_id);
                self.retries.reset(task_id);
            }
        }
        hlog_debug!("Submission {} retired", submission.short());

        if self.config.retained_reports > 0 {
            self.finished.insert(*submission, report.clone());
            self.finished_order.push_back(*submission);
            while self.finished_order.len() > self.config.retained_reports {
                if let Some(oldest) = self.finished_order.pop_front() {
                    self.finished.remove(&oldest);
                }
            }
        }
        Some(report)
    }

    pub fn take_dirty(&mut self) -> Vec<SubmissionId> {
        self.dirty.drain().collect()
    }

    /// Number of nodes currently holding a lease on `task`.
    pub fn lease_holders(&self, task: &TaskId) -> usize {
        self.members.lease_holders(task).len()
    }
}
