//! Liveness and retry rules for the coordinator.
//!
//! The `HealthMonitor` inspects the membership table and leased tasks at a
//! given instant and reports what has gone wrong; the scheduler decides what
//! to do about it. Time is always passed in, never read, so the rules can be
//! driven by simulated clocks in tests.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::config::CoordinatorConfig;
use crate::core::{Membership, NodeId, Task, TaskId};

/// Default maximum number of retries before a faulting task is failed.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Thresholds used by the health monitor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthConfig {
    /// Silence longer than this declares a node Lost.
    pub heartbeat_timeout: Duration,
    /// Grace added to every lease before it counts as expired.
    pub clock_skew: Duration,
    /// Fault results tolerated before a task is failed permanently.
    pub max_retries: u32,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self::from(&CoordinatorConfig::default())
    }
}

impl From<&CoordinatorConfig> for HealthConfig {
    fn from(config: &CoordinatorConfig) -> Self {
        Self {
            heartbeat_timeout: config.heartbeat_timeout(),
            clock_skew: config.clock_skew(),
            max_retries: config.max_retries,
        }
    }
}

/// Problems found by [`HealthMonitor::check_all`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HealthEvent {
    /// No heartbeat for longer than the timeout.
    NodeLost { node_id: NodeId, silent: Duration },
    /// A lease ran out without renewal.
    LeaseExpired { task_id: TaskId, node_id: NodeId },
}

/// What to do with a task whose attempt faulted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryAction {
    /// Re-queue; `attempt` is the retry number about to run.
    Retry { attempt: u32 },
    /// Retry budget exhausted.
    Fail,
}

/// Tracks retry counts per task for recovery decisions.
///
/// # Example
///
/// ```
/// use hive::core::TaskId;
/// use hive::orchestration::{RecoveryAction, RetryTracker};
///
/// let mut tracker = RetryTracker::new();
/// let task_id = TaskId::new();
///
/// assert_eq!(tracker.get_retries(&task_id), 0);
/// assert_eq!(tracker.on_fault(&task_id, 1), RecoveryAction::Retry { attempt: 1 });
/// assert_eq!(tracker.on_fault(&task_id, 1), RecoveryAction::Fail);
/// ```
#[derive(Debug, Clone, Default)]
pub struct RetryTracker {
    retries: HashMap<TaskId, u32>,
}

impl RetryTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns 0 if the task has not been retried.
    pub fn get_retries(&self, task_id: &TaskId) -> u32 {
        self.retries.get(task_id).copied().unwrap_or(0)
    }

    /// Returns the new retry count.
    pub fn increment(&mut self, task_id: &TaskId) -> u32 {
        let count = self.retries.entry(*task_id).or_insert(0);
        *count += 1;
        *count
    }

    pub fn reset(&mut self, task_id: &TaskId) {
        self.retries.remove(task_id);
    }

    /// Record a fault and decide between retry and permanent failure.
    pub fn on_fault(&mut self, task_id: &TaskId, max_retries: u32) -> RecoveryAction {
        if self.get_retries(task_id) >= max_retries {
            self.reset(task_id);
            RecoveryAction::Fail
        } else {
            RecoveryAction::Retry {
                attempt: self.increment(task_id),
            }
        }
    }

    pub fn len(&self) -> usize {
        self.retries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.retries.is_empty()
    }
}

/// Stateless checker applying [`HealthConfig`] to cluster state.
#[derive(Debug, Clone, Default)]
pub struct HealthMonitor {
    config: HealthConfig,
}

impl HealthMonitor {
    pub fn new(config: HealthConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &HealthConfig {
        &self.config
    }

    pub fn is_node_lost(&self, last_heartbeat: Instant, now: Instant) -> bool {
        now.saturating_duration_since(last_heartbeat) > self.config.heartbeat_timeout
    }

    /// Lost nodes first, then expired leases on nodes that are still alive.
    pub fn check_all<'a>(
        &self,
        members: &Membership,
        tasks: impl Iterator<Item = &'a Task>,
        now: Instant,
    ) -> Vec<HealthEvent> {
        let mut events: Vec<HealthEvent> = members
            .iter()
            .filter(|n| self.is_node_lost(n.last_heartbeat, now))
            .map(|n| HealthEvent::NodeLost {
                node_id: n.id.clone(),
                silent: now.saturating_duration_since(n.last_heartbeat),
            })
            .collect();

        let lost: Vec<&NodeId> = events
            .iter()
            .filter_map(|e| match e {
                HealthEvent::NodeLost { node_id, .. } => Some(node_id),
                HealthEvent::LeaseExpired { .. } => None,
            })
            .collect();
        let mut expired: Vec<HealthEvent> = tasks
            .filter_map(|task| {
                let lease = task.state.lease()?;
                let node = task.state.node()?;
                (!lost.contains(&node) && lease.is_expired(now, self.config.clock_skew)).then(
                    || HealthEvent::LeaseExpired {
                        task_id: task.id,
                        node_id: node.clone(),
                    },
                )
            })
            .collect();
        expired.sort_by_key(|e| match e {
            HealthEvent::LeaseExpired { task_id, .. } => Some(*task_id),
            HealthEvent::NodeLost { .. } => None,
        });
        events.extend(expired);
        events
    }
}
