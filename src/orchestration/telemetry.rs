//! Telemetry aggregator.
//!
//! The scheduler records events through a [`TelemetrySink`] using
//! `try_send` on a bounded crossbeam channel, so a slow or absent reader
//! never stalls scheduling. [`Telemetry::snapshot`] drains pending events
//! and returns a copy of the counters.

use crossbeam_channel::{Receiver, Sender};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use crate::core::{NodeId, SubmissionId};
use crate::vcpu::ExecStats;

pub const DEFAULT_TELEMETRY_CAPACITY: usize = 65_536;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptOutcome {
    Completed,
    /// A fault that will be retried.
    Fault,
    /// A fault that exhausted the retry budget.
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TelemetryEvent {
    /// An accepted (non-stale) task result.
    Attempt {
        node: NodeId,
        submission: SubmissionId,
        stats: ExecStats,
        outcome: AttemptOutcome,
    },
    NodeJoined(NodeId),
    NodeLost(NodeId),
    Requeued(SubmissionId),
    Stolen { from: NodeId, to: NodeId },
    StaleDiscarded(NodeId),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Counters {
    pub cycles: u64,
    pub scalar_ops: u64,
    pub matrix_ops: u64,
    pub completions: u64,
    pub faults: u64,
    pub failures: u64,
    pub histogram: BTreeMap<String, u64>,
}

impl Counters {
    fn record(&mut self, stats: &ExecStats, outcome: AttemptOutcome) {
        self.cycles += stats.cycles;
        self.scalar_ops += stats.scalar_ops;
        self.matrix_ops += stats.matrix_ops;
        for (name, count) in &stats.histogram {
            *self.histogram.entry(name.clone()).or_insert(0) += count;
        }
        match outcome {
            AttemptOutcome::Completed => self.completions += 1,
            AttemptOutcome::Fault => self.faults += 1,
            AttemptOutcome::Failed => {
                self.faults += 1;
                self.failures += 1;
            }
        }
    }
}

/// Read-only copy of the aggregated counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TelemetrySnapshot {
    pub totals: Counters,
    pub nodes: BTreeMap<NodeId, Counters>,
    pub programs: BTreeMap<SubmissionId, Counters>,
    pub nodes_joined: u64,
    pub nodes_lost: u64,
    pub requeues: u64,
    pub steals: u64,
    pub stale_discarded: u64,
    /// Events lost because the channel was full.
    pub dropped_events: u64,
}

impl TelemetrySnapshot {
    fn apply(&mut self, event: TelemetryEvent) {
        match event {
            TelemetryEvent::Attempt {
                node,
                submission,
                stats,
                outcome,
            } => {
                self.totals.record(&stats, outcome);
                self.nodes.entry(node).or_default().record(&stats, outcome);
                self.programs
                    .entry(submission)
                    .or_default()
                    .record(&stats, outcome);
            }
            TelemetryEvent::NodeJoined(_) => self.nodes_joined += 1,
            TelemetryEvent::NodeLost(_) => self.nodes_lost += 1,
            TelemetryEvent::Requeued(_) => self.requeues += 1,
            TelemetryEvent::Stolen { .. } => self.steals += 1,
            TelemetryEvent::StaleDiscarded(_) => self.stale_discarded += 1,
        }
    }
}

/// Write side, owned by the scheduler.
#[derive(Debug, Clone)]
pub struct TelemetrySink {
    tx: Sender<TelemetryEvent>,
    dropped: Arc<AtomicU64>,
}

impl TelemetrySink {
    /// Fire-and-forget; a full channel drops the event and counts it.
    pub fn record(&self, event: TelemetryEvent) {
        if self.tx.try_send(event).is_err() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
    }
}

/// Read side. Cheap to clone; all clones share the same counters.
#[derive(Debug, Clone)]
pub struct Telemetry {
    rx: Receiver<TelemetryEvent>,
    state: Arc<Mutex<TelemetrySnapshot>>,
    dropped: Arc<AtomicU64>,
}

impl Telemetry {
    pub fn new(capacity: usize) -> (Telemetry, TelemetrySink) {
        let (tx, rx) = crossbeam_channel::bounded(capacity);
        let dropped = Arc::new(AtomicU64::new(0));
        (
            Telemetry {
                rx,
                state: Arc::new(Mutex::new(TelemetrySnapshot::default())),
                dropped: Arc::clone(&dropped),
            },
            TelemetrySink { tx, dropped },
        )
    }

    pub fn snapshot(&self) -> TelemetrySnapshot {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        while let Ok(event) = self.rx.try_recv() {
            state.apply(event);
        }
        state.dropped_events = self.dropped.load(Ordering::Relaxed);
        state.clone()
    }
}
