//! Orchestration layer for the hive.
//!
//! This module holds the coordinator's decision making as plain
//! synchronous state: the work-stealing scheduler, node health and retry
//! tracking, submission bookkeeping for clients, and the telemetry
//! aggregator. The actor in [`crate::actors::coordinator`] drives it.

mod health;
mod scheduler;
mod submission;
mod telemetry;

pub use health::{
    HealthConfig, HealthEvent, HealthMonitor, RecoveryAction, RetryTracker, DEFAULT_MAX_RETRIES,
};
pub use scheduler::{Admission, Outbound, ResultDisposition, Scheduler, SchedulerConfig};
pub use submission::{aggregate, SubmissionHandle, SubmissionReport, SubmitRequest, TaskReport};
pub use telemetry::{
    AttemptOutcome, Counters, Telemetry, TelemetryEvent, TelemetrySink, TelemetrySnapshot,
    DEFAULT_TELEMETRY_CAPACITY,
};
