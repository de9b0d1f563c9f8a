//! Core domain models for the Hive.
//!
//! Tasks and node records are plain data; all mutation happens inside the
//! coordinator's scheduler.

pub mod node;
pub mod task;

pub use node::{Membership, NodeId, NodeRecord, NodeSummary};
pub use task::{Lease, SubmissionId, Task, TaskId, TaskState, TaskStatus, VcpuResult};
