pub mod config;
pub mod error;
pub mod log;
pub mod util;

// Cluster model and wire format
pub mod core;
pub mod protocol;
pub mod vcpu;

// Scheduling state and the actors that drive it
pub mod actors;
pub mod orchestration;

pub use actors::{Coordinator, CoordinatorHandle, NodeAgent, NodeAgentConfig, NodeHandle};
pub use error::{Error, Result};
pub use orchestration::{SubmissionHandle, SubmissionReport, SubmitRequest};
