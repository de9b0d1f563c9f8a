//! Actor system for the cluster.
//!
//! Each actor is an independent tokio task that communicates with the
//! outside world via message passing. Actors handle:
//! - The coordinator loop owning all scheduling state (Coordinator)
//! - A node's connection, heartbeats and worker slots (NodeAgent)
//!
//! NOTE: Scheduling decisions are made synchronously inside the
//! coordinator loop, not by connection tasks, so assignment stays atomic.

pub mod coordinator;
pub mod node;
pub mod worker;

use tokio_util::sync::CancellationToken;

pub use coordinator::{Coordinator, CoordinatorHandle};
pub use node::{NodeAgent, NodeAgentConfig, NodeHandle, NodeStatus};
pub use worker::{run_task, WorkerPool, WorkerReport};

/// Handle to a running actor, used for graceful shutdown.
pub struct ActorHandle {
    cancel: CancellationToken,
}

impl ActorHandle {
    /// Create a new actor handle with a cancellation token.
    pub fn new(cancel: CancellationToken) -> Self {
        Self { cancel }
    }

    /// Signal the actor to shut down gracefully.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    /// Check if shutdown has been requested.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}
