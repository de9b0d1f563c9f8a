//! Integration test suite for the hive.
//!
//! These tests exercise the vCPU, the scheduler and the actors together.
//! Scheduling properties are checked against the pure `Scheduler` with
//! simulated time; `cluster_e2e` runs a real coordinator and node agents
//! over loopback TCP.
//!
//! # Test Categories
//!
//! - `vcpu_programs`: Interpreter behaviour on whole programs
//! - `scheduling`: Assignment, leases and submission lifecycle
//! - `recovery`: Node loss, lease expiry, stale messages and retries
//! - `work_stealing`: Backlog staging and steal rules
//! - `protocol`: Framing and handshakes over real sockets
//! - `cluster_e2e`: Full cluster runs
//!
//! # CI Compatibility
//!
//! Sockets bind to 127.0.0.1 on ephemeral ports, so suites can run in
//! parallel.


mod cluster_e2e;
mod protocol;
mod recovery;
mod scheduling;
mod work_stealing;
