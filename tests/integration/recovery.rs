//! Node loss and recovery integration tests.
//!
//! These tests verify that lost nodes, expired leases and late messages
//! are handled so that every task still completes exactly once.

use std::time::{Duration, Instant};

use hive::core::{NodeId, TaskState, TaskStatus};
use hive::orchestration::{ResultDisposition, Scheduler, SubmitRequest, Telemetry};
use hive::protocol::TaskOutcome;
use hive::vcpu::{ExecStats, Fault};

use crate::fixtures::*;

/// Test: Node loss
/// Given a node holding two leased tasks
/// When it misses heartbeats past the timeout
/// Then one tick re-queues both tasks and removes the node record
#[test]
fn test_lost_node_requeues_within_one_tick() {
    let (telemetry, sink) = Telemetry::new(64);
    let mut s = Scheduler::new(scheduler_config()).with_telemetry(sink);
    let t0 = Instant::now();
    s.submit(SubmitRequest::new(add_program(), 2)).unwrap();
    join(&mut s, "a", 2, t0);
    let tasks = assigned(&s.dispatch(t0));
    assert_eq!(tasks.len(), 2);

    // still inside the timeout: nothing happens
    s.tick(t0 + HEARTBEAT_TIMEOUT);
    assert!(s.node(&NodeId::from("a")).is_some());

    s.tick(t0 + HEARTBEAT_TIMEOUT + Duration::from_millis(1));
    assert!(s.node(&NodeId::from("a")).is_none());
    assert_eq!(s.ready_len(), 2);
    for task in &tasks {
        let t = s.task(&task.task_id).unwrap();
        assert_eq!(t.state, TaskState::Queued);
        assert_eq!(t.generation, task.generation + 1);
        // re-queued after dispatch still reads Running to the submitter
        assert_eq!(t.status(), TaskStatus::Running);
    }

    let snapshot = telemetry.snapshot();
    assert_eq!(snapshot.nodes_lost, 1);
    assert_eq!(snapshot.requeues, 2);
}

#[test]
fn test_lost_work_moves_to_live_node() {
    let mut s = Scheduler::new(scheduler_config());
    let t0 = Instant::now();
    s.submit(SubmitRequest::new(add_program(), 2)).unwrap();
    join(&mut s, "a", 2, t0);
    let first = assigned(&s.dispatch(t0));
    let sb = join(&mut s, "b", 2, t0);

    let t1 = t0 + Duration::from_millis(250);
    assert!(s.heartbeat(&NodeId::from("b"), sb, &[], t1));
    let out = s.tick(t0 + Duration::from_millis(301));

    let mut moved = assigned_to(&out, "b");
    let mut first = first;
    moved.sort_by_key(|r| r.task_id);
    first.sort_by_key(|r| r.task_id);
    assert_eq!(moved.len(), 2);
    for (before, after) in first.iter().zip(&moved) {
        assert_eq!(before.task_id, after.task_id);
        assert_eq!(after.generation, before.generation + 1);
    }
    assert_eq!(s.ready_len(), 0);
}

/// Test: Stale duplicate result
/// Given a task re-queued away from a node that was declared lost
/// When that node's late result for the old generation arrives
/// Then it is discarded and the aggregated counters do not move
#[test]
fn test_stale_result_leaves_telemetry_unchanged() {
    let (telemetry, sink) = Telemetry::new(64);
    let mut s = Scheduler::new(scheduler_config()).with_telemetry(sink);
    let t0 = Instant::now();
    let id = s.submit(SubmitRequest::new(add_program(), 1)).unwrap();
    let sa = join(&mut s, "a", 1, t0);
    let old = assigned(&s.dispatch(t0))[0];

    let sb = join(&mut s, "b", 1, t0);
    s.heartbeat(&NodeId::from("b"), sb, &[], t0 + Duration::from_millis(250));
    let new = assigned_to(&s.tick(t0 + Duration::from_millis(301)), "b")[0];
    s.handle_message(result("b", sb, new, completed()), t0 + Duration::from_millis(310))
        .unwrap();
    let before = telemetry.snapshot();
    assert_eq!(before.totals.completions, 1);

    let d = s.task_result(&NodeId::from("a"), sa, old, completed(), stats(3));
    assert_eq!(d, ResultDisposition::Stale);
    // the same valid result delivered twice is also stale
    let d = s.task_result(&NodeId::from("b"), sb, new, completed(), stats(3));
    assert_eq!(d, ResultDisposition::Stale);

    let after = telemetry.snapshot();
    assert_eq!(after.totals, before.totals);
    assert_eq!(after.nodes, before.nodes);
    assert_eq!(after.programs, before.programs);
    assert_eq!(after.stale_discarded, before.stale_discarded + 2);
    assert_eq!(s.report(&id).unwrap().status, TaskStatus::Completed);
}

/// Test: Lease expiry
/// Given a live node that stops reporting one task in its heartbeats
/// When the lease runs out
/// Then the task is re-queued under a new generation and a late result
/// for the old generation is ignored
#[test]
fn test_expired_lease_requeues_with_new_generation() {
    let mut s = Scheduler::new(scheduler_config());
    let t0 = Instant::now();
    s.submit(SubmitRequest::new(add_program(), 1)).unwrap();
    let sa = join(&mut s, "a", 1, t0);
    let old = assigned(&s.dispatch(t0))[0];

    let mut now = t0;
    while now < t0 + LEASE {
        now += Duration::from_millis(100);
        s.heartbeat(&NodeId::from("a"), sa, &[], now);
    }
    let out = s.tick(now + Duration::from_millis(1));
    let new = assigned(&out)[0];
    assert_eq!(new.task_id, old.task_id);
    assert_eq!(new.generation, old.generation + 1);
    assert_eq!(s.lease_holders(&old.task_id), 1);

    let d = s.task_result(&NodeId::from("a"), sa, old, completed(), ExecStats::default());
    assert_eq!(d, ResultDisposition::Stale);
    let d = s.task_result(&NodeId::from("a"), sa, new, completed(), ExecStats::default());
    assert_eq!(d, ResultDisposition::Completed);
}

#[test]
fn test_fault_retry_budget() {
    let (telemetry, sink) = Telemetry::new(64);
    let mut s = Scheduler::new(scheduler_config()).with_telemetry(sink);
    let now = Instant::now();
    let id = s.submit(SubmitRequest::new(add_program(), 1)).unwrap();
    let sa = join(&mut s, "a", 1, now);
    let fault = || TaskOutcome::Fault {
        fault: Fault::MemoryOutOfRange {
            pc: 1,
            address: 999,
            words: 64,
        },
    };

    let first = assigned(&s.dispatch(now))[0];
    let out = s
        .handle_message(result("a", sa, first, fault()), now)
        .unwrap();
    let second = assigned(&out)[0];
    assert_eq!(second.generation, first.generation + 1);

    let d = s.task_result(&NodeId::from("a"), sa, second, fault(), stats(2));
    assert_eq!(d, ResultDisposition::Failed);
    match s.report(&id).unwrap().status {
        TaskStatus::Failed { error } => assert!(error.contains("memory address 999")),
        other => panic!("expected Failed, got {:?}", other),
    }
    let snapshot = telemetry.snapshot();
    assert_eq!(snapshot.totals.faults, 2);
    assert_eq!(snapshot.totals.failures, 1);
    assert_eq!(snapshot.totals.completions, 0);
}

#[test]
fn test_leave_requeues_immediately() {
    let mut s = Scheduler::new(scheduler_config());
    let now = Instant::now();
    s.submit(SubmitRequest::new(add_program(), 2)).unwrap();
    let sa = join(&mut s, "a", 2, now);
    s.dispatch(now);

    let out = s
        .handle_message(
            hive::protocol::HiveMessage::Leave {
                node_id: NodeId::from("a"),
                session: sa,
            },
            now,
        )
        .unwrap();
    assert!(out.is_empty());
    assert!(s.members().is_empty());
    assert_eq!(s.ready_len(), 2);
}

/// Test: Reconnect
/// Given a node whose connection dropped while holding a lease
/// When it joins again under the same id
/// Then the old session's work is re-queued and its messages are stale
#[test]
fn test_rejoin_after_disconnect() {
    let mut s = Scheduler::new(scheduler_config());
    let t0 = Instant::now();
    s.submit(SubmitRequest::new(add_program(), 1)).unwrap();
    let old_session = join(&mut s, "a", 1, t0);
    let old = assigned(&s.dispatch(t0))[0];

    s.disconnected(&NodeId::from("a"), old_session);
    assert_eq!(s.lease_holders(&old.task_id), 1, "lease survives the socket");

    let t1 = t0 + Duration::from_millis(100);
    let new_session = join(&mut s, "a", 1, t1);
    let out = s.dispatch(t1);
    let new = assigned(&out)[0];
    assert_eq!(new.generation, old.generation + 1);
    assert!(out.iter().all(|o| o.session == new_session));

    assert!(!s.heartbeat(&NodeId::from("a"), old_session, &[old], t1));
    let d = s.task_result(&NodeId::from("a"), old_session, old, completed(), stats(3));
    assert_eq!(d, ResultDisposition::Stale);
}
