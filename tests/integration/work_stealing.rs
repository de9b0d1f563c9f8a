//! Work-stealing tests.
//!
//! Staged backlog lives on the coordinator until it is leased, so a steal
//! only ever moves unleased work between nodes.

use std::time::Instant;

use hive::core::{NodeId, TaskState};
use hive::orchestration::{Scheduler, SchedulerConfig, SubmitRequest, Telemetry};
use hive::protocol::HiveMessage;

use crate::fixtures::*;

fn steal(s: &mut Scheduler, node: &str, session: u64, now: Instant) -> Vec<HiveMessage> {
    s.handle_message(
        HiveMessage::StealRequest {
            node_id: NodeId::from(node),
            session,
            free_capacity: 1,
        },
        now,
    )
    .unwrap()
    .into_iter()
    .map(|o| o.message)
    .collect()
}

/// Test: One task per steal
/// Given node A with five staged tasks and node B idle
/// When B sends a StealRequest
/// Then exactly one task, the tail of A's backlog, is granted to B and
/// four remain staged on A
#[test]
fn test_steal_grants_exactly_one() {
    let (telemetry, sink) = Telemetry::new(64);
    let mut s = Scheduler::new(SchedulerConfig {
        prefetch_depth: 5,
        ..scheduler_config()
    })
    .with_telemetry(sink);
    let now = Instant::now();
    s.submit(SubmitRequest::new(add_program(), 6)).unwrap();
    join(&mut s, "a", 1, now);
    s.dispatch(now);
    let a = NodeId::from("a");
    assert_eq!(s.node(&a).unwrap().leased.len(), 1);
    assert_eq!(s.node(&a).unwrap().backlog.len(), 5);
    let tail = *s.node(&a).unwrap().backlog.back().unwrap();

    let sb = join(&mut s, "b", 1, now);
    let out = steal(&mut s, "b", sb, now);
    assert_eq!(out.len(), 1);
    match &out[0] {
        HiveMessage::StealGrant { victim, assignment } => {
            assert_eq!(victim, &a);
            assert_eq!(assignment.task_id, tail);
        }
        other => panic!("expected StealGrant, got {:?}", other),
    }
    assert_eq!(s.node(&a).unwrap().backlog.len(), 4);
    assert!(matches!(
        &s.task(&tail).unwrap().state,
        TaskState::Assigned { node, .. } if node == &NodeId::from("b")
    ));
    assert_eq!(telemetry.snapshot().steals, 1);
}

/// Test: Leased work is never stolen
/// Given a node whose tasks are all leased and running
/// When another node asks to steal
/// Then nothing is granted and the leases are untouched
#[test]
fn test_running_task_never_stolen() {
    let mut s = Scheduler::new(scheduler_config());
    let now = Instant::now();
    s.submit(SubmitRequest::new(countdown_program(1_000), 2))
        .unwrap();
    let sa = join(&mut s, "a", 2, now);
    let running = assigned(&s.dispatch(now));
    s.heartbeat(&NodeId::from("a"), sa, &running, now);

    let sb = join(&mut s, "b", 2, now);
    assert!(steal(&mut s, "b", sb, now).is_empty());
    for task in &running {
        assert!(matches!(
            &s.task(&task.task_id).unwrap().state,
            TaskState::Running { node, .. } if node == &NodeId::from("a")
        ));
        assert_eq!(s.lease_holders(&task.task_id), 1);
    }
}

#[test]
fn test_global_queue_served_before_stealing() {
    let mut s = scheduler_with_prefetch(1);
    let now = Instant::now();
    s.submit(SubmitRequest::new(add_program(), 3)).unwrap();
    join(&mut s, "a", 1, now);
    s.dispatch(now);
    assert_eq!(s.ready_len(), 1);

    let sb = join(&mut s, "b", 1, now);
    let out = steal(&mut s, "b", sb, now);
    assert_eq!(out.len(), 1);
    assert!(matches!(out[0], HiveMessage::TaskAssign(_)));
    assert_eq!(s.node(&NodeId::from("a")).unwrap().backlog.len(), 1);
}

/// Test: Victim choice
/// Given A with more in-flight work than C
/// When B steals twice
/// Then the first steal hits A, and the tie that follows goes to the
/// lower node id
#[test]
fn test_steal_from_busiest_then_lowest_id() {
    let mut s = scheduler_with_prefetch(3);
    let now = Instant::now();
    s.submit(SubmitRequest::new(add_program(), 5)).unwrap();
    join(&mut s, "a", 1, now);
    join(&mut s, "c", 1, now);
    s.dispatch(now);
    assert_eq!(s.node(&NodeId::from("a")).unwrap().in_flight(), 3);
    assert_eq!(s.node(&NodeId::from("c")).unwrap().in_flight(), 2);

    let sb = join(&mut s, "b", 2, now);
    let victims: Vec<NodeId> = (0..2)
        .flat_map(|_| steal(&mut s, "b", sb, now))
        .filter_map(|m| match m {
            HiveMessage::StealGrant { victim, .. } => Some(victim),
            _ => None,
        })
        .collect();
    assert_eq!(victims, vec![NodeId::from("a"), NodeId::from("a")]);
    assert_eq!(s.node(&NodeId::from("a")).unwrap().backlog.len(), 0);
    assert_eq!(s.node(&NodeId::from("c")).unwrap().backlog.len(), 1);
}

#[test]
fn test_steal_from_stale_session_or_full_node_ignored() {
    let (telemetry, sink) = Telemetry::new(64);
    let mut s = Scheduler::new(SchedulerConfig {
        prefetch_depth: 2,
        ..scheduler_config()
    })
    .with_telemetry(sink);
    let now = Instant::now();
    s.submit(SubmitRequest::new(add_program(), 3)).unwrap();
    join(&mut s, "a", 1, now);
    s.dispatch(now);

    let sb = join(&mut s, "b", 1, now);
    assert!(steal(&mut s, "b", sb + 100, now).is_empty());
    assert_eq!(telemetry.snapshot().stale_discarded, 1);

    assert_eq!(steal(&mut s, "b", sb, now).len(), 1);
    // b is now full
    assert!(steal(&mut s, "b", sb, now).is_empty());
    assert_eq!(s.node(&NodeId::from("a")).unwrap().backlog.len(), 1);
}
