//! Scheduling tests against the pure scheduler with simulated time.

use std::collections::HashSet;
use std::time::{Duration, Instant};

use hive::core::{NodeId, TaskId, TaskState, TaskStatus};
use hive::orchestration::{Scheduler, SubmitRequest, Telemetry};
use hive::protocol::HiveMessage;
use hive::vcpu::{DecodeError, Instruction, Operand, Program};
use hive::Error;

use crate::fixtures::*;

/// Test: Decode at submission
/// Given a program that names a register outside the register file
/// When it is submitted
/// Then the submission fails with a DecodeError and no task is created
#[test]
fn test_submit_rejects_out_of_range_register() {
    let mut s = Scheduler::new(scheduler_config());
    let program = Program::new(vec![
        Instruction::mov(0, Operand::Imm(1)),
        Instruction::add(99, Operand::Reg(0), Operand::Imm(1)),
        Instruction::halt(),
    ]);
    let err = s.submit(SubmitRequest::new(program, 4)).unwrap_err();
    assert!(matches!(
        err,
        Error::Decode(DecodeError::RegisterOutOfRange {
            index: 1,
            register: 99,
            ..
        })
    ));
    assert_eq!(s.ready_len(), 0);
}

#[test]
fn test_submit_with_custom_layout() {
    let mut s = Scheduler::new(scheduler_config());
    let program = Program::new(vec![Instruction::mov(40, Operand::Imm(1))]);
    assert!(s.submit(SubmitRequest::new(program.clone(), 1)).is_err());

    let layout = hive::vcpu::VcpuLayout {
        registers: 64,
        memory_words: 8,
    };
    let id = s
        .submit(SubmitRequest::new(program, 1).with_layout(layout))
        .unwrap();
    let now = Instant::now();
    join(&mut s, "a", 1, now);
    let out = s.dispatch(now);
    match &out[0].message {
        HiveMessage::TaskAssign(a) => assert_eq!(a.layout, layout),
        other => panic!("expected TaskAssign, got {:?}", other),
    }
    assert_eq!(s.tasks_of(&id).len(), 1);
}

/// Test: Capacity
/// Given two nodes with capacity 2 and 1
/// When six tasks are queued
/// Then exactly three are leased and no node exceeds its capacity
#[test]
fn test_assignment_respects_capacity() {
    let mut s = Scheduler::new(scheduler_config());
    let now = Instant::now();
    s.submit(SubmitRequest::new(add_program(), 6)).unwrap();
    join(&mut s, "a", 2, now);
    join(&mut s, "b", 1, now);

    let out = s.dispatch(now);
    assert_eq!(assigned_to(&out, "a").len(), 2);
    assert_eq!(assigned_to(&out, "b").len(), 1);
    assert_eq!(s.ready_len(), 3);
    for node in s.members().iter() {
        assert!(node.leased.len() <= node.capacity as usize);
    }
}

/// Test: At most one lease
/// Given a busy cluster with results, heartbeats and re-joins interleaved
/// When the state is inspected after every step
/// Then no task is ever leased to more than one node
#[test]
fn test_at_most_one_lease_per_task() {
    let mut s = scheduler_with_prefetch(1);
    let t0 = Instant::now();
    let id = s.submit(SubmitRequest::new(add_program(), 8)).unwrap();
    let sa = join(&mut s, "a", 2, t0);
    let sb = join(&mut s, "b", 2, t0);

    let check = |s: &Scheduler| {
        for task in s.tasks_of(&id) {
            assert!(s.lease_holders(&task.id) <= 1, "task {} double-leased", task.id);
        }
    };

    let out = s.dispatch(t0);
    check(&s);
    let a_tasks = assigned_to(&out, "a");

    // a finishes one, b re-joins, a steals
    let t1 = t0 + Duration::from_millis(50);
    s.handle_message(result("a", sa, a_tasks[0], completed()), t1)
        .unwrap();
    check(&s);
    let sb2 = join(&mut s, "b", 2, t1);
    assert_ne!(sb, sb2);
    check(&s);
    s.dispatch(t1);
    check(&s);
    s.handle_message(
        HiveMessage::StealRequest {
            node_id: NodeId::from("a"),
            session: sa,
            free_capacity: 1,
        },
        t1,
    )
    .unwrap();
    check(&s);
    s.tick(t1 + Duration::from_millis(200));
    check(&s);
}

#[test]
fn test_fifo_across_submissions() {
    let mut s = Scheduler::new(scheduler_config());
    let now = Instant::now();
    let first = s.submit(SubmitRequest::new(add_program(), 2)).unwrap();
    let second = s.submit(SubmitRequest::new(add_program(), 2)).unwrap();
    join(&mut s, "a", 2, now);

    let leased: HashSet<TaskId> = assigned(&s.dispatch(now))
        .iter()
        .map(|r| r.task_id)
        .collect();
    let first_ids: HashSet<TaskId> = s.tasks_of(&first).iter().map(|t| t.id).collect();
    assert_eq!(leased, first_ids);
    assert_eq!(s.report(&second).unwrap().status, TaskStatus::Pending);
}

/// Test: Submission lifecycle
/// Given a two-vCPU submission
/// When both tasks complete
/// Then the report reads Completed with per-vCPU results and telemetry
/// attributes the cycles to the node and the program
#[test]
fn test_submission_completes_with_results_and_telemetry() {
    let (telemetry, sink) = Telemetry::new(64);
    let mut s = Scheduler::new(scheduler_config()).with_telemetry(sink);
    let now = Instant::now();
    let id = s.submit(SubmitRequest::new(add_program(), 2)).unwrap();
    let session = join(&mut s, "a", 2, now);
    let tasks = assigned(&s.dispatch(now));
    assert_eq!(s.report(&id).unwrap().status, TaskStatus::Running);

    for task in &tasks {
        s.handle_message(result("a", session, *task, completed()), now)
            .unwrap();
    }
    let report = s.report(&id).unwrap();
    assert_eq!(report.status, TaskStatus::Completed);
    assert!(report.tasks.iter().all(|t| t.result.is_some()));
    assert_eq!(report.tasks[0].vcpu, 0);
    assert_eq!(report.tasks[1].vcpu, 1);

    let snapshot = telemetry.snapshot();
    assert_eq!(snapshot.totals.completions, 2);
    assert_eq!(snapshot.totals.cycles, 6);
    assert_eq!(snapshot.nodes[&NodeId::from("a")].cycles, 6);
    assert_eq!(snapshot.programs[&id].completions, 2);
    assert_eq!(snapshot.nodes_joined, 1);
}

#[test]
fn test_heartbeat_moves_assigned_to_running() {
    let mut s = Scheduler::new(scheduler_config());
    let t0 = Instant::now();
    s.submit(SubmitRequest::new(add_program(), 1)).unwrap();
    let session = join(&mut s, "a", 1, t0);
    let task = assigned(&s.dispatch(t0))[0];
    assert!(matches!(
        s.task(&task.task_id).unwrap().state,
        TaskState::Assigned { .. }
    ));

    s.handle_message(heartbeat("a", session, vec![task]), t0)
        .unwrap();
    assert!(matches!(
        s.task(&task.task_id).unwrap().state,
        TaskState::Running { .. }
    ));
}

#[test]
fn test_cancel_retires_queued_work() {
    let mut s = Scheduler::new(scheduler_config());
    let now = Instant::now();
    let id = s.submit(SubmitRequest::new(add_program(), 3)).unwrap();
    s.cancel(id).unwrap();
    assert_eq!(s.ready_len(), 0);

    join(&mut s, "a", 3, now);
    assert!(assigned(&s.dispatch(now)).is_empty());
    match s.report(&id).unwrap().status {
        TaskStatus::Failed { error } => assert!(error.contains("3 of 3")),
        other => panic!("expected Failed, got {:?}", other),
    }
}

#[test]
fn test_non_node_messages_are_protocol_errors() {
    let mut s = Scheduler::new(scheduler_config());
    let now = Instant::now();
    assert!(s
        .handle_message(
            HiveMessage::HelloReject {
                reason: "no".to_string()
            },
            now
        )
        .is_err());
    assert!(s.handle_message(hello("a", 1), now).is_err());
}
