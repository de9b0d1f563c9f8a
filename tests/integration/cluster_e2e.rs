//! End-to-end cluster tests over loopback TCP.
//!
//! A slow accelerator pins a task on one node long enough to crash it,
//! make it leave, or have its staged backlog stolen.

use std::sync::Arc;
use std::time::Duration;

use hive::core::{NodeId, SubmissionId, TaskStatus};
use hive::orchestration::SubmitRequest;
use hive::protocol::ProtocolError;
use hive::vcpu::{
    assemble, AcceleratorError, AcceleratorExecutor, HostAccelerator, MatrixOp, Program,
};
use hive::{CoordinatorHandle, Error, NodeAgent, NodeHandle};

use crate::fixtures::*;

const WAIT: Duration = Duration::from_secs(10);

struct SlowAccelerator(Duration);

impl AcceleratorExecutor for SlowAccelerator {
    fn name(&self) -> &str {
        "slow"
    }

    fn execute_matrix_op(&self, op: &MatrixOp) -> Result<Vec<i64>, AcceleratorError> {
        std::thread::sleep(self.0);
        HostAccelerator.execute_matrix_op(op)
    }
}

fn matrix_program() -> Program {
    assemble(
        "
        STORE 1, 0
        STORE 2, 3
        STORE 3, 4
        STORE 4, 7
        MOV r1, 8
        MATMUL r1, 0, 4 [2x2x2]
        HALT
        ",
    )
    .unwrap()
}

async fn spawn_slow(cluster: &TestCluster, id: &str, capacity: u32) -> NodeHandle {
    let mut handle = NodeAgent::new(cluster.agent_config(id, capacity))
        .with_accelerator(Arc::new(SlowAccelerator(Duration::from_millis(500))))
        .spawn();
    handle.wait_connected(WAIT).await.unwrap();
    handle
}

/// Poll until `node` holds `count` leases.
async fn wait_for_leases(coordinator: &CoordinatorHandle, node: &str, count: usize) {
    let node = NodeId::from(node);
    tokio::time::timeout(WAIT, async {
        loop {
            let nodes = coordinator.nodes().await.unwrap();
            if nodes.iter().any(|n| n.id == node && n.leased == count) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("lease observed");
}

/// Test: Happy path
/// Given two nodes and a four-vCPU submission
/// When the cluster runs it
/// Then every vCPU reports r1 = 100 and telemetry counts the work
#[tokio::test]
async fn test_submission_runs_across_nodes() {
    let cluster = TestCluster::start(cluster_config(), &[2, 2]).await;
    let mut handle = cluster
        .coordinator
        .submit(SubmitRequest::new(add_program(), 4))
        .await
        .unwrap();
    let report = handle.wait_timeout(WAIT).await.unwrap();

    assert_eq!(report.status, TaskStatus::Completed);
    assert_eq!(report.tasks.len(), 4);
    for task in &report.tasks {
        let result = task.result.as_ref().unwrap();
        assert_eq!(result.registers[1], 100);
        assert_eq!(result.stats.cycles, 3);
    }

    let telemetry = cluster.coordinator.telemetry();
    assert_eq!(telemetry.totals.completions, 4);
    assert_eq!(telemetry.totals.cycles, 12);
    assert_eq!(telemetry.programs[&report.id].completions, 4);
    assert_eq!(telemetry.nodes_joined, 2);

    // the finished submission is retired but its report is still served
    let later = cluster.coordinator.report(report.id).await.unwrap();
    assert_eq!(later, report);
    cluster.shutdown().await;
}

#[tokio::test]
async fn test_matrix_program_end_to_end() {
    let cluster = TestCluster::start(cluster_config(), &[1]).await;
    let mut handle = cluster
        .coordinator
        .submit(SubmitRequest::new(matrix_program(), 1))
        .await
        .unwrap();
    let report = handle.wait_timeout(WAIT).await.unwrap();
    let result = report.tasks[0].result.as_ref().unwrap();
    // [1 0; 0 2] @ [3 0; 0 4]
    assert_eq!(&result.memory[8..12], &[3, 0, 0, 8]);
    assert_eq!(result.stats.matrix_ops, 1);
    cluster.shutdown().await;
}

/// Test: Node crash
/// Given a node running a leased task
/// When the node dies without a Leave
/// Then after its heartbeat timeout the task is re-queued and completed
/// by another node
#[tokio::test]
async fn test_crashed_node_work_completes_elsewhere() {
    let mut cluster = TestCluster::start(cluster_config(), &[]).await;
    let slow = spawn_slow(&cluster, "slow", 1).await;
    let mut handle = cluster
        .coordinator
        .submit(SubmitRequest::new(matrix_program(), 1))
        .await
        .unwrap();
    wait_for_leases(&cluster.coordinator, "slow", 1).await;

    slow.crash();
    cluster.add_node("fast", 1).await;

    let report = handle.wait_timeout(WAIT).await.unwrap();
    assert_eq!(report.status, TaskStatus::Completed);
    let telemetry = cluster.coordinator.telemetry();
    assert_eq!(telemetry.nodes_lost, 1);
    assert_eq!(telemetry.requeues, 1);
    assert_eq!(telemetry.nodes[&NodeId::from("fast")].completions, 1);
    assert!(!telemetry.nodes.contains_key(&NodeId::from("slow")));
    cluster.shutdown().await;
}

#[tokio::test]
async fn test_leaving_node_hands_work_back() {
    let mut cluster = TestCluster::start(cluster_config(), &[]).await;
    let slow = spawn_slow(&cluster, "slow", 1).await;
    let mut handle = cluster
        .coordinator
        .submit(SubmitRequest::new(matrix_program(), 1))
        .await
        .unwrap();
    wait_for_leases(&cluster.coordinator, "slow", 1).await;

    slow.shutdown().await.unwrap();
    cluster.add_node("fast", 1).await;

    let report = handle.wait_timeout(WAIT).await.unwrap();
    assert_eq!(report.status, TaskStatus::Completed);
    let telemetry = cluster.coordinator.telemetry();
    assert_eq!(telemetry.nodes_lost, 0);
    assert_eq!(telemetry.requeues, 1);
    cluster.shutdown().await;
}

/// Test: Stealing over the wire
/// Given a slow node with two staged tasks behind its running one
/// When an idle node joins
/// Then the idle node steals both staged tasks one at a time
#[tokio::test]
async fn test_idle_node_steals_staged_work() {
    let mut config = cluster_config();
    config.coordinator.prefetch_depth = 2;
    let mut cluster = TestCluster::start(config, &[]).await;
    let slow = spawn_slow(&cluster, "slow", 1).await;
    let mut handle = cluster
        .coordinator
        .submit(SubmitRequest::new(matrix_program(), 3))
        .await
        .unwrap();
    wait_for_leases(&cluster.coordinator, "slow", 1).await;

    let mut fast = NodeAgent::new(cluster.agent_config("fast", 1)).spawn();
    fast.wait_connected(WAIT).await.unwrap();

    let report = handle.wait_timeout(WAIT).await.unwrap();
    assert_eq!(report.status, TaskStatus::Completed);
    let telemetry = cluster.coordinator.telemetry();
    assert_eq!(telemetry.steals, 2);
    assert_eq!(telemetry.nodes[&NodeId::from("fast")].completions, 2);
    assert_eq!(telemetry.nodes[&NodeId::from("slow")].completions, 1);

    slow.shutdown().await.unwrap();
    fast.shutdown().await.unwrap();
    cluster.shutdown().await;
}

#[tokio::test]
async fn test_cancel_pending_submission() {
    let cluster = TestCluster::start(cluster_config(), &[]).await;
    let mut handle = cluster
        .coordinator
        .submit(SubmitRequest::new(add_program(), 2))
        .await
        .unwrap();
    assert_eq!(handle.status(), TaskStatus::Pending);

    cluster.coordinator.cancel(handle.id()).await.unwrap();
    let report = handle.wait_timeout(WAIT).await.unwrap();
    match report.status {
        TaskStatus::Failed { error } => assert!(error.contains("cancelled")),
        other => panic!("expected Failed, got {:?}", other),
    }
    assert!(matches!(
        cluster.coordinator.report(SubmissionId::new()).await,
        Err(Error::SubmissionNotFound(_))
    ));
    cluster.shutdown().await;
}

#[tokio::test]
async fn test_invalid_program_rejected_at_submit() {
    let cluster = TestCluster::start(cluster_config(), &[1]).await;
    let program = assemble("ADD r20, r0, 1").unwrap();
    let err = cluster
        .coordinator
        .submit(SubmitRequest::new(program, 1))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Decode(_)));
    cluster.shutdown().await;
}

/// Test: Rejected node stops
/// Given a node configured for another cluster epoch
/// When it connects
/// Then it is rejected and stops instead of retrying
#[tokio::test]
async fn test_node_on_wrong_epoch_stops() {
    let cluster = TestCluster::start(cluster_config(), &[]).await;
    let mut config = cluster.agent_config("stranger", 1);
    config.cluster_epoch += 1;
    let handle = NodeAgent::new(config).spawn();

    let result = tokio::time::timeout(WAIT, handle.join()).await.unwrap();
    assert!(matches!(
        result,
        Err(Error::Protocol(ProtocolError::Rejected(_)))
    ));
    assert!(cluster.coordinator.nodes().await.unwrap().is_empty());
    cluster.shutdown().await;
}
