//! Node Agent actor.
//!
//! Connects to the coordinator, announces capacity, runs leased vCPUs on a
//! [`WorkerPool`] and reports results. Heartbeats carry the in-flight
//! `(task_id, generation)` set so the coordinator can renew leases. When
//! slots are idle the agent asks for work with a StealRequest.
//!
//! A dropped connection is retried with a fixed backoff under a fresh
//! session; a HelloReject stops the agent for good.

use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::core::NodeId;
use crate::protocol::{HiveCodec, HiveMessage, ProtocolError, PROTOCOL_VERSION};
use crate::util::unix_millis;
use crate::vcpu::{AcceleratorExecutor, HostAccelerator, Interpreter, ISA_VERSION};
use crate::{hlog, hlog_debug, hlog_error, hlog_trace, hlog_warn, Error, Result};

use super::worker::{WorkerPool, WorkerReport};
use super::ActorHandle;

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

type HiveStream = Framed<TcpStream, HiveCodec>;

#[derive(Debug, Clone, PartialEq)]
pub struct NodeAgentConfig {
    pub node_id: NodeId,
    pub coordinator: String,
    pub capacity: u32,
    pub cluster_epoch: u64,
    pub slice_cycles: u64,
    pub accelerator_timeout: Duration,
    pub reconnect_backoff: Duration,
    pub handshake_timeout: Duration,
    pub max_frame_bytes: usize,
}

impl NodeAgentConfig {
    pub fn from_config(node_id: impl Into<NodeId>, config: &Config) -> Self {
        Self {
            node_id: node_id.into(),
            coordinator: config.node.coordinator.clone(),
            capacity: config.node.capacity,
            cluster_epoch: config.coordinator.cluster_epoch,
            slice_cycles: config.node.slice_cycles,
            accelerator_timeout: config.node.accelerator_timeout(),
            reconnect_backoff: config.node.reconnect_backoff(),
            handshake_timeout: HANDSHAKE_TIMEOUT,
            max_frame_bytes: config.protocol.max_frame_bytes,
        }
    }

    pub fn with_coordinator(mut self, address: impl Into<String>) -> Self {
        self.coordinator = address.into();
        self
    }

    pub fn with_capacity(mut self, capacity: u32) -> Self {
        self.capacity = capacity;
        self
    }
}

/// Connection state published by a running agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeStatus {
    Connecting,
    Connected { session: u64 },
    Stopped,
}

enum SessionEnd {
    Shutdown,
    Disconnected,
}

pub struct NodeAgent {
    config: NodeAgentConfig,
    accelerator: Arc<dyn AcceleratorExecutor>,
}

impl NodeAgent {
    pub fn new(config: NodeAgentConfig) -> Self {
        Self {
            config,
            accelerator: Arc::new(HostAccelerator),
        }
    }

    pub fn with_accelerator(mut self, accelerator: Arc<dyn AcceleratorExecutor>) -> Self {
        self.accelerator = accelerator;
        self
    }

    /// Start the agent on the current runtime.
    pub fn spawn(self) -> NodeHandle {
        let cancel = CancellationToken::new();
        let (status_tx, status_rx) = watch::channel(NodeStatus::Connecting);
        let node_id = self.config.node_id.clone();
        let task = tokio::spawn(self.run(status_tx, cancel.clone()));
        NodeHandle {
            node_id,
            actor: ActorHandle::new(cancel),
            task,
            status: status_rx,
        }
    }

    async fn run(
        self,
        status_tx: watch::Sender<NodeStatus>,
        cancel: CancellationToken,
    ) -> Result<()> {
        let interpreter = Arc::new(Interpreter::new(
            Arc::clone(&self.accelerator),
            self.config.accelerator_timeout,
        ));
        hlog!(
            "Node {} starting (capacity {}, accelerator {})",
            self.config.node_id,
            self.config.capacity,
            interpreter.accelerator_name()
        );

        let result = loop {
            status_tx.send_replace(NodeStatus::Connecting);
            match self.session(&interpreter, &status_tx, &cancel).await {
                Ok(SessionEnd::Shutdown) => break Ok(()),
                Ok(SessionEnd::Disconnected) => {
                    hlog_warn!("Node {} lost its coordinator connection", self.config.node_id)
                }
                Err(Error::Protocol(ProtocolError::Rejected(reason))) => {
                    hlog_error!("Node {} rejected: {}", self.config.node_id, reason);
                    break Err(ProtocolError::Rejected(reason).into());
                }
                Err(e) => hlog_warn!("Node {} session failed: {}", self.config.node_id, e),
            }
            tokio::select! {
                _ = cancel.cancelled() => break Ok(()),
                _ = tokio::time::sleep(self.config.reconnect_backoff) => {}
            }
        };
        status_tx.send_replace(NodeStatus::Stopped);
        hlog!("Node {} stopped", self.config.node_id);
        result
    }

    async fn connect(
        &self,
        cancel: &CancellationToken,
    ) -> Result<Option<(HiveStream, u64, Duration)>> {
        let stream = tokio::select! {
            _ = cancel.cancelled() => return Ok(None),
            stream = TcpStream::connect(&self.config.coordinator) => stream?,
        };
        stream.set_nodelay(true)?;
        let mut framed = Framed::new(stream, HiveCodec::new(self.config.max_frame_bytes));
        framed
            .send(HiveMessage::Hello {
                node_id: self.config.node_id.clone(),
                capacity: self.config.capacity,
                protocol_version: PROTOCOL_VERSION,
                isa_version: ISA_VERSION,
                cluster_epoch: self.config.cluster_epoch,
            })
            .await?;

        let reply = tokio::time::timeout(self.config.handshake_timeout, framed.next())
            .await
            .map_err(|_| ProtocolError::HandshakeTimeout)?
            .ok_or(ProtocolError::ConnectionClosed)??;
        match reply {
            HiveMessage::HelloAck {
                cluster_epoch,
                session,
                heartbeat_interval_ms,
            } => {
                if cluster_epoch != self.config.cluster_epoch {
                    return Err(ProtocolError::IncompatibleEpoch {
                        expected: self.config.cluster_epoch,
                        got: cluster_epoch,
                    }
                    .into());
                }
                let interval = Duration::from_millis(heartbeat_interval_ms.max(1));
                Ok(Some((framed, session, interval)))
            }
            HiveMessage::HelloReject { reason } => Err(ProtocolError::Rejected(reason).into()),
            other => Err(ProtocolError::UnexpectedMessage(other.kind().to_string()).into()),
        }
    }

    async fn session(
        &self,
        interpreter: &Arc<Interpreter>,
        status_tx: &watch::Sender<NodeStatus>,
        cancel: &CancellationToken,
    ) -> Result<SessionEnd> {
        let Some((mut framed, session, heartbeat_interval)) = self.connect(cancel).await? else {
            return Ok(SessionEnd::Shutdown);
        };
        let node_id = self.config.node_id.clone();
        hlog!("Node {} connected, session {}", node_id, session);
        status_tx.send_replace(NodeStatus::Connected { session });

        let (done_tx, mut done_rx) = mpsc::unbounded_channel::<WorkerReport>();
        let mut pool = WorkerPool::new(
            self.config.capacity as usize,
            self.config.slice_cycles,
            Arc::clone(interpreter),
            done_tx,
            cancel.child_token(),
        );
        let mut heartbeat = tokio::time::interval(heartbeat_interval);
        heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    pool.cancel_all();
                    let leave = HiveMessage::Leave { node_id: node_id.clone(), session };
                    let _ = framed.send(leave).await;
                    return Ok(SessionEnd::Shutdown);
                }
                _ = heartbeat.tick() => {
                    framed
                        .send(HiveMessage::Heartbeat {
                            node_id: node_id.clone(),
                            session,
                            timestamp_ms: unix_millis(),
                            in_flight: pool.in_flight(),
                        })
                        .await?;
                    request_work(&mut framed, &node_id, session, &pool).await?;
                }
                Some(report) = done_rx.recv() => {
                    if !pool.finish(&report) {
                        hlog_debug!("Dropping superseded result for task {}", report.task_id.short());
                        continue;
                    }
                    hlog_trace!(
                        "Task {} finished after {} cycles",
                        report.task_id.short(),
                        report.stats.cycles
                    );
                    framed
                        .send(HiveMessage::TaskResult {
                            node_id: node_id.clone(),
                            session,
                            task_id: report.task_id,
                            generation: report.generation,
                            outcome: report.outcome,
                            stats: report.stats,
                        })
                        .await?;
                    request_work(&mut framed, &node_id, session, &pool).await?;
                }
                frame = framed.next() => match frame {
                    None => return Ok(SessionEnd::Disconnected),
                    Some(Err(e)) => return Err(e.into()),
                    Some(Ok(HiveMessage::TaskAssign(assignment))) => {
                        hlog_debug!(
                            "Node {} leased task {} gen {}",
                            node_id,
                            assignment.task_id.short(),
                            assignment.generation
                        );
                        pool.spawn(assignment);
                    }
                    Some(Ok(HiveMessage::StealGrant { victim, assignment })) => {
                        hlog_debug!(
                            "Node {} stole task {} from {}",
                            node_id,
                            assignment.task_id.short(),
                            victim
                        );
                        pool.spawn(assignment);
                    }
                    Some(Ok(other)) => {
                        return Err(ProtocolError::UnexpectedMessage(other.kind().to_string()).into());
                    }
                },
            }
        }
    }
}

/// Ask for work when slots are idle.
async fn request_work(
    framed: &mut HiveStream,
    node_id: &NodeId,
    session: u64,
    pool: &WorkerPool,
) -> Result<()> {
    if !pool.has_capacity() {
        return Ok(());
    }
    framed
        .send(HiveMessage::StealRequest {
            node_id: node_id.clone(),
            session,
            free_capacity: pool.free_slots() as u32,
        })
        .await?;
    Ok(())
}

/// Control handle for a spawned [`NodeAgent`].
pub struct NodeHandle {
    node_id: NodeId,
    actor: ActorHandle,
    task: JoinHandle<Result<()>>,
    status: watch::Receiver<NodeStatus>,
}

impl NodeHandle {
    pub fn node_id(&self) -> &NodeId {
        &self.node_id
    }

    pub fn status(&self) -> NodeStatus {
        *self.status.borrow()
    }

    /// Wait for the agent to hold a session. Returns the session number.
    pub async fn wait_connected(&mut self, timeout: Duration) -> Result<u64> {
        let wait = async {
            loop {
                match *self.status.borrow_and_update() {
                    NodeStatus::Connected { session } => return Ok(session),
                    NodeStatus::Stopped => return Err(Error::CoordinatorUnavailable),
                    NodeStatus::Connecting => {}
                }
                self.status
                    .changed()
                    .await
                    .map_err(|_| Error::CoordinatorUnavailable)?;
            }
        };
        tokio::time::timeout(timeout, wait)
            .await
            .map_err(|_| Error::Timeout(timeout))?
    }

    /// Resolve once the agent has stopped for any reason.
    pub async fn stopped(&mut self) {
        while *self.status.borrow_and_update() != NodeStatus::Stopped {
            if self.status.changed().await.is_err() {
                return;
            }
        }
    }

    /// Leave the cluster gracefully and wait for the agent to stop.
    pub async fn shutdown(self) -> Result<()> {
        self.actor.shutdown();
        self.task
            .await
            .map_err(|e| Error::TaskJoin(e.to_string()))?
    }

    /// Stop abruptly without a Leave, as if the process died.
    pub fn crash(self) {
        hlog_warn!("Node {} crashing", self.node_id);
        self.task.abort();
    }

    /// Wait for the agent to exit on its own, e.g. after a rejection.
    pub async fn join(self) -> Result<()> {
        self.task
            .await
            .map_err(|e| Error::TaskJoin(e.to_string()))?
    }
}
