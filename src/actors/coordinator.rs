//! Coordinator actor: the single authority over cluster state.
//!
//! ## Architecture
//!
//! ```text
//!  CoordinatorHandle ──Command──┐
//!                               ▼
//!  TcpListener ──accept──► ┌───────────────────┐ ◄── tick interval
//!                          │  coordinator loop │
//!  connection tasks ─────► │  (owns Scheduler) │ ──► watch<SubmissionReport>
//!   (Framed<HiveCodec>)    └───────────────────┘
//!        ▲                          │
//!        └──── per-connection mpsc ◄┘ Outbound messages
//! ```
//!
//! Connection tasks only frame bytes. Every decision is made inside the
//! loop, so task assignment is atomic without locks.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Instant;

use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::core::{NodeId, NodeSummary, SubmissionId};
use crate::orchestration::{
    Outbound, Scheduler, SchedulerConfig, SubmissionHandle, SubmissionReport, SubmitRequest,
    Telemetry, TelemetrySnapshot, DEFAULT_TELEMETRY_CAPACITY,
};
use crate::protocol::{HiveCodec, HiveMessage, ProtocolError};
use crate::{hlog, hlog_debug, hlog_warn, Error, Result};

use super::ActorHandle;

const COMMAND_BUFFER: usize = 256;

type ConnId = u64;

enum Command {
    Submit {
        request: SubmitRequest,
        reply: oneshot::Sender<Result<SubmissionHandle>>,
    },
    Cancel {
        id: SubmissionId,
        reply: oneshot::Sender<Result<()>>,
    },
    Report {
        id: SubmissionId,
        reply: oneshot::Sender<Option<SubmissionReport>>,
    },
    Nodes {
        reply: oneshot::Sender<Vec<NodeSummary>>,
    },
}

enum ConnEvent {
    Opened {
        conn: ConnId,
        peer: String,
        tx: mpsc::UnboundedSender<HiveMessage>,
    },
    Frame {
        conn: ConnId,
        message: HiveMessage,
    },
    Closed {
        conn: ConnId,
        reason: Option<ProtocolError>,
    },
}

struct Connection {
    peer: String,
    tx: mpsc::UnboundedSender<HiveMessage>,
    bound: Option<(NodeId, u64)>,
}

/// Builder for a running coordinator.
pub struct Coordinator {
    config: Config,
}

impl Coordinator {
    pub fn new(config: Config) -> Self {
        Self { config }
    }

    /// Bind the listener and spawn the coordinator loop.
    pub async fn start(self) -> Result<CoordinatorHandle> {
        let listener = TcpListener::bind(&self.config.coordinator.listen).await?;
        let local_addr = listener.local_addr()?;
        let (telemetry, sink) = Telemetry::new(DEFAULT_TELEMETRY_CAPACITY);
        let scheduler = Scheduler::new(SchedulerConfig::from(&self.config)).with_telemetry(sink);

        let cancel = CancellationToken::new();
        let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_BUFFER);
        let (conn_tx, conn_rx) = mpsc::unbounded_channel();
        let actor = CoordinatorLoop {
            config: self.config,
            scheduler,
            connections: HashMap::new(),
            by_node: HashMap::new(),
            watchers: HashMap::new(),
            next_conn: 1,
            conn_tx,
            cancel: cancel.clone(),
        };
        hlog!("Coordinator listening on {}", local_addr);
        let task = tokio::spawn(actor.run(listener, cmd_rx, conn_rx));

        Ok(CoordinatorHandle {
            commands: cmd_tx,
            local_addr,
            telemetry,
            actor: ActorHandle::new(cancel),
            task,
        })
    }
}

/// Client side of a running coordinator.
pub struct CoordinatorHandle {
    commands: mpsc::Sender<Command>,
    local_addr: SocketAddr,
    telemetry: Telemetry,
    actor: ActorHandle,
    task: JoinHandle<()>,
}

impl CoordinatorHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    async fn request<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(make(tx))
            .await
            .map_err(|_| Error::CoordinatorUnavailable)?;
        rx.await.map_err(|_| Error::CoordinatorUnavailable)
    }

    /// Submit a program. Fails with [`Error::Decode`] for malformed programs.
    pub async fn submit(&self, request: SubmitRequest) -> Result<SubmissionHandle> {
        self.request(|reply| Command::Submit { request, reply }).await?
    }

    pub async fn cancel(&self, id: SubmissionId) -> Result<()> {
        self.request(|reply| Command::Cancel { id, reply }).await?
    }

    pub async fn report(&self, id: SubmissionId) -> Result<SubmissionReport> {
        self.request(|reply| Command::Report { id, reply })
            .await?
            .ok_or(Error::SubmissionNotFound(id))
    }

    pub async fn nodes(&self) -> Result<Vec<NodeSummary>> {
        self.request(|reply| Command::Nodes { reply }).await
    }

    pub fn telemetry(&self) -> TelemetrySnapshot {
        self.telemetry.snapshot()
    }

    /// Stop the loop and close every connection.
    pub async fn shutdown(self) -> Result<()> {
        self.actor.shutdown();
        self.task
            .await
            .map_err(|e| Error::TaskJoin(e.to_string()))
    }
}

struct CoordinatorLoop {
    config: Config,
    scheduler: Scheduler,
    connections: HashMap<ConnId, Connection>,
    by_node: HashMap<NodeId, ConnId>,
    watchers: HashMap<SubmissionId, watch::Sender<SubmissionReport>>,
    next_conn: ConnId,
    conn_tx: mpsc::UnboundedSender<ConnEvent>,
    cancel: CancellationToken,
}

impl CoordinatorLoop {
    async fn run(
        mut self,
        listener: TcpListener,
        mut commands: mpsc::Receiver<Command>,
        mut conn_events: mpsc::UnboundedReceiver<ConnEvent>,
    ) {
        let mut tick = tokio::time::interval(self.config.coordinator.tick());
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    hlog_debug!("Coordinator cancelled");
                    break;
                }
                _ = tick.tick() => {
                    let out = self.scheduler.tick(Instant::now());
                    self.close_evicted();
                    self.deliver(out);
                }
                Some(command) = commands.recv() => self.handle_command(command),
                Some(event) = conn_events.recv() => self.handle_conn_event(event),
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => self.spawn_connection(stream, peer),
                    Err(e) => hlog_warn!("Accept failed: {}", e),
                },
            }
            self.publish();
        }
        hlog!("Coordinator stopped");
    }

    fn spawn_connection(&mut self, stream: TcpStream, peer: SocketAddr) {
        let conn = self.next_conn;
        self.next_conn += 1;
        hlog_debug!("Connection {} from {}", conn, peer);
        tokio::spawn(run_connection(
            conn,
            stream,
            peer.to_string(),
            self.config.protocol.max_frame_bytes,
            self.conn_tx.clone(),
            self.cancel.child_token(),
        ));
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Submit { request, reply } => {
                let result = self.scheduler.submit(request).and_then(|id| {
                    let report = self
                        .scheduler
                        .report(&id)
                        .ok_or(Error::SubmissionNotFound(id))?;
                    let (tx, rx) = watch::channel(report);
                    self.watchers.insert(id, tx);
                    Ok(SubmissionHandle::new(id, rx))
                });
                if let Err(e) = &result {
                    hlog_warn!("Submission rejected: {}", e);
                }
                let _ = reply.send(result);
                let out = self.scheduler.dispatch(Instant::now());
                self.deliver(out);
            }
            Command::Cancel { id, reply } => {
                let _ = reply.send(self.scheduler.cancel(id));
            }
            Command::Report { id, reply } => {
                let _ = reply.send(self.scheduler.report(&id));
            }
            Command::Nodes { reply } => {
                let _ = reply.send(self.scheduler.members().summaries(Instant::now()));
            }
        }
    }

    fn handle_conn_event(&mut self, event: ConnEvent) {
        match event {
            ConnEvent::Opened { conn, peer, tx } => {
                self.connections.insert(
                    conn,
                    Connection {
                        peer,
                        tx,
                        bound: None,
                    },
                );
            }
            ConnEvent::Frame { conn, message } => self.handle_frame(conn, message),
            ConnEvent::Closed { conn, reason } => {
                match &reason {
                    Some(e) => hlog_warn!("Connection {} closed: {}", conn, e),
                    None => hlog_debug!("Connection {} closed", conn),
                }
                self.drop_connection(conn);
            }
        }
    }

    fn handle_frame(&mut self, conn: ConnId, message: HiveMessage) {
        let Some(connection) = self.connections.get_mut(&conn) else {
            return;
        };
        let now = Instant::now();

        let Some((node_id, session)) = connection.bound.clone() else {
            match self.scheduler.handshake(&message, &connection.peer, now) {
                Ok(admission) => {
                    let _ = connection.tx.send(admission.ack);
                    connection.bound = Some((admission.node_id.clone(), admission.session));
                    // a rejoin supersedes the old socket; dropping it closes it
                    if let Some(old) = self.by_node.insert(admission.node_id, conn) {
                        self.connections.remove(&old);
                    }
                    let out = self.scheduler.dispatch(now);
                    self.deliver(out);
                }
                Err(e) => {
                    hlog_warn!("Rejecting handshake from {}: {}", connection.peer, e);
                    let _ = connection.tx.send(HiveMessage::HelloReject {
                        reason: e.to_string(),
                    });
                    self.connections.remove(&conn);
                }
            }
            return;
        };

        if message.sender() != Some((&node_id, session)) {
            hlog_warn!(
                "Connection {} ({}) sent {} for another identity, closing",
                conn,
                node_id,
                message.kind()
            );
            self.drop_connection(conn);
            return;
        }
        match self.scheduler.handle_message(message, now) {
            Ok(out) => {
                self.close_evicted();
                self.deliver(out);
            }
            Err(e) => {
                hlog_warn!("Protocol error from {}: {}", node_id, e);
                self.drop_connection(conn);
            }
        }
    }

    /// Forget a connection; dropping its sender closes the socket.
    fn drop_connection(&mut self, conn: ConnId) {
        let Some(connection) = self.connections.remove(&conn) else {
            return;
        };
        if let Some((node_id, session)) = connection.bound {
            if self.by_node.get(&node_id) == Some(&conn) {
                self.by_node.remove(&node_id);
            }
            self.scheduler.disconnected(&node_id, session);
        }
    }

    /// Close every connection whose session the scheduler has evicted
    /// (lost or left). The agent sees the close and rejoins with a new Hello.
    fn close_evicted(&mut self) {
        let evicted: Vec<ConnId> = self
            .connections
            .iter()
            .filter_map(|(conn, c)| {
                let (node_id, session) = c.bound.as_ref()?;
                self.scheduler
                    .members()
                    .current(node_id, *session)
                    .is_none()
                    .then_some(*conn)
            })
            .collect();
        for conn in evicted {
            hlog_warn!("Closing connection {}: session no longer a member", conn);
            self.drop_connection(conn);
        }
    }

    fn deliver(&mut self, out: Vec<Outbound>) {
        for Outbound {
            node,
            session,
            message,
        } in out
        {
            let target = self
                .by_node
                .get(&node)
                .and_then(|conn| self.connections.get(conn))
                .filter(|c| c.bound.as_ref().map(|(_, s)| *s) == Some(session));
            match target {
                Some(connection) => {
                    if connection.tx.send(message).is_err() {
                        hlog_debug!("Outbound to {} dropped, connection closing", node);
                    }
                }
                None => hlog_debug!(
                    "No connection for {}/{}, dropping {}",
                    node,
                    session,
                    message.kind()
                ),
            }
        }
    }

    /// Push fresh reports to submitters. Finished submissions are retired
    /// so only their final report stays in memory.
    fn publish(&mut self) {
        for id in self.scheduler.take_dirty() {
            let (report, terminal) = match self.scheduler.retire(&id) {
                Some(report) => (report, true),
                None => match self.scheduler.report(&id) {
                    Some(report) => (report, false),
                    None => continue,
                },
            };
            if terminal {
                hlog!("Submission {} finished: {}", id.short(), report.status);
                if let Some(tx) = self.watchers.remove(&id) {
                    tx.send_replace(report);
                }
            } else if let Some(tx) = self.watchers.get(&id) {
                tx.send_replace(report);
            }
        }
    }
}

/// Frame one TCP connection until either side closes it.
async fn run_connection(
    conn: ConnId,
    stream: TcpStream,
    peer: String,
    max_frame_bytes: usize,
    events: mpsc::UnboundedSender<ConnEvent>,
    cancel: CancellationToken,
) {
    let _ = stream.set_nodelay(true);
    let (tx, mut outbound) = mpsc::unbounded_channel();
    if events.send(ConnEvent::Opened { conn, peer, tx }).is_err() {
        return;
    }
    let mut framed = Framed::new(stream, HiveCodec::new(max_frame_bytes));

    let reason = loop {
        tokio::select! {
            _ = cancel.cancelled() => break None,
            message = outbound.recv() => match message {
                Some(message) => {
                    if let Err(e) = framed.send(message).await {
                        break Some(e);
                    }
                }
                None => break None,
            },
            frame = framed.next() => match frame {
                Some(Ok(message)) => {
                    if events.send(ConnEvent::Frame { conn, message }).is_err() {
                        break None;
                    }
                }
                Some(Err(e)) => break Some(e),
                None => break Some(ProtocolError::ConnectionClosed),
            },
        }
    };
    let _ = events.send(ConnEvent::Closed { conn, reason });
}
