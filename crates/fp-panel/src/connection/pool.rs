//! Live agent connections
//!
//! One `AgentConnection` per registered agent tunnel. Outbound traffic goes
//! through `command_tx` to the connection's command processor; inbound frames
//! are routed by `dispatch` to whoever is waiting on them.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use fp_core::time::now_millis;
use fp_core::traits::{ShellEvent, ShellRequest};
use fp_core::{AgentId, NodeId, PanelError, ResourceSnapshot, TerminalSize};
use fp_protocol::{ErrorCode, Frame, Message, StreamId};

/// Capacity of the per-connection command queue
pub const COMMAND_BUFFER: usize = 256;

/// Work for a connection's command processor
#[derive(Debug)]
pub enum AgentCommand {
    Heartbeat { timestamp: u64 },
    QueryMetrics { request_id: u64 },
    OpenShell { stream_id: StreamId, request: ShellRequest },
    Input { stream_id: StreamId, data: bytes::Bytes },
    Resize { stream_id: StreamId, size: TerminalSize },
    CloseShell { stream_id: StreamId },
}

impl AgentCommand {
    /// Frame to put on the wire
    pub fn to_frame(self) -> Frame {
        match self {
            AgentCommand::Heartbeat { timestamp } => Frame::control(Message::Heartbeat { timestamp }),
            AgentCommand::QueryMetrics { request_id } => {
                Frame::control(Message::MetricsQuery { request_id })
            }
            AgentCommand::OpenShell { stream_id, request } => Frame::new(
                stream_id,
                Message::ShellOpen {
                    shell: request.shell,
                    env: request.env,
                    size: request.size,
                },
            ),
            AgentCommand::Input { stream_id, data } => Frame::new(stream_id, Message::Input(data)),
            AgentCommand::Resize { stream_id, size } => Frame::new(stream_id, Message::Resize(size)),
            AgentCommand::CloseShell { stream_id } => {
                Frame::new(stream_id, Message::ShellClose { exit_code: None })
            }
        }
    }
}

/// Identity an agent reported in `Register`
#[derive(Debug, Clone)]
pub struct AgentInfo {
    pub agent_id: AgentId,
    pub node_id: NodeId,
    pub hostname: String,
    pub os: String,
    pub arch: String,
    pub version: String,
}

/// A registered agent tunnel
pub struct AgentConnection {
    pub info: AgentInfo,
    /// Distinguishes a reconnect from the connection it replaced
    pub conn_id: u64,
    pub connected_at: u64,
    pub command_tx: mpsc::Sender<AgentCommand>,
    /// Cancelled to drop the tunnel
    pub cancel: CancellationToken,
    last_heartbeat: AtomicU64,
    next_request: AtomicU64,
    next_stream: AtomicU32,
    pending_metrics: DashMap<u64, oneshot::Sender<Result<ResourceSnapshot, PanelError>>>,
    pending_shells: DashMap<StreamId, oneshot::Sender<Result<u32, PanelError>>>,
    shells: DashMap<StreamId, mpsc::Sender<ShellEvent>>,
}

impl AgentConnection {
    pub fn new(
        info: AgentInfo,
        conn_id: u64,
        command_tx: mpsc::Sender<AgentCommand>,
        cancel: CancellationToken,
    ) -> Self {
        let now = now_millis();
        Self {
            info,
            conn_id,
            connected_at: now,
            command_tx,
            cancel,
            last_heartbeat: AtomicU64::new(now),
            next_request: AtomicU64::new(1),
            next_stream: AtomicU32::new(1),
            pending_metrics: DashMap::new(),
            pending_shells: DashMap::new(),
            shells: DashMap::new(),
        }
    }

    pub fn agent_id(&self) -> &AgentId {
        &self.info.agent_id
    }

    pub fn node_id(&self) -> &NodeId {
        &self.info.node_id
    }

    pub fn is_open(&self) -> bool {
        !self.cancel.is_cancelled() && !self.command_tx.is_closed()
    }

    pub fn record_heartbeat(&self) {
        self.last_heartbeat.store(now_millis(), Ordering::Relaxed);
    }

    pub fn last_heartbeat(&self) -> u64 {
        self.last_heartbeat.load(Ordering::Relaxed)
    }

    pub fn next_request_id(&self) -> u64 {
        self.next_request.fetch_add(1, Ordering::Relaxed)
    }

    /// Fresh shell stream; stream 0 is never handed out
    pub fn next_stream_id(&self) -> StreamId {
        StreamId::new(self.next_stream.fetch_add(1, Ordering::Relaxed))
    }

    /// Queue a command for the tunnel
    pub async fn send(&self, command: AgentCommand) -> Result<(), PanelError> {
        if self.cancel.is_cancelled() {
            return Err(self.gone());
        }
        self.command_tx.send(command).await.map_err(|_| self.gone())
    }

    /// Queue without waiting; for best-effort teardown paths
    pub fn try_send(&self, command: AgentCommand) -> bool {
        self.command_tx.try_send(command).is_ok()
    }

    pub fn await_metrics(
        &self,
        request_id: u64,
    ) -> oneshot::Receiver<Result<ResourceSnapshot, PanelError>> {
        let (tx, rx) = oneshot::channel();
        self.pending_metrics.insert(request_id, tx);
        rx
    }

    pub fn forget_metrics(&self, request_id: u64) {
        self.pending_metrics.remove(&request_id);
    }

    /// Register the sink for a shell's events and wait for the agent's ack
    pub fn await_shell(
        &self,
        stream_id: StreamId,
        events: mpsc::Sender<ShellEvent>,
    ) -> oneshot::Receiver<Result<u32, PanelError>> {
        let (tx, rx) = oneshot::channel();
        self.shells.insert(stream_id, events);
        self.pending_shells.insert(stream_id, tx);
        rx
    }

    /// Drop local state for a shell stream
    pub fn forget_shell(&self, stream_id: StreamId) {
        self.pending_shells.remove(&stream_id);
        self.shells.remove(&stream_id);
    }

    pub fn shell_count(&self) -> usize {
        self.shells.len()
    }

    /// Route an inbound frame from the agent
    pub async fn dispatch(&self, frame: Frame) {
        let stream_id = frame.stream_id;
        match frame.message {
            Message::MetricsReport {
                request_id,
                snapshot,
            } => match self.pending_metrics.remove(&request_id) {
                Some((_, tx)) => {
                    let _ = tx.send(Ok(snapshot.normalized()));
                }
                None => tracing::debug!(
                    "Late metrics report {} from {}",
                    request_id,
                    self.agent_id()
                ),
            },

            Message::ShellReady { pid } => {
                tracing::debug!("Shell {} ready on {}, pid={}", stream_id, self.agent_id(), pid);
                if let Some((_, tx)) = self.pending_shells.remove(&stream_id) {
                    if tx.send(Ok(pid)).is_err() {
                        // Opener gave up; release the remote side
                        self.forget_shell(stream_id);
                        self.try_send(AgentCommand::CloseShell { stream_id });
                    }
                }
            }

            Message::Output(data) => {
                self.deliver(stream_id, ShellEvent::Output(data)).await;
            }

            Message::ShellClose { exit_code } => {
                tracing::debug!(
                    "Shell {} closed on {}, exit_code={:?}",
                    stream_id,
                    self.agent_id(),
                    exit_code
                );
                self.deliver(stream_id, ShellEvent::Exited { exit_code }).await;
                self.forget_shell(stream_id);
            }

            Message::Error { code, message } => self.handle_error(stream_id, code, message).await,

            Message::HeartbeatAck { timestamp } => {
                let latency = now_millis().saturating_sub(timestamp);
                tracing::trace!("Heartbeat ack from {}, latency={}ms", self.agent_id(), latency);
                self.record_heartbeat();
            }

            other => {
                tracing::warn!(
                    "Unexpected message from {}: {:?}",
                    self.agent_id(),
                    other.message_type()
                );
            }
        }
    }

    /// Fail everything still waiting on this connection. Dropping the shell
    /// sinks ends every open shell's event stream.
    pub fn fail_all(&self) {
        let requests: Vec<u64> = self.pending_metrics.iter().map(|r| *r.key()).collect();
        for id in requests {
            if let Some((_, tx)) = self.pending_metrics.remove(&id) {
                let _ = tx.send(Err(self.gone()));
            }
        }
        let opening: Vec<StreamId> = self.pending_shells.iter().map(|r| *r.key()).collect();
        for stream_id in opening {
            if let Some((_, tx)) = self.pending_shells.remove(&stream_id) {
                let _ = tx.send(Err(self.gone()));
            }
        }
        self.shells.clear();
    }

    async fn deliver(&self, stream_id: StreamId, event: ShellEvent) {
        let Some(sink) = self.shells.get(&stream_id).map(|r| r.clone()) else {
            tracing::trace!("Dropping event for unknown {} on {}", stream_id, self.agent_id());
            return;
        };
        if sink.send(event).await.is_err() {
            // Nobody is reading this shell anymore
            self.forget_shell(stream_id);
            self.try_send(AgentCommand::CloseShell { stream_id });
        }
    }

    async fn handle_error(&self, stream_id: StreamId, code: ErrorCode, message: String) {
        tracing::warn!(
            "Agent {} reported {:?} on {}: {}",
            self.agent_id(),
            code,
            stream_id,
            message
        );

        if stream_id.is_control() {
            if code == ErrorCode::MetricsUnavailable {
                let requests: Vec<u64> = self.pending_metrics.iter().map(|r| *r.key()).collect();
                for id in requests {
                    if let Some((_, tx)) = self.pending_metrics.remove(&id) {
                        let _ = tx.send(Err(PanelError::Unreachable(format!(
                            "agent {} could not read metrics: {}",
                            self.agent_id(),
                            message
                        ))));
                    }
                }
            }
            return;
        }

        if let Some((_, tx)) = self.pending_shells.remove(&stream_id) {
            let _ = tx.send(Err(PanelError::Unreachable(format!(
                "agent {} could not open a shell: {}",
                self.agent_id(),
                message
            ))));
            self.shells.remove(&stream_id);
        } else {
            self.deliver(stream_id, ShellEvent::Exited { exit_code: None })
                .await;
            self.forget_shell(stream_id);
        }
    }

    fn gone(&self) -> PanelError {
        PanelError::Unreachable(format!("agent {} disconnected", self.agent_id()))
    }
}

/// Registered agents, keyed by agent id
pub struct AgentPool {
    connections: DashMap<AgentId, Arc<AgentConnection>>,
    next_conn_id: AtomicU64,
}

impl AgentPool {
    pub fn new() -> Self {
        Self {
            connections: DashMap::new(),
            next_conn_id: AtomicU64::new(1),
        }
    }

    pub fn next_conn_id(&self) -> u64 {
        self.next_conn_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Add a connection. A previous tunnel of the same agent is cancelled and
    /// returned.
    pub fn insert(&self, conn: Arc<AgentConnection>) -> Option<Arc<AgentConnection>> {
        let previous = self.connections.insert(conn.agent_id().clone(), conn);
        if let Some(old) = &previous {
            tracing::info!(
                "Agent {} reconnected; dropping previous tunnel",
                old.agent_id()
            );
            old.cancel.cancel();
            old.fail_all();
        }
        previous
    }

    pub fn get(&self, agent_id: &AgentId) -> Option<Arc<AgentConnection>> {
        self.connections.get(agent_id).map(|r| Arc::clone(&r))
    }

    /// Remove the agent's connection only if it is still `conn_id`
    pub fn remove_if_same(&self, agent_id: &AgentId, conn_id: u64) -> Option<Arc<AgentConnection>> {
        self.connections
            .remove_if(agent_id, |_, c| c.conn_id == conn_id)
            .map(|(_, c)| c)
    }

    pub fn remove(&self, agent_id: &AgentId) -> Option<Arc<AgentConnection>> {
        self.connections.remove(agent_id).map(|(_, c)| c)
    }

    pub fn list(&self) -> Vec<Arc<AgentConnection>> {
        self.connections.iter().map(|r| Arc::clone(&r)).collect()
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }
}

impl Default for AgentPool {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use bytes::Bytes;

    pub(crate) fn connection(
        agent: &str,
        conn_id: u64,
    ) -> (Arc<AgentConnection>, mpsc::Receiver<AgentCommand>) {
        let (tx, rx) = mpsc::channel(COMMAND_BUFFER);
        let info = AgentInfo {
            agent_id: AgentId::new(agent),
            node_id: NodeId::new(format!("node-of-{}", agent)),
            hostname: "web-1".into(),
            os: "linux".into(),
            arch: "x86_64".into(),
            version: fp_protocol::PROTOCOL_VERSION.into(),
        };
        (
            Arc::new(AgentConnection::new(info, conn_id, tx, CancellationToken::new())),
            rx,
        )
    }

    #[test]
    fn stream_ids_skip_control() {
        let (conn, _rx) = connection("a1", 1);
        assert_eq!(conn.next_stream_id(), StreamId::new(1));
        assert_eq!(conn.next_stream_id(), StreamId::new(2));
    }

    #[tokio::test]
    async fn metrics_report_completes_the_waiting_query() {
        let (conn, _rx) = connection("a1", 1);
        let rx = conn.await_metrics(7);
        let snapshot = ResourceSnapshot {
            cpu_percent: 12.0,
            ram_percent: 40.0,
            disk_percent: 55.0,
            uptime_secs: 100,
        };
        conn.dispatch(Frame::control(Message::MetricsReport {
            request_id: 7,
            snapshot,
        }))
        .await;
        assert_eq!(rx.await.unwrap().unwrap(), snapshot);
    }

    #[tokio::test]
    async fn shell_events_arrive_in_order() {
        let (conn, _rx) = connection("a1", 1);
        let stream = conn.next_stream_id();
        let (tx, mut events) = mpsc::channel(8);
        let ready = conn.await_shell(stream, tx);

        conn.dispatch(Frame::new(stream, Message::ShellReady { pid: 42 })).await;
        assert_eq!(ready.await.unwrap().unwrap(), 42);

        conn.dispatch(Frame::new(stream, Message::Output(Bytes::from_static(b"a"))))
            .await;
        conn.dispatch(Frame::new(stream, Message::Output(Bytes::from_static(b"b"))))
            .await;
        conn.dispatch(Frame::new(stream, Message::ShellClose { exit_code: Some(0) }))
            .await;

        assert_eq!(events.recv().await, Some(ShellEvent::Output(Bytes::from_static(b"a"))));
        assert_eq!(events.recv().await, Some(ShellEvent::Output(Bytes::from_static(b"b"))));
        assert_eq!(
            events.recv().await,
            Some(ShellEvent::Exited { exit_code: Some(0) })
        );
        assert_eq!(events.recv().await, None);
        assert_eq!(conn.shell_count(), 0);
    }

    #[tokio::test]
    async fn open_error_fails_the_opener() {
        let (conn, _rx) = connection("a1", 1);
        let stream = conn.next_stream_id();
        let (tx, _events) = mpsc::channel(8);
        let ready = conn.await_shell(stream, tx);

        conn.dispatch(Frame::new(
            stream,
            Message::Error {
                code: ErrorCode::PtyAllocationFailed,
                message: "no ptys".into(),
            },
        ))
        .await;
        assert!(matches!(ready.await.unwrap(), Err(PanelError::Unreachable(_))));
        assert_eq!(conn.shell_count(), 0);
    }

    #[tokio::test]
    async fn fail_all_releases_waiters() {
        let (conn, _rx) = connection("a1", 1);
        let metrics = conn.await_metrics(1);
        let (tx, mut events) = mpsc::channel(8);
        let _ready = conn.await_shell(StreamId::new(3), tx);

        conn.fail_all();
        assert!(metrics.await.unwrap().is_err());
        assert_eq!(events.recv().await, None);
    }

    #[test]
    fn reconnect_replaces_and_cancels_previous() {
        let pool = AgentPool::new();
        let (first, _rx1) = connection("a1", 1);
        let (second, _rx2) = connection("a1", 2);

        assert!(pool.insert(Arc::clone(&first)).is_none());
        assert!(pool.insert(Arc::clone(&second)).is_some());
        assert!(first.cancel.is_cancelled());

        // The stale handler's cleanup must not evict the new tunnel
        assert!(pool.remove_if_same(&AgentId::new("a1"), 1).is_none());
        assert_eq!(pool.get(&AgentId::new("a1")).unwrap().conn_id, 2);
        assert!(pool.remove_if_same(&AgentId::new("a1"), 2).is_some());
        assert!(pool.is_empty());
    }
}
