//! Tunnel shell gateway
//!
//! Operators drive remote shells through short request/response calls: start,
//! send input, poll for output. Each session lives in the gateway's registry;
//! a pump task moves the agent's shell events into the session buffer, and a
//! poll drains whatever has accumulated since the previous one.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use bytes::Bytes;
use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use fp_core::config::ShellConfig;
use fp_core::time::now_millis;
use fp_core::traits::{AgentRpc, ShellEvent, ShellRequest};
use fp_core::{
    AgentId, ConnectionType, NodeId, NodeStatus, Operator, PanelError, ShellId, ShellState,
    TerminalSize,
};
use fp_protocol::StreamId;

use crate::registry::NodeRegistry;

/// One chunk of shell output
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputChunk {
    pub seq: u64,
    pub data: Bytes,
}

/// Result of a poll
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShellOutput {
    pub shell_id: ShellId,
    pub state: ShellState,
    pub events: Vec<OutputChunk>,
    /// Chunks discarded since the previous poll because the buffer was full
    pub dropped: u64,
    pub exit_code: Option<i32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ShellSummary {
    pub shell_id: ShellId,
    pub node_id: NodeId,
    pub owner: String,
    pub state: ShellState,
    pub pid: Option<u32>,
    pub created_at: u64,
    pub last_poll: u64,
}

#[derive(Debug)]
struct SessionBuffer {
    state: ShellState,
    stream_id: Option<StreamId>,
    pid: Option<u32>,
    events: VecDeque<OutputChunk>,
    buffered_bytes: usize,
    dropped: u64,
    next_seq: u64,
    exit_code: Option<i32>,
}

pub struct ShellSession {
    pub id: ShellId,
    /// Operator who started the shell
    pub owner: String,
    pub node_id: NodeId,
    pub agent_id: AgentId,
    pub created_at: u64,
    buffer: Mutex<SessionBuffer>,
    /// Serializes writers so input chunks reach the shell whole and in order
    input_lock: tokio::sync::Mutex<()>,
    last_poll: AtomicU64,
    closed: AtomicBool,
    pump: Mutex<Option<JoinHandle<()>>>,
}

impl ShellSession {
    fn new(owner: &Operator, node_id: NodeId, agent_id: AgentId) -> Self {
        let now = now_millis();
        Self {
            id: ShellId::generate(),
            owner: owner.name.clone(),
            node_id,
            agent_id,
            created_at: now,
            buffer: Mutex::new(SessionBuffer {
                state: ShellState::Connecting,
                stream_id: None,
                pid: None,
                events: VecDeque::new(),
                buffered_bytes: 0,
                dropped: 0,
                next_seq: 1,
                exit_code: None,
            }),
            input_lock: tokio::sync::Mutex::new(()),
            last_poll: AtomicU64::new(now),
            closed: AtomicBool::new(false),
            pump: Mutex::new(None),
        }
    }

    fn buffer(&self) -> MutexGuard<'_, SessionBuffer> {
        // Poisoning is ignored; every update leaves the buffer consistent
        self.buffer.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn state(&self) -> ShellState {
        self.buffer().state
    }

    pub fn stream_id(&self) -> Option<StreamId> {
        self.buffer().stream_id
    }

    pub fn last_poll(&self) -> u64 {
        self.last_poll.load(Ordering::Relaxed)
    }

    /// Claim teardown; only the first caller gets `true`
    pub fn try_close(&self) -> bool {
        self.closed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn connected(&self, stream_id: StreamId, pid: u32) {
        let mut buf = self.buffer();
        if buf.state == ShellState::Connecting {
            buf.state = ShellState::Connected;
        }
        buf.stream_id = Some(stream_id);
        buf.pid = Some(pid);
    }

    fn push(&self, data: Bytes, max_bytes: usize) {
        let mut buf = self.buffer();
        let seq = buf.next_seq;
        buf.next_seq += 1;
        buf.buffered_bytes += data.len();
        buf.events.push_back(OutputChunk { seq, data });

        while buf.buffered_bytes > max_bytes && buf.events.len() > 1 {
            if let Some(old) = buf.events.pop_front() {
                buf.buffered_bytes -= old.data.len();
                buf.dropped += 1;
            }
        }
    }

    fn finish(&self, exit_code: Option<i32>) {
        let mut buf = self.buffer();
        if buf.state != ShellState::Disconnected {
            buf.state = ShellState::Disconnected;
            buf.exit_code = exit_code;
        }
    }

    fn drain(&self) -> ShellOutput {
        self.last_poll.store(now_millis(), Ordering::Relaxed);
        let mut buf = self.buffer();
        let events: Vec<OutputChunk> = buf.events.drain(..).collect();
        buf.buffered_bytes = 0;
        ShellOutput {
            shell_id: self.id.clone(),
            state: buf.state,
            events,
            dropped: std::mem::take(&mut buf.dropped),
            exit_code: buf.exit_code,
        }
    }

    fn summary(&self) -> ShellSummary {
        let buf = self.buffer();
        ShellSummary {
            shell_id: self.id.clone(),
            node_id: self.node_id.clone(),
            owner: self.owner.clone(),
            state: buf.state,
            pid: buf.pid,
            created_at: self.created_at,
            last_poll: self.last_poll(),
        }
    }

    fn set_pump(&self, handle: JoinHandle<()>) {
        if let Ok(mut pump) = self.pump.lock() {
            *pump = Some(handle);
        }
    }

    fn stop_pump(&self) {
        if let Some(handle) = self.pump.lock().ok().and_then(|mut p| p.take()) {
            handle.abort();
        }
    }
}

pub struct ShellGateway {
    registry: Arc<NodeRegistry>,
    agents: Arc<dyn AgentRpc>,
    config: ShellConfig,
    sessions: DashMap<ShellId, Arc<ShellSession>>,
}

impl ShellGateway {
    pub fn new(registry: Arc<NodeRegistry>, agents: Arc<dyn AgentRpc>, config: ShellConfig) -> Self {
        Self {
            registry,
            agents,
            config,
            sessions: DashMap::new(),
        }
    }

    /// Open a shell on a tunnel node
    pub async fn start_shell(
        &self,
        operator: &Operator,
        node_id: &NodeId,
        size: Option<TerminalSize>,
    ) -> Result<ShellId, PanelError> {
        let node = self.registry.get(node_id)?;
        if node.is_local || node.connection_type != ConnectionType::Tunnel {
            return Err(PanelError::NodeNotTunnel(node_id.clone()));
        }
        let agent_id = node.agent_id.ok_or_else(|| {
            PanelError::Unreachable(format!("node {} has no agent deployed", node.name))
        })?;
        match node.status {
            NodeStatus::Active | NodeStatus::Online => {}
            NodeStatus::Maintenance => {
                return Err(PanelError::Conflict(format!(
                    "node {} is in maintenance",
                    node.name
                )));
            }
            status => {
                return Err(PanelError::Unreachable(format!(
                    "node {} is {}",
                    node.name, status
                )));
            }
        }
        if !self.agents.is_connected(&agent_id) {
            return Err(PanelError::Unreachable(format!(
                "agent for node {} is not connected",
                node.name
            )));
        }

        let session = Arc::new(ShellSession::new(operator, node_id.clone(), agent_id.clone()));
        let shell_id = session.id.clone();
        self.sessions.insert(shell_id.clone(), Arc::clone(&session));

        let request = ShellRequest {
            shell: None,
            env: Vec::new(),
            size: size.unwrap_or_else(|| {
                TerminalSize::new(self.config.default_rows, self.config.default_cols)
            }),
        };
        let opened =
            tokio::time::timeout(self.config.open_timeout, self.agents.open_shell(&agent_id, request))
                .await;

        let remote = match opened {
            Ok(Ok(remote)) => remote,
            Ok(Err(e)) => {
                self.sessions.remove(&shell_id);
                return Err(e);
            }
            Err(_) => {
                self.sessions.remove(&shell_id);
                return Err(PanelError::Unreachable(format!(
                    "agent did not acknowledge the shell within {:?}",
                    self.config.open_timeout
                )));
            }
        };

        if session.is_closed() {
            // Closed while the open was in flight
            let _ = self.agents.close_shell(&agent_id, remote.stream_id).await;
            return Err(PanelError::not_found("shell", &shell_id));
        }

        session.connected(remote.stream_id, remote.pid);
        let pump = tokio::spawn(pump_events(
            Arc::clone(&session),
            remote.events,
            self.config.max_buffered_bytes,
        ));
        session.set_pump(pump);

        tracing::info!(
            "Shell {} started on node {} by {} (pid {})",
            shell_id,
            node_id,
            operator.name,
            remote.pid
        );
        Ok(shell_id)
    }

    /// Forward bytes to the shell's stdin
    pub async fn send_input(
        &self,
        operator: &Operator,
        node_id: &NodeId,
        shell_id: &ShellId,
        data: Bytes,
    ) -> Result<(), PanelError> {
        let session = self.lookup(operator, Some(node_id), shell_id)?;
        let stream_id = self.live_stream(&session)?;

        let _writer = session.input_lock.lock().await;
        let sent = tokio::time::timeout(
            self.config.io_timeout,
            self.agents.send_input(&session.agent_id, stream_id, data),
        )
        .await
        .unwrap_or_else(|_| {
            Err(PanelError::timeout(
                self.config.io_timeout,
                format!("writing to shell {}", shell_id),
            ))
        });

        if let Err(e) = &sent {
            tracing::warn!("Input to shell {} failed: {}; closing it", shell_id, e);
            session.finish(None);
            let _ = self.agents.close_shell(&session.agent_id, stream_id).await;
        }
        sent
    }

    /// Everything emitted since the previous poll. Once the shell has exited
    /// this is the final poll and the session is released.
    pub async fn poll_output(
        &self,
        operator: &Operator,
        node_id: Option<&NodeId>,
        shell_id: &ShellId,
    ) -> Result<ShellOutput, PanelError> {
        let session = self.lookup(operator, node_id, shell_id)?;
        let output = session.drain();
        if output.state == ShellState::Disconnected {
            self.release(&session, "shell exited").await;
        }
        Ok(output)
    }

    pub async fn resize_shell(
        &self,
        operator: &Operator,
        shell_id: &ShellId,
        size: TerminalSize,
    ) -> Result<(), PanelError> {
        if size.rows == 0 || size.cols == 0 {
            return Err(PanelError::Invalid("terminal size must be non-zero".into()));
        }
        let session = self.lookup(operator, None, shell_id)?;
        let stream_id = self.live_stream(&session)?;
        tokio::time::timeout(
            self.config.io_timeout,
            self.agents.resize_shell(&session.agent_id, stream_id, size),
        )
        .await
        .map_err(|_| {
            PanelError::timeout(self.config.io_timeout, format!("resizing shell {}", shell_id))
        })?
    }

    /// Tear a shell down. Closing an unknown or already closed shell succeeds.
    pub async fn close_shell(&self, operator: &Operator, shell_id: &ShellId) -> Result<(), PanelError> {
        let Some(session) = self.sessions.get(shell_id).map(|r| Arc::clone(&r)) else {
            return Ok(());
        };
        if session.owner != operator.name && !operator.admin {
            return Err(PanelError::Forbidden(format!("shell {} belongs to another operator", shell_id)));
        }
        self.release(&session, "closed by operator").await;
        Ok(())
    }

    /// Live sessions visible to the operator
    pub fn list_shells(&self, operator: &Operator) -> Vec<ShellSummary> {
        let mut shells: Vec<ShellSummary> = self
            .sessions
            .iter()
            .filter(|r| operator.admin || r.owner == operator.name)
            .map(|r| r.summary())
            .collect();
        shells.sort_by_key(|s| s.created_at);
        shells
    }

    /// Close every shell on a node (node deleted)
    pub async fn close_for_node(&self, node_id: &NodeId) -> usize {
        let sessions: Vec<Arc<ShellSession>> = self
            .sessions
            .iter()
            .filter(|r| &r.node_id == node_id)
            .map(|r| Arc::clone(&r))
            .collect();
        for session in &sessions {
            self.release(session, "node removed").await;
        }
        sessions.len()
    }

    /// Release sessions nobody has polled within the idle timeout
    pub async fn sweep_idle(&self, now: u64) -> usize {
        let cutoff = now.saturating_sub(self.config.idle_timeout.as_millis() as u64);
        let idle: Vec<Arc<ShellSession>> = self
            .sessions
            .iter()
            .filter(|r| r.last_poll() < cutoff)
            .map(|r| Arc::clone(&r))
            .collect();

        let mut released = 0;
        for session in idle {
            tracing::info!(
                "Releasing idle shell {} (last poll {}ms ago, owner: {})",
                session.id,
                now.saturating_sub(session.last_poll()),
                session.owner
            );
            if self.release(&session, "idle timeout").await {
                released += 1;
            }
        }
        released
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    fn lookup(
        &self,
        operator: &Operator,
        node_id: Option<&NodeId>,
        shell_id: &ShellId,
    ) -> Result<Arc<ShellSession>, PanelError> {
        let session = self
            .sessions
            .get(shell_id)
            .map(|r| Arc::clone(&r))
            .filter(|s| !s.is_closed())
            .ok_or_else(|| PanelError::not_found("shell", shell_id))?;
        if let Some(node_id) = node_id {
            if &session.node_id != node_id {
                return Err(PanelError::not_found("shell", shell_id));
            }
        }
        if session.owner != operator.name {
            return Err(PanelError::Forbidden(format!(
                "shell {} belongs to another operator",
                shell_id
            )));
        }
        Ok(session)
    }

    fn live_stream(&self, session: &ShellSession) -> Result<StreamId, PanelError> {
        let buf = session.buffer();
        match (buf.state, buf.stream_id) {
            (ShellState::Connected, Some(stream_id)) => Ok(stream_id),
            (ShellState::Connecting, _) => Err(PanelError::Conflict(format!(
                "shell {} is still connecting",
                session.id
            ))),
            _ => Err(PanelError::Conflict(format!("shell {} has exited", session.id))),
        }
    }

    /// Remove local state now and tell the agent best-effort. Returns whether
    /// this call did the teardown.
    async fn release(&self, session: &ShellSession, reason: &str) -> bool {
        if !session.try_close() {
            return false;
        }
        self.sessions.remove(&session.id);
        session.stop_pump();

        let (stream_id, running) = {
            let buf = session.buffer();
            (buf.stream_id, buf.state != ShellState::Disconnected)
        };
        session.finish(None);

        if let (Some(stream_id), true) = (stream_id, running) {
            let closed = tokio::time::timeout(
                self.config.io_timeout,
                self.agents.close_shell(&session.agent_id, stream_id),
            )
            .await;
            if !matches!(closed, Ok(Ok(()))) {
                tracing::debug!("Agent close of shell {} did not complete", session.id);
            }
        }
        tracing::debug!("Released shell {} ({})", session.id, reason);
        true
    }
}

/// Move agent events into the session buffer until the shell ends
async fn pump_events(
    session: Arc<ShellSession>,
    mut events: mpsc::Receiver<ShellEvent>,
    max_bytes: usize,
) {
    while let Some(event) = events.recv().await {
        match event {
            ShellEvent::Output(data) => session.push(data, max_bytes),
            ShellEvent::Exited { exit_code } => {
                tracing::debug!("Shell {} exited with {:?}", session.id, exit_code);
                session.finish(exit_code);
                return;
            }
        }
    }
    tracing::debug!("Event stream of shell {} ended; agent gone", session.id);
    session.finish(None);
}
