//! Tunnel connection handler
//!
//! Implements the russh server handler for agents dialing in. An agent logs
//! in with its id and token, opens one session channel and registers; after
//! that every frame on the channel is routed through its `AgentConnection`.

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::BytesMut;
use russh::server::{Auth, Handle, Handler, Msg, Session};
use russh::{Channel, ChannelId, CryptoVec};
use tokio::sync::mpsc;
use tokio_util::codec::Decoder;
use tokio_util::sync::CancellationToken;

use fp_core::{AgentId, NodeId};
use fp_protocol::{protocol_compatible, Frame, FrameCodec, Message, PROTOCOL_VERSION};

use crate::connection::{AgentCommand, AgentConnection, AgentInfo, AgentPool, COMMAND_BUFFER};
use crate::registry::NodeRegistry;

/// Handler for a single agent tunnel
pub struct TunnelHandler {
    registry: Arc<NodeRegistry>,
    pool: Arc<AgentPool>,
    peer_addr: SocketAddr,
    /// Agent and node the login credential belongs to
    identity: Option<(AgentId, NodeId)>,
    codec: FrameCodec,
    buffer: BytesMut,
    /// The single channel frames are multiplexed on
    channel: Option<ChannelId>,
    session_handle: Option<Handle>,
    /// Set once `Register` was accepted
    connection: Option<Arc<AgentConnection>>,
    command_processor_handle: Option<tokio::task::JoinHandle<()>>,
    /// Cancelled to drop this tunnel
    cancel: CancellationToken,
}

impl TunnelHandler {
    pub fn new(
        registry: Arc<NodeRegistry>,
        pool: Arc<AgentPool>,
        cancel: CancellationToken,
        peer_addr: SocketAddr,
    ) -> Self {
        Self {
            registry,
            pool,
            peer_addr,
            identity: None,
            codec: FrameCodec::new(),
            buffer: BytesMut::with_capacity(8192),
            channel: None,
            session_handle: None,
            connection: None,
            command_processor_handle: None,
            cancel,
        }
    }

    async fn handle_frame(&mut self, frame: Frame, session: &mut Session) {
        if let Some(conn) = &self.connection {
            conn.dispatch(frame).await;
            return;
        }

        match frame.message {
            Message::Register {
                agent_id,
                node_id,
                hostname,
                os,
                arch,
                version,
            } => {
                let info = AgentInfo {
                    agent_id: AgentId::new(agent_id),
                    node_id: NodeId::new(node_id),
                    hostname,
                    os,
                    arch,
                    version,
                };
                self.register(info, session);
            }
            other => {
                tracing::warn!(
                    "Frame {:?} from {} before registration",
                    other.message_type(),
                    self.peer_addr
                );
            }
        }
    }

    fn register(&mut self, info: AgentInfo, session: &mut Session) {
        if let Err(reason) = self.check_registration(&info) {
            tracing::warn!("Registration from {} refused: {}", self.peer_addr, reason);
            self.send_message(
                session,
                Message::RegisterAck {
                    accepted: false,
                    reason: Some(reason),
                },
            );
            if let Some(channel) = self.channel {
                session.close(channel);
            }
            return;
        }

        tracing::info!(
            "Agent registered: {} for node {} ({}) - {} {} v{}",
            info.agent_id,
            info.node_id,
            info.hostname,
            info.os,
            info.arch,
            info.version
        );

        self.send_message(
            session,
            Message::RegisterAck {
                accepted: true,
                reason: None,
            },
        );

        let (command_tx, command_rx) = mpsc::channel(COMMAND_BUFFER);
        let conn = Arc::new(AgentConnection::new(
            info,
            self.pool.next_conn_id(),
            command_tx,
            self.cancel.clone(),
        ));
        self.pool.insert(Arc::clone(&conn));
        self.start_command_processor(command_rx, conn.agent_id().clone());

        // Only a bound agent brings its node back; a freshly deployed one is
        // bound by the deployer once it answers
        let bound = self
            .registry
            .get(conn.node_id())
            .map(|n| n.agent_id.as_ref() == Some(conn.agent_id()))
            .unwrap_or(false);
        if bound {
            if let Err(e) = self.registry.mark_online(conn.node_id()) {
                tracing::warn!("Could not mark node {} online: {}", conn.node_id(), e);
            }
        }

        self.connection = Some(conn);
    }

    fn check_registration(&self, info: &AgentInfo) -> Result<(), String> {
        let Some((agent_id, node_id)) = &self.identity else {
            return Err("not authenticated".into());
        };
        if &info.agent_id != agent_id {
            return Err(format!(
                "registered as {} but authenticated as {}",
                info.agent_id, agent_id
            ));
        }
        if &info.node_id != node_id {
            return Err(format!("agent {} does not serve node {}", agent_id, info.node_id));
        }
        if !protocol_compatible(&info.version) {
            return Err(format!(
                "protocol {} is not compatible with {}",
                info.version, PROTOCOL_VERSION
            ));
        }
        Ok(())
    }

    fn send_message(&self, session: &mut Session, message: Message) {
        let Some(channel) = self.channel else {
            return;
        };
        match Frame::control(message).to_bytes() {
            Ok(buf) => session.data(channel, CryptoVec::from_slice(&buf)),
            Err(e) => tracing::error!("Failed to encode message: {}", e),
        }
    }

    /// Forward queued commands onto the channel until the tunnel is dropped
    fn start_command_processor(
        &mut self,
        mut command_rx: mpsc::Receiver<AgentCommand>,
        agent_id: AgentId,
    ) {
        let Some(handle) = self.session_handle.clone() else {
            tracing::error!("No session handle available for command processor");
            return;
        };
        let Some(channel) = self.channel else {
            tracing::error!("No channel available for command processor");
            return;
        };
        let cancel = self.cancel.clone();

        let task_handle = tokio::spawn(async move {
            tracing::debug!("Command processor started for {}", agent_id);

            loop {
                let command = tokio::select! {
                    command = command_rx.recv() => match command {
                        Some(command) => command,
                        None => break,
                    },
                    _ = cancel.cancelled() => {
                        let _ = handle.close(channel).await;
                        break;
                    }
                };

                let frame = command.to_frame();
                let stream_id = frame.stream_id;
                let buf = match frame.to_bytes() {
                    Ok(buf) => buf,
                    Err(e) => {
                        tracing::error!("Failed to encode command: {}", e);
                        continue;
                    }
                };

                if handle
                    .data(channel, CryptoVec::from_slice(&buf))
                    .await
                    .is_err()
                {
                    tracing::warn!("Failed to send to agent {}; closing tunnel", agent_id);
                    cancel.cancel();
                    break;
                }
                tracing::trace!("Sent {} bytes to {} on {}", buf.len(), agent_id, stream_id);
            }

            tracing::debug!("Command processor stopped for {}", agent_id);
        });

        self.command_processor_handle = Some(task_handle);
    }

    /// Remove this tunnel from the pool and degrade its node, unless a newer
    /// tunnel of the same agent already took over
    fn deregister(&mut self) {
        let Some(conn) = self.connection.take() else {
            return;
        };
        conn.cancel.cancel();
        conn.fail_all();

        if self
            .pool
            .remove_if_same(conn.agent_id(), conn.conn_id)
            .is_some()
        {
            tracing::info!("Agent {} disconnected", conn.agent_id());
            match self.registry.mark_unreachable(conn.node_id()) {
                Ok(status) => tracing::debug!("Node {} now {}", conn.node_id(), status),
                Err(e) => tracing::debug!("Could not degrade node {}: {}", conn.node_id(), e),
            }
        }
    }
}

impl Drop for TunnelHandler {
    fn drop(&mut self) {
        self.deregister();
        if let Some(handle) = self.command_processor_handle.take() {
            handle.abort();
            tracing::debug!("Aborted command processor task on handler drop");
        }
    }
}

#[async_trait]
impl Handler for TunnelHandler {
    type Error = anyhow::Error;

    /// User is the agent id, password the agent token
    async fn auth_password(&mut self, user: &str, password: &str) -> Result<Auth, Self::Error> {
        let agent_id = AgentId::new(user);
        match self.registry.verify_agent(&agent_id, password) {
            Some(node_id) => {
                tracing::info!(
                    "Agent {} authenticated from {} for node {}",
                    agent_id,
                    self.peer_addr,
                    node_id
                );
                self.identity = Some((agent_id, node_id));
                Ok(Auth::Accept)
            }
            None => {
                tracing::warn!(
                    "Authentication REJECTED for {} from {}",
                    agent_id,
                    self.peer_addr
                );
                Ok(Auth::Reject {
                    proceed_with_methods: None,
                })
            }
        }
    }

    async fn channel_open_session(
        &mut self,
        channel: Channel<Msg>,
        session: &mut Session,
    ) -> Result<bool, Self::Error> {
        if self.identity.is_none() || self.channel.is_some() {
            tracing::warn!("Refusing extra channel from {}", self.peer_addr);
            return Ok(false);
        }
        tracing::debug!("Channel opened: {:?}", channel.id());

        self.channel = Some(channel.id());
        self.session_handle = Some(session.handle());
        Ok(true)
    }

    async fn data(
        &mut self,
        channel: ChannelId,
        data: &[u8],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        if Some(channel) != self.channel {
            return Ok(());
        }
        tracing::trace!("Received {} bytes on channel {:?}", data.len(), channel);
        self.buffer.extend_from_slice(data);

        loop {
            match self.codec.decode(&mut self.buffer) {
                Ok(Some(frame)) => self.handle_frame(frame, session).await,
                Ok(None) => break,
                Err(e) => {
                    // Framing is lost; the agent reconnects and starts clean
                    tracing::error!("Protocol error from {}: {}", self.peer_addr, e);
                    self.buffer.clear();
                    self.deregister();
                    session.close(channel);
                    break;
                }
            }
        }

        Ok(())
    }

    async fn channel_close(
        &mut self,
        channel: ChannelId,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        tracing::debug!("Channel closed: {:?}", channel);
        if Some(channel) == self.channel {
            self.channel = None;
            self.deregister();
        }
        Ok(())
    }

    async fn channel_eof(
        &mut self,
        channel: ChannelId,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        tracing::debug!("Channel EOF: {:?}", channel);
        Ok(())
    }
}

/// russh server settings for the tunnel listener
#[derive(Clone)]
pub struct ServerConfig {
    pub ssh_config: Arc<russh::server::Config>,
}

impl ServerConfig {
    pub fn new(host_key: russh_keys::key::KeyPair) -> Self {
        let config = russh::server::Config {
            keys: vec![host_key],
            auth_rejection_time: std::time::Duration::from_secs(1),
            auth_rejection_time_initial: Some(std::time::Duration::from_secs(0)),
            inactivity_timeout: Some(std::time::Duration::from_secs(600)),
            ..Default::default()
        };

        Self {
            ssh_config: Arc::new(config),
        }
    }
}
