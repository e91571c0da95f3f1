//! Outbound SSH tunnel connector
//!
//! Dials the panel, logs in with the agent id and token, opens the session
//! channel and registers. Frames from the panel are decoded in the russh
//! handler and handed to the agent loop as `TunnelEvent`s.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use russh::client::{self, Config, Handle, Msg};
use russh::{Channel, ChannelId, Disconnect};
use russh_keys::key::PublicKey;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::codec::Decoder;

use fp_core::config::AgentConfig;
use fp_protocol::{Frame, FrameCodec, Message, StreamId, TerminalSize, PROTOCOL_VERSION};

use super::reconnect::ExponentialBackoff;

/// Events buffered between the russh handler and the agent loop
const TUNNEL_EVENT_CHANNEL_CAPACITY: usize = 256;

/// How long the panel has to answer `Register`
const REGISTER_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Debug, Error)]
pub enum ConnectionError {
    /// Agent id or token refused; the credential was revoked or replaced
    #[error("Authentication rejected by panel")]
    AuthRejected,

    #[error("Host key verification failed: {message}")]
    HostKeyRejected { message: String },

    /// `RegisterAck { accepted: false }`
    #[error("Registration refused: {reason}")]
    RegistrationRefused { reason: String },

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

impl ConnectionError {
    /// Whether another attempt with the same configuration can succeed
    pub fn is_permanent(&self) -> bool {
        !matches!(self, ConnectionError::Other(_))
    }
}

/// Establishes the outbound tunnel to the panel
pub struct TunnelConnector {
    config: AgentConfig,
}

impl TunnelConnector {
    pub fn new(config: AgentConfig) -> Result<Self, ConnectionError> {
        if config.agent_id.is_empty() || config.token.is_empty() {
            return Err(ConnectionError::Other(anyhow::anyhow!(
                "agent_id and token must be set in the agent configuration"
            )));
        }
        Ok(Self { config })
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    /// Connect, retrying transient failures with `backoff`. Permanent
    /// failures are returned at once.
    pub async fn connect_with_retry(
        &self,
        backoff: &mut ExponentialBackoff,
    ) -> Result<ActiveTunnel, ConnectionError> {
        loop {
            match self.try_connect().await {
                Ok(tunnel) => {
                    tracing::info!("Registered with panel at {}", self.config.panel_address);
                    return Ok(tunnel);
                }
                Err(e) if e.is_permanent() => return Err(e),
                Err(e) => {
                    let delay = backoff.next_delay();
                    tracing::warn!("Connection failed: {}. Retrying in {:?}", e, delay);
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    /// One connection attempt, through registration
    async fn try_connect(&self) -> Result<ActiveTunnel, ConnectionError> {
        let ssh_config = Arc::new(Config::default());
        let (event_tx, event_rx) = mpsc::channel(TUNNEL_EVENT_CHANNEL_CAPACITY);
        let handler = ClientHandler::new(self.config.panel_host_key.clone(), event_tx);

        tracing::debug!("Connecting to {}", self.config.panel_address);
        let mut session = tokio::time::timeout(
            self.config.connect_timeout,
            client::connect(ssh_config, self.config.panel_address.as_str(), handler),
        )
        .await
        .map_err(|_| anyhow::anyhow!("Connection to {} timed out", self.config.panel_address))?
        .map_err(|e| {
            let err_str = e.to_string();
            if err_str.contains("Unknown server key") || err_str.contains("server key") {
                return ConnectionError::HostKeyRejected {
                    message: format!(
                        "panel host key does not match {}",
                        self.config.panel_host_key.as_deref().unwrap_or("the configured key")
                    ),
                };
            }
            ConnectionError::Other(anyhow::anyhow!(
                "Failed to connect to {}: {}",
                self.config.panel_address,
                e
            ))
        })?;

        tracing::debug!("Authenticating as '{}'", self.config.agent_id);
        let authenticated = session
            .authenticate_password(&self.config.agent_id, &self.config.token)
            .await
            .context("Authentication error")?;
        if !authenticated {
            return Err(ConnectionError::AuthRejected);
        }

        let channel = session
            .channel_open_session()
            .await
            .context("Failed to open session channel")?;

        let mut tunnel = ActiveTunnel::new(session, channel, event_rx);
        tunnel.register(&self.config).await?;
        Ok(tunnel)
    }
}

/// Events received from the panel
#[derive(Debug, Clone, PartialEq)]
pub enum TunnelEvent {
    Registered {
        accepted: bool,
        reason: Option<String>,
    },
    OpenShell {
        stream_id: StreamId,
        shell: Option<String>,
        env: Vec<(String, String)>,
        size: TerminalSize,
    },
    Input {
        stream_id: StreamId,
        data: Bytes,
    },
    Resize {
        stream_id: StreamId,
        size: TerminalSize,
    },
    CloseShell {
        stream_id: StreamId,
    },
    Heartbeat {
        timestamp: u64,
    },
    MetricsQuery {
        request_id: u64,
    },
    /// Channel closed by the panel
    Disconnected,
}

impl TunnelEvent {
    /// Event for a frame from the panel; `None` for messages the panel
    /// never sends
    pub fn from_frame(frame: Frame) -> Option<Self> {
        let stream_id = frame.stream_id;
        Some(match frame.message {
            Message::RegisterAck { accepted, reason } => {
                TunnelEvent::Registered { accepted, reason }
            }
            Message::Heartbeat { timestamp } => TunnelEvent::Heartbeat { timestamp },
            Message::MetricsQuery { request_id } => TunnelEvent::MetricsQuery { request_id },
            Message::ShellOpen { shell, env, size } => TunnelEvent::OpenShell {
                stream_id,
                shell,
                env,
                size,
            },
            Message::Input(data) => TunnelEvent::Input { stream_id, data },
            Message::Resize(size) => TunnelEvent::Resize { stream_id, size },
            Message::ShellClose { .. } => TunnelEvent::CloseShell { stream_id },
            other => {
                tracing::warn!("Unexpected {:?} from panel", other.message_type());
                return None;
            }
        })
    }
}

/// A registered tunnel
pub struct ActiveTunnel {
    session: Handle<ClientHandler>,
    channel: Channel<Msg>,
    event_rx: mpsc::Receiver<TunnelEvent>,
}

impl ActiveTunnel {
    fn new(
        session: Handle<ClientHandler>,
        channel: Channel<Msg>,
        event_rx: mpsc::Receiver<TunnelEvent>,
    ) -> Self {
        Self {
            session,
            channel,
            event_rx,
        }
    }

    /// Send `Register` and wait for the panel's verdict
    async fn register(&mut self, config: &AgentConfig) -> Result<(), ConnectionError> {
        let message = Message::Register {
            agent_id: config.agent_id.clone(),
            node_id: config.node_id.clone(),
            hostname: config.hostname(),
            os: std::env::consts::OS.to_string(),
            arch: std::env::consts::ARCH.to_string(),
            version: PROTOCOL_VERSION.to_string(),
        };
        self.send(Frame::control(message)).await?;

        let ack = tokio::time::timeout(REGISTER_TIMEOUT, async {
            loop {
                match self.event_rx.recv().await {
                    Some(TunnelEvent::Registered { accepted, reason }) => {
                        return Some((accepted, reason))
                    }
                    Some(TunnelEvent::Disconnected) | None => return None,
                    Some(other) => {
                        tracing::debug!("Ignoring {:?} before registration", other)
                    }
                }
            }
        })
        .await
        .map_err(|_| anyhow::anyhow!("Panel did not answer registration"))?;

        match ack {
            Some((true, _)) => Ok(()),
            Some((false, reason)) => Err(ConnectionError::RegistrationRefused {
                reason: reason.unwrap_or_else(|| "no reason given".into()),
            }),
            None => Err(anyhow::anyhow!("Tunnel closed during registration").into()),
        }
    }

    pub async fn send(&self, frame: Frame) -> anyhow::Result<()> {
        let buf = frame.to_bytes().context("Failed to encode frame")?;
        self.channel
            .data(&buf[..])
            .await
            .context("Failed to send data")?;
        Ok(())
    }

    pub async fn recv_event(&mut self) -> Option<TunnelEvent> {
        self.event_rx.recv().await
    }

    pub async fn close(self) -> anyhow::Result<()> {
        self.session
            .disconnect(Disconnect::ByApplication, "agent shutting down", "en")
            .await?;
        Ok(())
    }
}

/// russh client handler for the tunnel
struct ClientHandler {
    /// Panel host key fingerprint to pin; any key is accepted when unset
    expected_host_key: Option<String>,
    event_tx: mpsc::Sender<TunnelEvent>,
    codec: FrameCodec,
    buffer: BytesMut,
}

impl ClientHandler {
    fn new(expected_host_key: Option<String>, event_tx: mpsc::Sender<TunnelEvent>) -> Self {
        Self {
            expected_host_key,
            event_tx,
            codec: FrameCodec::new(),
            buffer: BytesMut::with_capacity(8192),
        }
    }
}

#[async_trait]
impl client::Handler for ClientHandler {
    type Error = anyhow::Error;

    async fn check_server_key(
        &mut self,
        server_public_key: &PublicKey,
    ) -> Result<bool, Self::Error> {
        let fingerprint = server_public_key.fingerprint();
        match &self.expected_host_key {
            Some(expected) if expected.trim_start_matches("SHA256:") != fingerprint => {
                tracing::error!(
                    "Panel host key mismatch: expected {}, got {}",
                    expected,
                    fingerprint
                );
                Ok(false)
            }
            Some(_) => {
                tracing::debug!("Panel host key verified: {}", fingerprint);
                Ok(true)
            }
            None => {
                tracing::info!("Panel host key {} accepted (not pinned)", fingerprint);
                Ok(true)
            }
        }
    }

    async fn data(
        &mut self,
        _channel: ChannelId,
        data: &[u8],
        _session: &mut client::Session,
    ) -> Result<(), Self::Error> {
        self.buffer.extend_from_slice(data);

        loop {
            match self.codec.decode(&mut self.buffer) {
                Ok(Some(frame)) => {
                    if let Some(event) = TunnelEvent::from_frame(frame) {
                        if self.event_tx.send(event).await.is_err() {
                            break;
                        }
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    // Framing is lost; drop the tunnel and reconnect clean
                    tracing::error!("Protocol error: {}", e);
                    self.buffer.clear();
                    let _ = self.event_tx.send(TunnelEvent::Disconnected).await;
                    return Err(e.into());
                }
            }
        }

        Ok(())
    }

    async fn channel_close(
        &mut self,
        _channel: ChannelId,
        _session: &mut client::Session,
    ) -> Result<(), Self::Error> {
        tracing::info!("Tunnel channel closed by panel");
        let _ = self.event_tx.send(TunnelEvent::Disconnected).await;
        Ok(())
    }

    async fn channel_eof(
        &mut self,
        _channel: ChannelId,
        _session: &mut client::Session,
    ) -> Result<(), Self::Error> {
        tracing::debug!("Channel EOF");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frames_map_to_events() {
        let stream = StreamId::new(3);
        assert_eq!(
            TunnelEvent::from_frame(Frame::new(stream, Message::Input(Bytes::from_static(b"ls\n")))),
            Some(TunnelEvent::Input {
                stream_id: stream,
                data: Bytes::from_static(b"ls\n"),
            })
        );
        assert_eq!(
            TunnelEvent::from_frame(Frame::new(stream, Message::ShellClose { exit_code: None })),
            Some(TunnelEvent::CloseShell { stream_id: stream })
        );
        assert_eq!(
            TunnelEvent::from_frame(Frame::control(Message::MetricsQuery { request_id: 9 })),
            Some(TunnelEvent::MetricsQuery { request_id: 9 })
        );
    }

    #[test]
    fn test_agent_side_messages_are_ignored() {
        assert_eq!(
            TunnelEvent::from_frame(Frame::control(Message::HeartbeatAck { timestamp: 1 })),
            None
        );
        assert_eq!(
            TunnelEvent::from_frame(Frame::new(
                StreamId::new(2),
                Message::Output(Bytes::from_static(b"x"))
            )),
            None
        );
    }

    #[test]
    fn test_connector_needs_credentials() {
        let config = AgentConfig::default();
        assert!(TunnelConnector::new(config).is_err());
    }

    #[test]
    fn test_only_transport_failures_are_retried() {
        assert!(ConnectionError::AuthRejected.is_permanent());
        assert!(ConnectionError::RegistrationRefused {
            reason: "protocol 2.0".into()
        }
        .is_permanent());
        assert!(!ConnectionError::Other(anyhow::anyhow!("refused")).is_permanent());
    }
}
