//! Per-tunnel agent state
//!
//! Turns panel events into PTY operations and replies. Replies and shell
//! output are queued on `outbound`; the main loop writes them to the tunnel.

use std::collections::HashMap;
use std::io::Read;

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use fp_core::config::AgentConfig;
use fp_protocol::{ErrorCode, Frame, Message, StreamId};

use crate::metrics;
use crate::pty::PtyManager;
use crate::tunnel::TunnelEvent;

/// Buffered PTY reads across all shells
pub const PTY_EVENT_BUFFER: usize = 256;

/// Something a PTY reader task saw
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PtyEvent {
    Output { stream_id: StreamId, data: Bytes },
    /// Reader hit EOF; the shell is gone or going
    Eof { stream_id: StreamId },
}

pub struct AgentState {
    pty: PtyManager,
    readers: HashMap<StreamId, (JoinHandle<()>, CancellationToken)>,
    outbound: mpsc::Sender<Frame>,
    pty_tx: mpsc::Sender<PtyEvent>,
}

impl AgentState {
    pub fn new(
        config: &AgentConfig,
        outbound: mpsc::Sender<Frame>,
        pty_tx: mpsc::Sender<PtyEvent>,
    ) -> Self {
        Self {
            pty: PtyManager::new(config.shell(), config.default_env.clone()),
            readers: HashMap::new(),
            outbound,
            pty_tx,
        }
    }

    /// Apply one panel event. Returns the reason when the tunnel is done.
    pub async fn handle_event(&mut self, event: TunnelEvent) -> Option<String> {
        match event {
            TunnelEvent::Heartbeat { timestamp } => {
                tracing::trace!("Heartbeat received, sending ack");
                self.reply(Frame::control(Message::HeartbeatAck { timestamp }))
                    .await;
            }

            TunnelEvent::MetricsQuery { request_id } => {
                // The probe blocks for a CPU sampling interval
                let outbound = self.outbound.clone();
                tokio::spawn(async move {
                    let message = metrics::report(request_id).await;
                    let _ = outbound.send(Frame::control(message)).await;
                });
            }

            TunnelEvent::OpenShell {
                stream_id,
                shell,
                env,
                size,
            } => self.open_shell(stream_id, shell, env, size).await,

            TunnelEvent::Input { stream_id, data } => {
                if let Err(e) = self.pty.write(stream_id, &data) {
                    tracing::warn!("Input for {} failed: {}", stream_id, e);
                    self.stream_error(stream_id, e).await;
                }
            }

            TunnelEvent::Resize { stream_id, size } => {
                if let Err(e) = self.pty.resize(stream_id, size) {
                    tracing::warn!("Resize of {} failed: {}", stream_id, e);
                    self.stream_error(stream_id, e).await;
                }
            }

            TunnelEvent::CloseShell { stream_id } => {
                tracing::info!("Panel closed shell on {}", stream_id);
                let exit_code = self.close_shell(stream_id);
                self.reply(Frame::new(stream_id, Message::ShellClose { exit_code }))
                    .await;
            }

            TunnelEvent::Registered { accepted, reason } => {
                if !accepted {
                    let reason = reason.unwrap_or_else(|| "no reason given".into());
                    tracing::error!("Registration revoked: {}", reason);
                    return Some(format!("registration revoked: {}", reason));
                }
            }

            TunnelEvent::Disconnected => {
                return Some("panel closed the tunnel".to_string());
            }
        }
        None
    }

    /// Forward shell output, or report the shell's exit
    pub async fn handle_pty(&mut self, event: PtyEvent) {
        match event {
            PtyEvent::Output { stream_id, data } => {
                if self.pty.contains(stream_id) {
                    self.reply(Frame::new(stream_id, Message::Output(data))).await;
                }
            }
            PtyEvent::Eof { stream_id } => {
                if !self.pty.contains(stream_id) {
                    return;
                }
                let exit_code = self.close_shell(stream_id);
                tracing::info!("Shell on {} exited ({:?})", stream_id, exit_code);
                self.reply(Frame::new(stream_id, Message::ShellClose { exit_code }))
                    .await;
            }
        }
    }

    /// Kill every shell (tunnel lost)
    pub fn shutdown(&mut self) {
        for stream_id in self.pty.streams() {
            self.close_shell(stream_id);
        }
    }

    pub fn shell_count(&self) -> usize {
        self.pty.len()
    }

    async fn open_shell(
        &mut self,
        stream_id: StreamId,
        shell: Option<String>,
        env: Vec<(String, String)>,
        size: fp_protocol::TerminalSize,
    ) {
        match self.pty.open(stream_id, shell, env, size) {
            Ok((pid, reader)) => {
                self.reply(Frame::new(stream_id, Message::ShellReady { pid }))
                    .await;
                let cancel = CancellationToken::new();
                let handle =
                    spawn_pty_reader(stream_id, reader, self.pty_tx.clone(), cancel.clone());
                self.readers.insert(stream_id, (handle, cancel));
            }
            Err(e) => {
                tracing::error!("Failed to open shell on {}: {:#}", stream_id, e);
                self.reply(Frame::new(
                    stream_id,
                    Message::Error {
                        code: ErrorCode::PtyAllocationFailed,
                        message: format!("{:#}", e),
                    },
                ))
                .await;
            }
        }
    }

    fn close_shell(&mut self, stream_id: StreamId) -> Option<i32> {
        if let Some((_handle, cancel)) = self.readers.remove(&stream_id) {
            // The reader wakes up with EOF once the PTY is gone
            cancel.cancel();
        }
        self.pty.close(stream_id)
    }

    async fn stream_error(&self, stream_id: StreamId, error: anyhow::Error) {
        let code = if self.pty.contains(stream_id) {
            ErrorCode::Unknown
        } else {
            ErrorCode::StreamNotFound
        };
        self.reply(Frame::new(
            stream_id,
            Message::Error {
                code,
                message: error.to_string(),
            },
        ))
        .await;
    }

    async fn reply(&self, frame: Frame) {
        if self.outbound.send(frame).await.is_err() {
            tracing::debug!("Tunnel writer gone; dropping reply");
        }
    }
}

/// Blocking reader for one PTY. Stops on EOF, read error or cancellation.
fn spawn_pty_reader(
    stream_id: StreamId,
    mut reader: Box<dyn Read + Send>,
    tx: mpsc::Sender<PtyEvent>,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::task::spawn_blocking(move || {
        let mut buf = [0u8; 4096];

        loop {
            if cancel.is_cancelled() {
                tracing::debug!("PTY reader cancelled for {}", stream_id);
                return;
            }

            match reader.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    let data = Bytes::copy_from_slice(&buf[..n]);
                    if tx.blocking_send(PtyEvent::Output { stream_id, data }).is_err() {
                        return;
                    }
                }
                Err(e) => {
                    // EIO once the shell exits on Linux
                    if !cancel.is_cancelled() {
                        tracing::debug!("PTY read on {} ended: {}", stream_id, e);
                    }
                    break;
                }
            }
        }

        let _ = tx.blocking_send(PtyEvent::Eof { stream_id });
    })
}
