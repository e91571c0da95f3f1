//! russh-backed secure shell client
//!
//! Used by the deployment orchestrator and the direct-node metrics scrape.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use russh::client::{self, Handle};
use russh::{ChannelMsg, Disconnect};
use russh_keys::key::PublicKey;

use fp_core::traits::{CommandOutput, RemoteSession, SecureShell, SshAuth, SshTarget};
use fp_core::PanelError;

use crate::deploy::bootstrap::shell_quote;

/// Opens russh client sessions
pub struct RusshShell {
    /// Bound on each command run through a session
    command_timeout: Duration,
}

impl RusshShell {
    pub fn new(command_timeout: Duration) -> Self {
        Self { command_timeout }
    }
}

/// Client handler; nodes are provisioned by address, so any host key is
/// accepted and logged
struct NodeHandler {
    host: String,
}

#[async_trait]
impl client::Handler for NodeHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        server_public_key: &PublicKey,
    ) -> Result<bool, Self::Error> {
        tracing::debug!(
            "Host key for {}: {}",
            self.host,
            server_public_key.fingerprint()
        );
        Ok(true)
    }
}

#[async_trait]
impl SecureShell for RusshShell {
    async fn connect(
        &self,
        target: &SshTarget,
        timeout: Duration,
    ) -> Result<Box<dyn RemoteSession>, PanelError> {
        let config = client::Config {
            inactivity_timeout: Some(Duration::from_secs(300)),
            keepalive_interval: Some(Duration::from_secs(30)),
            keepalive_max: 3,
            ..Default::default()
        };
        let addr = (target.host.as_str(), target.port);
        let handler = NodeHandler {
            host: target.host.clone(),
        };

        tracing::debug!("Connecting to {}", target.display());
        let mut handle = match tokio::time::timeout(
            timeout,
            client::connect(Arc::new(config), addr, handler),
        )
        .await
        {
            Ok(Ok(handle)) => handle,
            Ok(Err(e)) => {
                return Err(PanelError::Unreachable(format!(
                    "{}: {}",
                    target.display(),
                    e
                )))
            }
            Err(_) => {
                return Err(PanelError::timeout(
                    timeout,
                    format!("connecting to {}", target.display()),
                ))
            }
        };

        let authenticated = tokio::time::timeout(timeout, authenticate(&mut handle, target))
            .await
            .map_err(|_| {
                PanelError::timeout(timeout, format!("authenticating to {}", target.display()))
            })??;

        if !authenticated {
            return Err(PanelError::AuthFailure(format!(
                "{} rejected the stored credentials",
                target.display()
            )));
        }

        Ok(Box::new(RusshSession {
            handle,
            label: target.display(),
            command_timeout: self.command_timeout,
        }))
    }
}

async fn authenticate(
    handle: &mut Handle<NodeHandler>,
    target: &SshTarget,
) -> Result<bool, PanelError> {
    match &target.auth {
        SshAuth::Password(password) => handle
            .authenticate_password(&target.user, password)
            .await
            .map_err(|e| PanelError::AuthFailure(format!("{}: {}", target.display(), e))),
        SshAuth::KeyFile { path, passphrase } => {
            let key = russh_keys::load_secret_key(path, passphrase.as_deref()).map_err(|e| {
                PanelError::AuthFailure(format!("cannot load key {}: {}", path.display(), e))
            })?;
            handle
                .authenticate_publickey(&target.user, Arc::new(key))
                .await
                .map_err(|e| PanelError::AuthFailure(format!("{}: {}", target.display(), e)))
        }
    }
}

struct RusshSession {
    handle: Handle<NodeHandler>,
    label: String,
    command_timeout: Duration,
}

impl RusshSession {
    async fn run(&self, command: &str, stdin: Option<Bytes>) -> Result<CommandOutput, PanelError> {
        let mut channel = self
            .handle
            .channel_open_session()
            .await
            .map_err(|e| PanelError::Unreachable(format!("{}: {}", self.label, e)))?;

        channel
            .exec(true, command)
            .await
            .map_err(|e| PanelError::Unreachable(format!("{}: {}", self.label, e)))?;

        if let Some(data) = stdin {
            channel
                .data(&data[..])
                .await
                .map_err(|e| PanelError::Unreachable(format!("{}: {}", self.label, e)))?;
            channel
                .eof()
                .await
                .map_err(|e| PanelError::Unreachable(format!("{}: {}", self.label, e)))?;
        }

        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        let mut exit_code = None;

        let collect = async {
            while let Some(msg) = channel.wait().await {
                match msg {
                    ChannelMsg::Data { data } => stdout.extend_from_slice(&data),
                    ChannelMsg::ExtendedData { data, ext } if ext == 1 => {
                        stderr.extend_from_slice(&data)
                    }
                    ChannelMsg::ExitStatus { exit_status } => exit_code = Some(exit_status),
                    _ => {}
                }
            }
        };
        tokio::time::timeout(self.command_timeout, collect)
            .await
            .map_err(|_| {
                PanelError::timeout(
                    self.command_timeout,
                    format!("running a command on {}", self.label),
                )
            })?;

        Ok(CommandOutput {
            stdout: String::from_utf8_lossy(&stdout).into_owned(),
            stderr: String::from_utf8_lossy(&stderr).into_owned(),
            exit_code,
        })
    }
}

#[async_trait]
impl RemoteSession for RusshSession {
    async fn exec(&self, command: &str) -> Result<CommandOutput, PanelError> {
        tracing::debug!("{}: exec {}", self.label, command);
        self.run(command, None).await
    }

    async fn upload(&self, path: &str, content: Bytes, mode: u32) -> Result<(), PanelError> {
        tracing::debug!("{}: upload {} ({} bytes)", self.label, path, content.len());
        let quoted = shell_quote(path);
        let command = format!(
            "umask 077 && cat > {path}.part && chmod {mode:o} {path}.part && mv -f {path}.part {path}",
            path = quoted,
            mode = mode,
        );
        let output = self.run(&command, Some(content)).await?;
        if output.success() {
            Ok(())
        } else {
            Err(PanelError::Unreachable(format!(
                "upload of {} failed: {}",
                path,
                output.summary(5)
            )))
        }
    }

    async fn close(&self) -> Result<(), PanelError> {
        self.handle
            .disconnect(Disconnect::ByApplication, "", "en")
            .await
            .map_err(|e| PanelError::Unreachable(format!("{}: {}", self.label, e)))
    }
}
