//! Tunnel listener
//!
//! Accepts agent connections and runs a `TunnelHandler` for each.

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use russh_keys::key::KeyPair;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::connection::AgentPool;
use crate::registry::NodeRegistry;
use crate::server::handler::{ServerConfig, TunnelHandler};

pub struct TunnelServer {
    config: ServerConfig,
    registry: Arc<NodeRegistry>,
    pool: Arc<AgentPool>,
    cancel: CancellationToken,
}

impl TunnelServer {
    pub fn new(
        host_key: KeyPair,
        registry: Arc<NodeRegistry>,
        pool: Arc<AgentPool>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            config: ServerConfig::new(host_key),
            registry,
            pool,
            cancel,
        }
    }

    /// Bind and serve until cancelled
    pub async fn run(&self, bind_addr: &str) -> Result<()> {
        let listener = TcpListener::bind(bind_addr)
            .await
            .with_context(|| format!("Failed to bind tunnel listener to {}", bind_addr))?;
        self.serve(listener).await
    }

    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        let local_addr = listener.local_addr()?;
        tracing::info!("Tunnel server listening on {}", local_addr);

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    tracing::info!("Tunnel server shutting down");
                    break;
                }

                result = listener.accept() => {
                    match result {
                        Ok((socket, peer_addr)) => self.handle_connection(socket, peer_addr),
                        Err(e) => tracing::error!("Failed to accept connection: {}", e),
                    }
                }
            }
        }

        Ok(())
    }

    fn handle_connection(&self, socket: tokio::net::TcpStream, peer_addr: SocketAddr) {
        tracing::info!("New tunnel connection from {}", peer_addr);

        let config = Arc::clone(&self.config.ssh_config);
        let conn_cancel = self.cancel.child_token();
        let handler = TunnelHandler::new(
            Arc::clone(&self.registry),
            Arc::clone(&self.pool),
            conn_cancel.clone(),
            peer_addr,
        );

        tokio::spawn(async move {
            let session = match russh::server::run_stream(config, socket, handler).await {
                Ok(session) => session,
                Err(e) => {
                    tracing::warn!("Handshake with {} failed: {}", peer_addr, e);
                    return;
                }
            };

            tokio::select! {
                result = session => match result {
                    Ok(()) => tracing::info!("Tunnel from {} closed normally", peer_addr),
                    Err(e) => tracing::warn!("Tunnel from {} closed with error: {}", peer_addr, e),
                },
                _ = conn_cancel.cancelled() => {
                    tracing::debug!("Tunnel from {} cancelled", peer_addr);
                }
            }
        });
    }
}

/// Load the tunnel host key, generating and saving an Ed25519 key on first
/// start so agents see a stable identity
pub async fn load_or_generate_host_key(path: &Path) -> Result<KeyPair> {
    if path.exists() {
        tracing::info!("Loading host key from {:?}", path);
        return russh_keys::load_secret_key(path, None)
            .with_context(|| format!("Failed to load host key from {:?}", path));
    }

    tracing::info!("Generating new host key at {:?}", path);
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("Failed to create directory {:?}", parent))?;
    }

    let key = KeyPair::generate_ed25519()
        .ok_or_else(|| anyhow::anyhow!("Failed to generate Ed25519 key"))?;
    let mut pem = Vec::new();
    russh_keys::encode_pkcs8_pem(&key, &mut pem).context("Failed to encode host key")?;
    write_private(path, &pem)
        .await
        .with_context(|| format!("Failed to write host key to {:?}", path))?;

    if let Ok(public) = key.clone_public_key() {
        tracing::info!("Tunnel host key fingerprint: {}", public.fingerprint());
    }
    Ok(key)
}

#[cfg(unix)]
async fn write_private(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    tokio::fs::write(path, contents).await?;
    tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600)).await
}

#[cfg(not(unix))]
async fn write_private(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    tokio::fs::write(path, contents).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn host_key_is_persisted() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keys").join("tunnel_host_key");

        let first = load_or_generate_host_key(&path).await.unwrap();
        assert!(path.exists());
        let second = load_or_generate_host_key(&path).await.unwrap();

        let fp = |k: &KeyPair| k.clone_public_key().unwrap().fingerprint();
        assert_eq!(fp(&first), fp(&second));
    }
}
