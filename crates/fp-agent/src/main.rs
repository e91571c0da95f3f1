//! fleet-agent daemon
//!
//! Installed on managed nodes by the panel's deployment. Keeps a reverse SSH
//! tunnel to the panel open, reconnecting with backoff, and serves metrics
//! queries and PTY shells over it.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::sync::mpsc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use fp_agent::state::PTY_EVENT_BUFFER;
use fp_agent::tunnel::{ActiveTunnel, ExponentialBackoff, TunnelConnector};
use fp_agent::AgentState;
use fp_core::config::{self, AgentConfig};

/// Replies and shell output queued for the tunnel writer
const OUTBOUND_BUFFER: usize = 512;

#[derive(Parser)]
#[command(name = "fleet-agent")]
#[command(about = "fleet-panel node agent")]
#[command(version)]
struct Args {
    /// Path to agent.toml
    #[arg(short, long, env = "FLEET_AGENT_CONFIG")]
    config: Option<PathBuf>,

    /// Panel tunnel address (`host:port`), overriding the configuration
    #[arg(long)]
    panel: Option<String>,

    /// Run in foreground with verbose output
    #[arg(short, long)]
    foreground: bool,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let log_level = if args.foreground {
        "debug"
    } else {
        &args.log_level
    };
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| log_level.into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config_path = args
        .config
        .clone()
        .unwrap_or_else(|| config::default_config_dir().join("agent.toml"));
    let mut config: AgentConfig = config::load_config(&config_path)
        .with_context(|| format!("Failed to load {}", config_path.display()))?;
    if let Some(panel) = args.panel {
        config.panel_address = panel;
    }

    tracing::info!(
        "fleet-agent {} starting: agent {} for node {}, panel {}",
        env!("CARGO_PKG_VERSION"),
        config.agent_id,
        config.node_id,
        config.panel_address
    );

    let connector = TunnelConnector::new(config.clone()).context("Invalid agent configuration")?;
    let mut backoff = ExponentialBackoff::from_config(&config.backoff);

    loop {
        let tunnel = tokio::select! {
            connected = connector.connect_with_retry(&mut backoff) => connected,
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Interrupted, exiting");
                return Ok(());
            }
        };

        // Transient failures are retried inside; whatever comes back is final
        // and the service manager decides whether to restart us
        let mut tunnel = match tunnel {
            Ok(tunnel) => tunnel,
            Err(e) => return Err(e).context("Giving up on the panel"),
        };
        backoff.reset();

        let lost = tokio::select! {
            reason = run_tunnel(&mut tunnel, &config) => Some(reason),
            _ = tokio::signal::ctrl_c() => None,
        };
        let Some(reason) = lost else {
            tracing::info!("Interrupted, closing tunnel");
            if let Err(e) = tunnel.close().await {
                tracing::debug!("Close failed: {}", e);
            }
            return Ok(());
        };
        tracing::warn!("Tunnel lost: {}", reason);

        tokio::time::sleep(Duration::from_secs(1)).await;
        tracing::info!("Reconnecting...");
    }
}

/// Serve one registered tunnel until it drops
async fn run_tunnel(tunnel: &mut ActiveTunnel, config: &AgentConfig) -> String {
    let (outbound_tx, mut outbound_rx) = mpsc::channel(OUTBOUND_BUFFER);
    let (pty_tx, mut pty_rx) = mpsc::channel(PTY_EVENT_BUFFER);
    let mut state = AgentState::new(config, outbound_tx, pty_tx);

    let reason = loop {
        tokio::select! {
            event = tunnel.recv_event() => {
                let Some(event) = event else {
                    break "event channel closed".to_string();
                };
                if let Some(reason) = state.handle_event(event).await {
                    break reason;
                }
            }

            Some(event) = pty_rx.recv() => {
                state.handle_pty(event).await;
            }

            Some(frame) = outbound_rx.recv() => {
                if let Err(e) = tunnel.send(frame).await {
                    break format!("send failed: {}", e);
                }
            }
        }
    };

    let open = state.shell_count();
    if open > 0 {
        tracing::info!("Closing {} shells", open);
    }
    state.shutdown();
    reason
}
