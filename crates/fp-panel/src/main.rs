//! fleet-panel control plane daemon

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use fp_core::config::{self, PanelConfig};
use fp_panel::registry::{sha256_hex, CredentialCipher};
use fp_panel::server::{load_or_generate_host_key, TunnelServer};
use fp_panel::ssh::RusshShell;
use fp_panel::store::Store;
use fp_panel::{api, PanelState};

#[derive(Parser)]
#[command(name = "fp-panel")]
#[command(about = "fleet-panel control plane")]
#[command(version)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, env = "FP_PANEL_CONFIG")]
    config: Option<PathBuf>,

    /// HTTP bind address (overrides config)
    #[arg(long)]
    http_bind: Option<String>,

    /// Agent tunnel bind address (overrides config)
    #[arg(long)]
    tunnel_bind: Option<String>,

    /// Data directory (overrides config)
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Run in foreground with verbose output
    #[arg(short, long)]
    foreground: bool,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Print the token_sha256 for an operator token and exit
    #[arg(long, value_name = "TOKEN")]
    hash_token: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if let Some(token) = &args.hash_token {
        println!("{}", sha256_hex(token));
        return Ok(());
    }

    let log_level = if args.foreground { "debug" } else { &args.log_level };
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| log_level.into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("fleet-panel starting...");

    let mut config = load_config(args.config.as_ref())?;
    if let Some(bind) = args.http_bind {
        config.http_bind = bind;
    }
    if let Some(bind) = args.tunnel_bind {
        config.tunnel_bind = bind;
    }
    if let Some(dir) = args.data_dir {
        config.data_dir = dir;
    }
    config.validate().context("Invalid configuration")?;
    if config.operators.is_empty() {
        tracing::warn!("No operators configured - every API call except /health will be rejected");
    }

    let store = Arc::new(
        Store::open(&config.data_dir)
            .with_context(|| format!("Failed to open data directory {:?}", config.data_dir))?,
    );
    let cipher = CredentialCipher::load_or_create(&config.credential_key_path)
        .context("Failed to load credential key")?;
    let ssh = Arc::new(RusshShell::new(config.deploy.command_timeout));

    let state = Arc::new(
        PanelState::build(config.clone(), store, cipher, ssh, None)
            .context("Failed to load panel state")?,
    );
    let local = state
        .registry
        .ensure_local(config.local_node_name.as_deref())
        .context("Failed to register the local node")?;
    tracing::info!("Local node: {} ({})", local.name, local.id);

    let cancel = CancellationToken::new();
    spawn_signal_handler(cancel.clone());

    let host_key = load_or_generate_host_key(&config.host_key_path).await?;
    let tunnel = TunnelServer::new(
        host_key,
        Arc::clone(&state.registry),
        Arc::clone(&state.agents),
        cancel.clone(),
    );
    let tunnel_bind = config.tunnel_bind.clone();
    let tunnel_task = tokio::spawn(async move {
        if let Err(e) = tunnel.run(&tunnel_bind).await {
            tracing::error!("Tunnel server failed: {:#}", e);
        }
    });

    let background = state.spawn_background(&cancel);

    let listener = TcpListener::bind(&config.http_bind)
        .await
        .with_context(|| format!("Failed to bind HTTP listener to {}", config.http_bind))?;
    tracing::info!("HTTP API listening on {}", listener.local_addr()?);
    tracing::info!("Agents dial {}", config.agent_dial_address());

    let shutdown = cancel.clone();
    axum::serve(listener, api::router(Arc::clone(&state)))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .context("HTTP server failed")?;

    cancel.cancel();
    let _ = tunnel_task.await;
    for task in background {
        let _ = task.await;
    }

    tracing::info!("fleet-panel shutdown complete");
    Ok(())
}

fn load_config(path: Option<&PathBuf>) -> Result<PanelConfig> {
    if let Some(path) = path {
        return config::load_config(path)
            .with_context(|| format!("Failed to load config from {:?}", path));
    }

    let default_path = config::default_config_path();
    if default_path.exists() {
        Ok(config::load_config(&default_path).unwrap_or_else(|e| {
            tracing::warn!("Failed to load config from {:?}: {}", default_path, e);
            PanelConfig::default()
        }))
    } else {
        tracing::info!("Using default configuration");
        Ok(PanelConfig::default())
    }
}

fn spawn_signal_handler(cancel: CancellationToken) {
    tokio::spawn(async move {
        let ctrl_c = tokio::signal::ctrl_c();

        #[cfg(unix)]
        let terminate = async {
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(mut signal) => {
                    signal.recv().await;
                }
                Err(e) => {
                    tracing::warn!("Failed to install SIGTERM handler: {}", e);
                    std::future::pending::<()>().await;
                }
            }
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => tracing::info!("Received Ctrl+C, initiating shutdown..."),
            _ = terminate => tracing::info!("Received SIGTERM, initiating shutdown..."),
        }

        cancel.cancel();
    });
}
