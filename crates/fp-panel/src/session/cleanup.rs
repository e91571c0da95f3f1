//! Idle shell sweep
//!
//! A shell nobody polls for `idle_timeout` is released: its local state is
//! dropped and a close is sent to the agent so the remote PTY goes away.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use fp_core::time::now_millis;

use super::ShellGateway;

pub async fn run_idle_sweep(
    gateway: Arc<ShellGateway>,
    interval: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);

    tracing::info!("Starting idle shell sweep (check interval: {:?})", interval);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let released = gateway.sweep_idle(now_millis()).await;
                if released > 0 {
                    tracing::info!("Released {} idle shells", released);
                }
            }
            _ = cancel.cancelled() => {
                tracing::info!("Idle shell sweep shutting down");
                break;
            }
        }
    }
}
