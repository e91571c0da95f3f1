//! Agent liveness
//!
//! Every tick the monitor heartbeats each live tunnel and evicts the ones that
//! have not answered within `stale_after`. Tunnel nodes still marked up while
//! their agent is gone (for instance after a control-plane restart) are
//! degraded as well.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use fp_core::time::now_millis;
use fp_core::AgentId;

use super::pool::{AgentCommand, AgentPool};
use crate::registry::NodeRegistry;

pub struct HealthMonitor {
    pool: Arc<AgentPool>,
    registry: Arc<NodeRegistry>,
    /// Heartbeat interval
    pub interval: Duration,
    /// Silence after which an agent is evicted
    pub stale_after: Duration,
}

impl HealthMonitor {
    pub fn new(
        pool: Arc<AgentPool>,
        registry: Arc<NodeRegistry>,
        interval: Duration,
        stale_after: Duration,
    ) -> Self {
        Self {
            pool,
            registry,
            interval,
            stale_after,
        }
    }

    pub async fn run(self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);

        tracing::info!(
            "Starting agent health monitor (heartbeat: {:?}, stale after: {:?})",
            self.interval,
            self.stale_after
        );

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.check(now_millis());
                }
                _ = cancel.cancelled() => {
                    tracing::info!("Agent health monitor shutting down");
                    break;
                }
            }
        }
    }

    /// One pass: evict silent agents, heartbeat the rest
    pub fn check(&self, now: u64) -> Vec<AgentId> {
        let window = self.stale_after.as_millis() as u64;
        let mut evicted = Vec::new();

        for conn in self.pool.list() {
            let silent_for = now.saturating_sub(conn.last_heartbeat());
            if silent_for > window {
                if self
                    .pool
                    .remove_if_same(conn.agent_id(), conn.conn_id)
                    .is_none()
                {
                    continue;
                }
                tracing::warn!(
                    "Agent {} silent for {}ms; dropping its tunnel",
                    conn.agent_id(),
                    silent_for
                );
                conn.cancel.cancel();
                conn.fail_all();
                if let Err(e) = self.registry.mark_unreachable(conn.node_id()) {
                    tracing::debug!("Could not degrade node {}: {}", conn.node_id(), e);
                }
                evicted.push(conn.agent_id().clone());
            } else if !conn.try_send(AgentCommand::Heartbeat { timestamp: now }) {
                tracing::debug!("Heartbeat queue full for agent {}", conn.agent_id());
            }
        }

        for node_id in self.registry.stale_tunnel_nodes(self.stale_after, now) {
            let connected = self
                .registry
                .get(&node_id)
                .ok()
                .and_then(|n| n.agent_id)
                .and_then(|a| self.pool.get(&a))
                .map(|c| c.is_open())
                .unwrap_or(false);
            if !connected {
                if let Ok(status) = self.registry.mark_unreachable(&node_id) {
                    tracing::info!("Tunnel node {} has no live agent; now {}", node_id, status);
                }
            }
        }

        evicted
    }
}
