//! Node sync
//!
//! A sync probes one node through its link, appends the sample to history and
//! moves the node's status. Concurrent triggers for a node share one in-flight
//! task, and a trigger shortly after a completed sync is answered from that
//! result without touching the node again.

use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::future::{BoxFuture, FutureExt, Shared};
use futures::stream::{self, StreamExt};
use serde::Serialize;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use fp_core::config::SyncConfig;
use fp_core::time::now_millis;
use fp_core::{MetricSample, NodeId, NodeStatus, PanelError, ResourceSnapshot};

use super::MetricsHistory;
use crate::link::LinkFactory;
use crate::registry::NodeRegistry;

type SyncFuture = Shared<BoxFuture<'static, SyncReport>>;

/// Outcome of one sync, as returned to the operator
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncReport {
    pub node_id: NodeId,
    pub ok: bool,
    /// Node status after the sync; `None` if the node vanished meanwhile
    pub status: Option<NodeStatus>,
    pub snapshot: Option<ResourceSnapshot>,
    pub error: Option<String>,
    pub synced_at: u64,
    /// Served from the debounce window
    pub cached: bool,
}

impl SyncReport {
    fn failed(node_id: NodeId, status: Option<NodeStatus>, error: String) -> Self {
        Self {
            node_id,
            ok: false,
            status,
            snapshot: None,
            error: Some(error),
            synced_at: now_millis(),
            cached: false,
        }
    }
}

pub struct MetricsCollector {
    registry: Arc<NodeRegistry>,
    history: Arc<MetricsHistory>,
    links: LinkFactory,
    config: SyncConfig,
    inflight: DashMap<NodeId, SyncFuture>,
    recent: DashMap<NodeId, (Instant, SyncReport)>,
}

impl MetricsCollector {
    pub fn new(
        registry: Arc<NodeRegistry>,
        history: Arc<MetricsHistory>,
        links: LinkFactory,
        config: SyncConfig,
    ) -> Self {
        Self {
            registry,
            history,
            links,
            config,
            inflight: DashMap::new(),
            recent: DashMap::new(),
        }
    }

    /// Sync one node, joining an in-flight sync or reusing a fresh result
    pub async fn sync_node(self: &Arc<Self>, node_id: &NodeId) -> Result<SyncReport, PanelError> {
        self.registry.get(node_id)?;

        if let Some(entry) = self.recent.get(node_id) {
            let (finished, report) = &*entry;
            if finished.elapsed() < self.config.debounce {
                let mut report = report.clone();
                report.cached = true;
                return Ok(report);
            }
        }

        let sync = match self.inflight.entry(node_id.clone()) {
            Entry::Occupied(e) => {
                tracing::debug!("Joining in-flight sync of {}", node_id);
                e.get().clone()
            }
            Entry::Vacant(e) => {
                let this = Arc::clone(self);
                let id = node_id.clone();
                let task = tokio::spawn(async move {
                    let report = this.perform(&id).await;
                    this.recent
                        .insert(id.clone(), (Instant::now(), report.clone()));
                    // Deleted mid-sync: `forget` may already have run
                    if this.registry.get(&id).is_err() {
                        this.recent.remove(&id);
                    }
                    this.inflight.remove(&id);
                    report
                });

                let id = node_id.clone();
                let registry = Arc::clone(&self.registry);
                let sync = async move {
                    match task.await {
                        Ok(report) => report,
                        Err(e) => {
                            let status = registry.get(&id).ok().map(|n| n.status);
                            SyncReport::failed(id, status, format!("sync task failed: {}", e))
                        }
                    }
                }
                .boxed()
                .shared();
                e.insert(sync.clone());
                sync
            }
        };

        Ok(sync.await)
    }

    /// Sync every node not in maintenance, `concurrency` at a time
    pub async fn sync_all(self: &Arc<Self>) -> Vec<SyncReport> {
        let ids: Vec<NodeId> = self
            .registry
            .list()
            .into_iter()
            .filter(|n| n.status != NodeStatus::Maintenance)
            .map(|n| n.id)
            .collect();

        stream::iter(ids)
            .map(|id| {
                let this = Arc::clone(self);
                async move { this.sync_node(&id).await }
            })
            .buffer_unordered(self.config.concurrency.max(1))
            .filter_map(|r| async move { r.ok() })
            .collect()
            .await
    }

    /// Periodic background sync, independent of operator activity
    pub async fn run_sync_loop(self: Arc<Self>, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.config.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        tracing::info!(
            "Starting sync loop (interval: {:?}, concurrency: {})",
            self.config.interval,
            self.config.concurrency
        );

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let reports = self.sync_all().await;
                    let failed = reports.iter().filter(|r| !r.ok).count();
                    tracing::debug!("Synced {} nodes ({} failed)", reports.len(), failed);
                }
                _ = cancel.cancelled() => {
                    tracing::info!("Sync loop shutting down");
                    break;
                }
            }
        }
    }

    /// Forget cached results for a deleted node
    pub fn forget(&self, node_id: &NodeId) {
        self.recent.remove(node_id);
    }

    /// Nodes holding a cached sync result
    pub fn cached_len(&self) -> usize {
        self.recent.len()
    }

    async fn perform(&self, node_id: &NodeId) -> SyncReport {
        match self.probe(node_id).await {
            Ok(snapshot) => {
                let at = now_millis();
                match self.registry.record_snapshot(node_id, snapshot, at) {
                    Ok(status) => {
                        self.history.append(MetricSample {
                            node_id: node_id.clone(),
                            timestamp: at,
                            snapshot,
                        });
                        SyncReport {
                            node_id: node_id.clone(),
                            ok: true,
                            status: Some(status),
                            snapshot: Some(snapshot),
                            error: None,
                            synced_at: at,
                            cached: false,
                        }
                    }
                    Err(e) => SyncReport::failed(node_id.clone(), None, e.to_string()),
                }
            }
            Err(e) => {
                tracing::warn!("Sync of node {} failed: {}", node_id, e);
                let status = match self.registry.mark_unreachable(node_id) {
                    Ok(status) => Some(status),
                    Err(err) => {
                        tracing::debug!("Could not mark {} unreachable: {}", node_id, err);
                        None
                    }
                };
                SyncReport::failed(node_id.clone(), status, e.to_string())
            }
        }
    }

    async fn probe(&self, node_id: &NodeId) -> Result<ResourceSnapshot, PanelError> {
        let node = self.registry.get(node_id)?;
        let link = self.links.link_for(&node)?;
        tracing::debug!("Probing {} via {} link", node_id, link.kind());

        tokio::time::timeout(self.config.timeout, link.probe())
            .await
            .map_err(|_| {
                PanelError::timeout(self.config.timeout, format!("syncing node {}", node_id))
            })?
    }
}
