//! Metric time series
//!
//! One append-only series per node, mirrored to `metrics/<node>.jsonl`.
//! Appends for a node hold that node's map entry while writing, so writes per
//! node are serialized. Samples past the retention window are compacted away
//! at load and by a periodic task.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio_util::sync::CancellationToken;

use fp_core::time::now_millis;
use fp_core::{MetricSample, NodeId, PanelError, ResourceSnapshot};

use crate::store::Store;

pub struct MetricsHistory {
    series: DashMap<NodeId, Vec<MetricSample>>,
    store: Arc<Store>,
    retention: Duration,
    max_points: usize,
}

impl MetricsHistory {
    pub fn new(store: Arc<Store>, retention: Duration, max_points: usize) -> Self {
        Self {
            series: DashMap::new(),
            store,
            retention,
            max_points: max_points.max(2),
        }
    }

    /// Load each node's series, dropping samples older than `retention` and
    /// compacting the file when anything was dropped
    pub fn load(
        store: Arc<Store>,
        nodes: &[NodeId],
        retention: Duration,
        max_points: usize,
        now: u64,
    ) -> Result<Self, PanelError> {
        let history = Self::new(store, retention, max_points);
        let cutoff = history.cutoff(now);
        let mut total = 0;

        for node in nodes {
            let name = Store::metrics_file(node.as_str());
            let mut samples: Vec<MetricSample> = history.store.read_lines(&name)?;
            let before = samples.len();
            samples.retain(|s| s.timestamp >= cutoff && &s.node_id == node);
            samples.sort_by_key(|s| s.timestamp);
            if samples.len() != before {
                history.store.rewrite_lines(&name, &samples)?;
                tracing::debug!(
                    "Compacted history of {}: {} -> {} samples",
                    node,
                    before,
                    samples.len()
                );
            }
            total += samples.len();
            history.series.insert(node.clone(), samples);
        }

        tracing::info!("Loaded {} metric samples for {} nodes", total, nodes.len());
        Ok(history)
    }

    /// Append a sample; storage failures are logged, the in-memory series
    /// still grows
    pub fn append(&self, sample: MetricSample) {
        let mut series = self.series.entry(sample.node_id.clone()).or_default();
        let name = Store::metrics_file(sample.node_id.as_str());
        if let Err(e) = self.store.append_line(&name, &sample) {
            tracing::warn!("Failed to persist sample for {}: {}", sample.node_id, e);
        }
        // Keep ascending order even if clocks step backwards
        let pos = series.partition_point(|s| s.timestamp <= sample.timestamp);
        series.insert(pos, sample);
    }

    /// Samples within `period` before `now`, ascending, at most `max_points`
    pub fn query(&self, node_id: &NodeId, period: Duration, now: u64) -> Vec<MetricSample> {
        let since = now.saturating_sub(period.as_millis() as u64);
        let samples: Vec<MetricSample> = self
            .series
            .get(node_id)
            .map(|series| {
                let start = series.partition_point(|s| s.timestamp < since);
                series[start..]
                    .iter()
                    .filter(|s| s.timestamp <= now)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        downsample(samples, self.max_points)
    }

    /// Drop samples older than the retention window and rewrite the files
    /// that lost any. Returns the number of samples dropped.
    pub fn compact(&self, now: u64) -> usize {
        let cutoff = self.cutoff(now);
        let mut dropped = 0;

        for mut entry in self.series.iter_mut() {
            let stale = entry.partition_point(|s| s.timestamp < cutoff);
            if stale == 0 {
                continue;
            }
            entry.drain(..stale);
            dropped += stale;

            let name = Store::metrics_file(entry.key().as_str());
            if let Err(e) = self.store.rewrite_lines(&name, entry.value()) {
                tracing::warn!("Failed to compact history of {}: {}", entry.key(), e);
            }
        }

        if dropped > 0 {
            tracing::debug!("Compacted {} expired metric samples", dropped);
        }
        dropped
    }

    pub async fn run_compaction(self: Arc<Self>, interval: Duration, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(interval);
        // The first tick is immediate and load has just compacted
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.compact(now_millis());
                }
                _ = cancel.cancelled() => break,
            }
        }
    }

    fn cutoff(&self, now: u64) -> u64 {
        now.saturating_sub(self.retention.as_millis() as u64)
    }

    pub fn len(&self, node_id: &NodeId) -> usize {
        self.series.get(node_id).map(|s| s.len()).unwrap_or(0)
    }

    pub fn remove_node(&self, node_id: &NodeId) {
        self.series.remove(node_id);
        if let Err(e) = self.store.remove(&Store::metrics_file(node_id.as_str())) {
            tracing::warn!("Failed to remove history of {}: {}", node_id, e);
        }
    }
}

/// Average consecutive samples into at most `max_points` buckets.
///
/// Each bucket reports the mean percentages, the latest uptime and the
/// timestamp of its last sample.
pub fn downsample(samples: Vec<MetricSample>, max_points: usize) -> Vec<MetricSample> {
    if samples.len() <= max_points || max_points == 0 {
        return samples;
    }
    let bucket = samples.len().div_ceil(max_points);

    samples
        .chunks(bucket)
        .filter_map(|chunk| {
            let last = chunk.last()?;
            let n = chunk.len() as f32;
            let mean = |f: fn(&ResourceSnapshot) -> f32| {
                chunk.iter().map(|s| f(&s.snapshot)).sum::<f32>() / n
            };
            Some(MetricSample {
                node_id: last.node_id.clone(),
                timestamp: last.timestamp,
                snapshot: ResourceSnapshot {
                    cpu_percent: mean(|s| s.cpu_percent),
                    ram_percent: mean(|s| s.ram_percent),
                    disk_percent: mean(|s| s.disk_percent),
                    uptime_secs: last.snapshot.uptime_secs,
                },
            })
        })
        .collect()
}
