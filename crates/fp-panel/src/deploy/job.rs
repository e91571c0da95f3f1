//! Deployment job table
//!
//! Jobs are kept per node, newest last. At most one job per node is ever
//! `running`, and a finished job never changes again.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use fp_core::time::now_millis;
use fp_core::{JobStatus, NodeId, PanelError};

use crate::store::{Store, JOBS_FILE};

/// Jobs kept per node; older finished jobs are dropped
const JOBS_KEPT_PER_NODE: usize = 10;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentJob {
    pub id: String,
    pub node_id: NodeId,
    pub status: JobStatus,
    /// Bootstrap step in progress, or the step that failed
    pub step: Option<String>,
    pub diagnostics: Option<String>,
    pub operator: String,
    pub submitted_at: u64,
    /// Past this instant the watchdog fails the job
    pub deadline: u64,
    pub finished_at: Option<u64>,
}

pub struct JobTable {
    jobs: DashMap<NodeId, Vec<DeploymentJob>>,
    store: Arc<Store>,
    persist_lock: Mutex<()>,
}

impl JobTable {
    /// Load `jobs.json`. Jobs still `running` belong to a previous process and
    /// are failed as interrupted.
    pub fn load(store: Arc<Store>) -> Result<Self, PanelError> {
        let rows: Vec<DeploymentJob> = store.load_json(JOBS_FILE)?;
        let jobs: DashMap<NodeId, Vec<DeploymentJob>> = DashMap::new();
        let now = now_millis();
        let mut interrupted = 0;

        for mut job in rows {
            if !job.status.is_terminal() {
                job.status = JobStatus::Failed;
                job.diagnostics = Some("interrupted: control plane restarted".to_string());
                job.finished_at = Some(now);
                interrupted += 1;
            }
            jobs.entry(job.node_id.clone()).or_default().push(job);
        }
        for mut entry in jobs.iter_mut() {
            entry.sort_by_key(|j| j.submitted_at);
        }

        let table = Self {
            jobs,
            store,
            persist_lock: Mutex::new(()),
        };
        if interrupted > 0 {
            tracing::warn!("Marked {} interrupted deployment jobs as failed", interrupted);
            table.persist()?;
        }
        Ok(table)
    }

    /// Open a `running` job, or `Conflict` if the node already has one
    pub fn begin(
        &self,
        node_id: &NodeId,
        operator: &str,
        timeout: Duration,
    ) -> Result<DeploymentJob, PanelError> {
        let now = now_millis();
        let job = DeploymentJob {
            id: uuid::Uuid::new_v4().to_string(),
            node_id: node_id.clone(),
            status: JobStatus::Running,
            step: None,
            diagnostics: None,
            operator: operator.to_string(),
            submitted_at: now,
            deadline: now + timeout.as_millis() as u64,
            finished_at: None,
        };

        match self.jobs.entry(node_id.clone()) {
            Entry::Occupied(mut entry) => {
                if let Some(running) = entry.get().iter().find(|j| j.status == JobStatus::Running) {
                    return Err(PanelError::Conflict(format!(
                        "deployment {} is already running for node {}",
                        running.id, node_id
                    )));
                }
                let list = entry.get_mut();
                list.push(job.clone());
                if list.len() > JOBS_KEPT_PER_NODE {
                    let excess = list.len() - JOBS_KEPT_PER_NODE;
                    list.drain(..excess);
                }
            }
            Entry::Vacant(entry) => {
                entry.insert(vec![job.clone()]);
            }
        }

        self.persist()?;
        Ok(job)
    }

    /// Record the step a running job has reached
    pub fn set_step(&self, node_id: &NodeId, job_id: &str, step: &str) {
        let updated = self
            .with_job(node_id, job_id, |job| {
                if job.status == JobStatus::Running {
                    job.step = Some(step.to_string());
                    true
                } else {
                    false
                }
            })
            .unwrap_or(false);
        if updated {
            if let Err(e) = self.persist() {
                tracing::warn!("Failed to persist job progress: {}", e);
            }
        }
    }

    /// Move a running job to a terminal state. Returns `false` if it had
    /// already finished.
    pub fn finish(
        &self,
        node_id: &NodeId,
        job_id: &str,
        status: JobStatus,
        diagnostics: Option<String>,
    ) -> bool {
        debug_assert!(status.is_terminal());
        let finished = self
            .with_job(node_id, job_id, |job| {
                if job.status.is_terminal() {
                    return false;
                }
                job.status = status;
                job.diagnostics = diagnostics;
                job.finished_at = Some(now_millis());
                true
            })
            .unwrap_or(false);

        if finished {
            if let Err(e) = self.persist() {
                tracing::warn!("Failed to persist job result: {}", e);
            }
        }
        finished
    }

    /// Newest job for a node
    pub fn latest(&self, node_id: &NodeId) -> Option<DeploymentJob> {
        self.jobs.get(node_id).and_then(|list| list.last().cloned())
    }

    pub fn get(&self, node_id: &NodeId, job_id: &str) -> Option<DeploymentJob> {
        self.jobs
            .get(node_id)
            .and_then(|list| list.iter().find(|j| j.id == job_id).cloned())
    }

    /// Fail every running job whose deadline has passed
    pub fn expire_overdue(&self, now: u64) -> Vec<DeploymentJob> {
        let mut expired = Vec::new();
        for mut entry in self.jobs.iter_mut() {
            for job in entry.iter_mut() {
                if job.status == JobStatus::Running && job.deadline <= now {
                    job.status = JobStatus::Failed;
                    job.diagnostics = Some(format!(
                        "deployment exceeded its deadline{}",
                        job.step
                            .as_deref()
                            .map(|s| format!(" during step '{}'", s))
                            .unwrap_or_default()
                    ));
                    job.finished_at = Some(now);
                    expired.push(job.clone());
                }
            }
        }
        if !expired.is_empty() {
            if let Err(e) = self.persist() {
                tracing::warn!("Failed to persist expired jobs: {}", e);
            }
        }
        expired
    }

    pub fn remove_node(&self, node_id: &NodeId) {
        if self.jobs.remove(node_id).is_some() {
            if let Err(e) = self.persist() {
                tracing::warn!("Failed to persist job table: {}", e);
            }
        }
    }

    fn with_job<R>(
        &self,
        node_id: &NodeId,
        job_id: &str,
        f: impl FnOnce(&mut DeploymentJob) -> R,
    ) -> Option<R> {
        let mut list = self.jobs.get_mut(node_id)?;
        list.iter_mut().find(|j| j.id == job_id).map(f)
    }

    fn persist(&self) -> Result<(), PanelError> {
        let _guard = self
            .persist_lock
            .lock()
            .map_err(|_| PanelError::Storage("job persist lock poisoned".into()))?;
        let mut rows: Vec<DeploymentJob> = self
            .jobs
            .iter()
            .flat_map(|entry| entry.value().clone())
            .collect();
        rows.sort_by_key(|j| j.submitted_at);
        self.store.save_json(JOBS_FILE, &rows)
    }
}
