//! Deployment orchestrator

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use rand::RngCore;
use tokio_util::sync::CancellationToken;

use fp_core::config::{AgentConfig, DeployConfig};
use fp_core::time::now_millis;
use fp_core::traits::{AgentRpc, CommandOutput, RemoteSession, SecureShell};
use fp_core::{
    AgentId, JobStatus, MetricSample, NodeId, Operator, PanelError, ResourceSnapshot,
};

use super::bootstrap::{AgentArtifact, BootstrapPlan, Platform, StepAction, PROBE_COMMAND};
use super::job::{DeploymentJob, JobTable};
use crate::metrics::MetricsHistory;
use crate::registry::{AuditLog, NodeRegistry};

/// Lines of stdout/stderr kept in a failure diagnostic
const DIAGNOSTIC_TAIL_LINES: usize = 20;

/// Poll period while waiting for a new agent to dial in
const REGISTRATION_POLL: Duration = Duration::from_millis(500);

/// Why a deployment failed, and where
struct DeployFailure {
    step: String,
    error: PanelError,
    output: Option<CommandOutput>,
}

impl DeployFailure {
    fn at(step: &str, error: PanelError) -> Self {
        Self {
            step: step.to_string(),
            error,
            output: None,
        }
    }

    fn diagnostics(&self) -> String {
        let mut text = format!("step '{}' failed: {}", self.step, self.error);
        if let Some(output) = &self.output {
            text.push('\n');
            text.push_str(&output.summary(DIAGNOSTIC_TAIL_LINES));
        }
        text
    }
}

pub struct Deployer {
    registry: Arc<NodeRegistry>,
    jobs: Arc<JobTable>,
    history: Arc<MetricsHistory>,
    ssh: Arc<dyn SecureShell>,
    agents: Arc<dyn AgentRpc>,
    audit: Arc<AuditLog>,
    settings: DeployConfig,
    /// Tunnel address written into agent.toml
    panel_address: String,
}

impl Deployer {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        registry: Arc<NodeRegistry>,
        jobs: Arc<JobTable>,
        history: Arc<MetricsHistory>,
        ssh: Arc<dyn SecureShell>,
        agents: Arc<dyn AgentRpc>,
        audit: Arc<AuditLog>,
        settings: DeployConfig,
        panel_address: String,
    ) -> Self {
        Self {
            registry,
            jobs,
            history,
            ssh,
            agents,
            audit,
            settings,
            panel_address,
        }
    }

    /// Start deploying an agent to `node_id`. Returns the running job at once.
    pub fn deploy_agent(
        self: &Arc<Self>,
        operator: &Operator,
        node_id: &NodeId,
        db_config: Option<serde_json::Value>,
    ) -> Result<DeploymentJob, PanelError> {
        let node = self.registry.get(node_id)?;
        if node.is_local {
            return Err(PanelError::Conflict(
                "the local node is probed directly and takes no agent".into(),
            ));
        }
        let database = database_settings(db_config.unwrap_or(serde_json::Value::Null))?;

        let job = self
            .jobs
            .begin(node_id, &operator.name, self.settings.timeout)?;
        self.audit.record(
            &operator.name,
            "deploy.start",
            Some(node_id),
            format!("job {} for {}", job.id, node.name),
        );
        tracing::info!("Deployment {} started for node {}", job.id, node_id);

        let this = Arc::clone(self);
        let spawned = job.clone();
        tokio::spawn(async move { this.execute(spawned, database).await });

        Ok(job)
    }

    /// Latest job for a node
    pub fn deploy_status(&self, node_id: &NodeId) -> Result<DeploymentJob, PanelError> {
        self.registry.get(node_id)?;
        self.jobs
            .latest(node_id)
            .ok_or_else(|| PanelError::NotFound(format!("no deployment for node {}", node_id)))
    }

    /// Fail jobs that outlive their deadline, whatever their task is doing
    pub async fn run_watchdog(self: Arc<Self>, interval: Duration, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    for job in self.jobs.expire_overdue(now_millis()) {
                        tracing::warn!("Deployment {} for node {} passed its deadline", job.id, job.node_id);
                        self.node_failed(&job.node_id);
                    }
                }
                _ = cancel.cancelled() => {
                    tracing::info!("Deployment watchdog shutting down");
                    break;
                }
            }
        }
    }

    async fn execute(self: Arc<Self>, job: DeploymentJob, database: Option<toml::Table>) {
        let outcome = tokio::time::timeout(self.settings.timeout, self.bootstrap(&job, database))
            .await
            .unwrap_or_else(|_| {
                let step = self
                    .jobs
                    .get(&job.node_id, &job.id)
                    .and_then(|j| j.step)
                    .unwrap_or_else(|| "deploy".to_string());
                Err(DeployFailure::at(
                    &step,
                    PanelError::timeout(self.settings.timeout, "deploying the agent"),
                ))
            });

        match outcome {
            Ok((agent_id, snapshot)) => {
                // Bind while the job still reads running, so a poller never
                // sees success on an unbound node
                if let Err(e) = self.registry.bind_agent(&job.node_id, &agent_id, snapshot) {
                    tracing::error!("Failed to bind agent {} to node {}: {}", agent_id, job.node_id, e);
                    self.jobs.finish(
                        &job.node_id,
                        &job.id,
                        JobStatus::Failed,
                        Some(format!("step 'bind agent': {}", e)),
                    );
                    return;
                }
                self.history.append(MetricSample {
                    node_id: job.node_id.clone(),
                    timestamp: now_millis(),
                    snapshot,
                });
                if !self.jobs.finish(&job.node_id, &job.id, JobStatus::Success, None) {
                    tracing::warn!("Deployment {} finished after it was already failed", job.id);
                    self.node_failed(&job.node_id);
                    return;
                }
                self.audit.record(
                    &job.operator,
                    "deploy.success",
                    Some(&job.node_id),
                    format!("job {} bound agent {}", job.id, agent_id),
                );
                tracing::info!("Deployment {} succeeded, agent {} active", job.id, agent_id);
            }
            Err(failure) => {
                let diagnostics = failure.diagnostics();
                tracing::warn!("Deployment {} failed: {}", job.id, diagnostics);
                if self.jobs.finish(
                    &job.node_id,
                    &job.id,
                    JobStatus::Failed,
                    Some(diagnostics.clone()),
                ) {
                    self.node_failed(&job.node_id);
                    self.audit.record(
                        &job.operator,
                        "deploy.failed",
                        Some(&job.node_id),
                        format!("job {}: step '{}'", job.id, failure.step),
                    );
                }
            }
        }
    }

    fn node_failed(&self, node_id: &NodeId) {
        if let Err(e) = self.registry.mark_connection_error(node_id) {
            tracing::debug!("Could not mark node {} failed: {}", node_id, e);
        }
    }

    async fn bootstrap(
        &self,
        job: &DeploymentJob,
        database: Option<toml::Table>,
    ) -> Result<(AgentId, ResourceSnapshot), DeployFailure> {
        let node_id = &job.node_id;

        self.step(job, "connect");
        let target = self
            .registry
            .ssh_target(node_id)
            .map_err(|e| DeployFailure::at("connect", e))?;
        let session = self
            .ssh
            .connect(&target, self.settings.connect_timeout)
            .await
            .map_err(|e| DeployFailure::at("connect", e))?;

        let agent_id = AgentId::generate();
        let installed = self
            .install(job, session.as_ref(), &agent_id, database)
            .await;
        if let Err(e) = session.close().await {
            tracing::debug!("Closing session to {} failed: {}", target.display(), e);
        }
        installed?;

        self.step(job, "wait for agent registration");
        let registered = tokio::time::timeout(self.settings.registration_timeout, async {
            while !self.agents.is_connected(&agent_id) {
                tokio::time::sleep(REGISTRATION_POLL).await;
            }
        })
        .await;
        if registered.is_err() {
            return Err(DeployFailure::at(
                "wait for agent registration",
                PanelError::timeout(
                    self.settings.registration_timeout,
                    format!("waiting for agent {} to connect", agent_id),
                ),
            ));
        }

        self.step(job, "query agent metrics");
        let snapshot = tokio::time::timeout(
            self.settings.command_timeout,
            self.agents.query_metrics(&agent_id),
        )
        .await
        .map_err(|_| {
            DeployFailure::at(
                "query agent metrics",
                PanelError::timeout(self.settings.command_timeout, "querying agent metrics"),
            )
        })?
        .map_err(|e| DeployFailure::at("query agent metrics", e))?;

        Ok((agent_id, snapshot))
    }

    /// Remote half of the bootstrap, on an open session
    async fn install(
        &self,
        job: &DeploymentJob,
        session: &dyn RemoteSession,
        agent_id: &AgentId,
        database: Option<toml::Table>,
    ) -> Result<(), DeployFailure> {
        self.step(job, "probe platform");
        let probe = self.exec_checked(session, "probe platform", PROBE_COMMAND).await?;
        let platform = Platform::parse(&probe.stdout)
            .and_then(|p| p.ensure_supported().map(|_| p))
            .map_err(|e| DeployFailure::at("probe platform", e))?;

        self.step(job, "prepare agent");
        let artifact = self
            .artifact()
            .await
            .map_err(|e| DeployFailure::at("prepare agent", e))?;

        let token = random_token();
        self.registry
            .stage_agent(&job.node_id, agent_id, &token)
            .map_err(|e| DeployFailure::at("prepare agent", e))?;

        let agent_config = AgentConfig {
            panel_address: self.panel_address.clone(),
            agent_id: agent_id.to_string(),
            node_id: job.node_id.to_string(),
            token,
            database,
            ..Default::default()
        };
        let plan = BootstrapPlan::build(&self.settings, &platform, artifact, &agent_config)
            .map_err(|e| DeployFailure::at("prepare agent", e))?;

        for step in plan.steps {
            self.step(job, step.name);
            match step.action {
                StepAction::Exec(command) => {
                    self.exec_checked(session, step.name, &command).await?;
                }
                StepAction::Upload {
                    path,
                    content,
                    mode,
                } => {
                    session
                        .upload(&path, content, mode)
                        .await
                        .map_err(|e| DeployFailure::at(step.name, e))?;
                }
            }
        }
        Ok(())
    }

    async fn exec_checked(
        &self,
        session: &dyn RemoteSession,
        step: &str,
        command: &str,
    ) -> Result<CommandOutput, DeployFailure> {
        let output = session
            .exec(command)
            .await
            .map_err(|e| DeployFailure::at(step, e))?;
        if output.success() {
            Ok(output)
        } else {
            Err(DeployFailure {
                step: step.to_string(),
                error: PanelError::Unreachable("remote command failed".into()),
                output: Some(output),
            })
        }
    }

    async fn artifact(&self) -> Result<AgentArtifact, PanelError> {
        if let Some(path) = &self.settings.agent_binary {
            let bytes = tokio::fs::read(path).await.map_err(|e| {
                PanelError::Invalid(format!("cannot read agent binary {}: {}", path.display(), e))
            })?;
            return Ok(AgentArtifact::Local(Bytes::from(bytes)));
        }
        if let Some(url) = &self.settings.agent_download_url {
            return Ok(AgentArtifact::Download(url.clone()));
        }
        Err(PanelError::Invalid(
            "no agent artifact configured (deploy.agent_binary or deploy.agent_download_url)"
                .into(),
        ))
    }

    fn step(&self, job: &DeploymentJob, name: &str) {
        tracing::debug!("Deployment {}: {}", job.id, name);
        self.jobs.set_step(&job.node_id, &job.id, name);
    }
}

fn random_token() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Operator-supplied `dbConfig`, carried into the agent configuration.
/// JSON nulls are dropped since TOML has no null.
fn database_settings(value: serde_json::Value) -> Result<Option<toml::Table>, PanelError> {
    match value {
        serde_json::Value::Null => Ok(None),
        serde_json::Value::Object(map) => Ok(Some(
            map.into_iter()
                .filter_map(|(k, v)| json_to_toml(v).map(|v| (k, v)))
                .collect(),
        )),
        _ => Err(PanelError::Invalid("dbConfig must be a JSON object".into())),
    }
}

fn json_to_toml(value: serde_json::Value) -> Option<toml::Value> {
    use serde_json::Value as J;
    use toml::Value as T;

    Some(match value {
        J::Null => return None,
        J::Bool(b) => T::Boolean(b),
        J::Number(n) => match n.as_i64() {
            Some(i) => T::Integer(i),
            None => T::Float(n.as_f64()?),
        },
        J::String(s) => T::String(s),
        J::Array(items) => T::Array(items.into_iter().filter_map(json_to_toml).collect()),
        J::Object(map) => T::Table(
            map.into_iter()
                .filter_map(|(k, v)| json_to_toml(v).map(|v| (k, v)))
                .collect(),
        ),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn db_config_becomes_a_table() {
        let table = database_settings(json!({
            "engine": "mariadb",
            "port": 3306,
            "ratio": 0.5,
            "replicas": ["a", null, "b"],
            "password": null,
            "tls": { "enabled": true }
        }))
        .unwrap()
        .unwrap();

        assert_eq!(table["engine"].as_str(), Some("mariadb"));
        assert_eq!(table["port"].as_integer(), Some(3306));
        assert_eq!(table["ratio"].as_float(), Some(0.5));
        assert_eq!(table["replicas"].as_array().unwrap().len(), 2);
        assert!(!table.contains_key("password"));
        assert_eq!(table["tls"]["enabled"].as_bool(), Some(true));
    }

    #[test]
    fn db_config_must_be_an_object() {
        assert!(database_settings(json!(null)).unwrap().is_none());
        assert!(matches!(
            database_settings(json!("mysql://")),
            Err(PanelError::Invalid(_))
        ));
    }

    #[test]
    fn failure_diagnostics_name_the_step() {
        let failure = DeployFailure {
            step: "install and start service".into(),
            error: PanelError::Unreachable("remote command failed".into()),
            output: Some(CommandOutput {
                stdout: String::new(),
                stderr: "systemctl: permission denied\n".into(),
                exit_code: Some(1),
            }),
        };
        let text = failure.diagnostics();
        assert!(text.starts_with("step 'install and start service' failed"));
        assert!(text.contains("exit code 1"));
        assert!(text.contains("permission denied"));
    }

    #[test]
    fn tokens_are_random_hex() {
        let a = random_token();
        assert_eq!(a.len(), 64);
        assert_ne!(a, random_token());
    }
}
