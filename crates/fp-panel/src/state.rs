//! Control-plane state shared by the HTTP API, the tunnel server and the
//! background tasks

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use fp_core::config::PanelConfig;
use fp_core::time::now_millis;
use fp_core::traits::{AgentRpc, SecureShell};
use fp_core::{NodeId, Operator, PanelError};

use crate::connection::{AgentPool, HealthMonitor, TunnelRpc};
use crate::deploy::{Deployer, JobTable};
use crate::link::LinkFactory;
use crate::metrics::{MetricsCollector, MetricsHistory};
use crate::registry::{sha256_hex, AuditLog, CredentialCipher, Node, NodeRegistry};
use crate::session::{run_idle_sweep, ShellGateway};
use crate::store::Store;

/// How often the deploy watchdog looks for overdue jobs
const WATCHDOG_INTERVAL: Duration = Duration::from_secs(5);
const HISTORY_COMPACT_INTERVAL: Duration = Duration::from_secs(3600);

pub struct PanelState {
    pub config: PanelConfig,
    pub store: Arc<Store>,
    pub audit: Arc<AuditLog>,
    pub registry: Arc<NodeRegistry>,
    pub jobs: Arc<JobTable>,
    pub history: Arc<MetricsHistory>,
    /// Live agent tunnels
    pub agents: Arc<AgentPool>,
    pub rpc: Arc<dyn AgentRpc>,
    pub collector: Arc<MetricsCollector>,
    pub deployer: Arc<Deployer>,
    pub shells: Arc<ShellGateway>,
}

impl PanelState {
    /// Load persisted state and wire the services together. `rpc` defaults to
    /// the tunnel-backed implementation over `agents`.
    pub fn build(
        config: PanelConfig,
        store: Arc<Store>,
        cipher: CredentialCipher,
        ssh: Arc<dyn SecureShell>,
        rpc: Option<Arc<dyn AgentRpc>>,
    ) -> Result<Self, PanelError> {
        let audit = Arc::new(AuditLog::new(Arc::clone(&store)));
        let registry = Arc::new(NodeRegistry::load(
            Arc::clone(&store),
            cipher,
            Arc::clone(&audit),
        )?);
        let jobs = Arc::new(JobTable::load(Arc::clone(&store))?);
        let history = Arc::new(MetricsHistory::load(
            Arc::clone(&store),
            &registry.ids(),
            config.history.retention,
            config.history.max_points,
            now_millis(),
        )?);

        let agents = Arc::new(AgentPool::new());
        let rpc = rpc.unwrap_or_else(|| {
            Arc::new(TunnelRpc::new(
                Arc::clone(&agents),
                config.agents.query_timeout,
            ))
        });

        let links = LinkFactory::new(
            Arc::clone(&registry),
            Arc::clone(&ssh),
            Arc::clone(&rpc),
            config.deploy.connect_timeout,
        );
        let collector = Arc::new(MetricsCollector::new(
            Arc::clone(&registry),
            Arc::clone(&history),
            links,
            config.sync.clone(),
        ));
        let deployer = Arc::new(Deployer::new(
            Arc::clone(&registry),
            Arc::clone(&jobs),
            Arc::clone(&history),
            ssh,
            Arc::clone(&rpc),
            Arc::clone(&audit),
            config.deploy.clone(),
            config.agent_dial_address(),
        ));
        let shells = Arc::new(ShellGateway::new(
            Arc::clone(&registry),
            Arc::clone(&rpc),
            config.shell.clone(),
        ));

        Ok(Self {
            config,
            store,
            audit,
            registry,
            jobs,
            history,
            agents,
            rpc,
            collector,
            deployer,
            shells,
        })
    }

    /// Operator presenting `token`, if any
    pub fn authenticate(&self, token: &str) -> Option<Operator> {
        let hash = sha256_hex(token);
        self.config
            .operators
            .iter()
            .find(|o| o.token_sha256.eq_ignore_ascii_case(&hash))
            .map(|o| Operator {
                name: o.name.clone(),
                admin: o.admin,
            })
    }

    /// Delete a node and everything hanging off it
    pub async fn delete_node(&self, operator: &Operator, id: &NodeId) -> Result<Node, PanelError> {
        let node = self.registry.delete(operator, id)?;

        let closed = self.shells.close_for_node(id).await;
        if closed > 0 {
            tracing::info!("Closed {} shells of deleted node {}", closed, id);
        }
        if let Some(agent_id) = &node.agent_id {
            self.rpc.disconnect(agent_id).await;
        }
        self.history.remove_node(id);
        self.jobs.remove_node(id);
        self.collector.forget(id);
        Ok(node)
    }

    /// Start the background loops: sync, deploy watchdog, agent health,
    /// history compaction and the idle shell sweep
    pub fn spawn_background(&self, cancel: &CancellationToken) -> Vec<JoinHandle<()>> {
        let health = HealthMonitor::new(
            Arc::clone(&self.agents),
            Arc::clone(&self.registry),
            self.config.agents.heartbeat_interval,
            self.config.agents.stale_after,
        );

        vec![
            tokio::spawn(Arc::clone(&self.collector).run_sync_loop(cancel.clone())),
            tokio::spawn(
                Arc::clone(&self.deployer).run_watchdog(WATCHDOG_INTERVAL, cancel.clone()),
            ),
            tokio::spawn(health.run(cancel.clone())),
            tokio::spawn(
                Arc::clone(&self.history).run_compaction(HISTORY_COMPACT_INTERVAL, cancel.clone()),
            ),
            tokio::spawn(run_idle_sweep(
                Arc::clone(&self.shells),
                self.config.shell.sweep_interval,
                cancel.clone(),
            )),
        ]
    }
}
