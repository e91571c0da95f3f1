//! In-memory stand-ins for the secure shell and the agent tunnel

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use tokio::sync::mpsc;

use fp_core::config::{OperatorToken, PanelConfig};
use fp_core::traits::{
    AgentRpc, CommandOutput, RemoteSession, RemoteShell, SecureShell, ShellEvent, ShellRequest,
    SshTarget,
};
use fp_core::{
    AgentId, ConnectionType, JobStatus, NodeId, Operator, PanelError, ResourceSnapshot,
    TerminalSize,
};
use fp_panel::deploy::DeploymentJob;
use fp_panel::registry::{sha256_hex, CredentialCipher, NewNode};
use fp_panel::store::Store;
use fp_panel::PanelState;
use fp_protocol::StreamId;

pub const OPERATOR_TOKEN: &str = "secret-token";

pub const SCRAPE_OUTPUT: &str = "#stat
cpu  1000 0 1000 8000 0 0 0 0 0 0
cpu  1100 0 1100 8800 0 0 0 0 0 0
#mem
MemTotal:        8000000 kB
MemAvailable:    6000000 kB
#uptime
500.25 900.00
#df
/dev/sda1        100000  50000  50000  50% /
";

pub fn ops() -> Operator {
    Operator::admin("ops")
}

pub fn snapshot() -> ResourceSnapshot {
    ResourceSnapshot {
        cpu_percent: 21.0,
        ram_percent: 42.0,
        disk_percent: 63.0,
        uptime_secs: 3600,
    }
}

/// Secure shell whose nodes answer every command successfully
#[derive(Default)]
pub struct FakeShell {
    /// `connect` never returns
    pub hang: AtomicBool,
    /// `connect` fails as unreachable
    pub refuse: AtomicBool,
    pub commands: Arc<Mutex<Vec<String>>>,
    pub uploads: Arc<Mutex<Vec<String>>>,
}

#[async_trait]
impl SecureShell for FakeShell {
    async fn connect(
        &self,
        target: &SshTarget,
        _timeout: Duration,
    ) -> Result<Box<dyn RemoteSession>, PanelError> {
        if self.hang.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        if self.refuse.load(Ordering::SeqCst) {
            return Err(PanelError::Unreachable(format!("{} refused", target.display())));
        }
        Ok(Box::new(FakeSession {
            commands: Arc::clone(&self.commands),
            uploads: Arc::clone(&self.uploads),
        }))
    }
}

struct FakeSession {
    commands: Arc<Mutex<Vec<String>>>,
    uploads: Arc<Mutex<Vec<String>>>,
}

#[async_trait]
impl RemoteSession for FakeSession {
    async fn exec(&self, command: &str) -> Result<CommandOutput, PanelError> {
        self.commands.lock().unwrap().push(command.to_string());
        let stdout = if command == "uname -sm" {
            "Linux x86_64\n".to_string()
        } else if command.starts_with("echo '#stat'") {
            SCRAPE_OUTPUT.to_string()
        } else {
            String::new()
        };
        Ok(CommandOutput {
            stdout,
            stderr: String::new(),
            exit_code: Some(0),
        })
    }

    async fn upload(&self, path: &str, _content: Bytes, _mode: u32) -> Result<(), PanelError> {
        self.uploads.lock().unwrap().push(path.to_string());
        Ok(())
    }

    async fn close(&self) -> Result<(), PanelError> {
        Ok(())
    }
}

/// Agent tunnel where every agent is reachable while `online` is set. Shells
/// echo their input; `ls` lists two files and `exit` ends the shell.
pub struct FakeAgents {
    pub online: AtomicBool,
    pub metrics_calls: AtomicUsize,
    pub metrics_delay: Mutex<Duration>,
    next_stream: AtomicU32,
    shells: DashMap<StreamId, mpsc::Sender<ShellEvent>>,
    pub closed: Mutex<Vec<StreamId>>,
    pub resized: Mutex<Vec<TerminalSize>>,
}

impl Default for FakeAgents {
    fn default() -> Self {
        Self {
            online: AtomicBool::new(true),
            metrics_calls: AtomicUsize::new(0),
            metrics_delay: Mutex::new(Duration::ZERO),
            next_stream: AtomicU32::new(1),
            shells: DashMap::new(),
            closed: Mutex::new(Vec::new()),
            resized: Mutex::new(Vec::new()),
        }
    }
}

impl FakeAgents {
    pub fn calls(&self) -> usize {
        self.metrics_calls.load(Ordering::SeqCst)
    }

    fn check(&self, agent_id: &AgentId) -> Result<(), PanelError> {
        if self.online.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(PanelError::Unreachable(format!("agent {} is not connected", agent_id)))
        }
    }
}

#[async_trait]
impl AgentRpc for FakeAgents {
    fn is_connected(&self, _agent_id: &AgentId) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    async fn query_metrics(&self, agent_id: &AgentId) -> Result<ResourceSnapshot, PanelError> {
        self.metrics_calls.fetch_add(1, Ordering::SeqCst);
        let delay = *self.metrics_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        self.check(agent_id)?;
        Ok(snapshot())
    }

    async fn open_shell(
        &self,
        agent_id: &AgentId,
        _request: ShellRequest,
    ) -> Result<RemoteShell, PanelError> {
        self.check(agent_id)?;
        let stream_id = StreamId::new(self.next_stream.fetch_add(1, Ordering::SeqCst));
        let (tx, events) = mpsc::channel(64);
        let _ = tx.try_send(ShellEvent::Output(Bytes::from_static(b"$ ")));
        self.shells.insert(stream_id, tx);
        Ok(RemoteShell {
            stream_id,
            pid: 4242,
            events,
        })
    }

    async fn send_input(
        &self,
        agent_id: &AgentId,
        stream_id: StreamId,
        data: Bytes,
    ) -> Result<(), PanelError> {
        self.check(agent_id)?;
        let tx = self
            .shells
            .get(&stream_id)
            .map(|r| r.clone())
            .ok_or_else(|| PanelError::NotFound(format!("{}", stream_id)))?;

        let _ = tx.send(ShellEvent::Output(data.clone())).await;
        match &data[..] {
            b"ls\n" => {
                let _ = tx
                    .send(ShellEvent::Output(Bytes::from_static(b"alpha.txt  beta.txt\r\n")))
                    .await;
                let _ = tx.send(ShellEvent::Output(Bytes::from_static(b"$ "))).await;
            }
            b"exit\n" => {
                let _ = tx.send(ShellEvent::Exited { exit_code: Some(0) }).await;
                self.shells.remove(&stream_id);
            }
            _ => {}
        }
        Ok(())
    }

    async fn resize_shell(
        &self,
        agent_id: &AgentId,
        _stream_id: StreamId,
        size: TerminalSize,
    ) -> Result<(), PanelError> {
        self.check(agent_id)?;
        self.resized.lock().unwrap().push(size);
        Ok(())
    }

    async fn close_shell(&self, _agent_id: &AgentId, stream_id: StreamId) -> Result<(), PanelError> {
        self.shells.remove(&stream_id);
        self.closed.lock().unwrap().push(stream_id);
        Ok(())
    }

    async fn disconnect(&self, _agent_id: &AgentId) {}
}

pub struct TestPanel {
    pub state: Arc<PanelState>,
    pub ssh: Arc<FakeShell>,
    pub agents: Arc<FakeAgents>,
}

pub fn test_config() -> PanelConfig {
    let mut config = PanelConfig::default();
    config.operators = vec![OperatorToken {
        name: "ops".into(),
        token_sha256: sha256_hex(OPERATOR_TOKEN),
        admin: true,
    }];
    config.public_tunnel_address = Some("panel.test:2222".into());
    config.deploy.agent_download_url = Some("https://downloads.test/fleet-agent-{arch}".into());
    config
}

pub fn panel() -> TestPanel {
    panel_with(test_config(), Store::in_memory())
}

pub fn panel_with(config: PanelConfig, store: Store) -> TestPanel {
    let ssh = Arc::new(FakeShell::default());
    let agents = Arc::new(FakeAgents::default());
    let state = PanelState::build(
        config,
        Arc::new(store),
        CredentialCipher::ephemeral(),
        Arc::clone(&ssh) as Arc<dyn SecureShell>,
        Some(Arc::clone(&agents) as Arc<dyn AgentRpc>),
    )
    .unwrap();
    state.registry.ensure_local(Some("panel")).unwrap();
    TestPanel {
        state: Arc::new(state),
        ssh,
        agents,
    }
}

pub fn new_node(name: &str, kind: ConnectionType) -> NewNode {
    NewNode {
        name: name.into(),
        hostname: format!("{}.example.net", name),
        ip: "10.0.0.7".into(),
        ssh_password: Some("hunter2".into()),
        connection_type: Some(kind),
        ..Default::default()
    }
}

/// Poll the latest job until it leaves `running`
pub async fn wait_for_job(state: &PanelState, node_id: &NodeId) -> DeploymentJob {
    for _ in 0..500 {
        let job = state.deployer.deploy_status(node_id).unwrap();
        if job.status != JobStatus::Running && job.status != JobStatus::Pending {
            return job;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("deployment for {} never finished", node_id);
}

/// A tunnel node with a bound, reachable agent
pub async fn deployed_tunnel_node(panel: &TestPanel, name: &str) -> NodeId {
    let node = panel
        .state
        .registry
        .create(&ops(), new_node(name, ConnectionType::Tunnel))
        .unwrap();
    panel
        .state
        .deployer
        .deploy_agent(&ops(), &node.id, None)
        .unwrap();
    let job = wait_for_job(&panel.state, &node.id).await;
    assert_eq!(job.status, JobStatus::Success, "{:?}", job.diagnostics);
    node.id
}
