//! Agent deployment against an in-memory secure shell and agent tunnel

mod common;

use std::sync::atomic::Ordering;
use std::time::Duration;

use common::*;
use fp_core::{ConnectionType, JobStatus, NodeStatus, PanelError};
use fp_panel::store::Store;

#[tokio::test]
async fn test_deploy_binds_agent_and_activates_node() {
    let panel = panel();
    let node_id = deployed_tunnel_node(&panel, "edge-1").await;

    let node = panel.state.registry.get(&node_id).unwrap();
    assert_eq!(node.status, NodeStatus::Active);
    assert_eq!(node.connection_type, ConnectionType::Tunnel);
    assert!(node.agent_id.is_some());
    assert_eq!(node.snapshot, Some(snapshot()));

    // First sample lands in history
    assert_eq!(panel.state.history.len(&node_id), 1);

    let commands = panel.ssh.commands.lock().unwrap().clone();
    assert_eq!(commands.first().map(String::as_str), Some("uname -sm"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_success_is_never_visible_before_the_node_is_bound() {
    let panel = panel();
    let node = panel
        .state
        .registry
        .create(&ops(), new_node("edge-3", ConnectionType::Tunnel))
        .unwrap();
    panel
        .state
        .deployer
        .deploy_agent(&ops(), &node.id, None)
        .unwrap();

    let started = std::time::Instant::now();
    while started.elapsed() < Duration::from_secs(5) {
        let job = panel.state.deployer.deploy_status(&node.id).unwrap();
        if job.status == JobStatus::Success {
            let bound = panel.state.registry.get(&node.id).unwrap();
            assert_eq!(bound.status, NodeStatus::Active);
            assert!(bound.agent_id.is_some());
            assert_eq!(panel.state.history.len(&node.id), 1);
            return;
        }
        assert_eq!(job.status, JobStatus::Running, "{:?}", job.diagnostics);
        tokio::task::yield_now().await;
    }
    panic!("deployment never finished");
}

#[tokio::test]
async fn test_deploy_rejects_second_running_job() {
    let panel = panel();
    panel.ssh.hang.store(true, Ordering::SeqCst);

    let node = panel
        .state
        .registry
        .create(&ops(), new_node("edge-2", ConnectionType::Tunnel))
        .unwrap();
    let first = panel
        .state
        .deployer
        .deploy_agent(&ops(), &node.id, None)
        .unwrap();
    assert_eq!(first.status, JobStatus::Running);

    let second = panel.state.deployer.deploy_agent(&ops(), &node.id, None);
    assert!(matches!(second, Err(PanelError::Conflict(_))));

    let status = panel.state.deployer.deploy_status(&node.id).unwrap();
    assert_eq!(status.id, first.id);
}

#[tokio::test(start_paused = true)]
async fn test_deploy_times_out_when_node_hangs() {
    let mut config = test_config();
    config.deploy.timeout = Duration::from_secs(2);
    let panel = panel_with(config, Store::in_memory());
    panel.ssh.hang.store(true, Ordering::SeqCst);

    let node = panel
        .state
        .registry
        .create(&ops(), new_node("edge-3", ConnectionType::Tunnel))
        .unwrap();
    panel
        .state
        .deployer
        .deploy_agent(&ops(), &node.id, None)
        .unwrap();

    let job = wait_for_job(&panel.state, &node.id).await;
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.step.as_deref(), Some("connect"));
    assert!(job.diagnostics.is_some());

    let node = panel.state.registry.get(&node.id).unwrap();
    assert_eq!(node.status, NodeStatus::ConnectionError);
}

#[tokio::test]
async fn test_deploy_fails_when_agent_never_registers() {
    let mut config = test_config();
    config.deploy.registration_timeout = Duration::from_millis(200);
    let panel = panel_with(config, Store::in_memory());
    panel.agents.online.store(false, Ordering::SeqCst);

    let node = panel
        .state
        .registry
        .create(&ops(), new_node("edge-4", ConnectionType::Tunnel))
        .unwrap();
    panel
        .state
        .deployer
        .deploy_agent(&ops(), &node.id, None)
        .unwrap();

    let job = wait_for_job(&panel.state, &node.id).await;
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.step.as_deref(), Some("wait for agent registration"));
    assert!(panel.state.registry.get(&node.id).unwrap().agent_id.is_none());
}

#[tokio::test]
async fn test_deploy_refuses_local_node() {
    let panel = panel();
    let local = panel.state.registry.local().unwrap();

    let result = panel.state.deployer.deploy_agent(&ops(), &local.id, None);
    assert!(matches!(result, Err(PanelError::Conflict(_))));
}

#[tokio::test]
async fn test_deploy_status_of_untouched_node_is_not_found() {
    let panel = panel();
    let node = panel
        .state
        .registry
        .create(&ops(), new_node("edge-5", ConnectionType::Direct))
        .unwrap();

    assert!(matches!(
        panel.state.deployer.deploy_status(&node.id),
        Err(PanelError::NotFound(_))
    ));
}

#[tokio::test]
async fn test_delete_local_node_is_refused() {
    let panel = panel();
    let local = panel.state.registry.local().unwrap();

    let result = panel.state.delete_node(&ops(), &local.id).await;
    assert!(matches!(result, Err(PanelError::Conflict(_))));
    assert!(panel.state.registry.get(&local.id).is_ok());
}

#[tokio::test]
async fn test_delete_node_drops_history_and_jobs() {
    let panel = panel();
    let node_id = deployed_tunnel_node(&panel, "edge-6").await;
    assert_eq!(panel.state.history.len(&node_id), 1);

    panel.state.delete_node(&ops(), &node_id).await.unwrap();
    assert_eq!(panel.state.history.len(&node_id), 0);
    assert!(panel.state.jobs.latest(&node_id).is_none());
    assert!(matches!(
        panel.state.registry.get(&node_id),
        Err(PanelError::NotFound(_))
    ));
}
