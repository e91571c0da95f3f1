//! Node registry
//!
//! The durable record of every node. Rows live in a `DashMap`; each mutation
//! updates its row in place and then rewrites `nodes.json` under a single
//! persist lock so concurrent writers never reorder the file.

mod audit;
mod credentials;
mod node;

pub use audit::{AuditEntry, AuditLog};
pub use credentials::CredentialCipher;
pub use node::{AgentCredential, NewNode, Node, NodeUpdate, NodeView};

use std::sync::{Arc, Mutex};
use std::time::Duration;

use dashmap::DashMap;
use sha2::{Digest, Sha256};

use fp_core::time::{is_stale, now_millis};
use fp_core::traits::{SshAuth, SshTarget};
use fp_core::{AgentId, ConnectionType, NodeId, NodeStatus, Operator, PanelError, ResourceSnapshot};

use crate::store::{Store, NODES_FILE};

/// Lowercase hex SHA-256 of a secret
pub fn sha256_hex(secret: &str) -> String {
    hex::encode(Sha256::digest(secret.as_bytes()))
}

pub struct NodeRegistry {
    nodes: DashMap<NodeId, Node>,
    store: Arc<Store>,
    cipher: CredentialCipher,
    audit: Arc<AuditLog>,
    persist_lock: Mutex<()>,
}

impl NodeRegistry {
    /// Load `nodes.json` from the store
    pub fn load(
        store: Arc<Store>,
        cipher: CredentialCipher,
        audit: Arc<AuditLog>,
    ) -> Result<Self, PanelError> {
        let rows: Vec<Node> = store.load_json(NODES_FILE)?;
        tracing::info!("Loaded {} nodes", rows.len());

        let nodes = DashMap::new();
        for node in rows {
            nodes.insert(node.id.clone(), node);
        }

        Ok(Self {
            nodes,
            store,
            cipher,
            audit,
            persist_lock: Mutex::new(()),
        })
    }

    /// All nodes, local node first, then by creation time
    pub fn list(&self) -> Vec<NodeView> {
        let mut views: Vec<NodeView> = self.nodes.iter().map(|r| r.view()).collect();
        views.sort_by(|a, b| {
            b.is_local
                .cmp(&a.is_local)
                .then(a.created_at.cmp(&b.created_at))
                .then(a.name.cmp(&b.name))
        });
        views
    }

    pub fn ids(&self) -> Vec<NodeId> {
        self.nodes.iter().map(|r| r.key().clone()).collect()
    }

    /// Full record, credentials still sealed
    pub fn get(&self, id: &NodeId) -> Result<Node, PanelError> {
        self.nodes
            .get(id)
            .map(|r| r.clone())
            .ok_or_else(|| PanelError::not_found("node", id))
    }

    pub fn view(&self, id: &NodeId) -> Result<NodeView, PanelError> {
        self.get(id).map(|n| n.view())
    }

    pub fn local(&self) -> Option<Node> {
        self.nodes.iter().find(|r| r.is_local).map(|r| r.clone())
    }

    pub fn create(&self, operator: &Operator, new: NewNode) -> Result<NodeView, PanelError> {
        new.validate()?;

        let now = now_millis();
        let connection_type = new.connection_type.unwrap_or_default();
        let ssh_password = match new.ssh_password.as_deref().map(str::trim) {
            Some(pw) if !pw.is_empty() => Some(self.cipher.seal(pw)?),
            _ => None,
        };

        let node = Node {
            id: NodeId::generate(),
            name: new.name.trim().to_string(),
            hostname: new.hostname.trim().to_string(),
            ip: new.ip.trim().to_string(),
            ssh_user: new
                .ssh_user
                .filter(|u| !u.trim().is_empty())
                .unwrap_or_else(|| "root".to_string()),
            ssh_port: new.ssh_port.unwrap_or(22),
            ssh_password,
            ssh_key_path: new.ssh_key_path.filter(|p| !p.trim().is_empty()),
            connection_type,
            is_local: false,
            // A tunnel node has no agent yet
            status: match connection_type {
                ConnectionType::Direct => NodeStatus::Active,
                ConnectionType::Tunnel => NodeStatus::ConnectionError,
            },
            last_seen: None,
            snapshot: None,
            agent_id: None,
            agent_credential: None,
            created_at: now,
            updated_at: now,
        };

        let view = node.view();
        self.nodes.insert(node.id.clone(), node);
        self.persist()?;

        self.audit.record(
            &operator.name,
            "node.create",
            Some(&view.id),
            format!("created {} ({}, {})", view.name, view.ip, view.connection_type),
        );
        Ok(view)
    }

    pub fn update(
        &self,
        operator: &Operator,
        id: &NodeId,
        update: NodeUpdate,
    ) -> Result<NodeView, PanelError> {
        update.validate()?;

        let sealed_password = match update.ssh_password.as_deref().map(str::trim) {
            Some(pw) if !pw.is_empty() => Some(self.cipher.seal(pw)?),
            _ => None,
        };

        let mut changed = Vec::new();
        let view = {
            let mut node = self
                .nodes
                .get_mut(id)
                .ok_or_else(|| PanelError::not_found("node", id))?;

            if node.is_local && matches!(update.connection_type, Some(ConnectionType::Tunnel)) {
                return Err(PanelError::Conflict("the local node is always direct".into()));
            }

            if let Some(name) = update.name {
                node.name = name.trim().to_string();
                changed.push("name");
            }
            if let Some(hostname) = update.hostname {
                node.hostname = hostname.trim().to_string();
                changed.push("hostname");
            }
            if let Some(ip) = update.ip {
                node.ip = ip.trim().to_string();
                changed.push("ip");
            }
            if let Some(user) = update.ssh_user.filter(|u| !u.trim().is_empty()) {
                node.ssh_user = user;
                changed.push("sshUser");
            }
            if let Some(port) = update.ssh_port {
                node.ssh_port = port;
                changed.push("sshPort");
            }
            if let Some(sealed) = sealed_password {
                node.ssh_password = Some(sealed);
                changed.push("sshPassword");
            }
            if let Some(path) = update.ssh_key_path {
                node.ssh_key_path = Some(path).filter(|p| !p.trim().is_empty());
                changed.push("sshKeyPath");
            }
            if let Some(kind) = update.connection_type.filter(|k| *k != node.connection_type) {
                node.connection_type = kind;
                changed.push("connectionType");
                // A tunnel node is only healthy once an agent is bound
                if node.status != NodeStatus::Maintenance {
                    node.status = resumed_status(&node);
                }
            }
            match update.status {
                Some(NodeStatus::Maintenance) => {
                    node.status = NodeStatus::Maintenance;
                    changed.push("status");
                }
                Some(_) if node.status == NodeStatus::Maintenance => {
                    node.status = resumed_status(&node);
                    changed.push("status");
                }
                _ => {}
            }

            node.updated_at = now_millis();
            node.view()
        };

        self.persist()?;
        self.audit.record(
            &operator.name,
            "node.update",
            Some(id),
            format!("updated {}", changed.join(", ")),
        );
        Ok(view)
    }

    /// Remove a node. The local node cannot be deleted.
    pub fn delete(&self, operator: &Operator, id: &NodeId) -> Result<Node, PanelError> {
        let removed = self
            .nodes
            .remove_if(id, |_, node| !node.is_local)
            .map(|(_, node)| node);

        let node = match removed {
            Some(node) => node,
            None if self.nodes.contains_key(id) => {
                return Err(PanelError::Conflict("the local node cannot be deleted".into()))
            }
            None => return Err(PanelError::not_found("node", id)),
        };

        self.persist()?;
        self.audit.record(
            &operator.name,
            "node.delete",
            Some(id),
            format!("deleted {}", node.name),
        );
        Ok(node)
    }

    /// Make sure exactly one local node exists, creating it on first start
    pub fn ensure_local(&self, name: Option<&str>) -> Result<NodeView, PanelError> {
        if let Some(local) = self.local() {
            return Ok(local.view());
        }

        let hostname = gethostname::gethostname().to_string_lossy().into_owned();
        let now = now_millis();
        let node = Node {
            id: NodeId::generate(),
            name: name.map(str::to_string).unwrap_or_else(|| hostname.clone()),
            hostname,
            ip: "127.0.0.1".to_string(),
            ssh_user: "root".to_string(),
            ssh_port: 22,
            ssh_password: None,
            ssh_key_path: None,
            connection_type: ConnectionType::Direct,
            is_local: true,
            status: NodeStatus::Active,
            last_seen: None,
            snapshot: None,
            agent_id: None,
            agent_credential: None,
            created_at: now,
            updated_at: now,
        };
        let view = node.view();
        self.nodes.insert(node.id.clone(), node);
        self.persist()?;

        self.audit.record(
            "system",
            "node.create",
            Some(&view.id),
            format!("registered local node {}", view.name),
        );
        Ok(view)
    }

    /// Secure-shell target for a node, password unsealed
    pub fn ssh_target(&self, id: &NodeId) -> Result<SshTarget, PanelError> {
        let node = self.get(id)?;
        let auth = match (&node.ssh_password, &node.ssh_key_path) {
            (Some(sealed), _) => SshAuth::Password(self.cipher.open(sealed)?),
            (None, Some(path)) => SshAuth::KeyFile {
                path: path.into(),
                passphrase: None,
            },
            (None, None) => {
                return Err(PanelError::Invalid(format!(
                    "node {} has no password or key configured",
                    node.name
                )))
            }
        };
        Ok(SshTarget {
            host: node.ip.clone(),
            port: node.ssh_port,
            user: node.ssh_user.clone(),
            auth,
        })
    }

    /// Issue the credential a freshly deployed agent will log in with
    pub fn stage_agent(
        &self,
        id: &NodeId,
        agent_id: &AgentId,
        token: &str,
    ) -> Result<(), PanelError> {
        self.modify(id, |node| {
            node.agent_credential = Some(AgentCredential {
                agent_id: agent_id.clone(),
                token_sha256: sha256_hex(token),
            });
        })
    }

    /// Tunnel authentication: the node whose staged or bound credential
    /// matches
    pub fn verify_agent(&self, agent_id: &AgentId, token: &str) -> Option<NodeId> {
        let hash = sha256_hex(token);
        self.nodes
            .iter()
            .find(|r| {
                r.agent_credential
                    .as_ref()
                    .map(|c| &c.agent_id == agent_id && c.token_sha256 == hash)
                    .unwrap_or(false)
            })
            .map(|r| r.key().clone())
    }

    /// Node served by a bound agent
    pub fn node_for_agent(&self, agent_id: &AgentId) -> Option<NodeId> {
        self.nodes
            .iter()
            .find(|r| r.agent_id.as_ref() == Some(agent_id))
            .map(|r| r.key().clone())
    }

    /// Deploy success: bind the agent, take the node over the tunnel and
    /// record its first snapshot
    pub fn bind_agent(
        &self,
        id: &NodeId,
        agent_id: &AgentId,
        snapshot: ResourceSnapshot,
    ) -> Result<(), PanelError> {
        let now = now_millis();
        self.modify(id, |node| {
            node.agent_id = Some(agent_id.clone());
            node.connection_type = ConnectionType::Tunnel;
            node.snapshot = Some(snapshot);
            node.last_seen = Some(now);
            if node.status != NodeStatus::Maintenance {
                node.status = NodeStatus::Active;
            }
        })
    }

    /// A bound agent (re)connected; it counts as online until it reports
    pub fn mark_online(&self, id: &NodeId) -> Result<(), PanelError> {
        self.modify(id, |node| {
            if node.agent_id.is_some()
                && matches!(
                    node.status,
                    NodeStatus::Offline | NodeStatus::ConnectionError
                )
            {
                node.status = NodeStatus::Online;
            }
        })
    }

    /// Successful sync
    pub fn record_snapshot(
        &self,
        id: &NodeId,
        snapshot: ResourceSnapshot,
        at: u64,
    ) -> Result<NodeStatus, PanelError> {
        let mut status = NodeStatus::Active;
        self.modify(id, |node| {
            node.snapshot = Some(snapshot);
            node.last_seen = Some(at);
            let agent_ok =
                node.connection_type == ConnectionType::Direct || node.agent_id.is_some();
            if node.status != NodeStatus::Maintenance && agent_ok {
                node.status = NodeStatus::Active;
            }
            status = node.status;
        })?;
        Ok(status)
    }

    /// Failed sync or lost agent; snapshot and history are kept
    pub fn mark_unreachable(&self, id: &NodeId) -> Result<NodeStatus, PanelError> {
        let mut status = NodeStatus::Offline;
        self.modify(id, |node| {
            node.status = node.status.degraded(node.provisioned());
            status = node.status;
        })?;
        Ok(status)
    }

    /// Deploy failure
    pub fn mark_connection_error(&self, id: &NodeId) -> Result<(), PanelError> {
        self.modify(id, |node| {
            if node.status != NodeStatus::Maintenance {
                node.status = NodeStatus::ConnectionError;
            }
        })
    }

    /// Tunnel nodes whose agent has gone quiet
    pub fn stale_tunnel_nodes(&self, window: Duration, now: u64) -> Vec<NodeId> {
        self.nodes
            .iter()
            .filter(|r| {
                r.connection_type == ConnectionType::Tunnel
                    && matches!(r.status, NodeStatus::Active | NodeStatus::Online)
                    && is_stale(r.last_seen, window, now)
            })
            .map(|r| r.key().clone())
            .collect()
    }

    fn modify(&self, id: &NodeId, f: impl FnOnce(&mut Node)) -> Result<(), PanelError> {
        {
            let mut node = self
                .nodes
                .get_mut(id)
                .ok_or_else(|| PanelError::not_found("node", id))?;
            f(&mut node);
            node.updated_at = now_millis();
        }
        self.persist()
    }

    fn persist(&self) -> Result<(), PanelError> {
        let _guard = self
            .persist_lock
            .lock()
            .map_err(|_| PanelError::Storage("registry persist lock poisoned".into()))?;
        let mut rows: Vec<Node> = self.nodes.iter().map(|r| r.clone()).collect();
        rows.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        self.store.save_json(NODES_FILE, &rows)
    }
}

/// Status a node returns to when maintenance is lifted
fn resumed_status(node: &Node) -> NodeStatus {
    match node.connection_type {
        ConnectionType::Tunnel if node.agent_id.is_none() => NodeStatus::ConnectionError,
        ConnectionType::Tunnel => NodeStatus::Online,
        ConnectionType::Direct => NodeStatus::Active,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> NodeRegistry {
        let store = Arc::new(Store::in_memory());
        let audit = Arc::new(AuditLog::new(Arc::clone(&store)));
        NodeRegistry::load(store, CredentialCipher::ephemeral(), audit).unwrap()
    }

    fn new_node(kind: ConnectionType) -> NewNode {
        NewNode {
            name: "web-1".into(),
            hostname: "web-1.example.net".into(),
            ip: "10.0.0.5".into(),
            ssh_password: Some("hunter2".into()),
            connection_type: Some(kind),
            ..Default::default()
        }
    }

    fn ops() -> Operator {
        Operator::admin("ops")
    }

    #[test]
    fn create_applies_defaults() {
        let reg = registry();
        let view = reg.create(&ops(), new_node(ConnectionType::Direct)).unwrap();
        assert_eq!(view.ssh_user, "root");
        assert_eq!(view.ssh_port, 22);
        assert_eq!(view.status, NodeStatus::Active);
        assert!(view.has_password);
        assert!(!view.is_local);

        let tunnel = reg.create(&ops(), new_node(ConnectionType::Tunnel)).unwrap();
        assert_eq!(tunnel.status, NodeStatus::ConnectionError);
    }

    #[test]
    fn views_never_expose_the_password() {
        let reg = registry();
        let view = reg.create(&ops(), new_node(ConnectionType::Direct)).unwrap();
        let json = serde_json::to_string(&reg.list()).unwrap();
        assert!(!json.contains("hunter2"));

        let stored = reg.get(&view.id).unwrap();
        assert_ne!(stored.ssh_password.as_deref(), Some("hunter2"));
        match reg.ssh_target(&view.id).unwrap().auth {
            SshAuth::Password(pw) => assert_eq!(pw, "hunter2"),
            other => panic!("unexpected auth {:?}", other),
        }
    }

    #[test]
    fn blank_password_keeps_existing() {
        let reg = registry();
        let view = reg.create(&ops(), new_node(ConnectionType::Direct)).unwrap();
        let before = reg.get(&view.id).unwrap().ssh_password;

        let updated = reg
            .update(
                &ops(),
                &view.id,
                NodeUpdate {
                    name: Some("web-01".into()),
                    ssh_password: Some("".into()),
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(updated.name, "web-01");
        assert_eq!(reg.get(&view.id).unwrap().ssh_password, before);
    }

    #[test]
    fn switching_to_tunnel_needs_an_agent() {
        let reg = registry();
        let view = reg.create(&ops(), new_node(ConnectionType::Direct)).unwrap();
        assert_eq!(view.status, NodeStatus::Active);

        let to_tunnel = NodeUpdate {
            connection_type: Some(ConnectionType::Tunnel),
            ..Default::default()
        };
        let switched = reg.update(&ops(), &view.id, to_tunnel).unwrap();
        assert_eq!(switched.connection_type, ConnectionType::Tunnel);
        assert_eq!(switched.status, NodeStatus::ConnectionError);
        assert!(switched.agent_id.is_none());

        let back = reg
            .update(
                &ops(),
                &view.id,
                NodeUpdate {
                    connection_type: Some(ConnectionType::Direct),
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(back.status, NodeStatus::Active);
    }

    #[test]
    fn type_switch_keeps_maintenance() {
        let reg = registry();
        let view = reg.create(&ops(), new_node(ConnectionType::Direct)).unwrap();
        reg.update(
            &ops(),
            &view.id,
            NodeUpdate {
                status: Some(NodeStatus::Maintenance),
                ..Default::default()
            },
        )
        .unwrap();

        let switched = reg
            .update(
                &ops(),
                &view.id,
                NodeUpdate {
                    connection_type: Some(ConnectionType::Tunnel),
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(switched.status, NodeStatus::Maintenance);
    }

    #[test]
    fn local_node_is_unique_and_undeletable() {
        let reg = registry();
        let first = reg.ensure_local(Some("panel")).unwrap();
        let second = reg.ensure_local(None).unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(reg.list().iter().filter(|n| n.is_local).count(), 1);

        let err = reg.delete(&ops(), &first.id).unwrap_err();
        assert!(matches!(err, PanelError::Conflict(_)));
        assert!(reg.get(&first.id).is_ok());
        assert_eq!(reg.list().len(), 1);
    }

    #[test]
    fn delete_unknown_is_not_found() {
        let reg = registry();
        let err = reg.delete(&ops(), &NodeId::new("missing")).unwrap_err();
        assert!(matches!(err, PanelError::NotFound(_)));
    }

    #[test]
    fn staged_agent_verifies_by_token_hash() {
        let reg = registry();
        let view = reg.create(&ops(), new_node(ConnectionType::Tunnel)).unwrap();
        let agent = AgentId::new("agt-1");
        reg.stage_agent(&view.id, &agent, "tok").unwrap();

        assert_eq!(reg.verify_agent(&agent, "tok"), Some(view.id.clone()));
        assert_eq!(reg.verify_agent(&agent, "wrong"), None);
        assert_eq!(reg.verify_agent(&AgentId::new("agt-2"), "tok"), None);
        assert!(!serde_json::to_string(&reg.get(&view.id).unwrap())
            .unwrap()
            .contains("\"tok\""));
    }

    #[test]
    fn sync_outcomes_move_status() {
        let reg = registry();
        let view = reg.create(&ops(), new_node(ConnectionType::Tunnel)).unwrap();
        let agent = AgentId::new("agt-1");

        // Never provisioned
        assert_eq!(
            reg.mark_unreachable(&view.id).unwrap(),
            NodeStatus::ConnectionError
        );

        reg.bind_agent(&view.id, &agent, ResourceSnapshot::default())
            .unwrap();
        assert_eq!(reg.get(&view.id).unwrap().status, NodeStatus::Active);
        assert_eq!(reg.mark_unreachable(&view.id).unwrap(), NodeStatus::Offline);
        assert!(reg.get(&view.id).unwrap().snapshot.is_some());

        reg.mark_online(&view.id).unwrap();
        assert_eq!(reg.get(&view.id).unwrap().status, NodeStatus::Online);
        assert_eq!(
            reg.record_snapshot(&view.id, ResourceSnapshot::default(), now_millis())
                .unwrap(),
            NodeStatus::Active
        );
    }

    #[test]
    fn maintenance_is_sticky() {
        let reg = registry();
        let view = reg.create(&ops(), new_node(ConnectionType::Direct)).unwrap();
        reg.update(
            &ops(),
            &view.id,
            NodeUpdate {
                status: Some(NodeStatus::Maintenance),
                ..Default::default()
            },
        )
        .unwrap();

        reg.mark_unreachable(&view.id).unwrap();
        reg.record_snapshot(&view.id, ResourceSnapshot::default(), now_millis())
            .unwrap();
        assert_eq!(reg.get(&view.id).unwrap().status, NodeStatus::Maintenance);

        let resumed = reg
            .update(
                &ops(),
                &view.id,
                NodeUpdate {
                    status: Some(NodeStatus::Active),
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(resumed.status, NodeStatus::Active);
    }

    #[test]
    fn registry_survives_reload() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(Store::open(dir.path()).unwrap());
        let audit = Arc::new(AuditLog::new(Arc::clone(&store)));
        let cipher = CredentialCipher::ephemeral();

        let reg = NodeRegistry::load(Arc::clone(&store), cipher.clone(), Arc::clone(&audit))
            .unwrap();
        let view = reg.create(&ops(), new_node(ConnectionType::Direct)).unwrap();
        drop(reg);

        let reg = NodeRegistry::load(store, cipher, audit).unwrap();
        assert_eq!(reg.view(&view.id).unwrap().name, "web-1");
        assert!(matches!(
            reg.ssh_target(&view.id).unwrap().auth,
            SshAuth::Password(_)
        ));
    }

    #[test]
    fn mutations_are_audited() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(Store::open(dir.path()).unwrap());
        let audit = Arc::new(AuditLog::new(Arc::clone(&store)));
        let reg =
            NodeRegistry::load(store, CredentialCipher::ephemeral(), Arc::clone(&audit)).unwrap();

        let view = reg.create(&ops(), new_node(ConnectionType::Direct)).unwrap();
        reg.delete(&ops(), &view.id).unwrap();

        let actions: Vec<String> = audit.entries().into_iter().map(|e| e.action).collect();
        assert_eq!(actions, vec!["node.create", "node.delete"]);
    }
}
