//! Audit trail of operator actions
//!
//! Every entry is emitted as a `tracing` event on target `audit` and appended
//! to `audit.log`.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use fp_core::time::now_millis;
use fp_core::NodeId;

use crate::store::{Store, AUDIT_FILE};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditEntry {
    pub timestamp: u64,
    pub operator: String,
    pub action: String,
    pub node_id: Option<NodeId>,
    pub detail: String,
}

pub struct AuditLog {
    store: Arc<Store>,
}

impl AuditLog {
    pub fn new(store: Arc<Store>) -> Self {
        Self { store }
    }

    pub fn record(
        &self,
        operator: &str,
        action: &str,
        node_id: Option<&NodeId>,
        detail: impl Into<String>,
    ) {
        let entry = AuditEntry {
            timestamp: now_millis(),
            operator: operator.to_string(),
            action: action.to_string(),
            node_id: node_id.cloned(),
            detail: detail.into(),
        };

        tracing::info!(
            target: "audit",
            operator = %entry.operator,
            action = %entry.action,
            node = entry.node_id.as_ref().map(|n| n.as_str()).unwrap_or("-"),
            "{}",
            entry.detail
        );

        // The tracing event above is the fallback record
        if let Err(e) = self.store.append_line(AUDIT_FILE, &entry) {
            tracing::warn!("Failed to append audit entry: {}", e);
        }
    }

    /// Entries on disk, oldest first
    pub fn entries(&self) -> Vec<AuditEntry> {
        self.store.read_lines(AUDIT_FILE).unwrap_or_default()
    }
}
