//! fp-core: shared types, configuration and capability traits for fleet-panel
//!
//! The control plane (`fp-panel`) and the node agent (`fp-agent`) both build
//! on this crate. Remote capabilities (secure shell, agent RPC, node links)
//! are traits here so the panel can be exercised against in-memory fakes.

pub mod config;
pub mod error;
pub mod probe;
pub mod time;
pub mod traits;
pub mod types;

pub use error::{ConfigError, PanelError};
pub use types::{
    AgentId, ConnectionType, JobStatus, MetricSample, NodeId, NodeStatus, Operator,
    ResourceSnapshot, ShellId, ShellState, TerminalSize,
};
