//! fp-panel: fleet control plane
//!
//! Keeps the node registry, deploys agents over SSH, collects resource
//! metrics and brokers interactive shells through agent tunnels. Operators
//! reach it over a bearer-authenticated HTTP API; agents dial its SSH tunnel
//! listener.

pub mod api;
pub mod connection;
pub mod deploy;
pub mod link;
pub mod metrics;
pub mod registry;
pub mod server;
pub mod session;
pub mod ssh;
pub mod state;
pub mod store;

pub use state::PanelState;
