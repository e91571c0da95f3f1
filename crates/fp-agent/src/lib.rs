//! fp-agent: node agent for fleet-panel
//!
//! Runs on managed nodes. Dials the panel's SSH tunnel listener, registers,
//! answers heartbeats and metrics queries and brokers PTY shells over the
//! multiplexed channel.

pub mod metrics;
pub mod pty;
pub mod state;
pub mod tunnel;

pub use state::{AgentState, PtyEvent};
