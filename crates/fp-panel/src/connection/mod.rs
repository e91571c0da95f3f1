//! Agent tunnel connections

mod health;
mod pool;
mod rpc;

pub use health::HealthMonitor;
pub use pool::{AgentCommand, AgentConnection, AgentInfo, AgentPool, COMMAND_BUFFER};
pub use rpc::TunnelRpc;
