//! Capability traits the control plane is written against
//!
//! Real implementations (russh client, agent tunnel, local probe) live in
//! `fp-panel`; tests substitute in-memory fakes.

mod agent;
mod link;
mod remote;

pub use agent::{AgentRpc, RemoteShell, ShellEvent, ShellRequest};
pub use link::NodeLink;
pub use remote::{tail_lines, CommandOutput, RemoteSession, SecureShell, SshAuth, SshTarget};
