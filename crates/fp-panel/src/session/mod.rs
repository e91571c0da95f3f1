//! Remote shell sessions

mod cleanup;
mod gateway;

pub use cleanup::run_idle_sweep;
pub use gateway::{OutputChunk, ShellGateway, ShellOutput, ShellSession, ShellSummary};
