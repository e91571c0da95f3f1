//! Agent deployment
//!
//! `Deployer::deploy_agent` opens a job and drives the bootstrap in a spawned
//! task; callers poll `deploy_status` for the outcome.

pub mod bootstrap;
mod job;
mod orchestrator;

pub use job::{DeploymentJob, JobTable};
pub use orchestrator::Deployer;
