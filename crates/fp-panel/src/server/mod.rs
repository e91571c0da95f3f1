//! Agent tunnel server

mod handler;
mod listener;

pub use handler::{ServerConfig, TunnelHandler};
pub use listener::{load_or_generate_host_key, TunnelServer};
