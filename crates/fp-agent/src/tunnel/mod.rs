//! Outbound tunnel to the panel

mod connector;
mod reconnect;

pub use connector::{ActiveTunnel, ConnectionError, TunnelConnector, TunnelEvent};
pub use reconnect::ExponentialBackoff;
