//! Stream identifiers
//!
//! A stream is one logical conversation multiplexed over the agent tunnel.
//! The panel allocates stream ids for shells; the agent only echoes them.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifier of a multiplexed stream on one agent tunnel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StreamId(pub u32);

impl StreamId {
    /// Stream reserved for registration, heartbeats and metrics queries
    pub const CONTROL: StreamId = StreamId(0);

    pub fn new(id: u32) -> Self {
        Self(id)
    }

    pub fn as_u32(&self) -> u32 {
        self.0
    }

    /// Whether this is the control stream
    pub fn is_control(&self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_control() {
            write!(f, "stream-control")
        } else {
            write!(f, "stream-{}", self.0)
        }
    }
}

impl From<u32> for StreamId {
    fn from(id: u32) -> Self {
        Self(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn control_stream_is_zero() {
        assert!(StreamId::CONTROL.is_control());
        assert!(!StreamId::new(7).is_control());
    }

    #[test]
    fn display_names_streams() {
        assert_eq!(StreamId::new(42).to_string(), "stream-42");
        assert_eq!(StreamId::CONTROL.to_string(), "stream-control");
    }
}
