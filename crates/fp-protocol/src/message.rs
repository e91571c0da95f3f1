//! Messages exchanged over the agent tunnel
//!
//! # Message flow
//!
//! 1. The agent connects, authenticates and sends `Register` on the control
//!    stream; the panel answers `RegisterAck`.
//! 2. The panel sends `Heartbeat` periodically, the agent echoes `HeartbeatAck`.
//! 3. Metrics: panel sends `MetricsQuery { request_id }`, agent answers
//!    `MetricsReport` with the same id.
//! 4. Shells: panel picks a fresh stream and sends `ShellOpen`; the agent
//!    answers `ShellReady { pid }` (or `Error`) on that stream. `Input` flows
//!    panel → agent, `Output` flows agent → panel, `Resize` panel → agent.
//! 5. `ShellClose` may be sent by either side; from the agent it carries the
//!    exit code.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Protocol version carried in `Register`. Agents with a different major
/// version are refused.
pub const PROTOCOL_VERSION: &str = "1.0";

/// Whether a peer's advertised version can talk to this build
pub fn protocol_compatible(peer: &str) -> bool {
    let major = |v: &str| v.split('.').next().map(str::to_owned);
    major(peer).is_some() && major(peer) == major(PROTOCOL_VERSION)
}

/// Terminal dimensions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TerminalSize {
    pub rows: u16,
    pub cols: u16,
}

impl TerminalSize {
    pub fn new(rows: u16, cols: u16) -> Self {
        Self { rows, cols }
    }
}

impl Default for TerminalSize {
    fn default() -> Self {
        Self { rows: 24, cols: 80 }
    }
}

/// Resource usage of a node at one instant
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceSnapshot {
    /// CPU usage percentage (0-100)
    pub cpu_percent: f32,
    /// Memory usage percentage (0-100)
    pub ram_percent: f32,
    /// Usage of the root filesystem(s), percentage (0-100)
    pub disk_percent: f32,
    /// Seconds since boot
    pub uptime_secs: u64,
}

impl ResourceSnapshot {
    /// Clamp percentages into 0..=100 and drop NaNs
    pub fn normalized(self) -> Self {
        let clamp = |v: f32| if v.is_nan() { 0.0 } else { v.clamp(0.0, 100.0) };
        Self {
            cpu_percent: clamp(self.cpu_percent),
            ram_percent: clamp(self.ram_percent),
            disk_percent: clamp(self.disk_percent),
            uptime_secs: self.uptime_secs,
        }
    }
}

/// Message type identifier used in the frame header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
    Register = 0x01,
    RegisterAck = 0x02,
    Heartbeat = 0x03,
    HeartbeatAck = 0x04,
    MetricsQuery = 0x10,
    MetricsReport = 0x11,
    ShellOpen = 0x20,
    ShellReady = 0x21,
    Input = 0x22,
    Output = 0x23,
    Resize = 0x24,
    ShellClose = 0x25,
    Error = 0xFF,
}

impl MessageType {
    pub fn as_u8(&self) -> u8 {
        *self as u8
    }

    pub fn from_u8(value: u8) -> Option<Self> {
        Some(match value {
            0x01 => Self::Register,
            0x02 => Self::RegisterAck,
            0x03 => Self::Heartbeat,
            0x04 => Self::HeartbeatAck,
            0x10 => Self::MetricsQuery,
            0x11 => Self::MetricsReport,
            0x20 => Self::ShellOpen,
            0x21 => Self::ShellReady,
            0x22 => Self::Input,
            0x23 => Self::Output,
            0x24 => Self::Resize,
            0x25 => Self::ShellClose,
            0xFF => Self::Error,
            _ => return None,
        })
    }
}

/// Error codes carried in `Message::Error`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCode {
    Unknown,
    StreamNotFound,
    PtyAllocationFailed,
    MetricsUnavailable,
    InvalidMessage,
}

/// Protocol messages
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Message {
    /// Agent identification, first frame after the channel opens
    Register {
        agent_id: String,
        node_id: String,
        hostname: String,
        os: String,
        arch: String,
        /// `PROTOCOL_VERSION` of the agent build
        version: String,
    },

    RegisterAck {
        accepted: bool,
        reason: Option<String>,
    },

    Heartbeat {
        timestamp: u64,
    },

    HeartbeatAck {
        timestamp: u64,
    },

    MetricsQuery {
        request_id: u64,
    },

    MetricsReport {
        request_id: u64,
        snapshot: ResourceSnapshot,
    },

    /// Open a shell on the frame's stream
    ShellOpen {
        shell: Option<String>,
        env: Vec<(String, String)>,
        size: TerminalSize,
    },

    ShellReady {
        pid: u32,
    },

    /// Bytes for the shell's stdin
    Input(Bytes),

    /// Bytes produced by the shell
    Output(Bytes),

    Resize(TerminalSize),

    ShellClose {
        exit_code: Option<i32>,
    },

    Error {
        code: ErrorCode,
        message: String,
    },
}

impl Message {
    pub fn message_type(&self) -> MessageType {
        match self {
            Message::Register { .. } => MessageType::Register,
            Message::RegisterAck { .. } => MessageType::RegisterAck,
            Message::Heartbeat { .. } => MessageType::Heartbeat,
            Message::HeartbeatAck { .. } => MessageType::HeartbeatAck,
            Message::MetricsQuery { .. } => MessageType::MetricsQuery,
            Message::MetricsReport { .. } => MessageType::MetricsReport,
            Message::ShellOpen { .. } => MessageType::ShellOpen,
            Message::ShellReady { .. } => MessageType::ShellReady,
            Message::Input(_) => MessageType::Input,
            Message::Output(_) => MessageType::Output,
            Message::Resize(_) => MessageType::Resize,
            Message::ShellClose { .. } => MessageType::ShellClose,
            Message::Error { .. } => MessageType::Error,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_type_bytes_are_stable() {
        for ty in [
            MessageType::Register,
            MessageType::RegisterAck,
            MessageType::Heartbeat,
            MessageType::HeartbeatAck,
            MessageType::MetricsQuery,
            MessageType::MetricsReport,
            MessageType::ShellOpen,
            MessageType::ShellReady,
            MessageType::Input,
            MessageType::Output,
            MessageType::Resize,
            MessageType::ShellClose,
            MessageType::Error,
        ] {
            assert_eq!(MessageType::from_u8(ty.as_u8()), Some(ty));
        }
        assert_eq!(MessageType::from_u8(0x7E), None);
    }

    #[test]
    fn versions_compare_on_major() {
        assert!(protocol_compatible("1.0"));
        assert!(protocol_compatible("1.7"));
        assert!(!protocol_compatible("2.0"));
        assert!(!protocol_compatible(""));
    }

    #[test]
    fn snapshot_normalization_clamps() {
        let snap = ResourceSnapshot {
            cpu_percent: 140.0,
            ram_percent: f32::NAN,
            disk_percent: -3.0,
            uptime_secs: 9,
        }
        .normalized();
        assert_eq!(snap.cpu_percent, 100.0);
        assert_eq!(snap.ram_percent, 0.0);
        assert_eq!(snap.disk_percent, 0.0);
    }
}
