//! fp-protocol: wire protocol for the fleet panel agent tunnel
//!
//! Agents dial the control plane over SSH and exchange length-prefixed
//! frames on a single session channel. Each frame is addressed to a stream:
//! stream 0 carries control traffic (registration, heartbeats, metrics
//! queries) and every remote shell gets its own stream.

pub mod codec;
pub mod error;
pub mod frame;
pub mod message;
pub mod stream;

pub use codec::{Frame, FrameCodec};
pub use error::ProtocolError;
pub use frame::{FrameHeader, FRAME_MAGIC, HEADER_SIZE, MAX_PAYLOAD_SIZE};
pub use message::{
    protocol_compatible, ErrorCode, Message, MessageType, ResourceSnapshot, TerminalSize,
    PROTOCOL_VERSION,
};
pub use stream::StreamId;
