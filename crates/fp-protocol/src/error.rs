//! Protocol error types

use thiserror::Error;

/// Errors raised while framing or decoding tunnel traffic
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// First header byte was not [`crate::FRAME_MAGIC`]
    #[error("Bad frame magic: 0x{0:02x}")]
    BadMagic(u8),

    /// Unknown message type
    #[error("Unknown message type: 0x{0:02x}")]
    UnknownMessageType(u8),

    /// Header type and payload variant disagree
    #[error("Frame declared {declared:?} but carried {actual:?}")]
    TypeMismatch {
        declared: crate::MessageType,
        actual: crate::MessageType,
    },

    /// Payload exceeds maximum size
    #[error("Payload too large: {size} bytes exceeds maximum of {max} bytes")]
    PayloadTooLarge { size: usize, max: usize },

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
