//! Frame header encoding/decoding
//!
//! Every frame starts with a 9-byte header:
//! - magic: 1 byte (`0xF7`)
//! - stream_id: 4 bytes (u32, big-endian)
//! - message_type: 1 byte
//! - payload_length: 3 bytes (u24, big-endian)

use bytes::{Buf, BufMut, BytesMut};

use crate::error::ProtocolError;
use crate::message::MessageType;
use crate::stream::StreamId;

/// Leading byte of every frame, used to detect desynchronised streams early
pub const FRAME_MAGIC: u8 = 0xF7;

/// Size of the frame header in bytes
pub const HEADER_SIZE: usize = 9;

/// Maximum payload size (limited by the 24-bit length field)
pub const MAX_PAYLOAD_SIZE: usize = 0x00FF_FFFF;

/// Routing and length information preceding each payload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub stream_id: StreamId,
    pub message_type: MessageType,
    pub payload_length: u32,
}

impl FrameHeader {
    pub fn new(stream_id: StreamId, message_type: MessageType, payload_length: u32) -> Self {
        Self {
            stream_id,
            message_type,
            payload_length,
        }
    }

    /// Append the encoded header to `dst`
    pub fn encode(&self, dst: &mut BytesMut) {
        dst.reserve(HEADER_SIZE);
        dst.put_u8(FRAME_MAGIC);
        dst.put_u32(self.stream_id.as_u32());
        dst.put_u8(self.message_type.as_u8());
        dst.put_u8((self.payload_length >> 16) as u8);
        dst.put_u16(self.payload_length as u16);
    }

    /// Decode a header from the front of `src`.
    ///
    /// Returns `Ok(None)` while fewer than [`HEADER_SIZE`] bytes are buffered.
    /// Nothing is consumed when the header is rejected.
    pub fn decode(src: &mut BytesMut) -> Result<Option<Self>, ProtocolError> {
        if src.len() < HEADER_SIZE {
            return Ok(None);
        }

        if src[0] != FRAME_MAGIC {
            return Err(ProtocolError::BadMagic(src[0]));
        }
        let type_byte = src[5];
        let message_type =
            MessageType::from_u8(type_byte).ok_or(ProtocolError::UnknownMessageType(type_byte))?;

        src.advance(1);
        let stream_id = StreamId::new(src.get_u32());
        src.advance(1);
        let high = src.get_u8() as u32;
        let low = src.get_u16() as u32;

        Ok(Some(Self {
            stream_id,
            message_type,
            payload_length: (high << 16) | low,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_layout_is_nine_bytes() {
        let header = FrameHeader::new(StreamId::new(3), MessageType::Output, 0x01_0203);
        let mut buf = BytesMut::new();
        header.encode(&mut buf);

        assert_eq!(
            &buf[..],
            &[FRAME_MAGIC, 0, 0, 0, 3, MessageType::Output.as_u8(), 0x01, 0x02, 0x03]
        );
        assert_eq!(FrameHeader::decode(&mut buf).unwrap(), Some(header));
        assert!(buf.is_empty());
    }

    #[test]
    fn max_payload_length_fits() {
        let header = FrameHeader::new(
            StreamId::CONTROL,
            MessageType::MetricsReport,
            MAX_PAYLOAD_SIZE as u32,
        );
        let mut buf = BytesMut::new();
        header.encode(&mut buf);

        let decoded = FrameHeader::decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded.payload_length, MAX_PAYLOAD_SIZE as u32);
    }

    #[test]
    fn short_buffer_waits_for_more() {
        let mut buf = BytesMut::from(&[FRAME_MAGIC, 0, 0, 0][..]);
        assert!(FrameHeader::decode(&mut buf).unwrap().is_none());
        assert_eq!(buf.len(), 4);
    }

    #[test]
    fn bad_magic_is_rejected_without_consuming() {
        let mut buf = BytesMut::from(&[0x00, 0, 0, 0, 1, 0x03, 0, 0, 1][..]);
        assert!(matches!(
            FrameHeader::decode(&mut buf),
            Err(ProtocolError::BadMagic(0x00))
        ));
        assert_eq!(buf.len(), HEADER_SIZE);
    }

    #[test]
    fn unknown_type_is_rejected() {
        let mut buf = BytesMut::from(&[FRAME_MAGIC, 0, 0, 0, 1, 0xEE, 0, 0, 10][..]);
        assert!(matches!(
            FrameHeader::decode(&mut buf),
            Err(ProtocolError::UnknownMessageType(0xEE))
        ));
    }
}
