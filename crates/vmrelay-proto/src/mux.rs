//! Multiplexing primitives for the relay wire protocol

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

/// Stream identifier
pub type StreamId = u32;

/// Frame types carried on the relay connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameType {
    Control = 0,
    Data = 1,
    Close = 2,
}

impl TryFrom<u8> for FrameType {
    type Error = ProtoError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(FrameType::Control),
            1 => Ok(FrameType::Data),
            2 => Ok(FrameType::Close),
            _ => Err(ProtoError::InvalidFrameType(value)),
        }
    }
}

/// Frame flags
#[derive(Debug, Clone, Copy, Default)]
pub struct FrameFlags(u8);

impl FrameFlags {
    pub const FIN: u8 = 0b0000_0001;
    pub const RST: u8 = 0b0000_0010;

    pub fn new() -> Self {
        Self(0)
    }

    pub fn with_fin(mut self) -> Self {
        self.0 |= Self::FIN;
        self
    }

    pub fn with_rst(mut self) -> Self {
        self.0 |= Self::RST;
        self
    }

    pub fn has_fin(&self) -> bool {
        self.0 & Self::FIN != 0
    }

    pub fn has_rst(&self) -> bool {
        self.0 & Self::RST != 0
    }

    pub fn as_u8(&self) -> u8 {
        self.0
    }

    pub fn from_u8(value: u8) -> Self {
        Self(value)
    }
}

/// Decoded frame header
#[derive(Debug, Clone, Copy)]
pub struct FrameHeader {
    pub stream_id: StreamId,
    pub frame_type: FrameType,
    pub flags: FrameFlags,
    pub payload_len: u32,
}

impl FrameHeader {
    /// Header size: stream_id (4) + frame_type (1) + flags (1) + length (4) = 10 bytes
    pub const SIZE: usize = 10;

    /// Decode a header from exactly `SIZE` bytes.
    pub fn decode(buf: &[u8; Self::SIZE]) -> Result<Self, ProtoError> {
        let mut buf = &buf[..];
        let stream_id = buf.get_u32();
        let frame_type = FrameType::try_from(buf.get_u8())?;
        let flags = FrameFlags::from_u8(buf.get_u8());
        let payload_len = buf.get_u32();

        if payload_len > crate::MAX_FRAME_SIZE {
            return Err(ProtoError::FrameTooLarge(payload_len as usize));
        }

        Ok(Self {
            stream_id,
            frame_type,
            flags,
            payload_len,
        })
    }
}

/// Multiplexed frame
#[derive(Debug, Clone)]
pub struct Frame {
    pub stream_id: StreamId,
    pub frame_type: FrameType,
    pub flags: FrameFlags,
    pub payload: Bytes,
}

impl Frame {
    pub fn new(stream_id: StreamId, frame_type: FrameType, payload: Bytes) -> Self {
        Self {
            stream_id,
            frame_type,
            flags: FrameFlags::new(),
            payload,
        }
    }

    /// Build a control frame; the payload is a bincode-encoded [`crate::RelayMessage`].
    pub fn control(payload: Bytes) -> Self {
        Self::new(crate::CONTROL_STREAM_ID, FrameType::Control, payload)
    }

    pub fn data(stream_id: StreamId, payload: Bytes) -> Self {
        Self::new(stream_id, FrameType::Data, payload)
    }

    pub fn close(stream_id: StreamId) -> Self {
        Self::new(stream_id, FrameType::Close, Bytes::new())
    }

    pub fn with_flags(mut self, flags: FrameFlags) -> Self {
        self.flags = flags;
        self
    }

    /// Encode frame to bytes
    pub fn encode(&self) -> Result<Bytes, ProtoError> {
        let payload_len = self.payload.len();
        if payload_len > crate::MAX_FRAME_SIZE as usize {
            return Err(ProtoError::FrameTooLarge(payload_len));
        }

        let mut buf = BytesMut::with_capacity(FrameHeader::SIZE + payload_len);

        buf.put_u32(self.stream_id);
        buf.put_u8(self.frame_type as u8);
        buf.put_u8(self.flags.as_u8());
        buf.put_u32(payload_len as u32);
        buf.put(self.payload.clone());

        Ok(buf.freeze())
    }

    /// Decode frame from bytes
    pub fn decode(mut buf: Bytes) -> Result<Self, ProtoError> {
        if buf.len() < FrameHeader::SIZE {
            return Err(ProtoError::IncompleteFrame);
        }

        let mut header = [0u8; FrameHeader::SIZE];
        buf.copy_to_slice(&mut header);
        let header = FrameHeader::decode(&header)?;

        if buf.remaining() < header.payload_len as usize {
            return Err(ProtoError::IncompleteFrame);
        }

        let payload = buf.split_to(header.payload_len as usize);

        Ok(Self {
            stream_id: header.stream_id,
            frame_type: header.frame_type,
            flags: header.flags,
            payload,
        })
    }
}

/// Wire protocol errors
#[derive(Debug, Error)]
pub enum ProtoError {
    #[error("Invalid frame type: {0}")]
    InvalidFrameType(u8),

    #[error("Frame too large: {0} bytes")]
    FrameTooLarge(usize),

    #[error("Incomplete frame")]
    IncompleteFrame,

    #[error("Message codec error: {0}")]
    Codec(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_encode_decode() {
        let payload = Bytes::from("hello world");
        let frame = Frame::data(42, payload.clone());

        let encoded = frame.encode().unwrap();
        let decoded = Frame::decode(encoded).unwrap();

        assert_eq!(decoded.stream_id, 42);
        assert_eq!(decoded.frame_type, FrameType::Data);
        assert_eq!(decoded.payload, payload);
    }

    #[test]
    fn test_frame_with_flags() {
        let frame = Frame::close(10).with_flags(FrameFlags::new().with_fin());

        assert!(frame.flags.has_fin());
        assert!(!frame.flags.has_rst());

        let encoded = frame.encode().unwrap();
        let decoded = Frame::decode(encoded).unwrap();

        assert!(decoded.flags.has_fin());
    }

    #[test]
    fn test_invalid_frame_type() {
        let mut encoded = BytesMut::new();
        encoded.put_u32(1);
        encoded.put_u8(99); // not a valid frame type
        encoded.put_u8(0);
        encoded.put_u32(0);

        let result = Frame::decode(encoded.freeze());
        assert!(matches!(result, Err(ProtoError::InvalidFrameType(99))));
    }

    #[test]
    fn test_oversized_frame_rejected() {
        let mut header = [0u8; FrameHeader::SIZE];
        let mut buf = &mut header[..];
        buf.put_u32(1);
        buf.put_u8(FrameType::Data as u8);
        buf.put_u8(0);
        buf.put_u32(crate::MAX_FRAME_SIZE + 1);

        let result = FrameHeader::decode(&header);
        assert!(matches!(result, Err(ProtoError::FrameTooLarge(_))));
    }

    #[test]
    fn test_truncated_frame() {
        let frame = Frame::data(7, Bytes::from("payload"));
        let encoded = frame.encode().unwrap();

        let truncated = encoded.slice(..encoded.len() - 2);
        let result = Frame::decode(truncated);
        assert!(matches!(result, Err(ProtoError::IncompleteFrame)));
    }
}
