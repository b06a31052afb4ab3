//! Codec for encoding and decoding intercom frames.
//!
//! The codec is pure: it turns frames into bytes and header bytes into a
//! [`FrameHeader`]. Reading the payload off the transport is the caller's
//! job once the header has told it how many bytes to expect.

use crate::frame::{Frame, FrameFlags, MessageType};
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Error type for codec operations
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum CodecError {
    /// Insufficient data to decode
    #[error("Insufficient data")]
    InsufficientData,

    /// Declared payload length exceeds the maximum. Framing can no longer be
    /// trusted, so the connection must be closed.
    #[error("Protocol desync: declared length {length} exceeds maximum {max}")]
    ProtocolDesync { length: usize, max: usize },

    /// Message type byte is not one we know. The length is still valid, so
    /// the payload can be skipped.
    #[error("Unknown message type: {code:#04x}")]
    UnknownMessageType { code: u8, length: usize },

    /// Payload does not fit in a frame
    #[error("Payload too large: {0} bytes")]
    PayloadTooLarge(usize),
}

/// Decoded frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    /// Type of message
    pub message_type: MessageType,
    /// Frame flags
    pub flags: FrameFlags,
    /// Number of payload bytes that follow the header
    pub length: usize,
}

/// Encode a frame header.
///
/// # Errors
///
/// Returns [`CodecError::PayloadTooLarge`] if `length` exceeds the maximum
/// payload size.
pub fn encode_header(
    message_type: MessageType,
    flags: FrameFlags,
    length: usize,
) -> Result<[u8; Frame::HEADER_SIZE], CodecError> {
    if length > Frame::MAX_PAYLOAD_SIZE {
        return Err(CodecError::PayloadTooLarge(length));
    }
    let length = u16::try_from(length).map_err(|_| CodecError::PayloadTooLarge(length))?;
    let [lo, hi] = length.to_le_bytes();
    Ok([message_type as u8, flags.to_u8(), lo, hi])
}

/// Encode a frame to bytes
///
/// # Errors
///
/// Returns an error if the payload is larger than the maximum payload size
pub fn encode_frame(frame: &Frame) -> Result<Bytes, CodecError> {
    let header = encode_header(frame.message_type, frame.flags, frame.payload.len())?;

    let mut buf = BytesMut::with_capacity(Frame::HEADER_SIZE + frame.payload.len());
    buf.put_slice(&header);
    buf.extend_from_slice(&frame.payload);

    Ok(buf.freeze())
}

/// Decode a frame header
///
/// The length is validated before the message type so that a corrupt
/// header is always reported as a desync.
///
/// # Errors
///
/// - [`CodecError::InsufficientData`] if fewer than four bytes are available
/// - [`CodecError::ProtocolDesync`] if the declared length is over the limit
/// - [`CodecError::UnknownMessageType`] if the type byte is unknown
pub fn decode_header(data: &mut impl Buf) -> Result<FrameHeader, CodecError> {
    if data.remaining() < Frame::HEADER_SIZE {
        return Err(CodecError::InsufficientData);
    }

    let type_byte = data.get_u8();
    let flags = FrameFlags::from_u8(data.get_u8());
    let length = usize::from(data.get_u16_le());

    if length > Frame::MAX_PAYLOAD_SIZE {
        return Err(CodecError::ProtocolDesync {
            length,
            max: Frame::MAX_PAYLOAD_SIZE,
        });
    }

    let message_type = MessageType::from_u8(type_byte).ok_or(CodecError::UnknownMessageType {
        code: type_byte,
        length,
    })?;

    Ok(FrameHeader {
        message_type,
        flags,
        length,
    })
}

/// Decode a complete frame (header and payload) from a buffer.
///
/// # Errors
///
/// Same as [`decode_header`], plus [`CodecError::InsufficientData`] when the
/// payload is incomplete.
pub fn decode_frame(data: &mut impl Buf) -> Result<Frame, CodecError> {
    let header = decode_header(data)?;

    if data.remaining() < header.length {
        return Err(CodecError::InsufficientData);
    }

    let payload = data.copy_to_bytes(header.length);

    Ok(Frame {
        message_type: header.message_type,
        flags: header.flags,
        payload,
    })
}
