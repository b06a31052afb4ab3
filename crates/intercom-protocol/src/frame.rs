//! Intercom frame types.

use bytes::Bytes;

/// Default TCP port endpoints listen on.
pub const DEFAULT_PORT: u16 = 6054;

/// Protocol version advertised by endpoints (informational, not on the wire).
pub const PROTOCOL_VERSION: u8 = 1;

/// Message type carried in the first header byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    /// PCM audio chunk
    Audio = 0x01,
    /// Start streaming request (payload: caller display name)
    Start = 0x02,
    /// Stop streaming / hang up
    Stop = 0x03,
    /// Keep-alive ping
    Ping = 0x04,
    /// Keep-alive response, also "call accepted" after START
    Pong = 0x05,
    /// Error response (payload: one status byte)
    Error = 0x06,
    /// Endpoint has auto-answer off and is waiting for a local answer
    Ring = 0x07,
    /// Call answered
    Answer = 0x08,
}

impl MessageType {
    /// Parse a message type byte.
    #[must_use]
    pub const fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x01 => Some(Self::Audio),
            0x02 => Some(Self::Start),
            0x03 => Some(Self::Stop),
            0x04 => Some(Self::Ping),
            0x05 => Some(Self::Pong),
            0x06 => Some(Self::Error),
            0x07 => Some(Self::Ring),
            0x08 => Some(Self::Answer),
            _ => None,
        }
    }

    /// Short lowercase name for logs and metric labels.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Audio => "audio",
            Self::Start => "start",
            Self::Stop => "stop",
            Self::Ping => "ping",
            Self::Pong => "pong",
            Self::Error => "error",
            Self::Ring => "ring",
            Self::Answer => "answer",
        }
    }
}

/// Frame flags
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FrameFlags {
    /// Last packet of a stream
    pub end: bool,
    /// START only: skip ringing and stream immediately
    pub no_ring: bool,
}

impl FrameFlags {
    /// No flags set.
    pub const NONE: Self = Self {
        end: false,
        no_ring: false,
    };

    /// START flag used for the initiating side of a bridge.
    pub const NO_RING: Self = Self {
        end: false,
        no_ring: true,
    };

    const END_BIT: u8 = 0x01;
    const NO_RING_BIT: u8 = 0x02;

    /// Convert flags to the header byte
    #[must_use]
    pub const fn to_u8(self) -> u8 {
        let mut flags = 0u8;
        if self.end {
            flags |= Self::END_BIT;
        }
        if self.no_ring {
            flags |= Self::NO_RING_BIT;
        }
        flags
    }

    /// Parse flags from the header byte. Unknown bits are ignored.
    #[must_use]
    pub const fn from_u8(value: u8) -> Self {
        Self {
            end: (value & Self::END_BIT) != 0,
            no_ring: (value & Self::NO_RING_BIT) != 0,
        }
    }
}

/// Status code carried in the first payload byte of an ERROR frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    /// No error
    Ok,
    /// Endpoint is already streaming with another peer (also used for decline)
    Busy,
    /// Malformed message
    InvalidMessage,
    /// Endpoint component not ready
    NotReady,
    /// Internal endpoint failure
    Internal,
    /// Code outside the known set
    Unknown(u8),
}

impl ErrorCode {
    /// Decode a status byte.
    #[must_use]
    pub const fn from_u8(value: u8) -> Self {
        match value {
            0x00 => Self::Ok,
            0x01 => Self::Busy,
            0x02 => Self::InvalidMessage,
            0x03 => Self::NotReady,
            0xFF => Self::Internal,
            other => Self::Unknown(other),
        }
    }

    /// Encode as a status byte.
    #[must_use]
    pub const fn to_u8(self) -> u8 {
        match self {
            Self::Ok => 0x00,
            Self::Busy => 0x01,
            Self::InvalidMessage => 0x02,
            Self::NotReady => 0x03,
            Self::Internal => 0xFF,
            Self::Unknown(other) => other,
        }
    }

    /// Decode the status carried by an ERROR payload.
    ///
    /// Endpoints that send a bare ERROR are reported as `Internal`.
    #[must_use]
    pub fn from_payload(payload: &[u8]) -> Self {
        payload.first().map_or(Self::Internal, |b| Self::from_u8(*b))
    }
}

/// A single protocol message.
///
/// Wire format (4 byte header, little-endian length):
/// - Message type: 1 byte
/// - Flags: 1 byte
/// - Payload length: 2 bytes
/// - Payload: variable, at most [`Frame::MAX_PAYLOAD_SIZE`] bytes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Type of message
    pub message_type: MessageType,
    /// Frame flags
    pub flags: FrameFlags,
    /// Message payload
    pub payload: Bytes,
}

impl Frame {
    /// Header size in bytes
    pub const HEADER_SIZE: usize = 4;

    /// Largest payload either side accepts. Anything larger is a desync.
    pub const MAX_PAYLOAD_SIZE: usize = 2048;

    /// Create a frame with an empty payload and no flags.
    #[must_use]
    pub const fn control(message_type: MessageType) -> Self {
        Self {
            message_type,
            flags: FrameFlags::NONE,
            payload: Bytes::new(),
        }
    }

    /// Create an AUDIO frame.
    #[must_use]
    pub const fn audio(payload: Bytes) -> Self {
        Self {
            message_type: MessageType::Audio,
            flags: FrameFlags::NONE,
            payload,
        }
    }

    /// Create a START frame carrying the caller's display name.
    ///
    /// Names longer than the payload limit are cut at a character boundary.
    #[must_use]
    pub fn start(flags: FrameFlags, caller_name: &str) -> Self {
        let mut end = caller_name.len().min(Self::MAX_PAYLOAD_SIZE);
        while !caller_name.is_char_boundary(end) {
            end -= 1;
        }
        let name = caller_name.get(..end).unwrap_or_default();
        Self {
            message_type: MessageType::Start,
            flags,
            payload: Bytes::copy_from_slice(name.as_bytes()),
        }
    }

    /// Create an ERROR frame with a status code.
    #[must_use]
    pub fn error(code: ErrorCode) -> Self {
        Self {
            message_type: MessageType::Error,
            flags: FrameFlags::NONE,
            payload: Bytes::copy_from_slice(&[code.to_u8()]),
        }
    }
}
