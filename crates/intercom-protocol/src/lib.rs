//! Wire protocol for intercom endpoints.
//!
//! This crate implements the small length-framed binary protocol that
//! audio endpoints speak over TCP: a 4 byte header (type, flags,
//! little-endian payload length) followed by up to 2048 payload bytes.

#![warn(clippy::pedantic)]

pub mod audio;
pub mod codec;
pub mod frame;

pub use codec::{decode_frame, decode_header, encode_frame, encode_header, CodecError, FrameHeader};
pub use frame::{ErrorCode, Frame, FrameFlags, MessageType, DEFAULT_PORT};
