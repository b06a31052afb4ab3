//! PCM audio format spoken by intercom endpoints.
//!
//! The protocol does not negotiate a format. Both sides assume 16 kHz,
//! 16-bit signed little-endian mono, sent in 512 byte chunks. The relay
//! forwards payloads untouched, so only the chunk size matters here.

/// Bytes in one chunk as produced by an endpoint microphone
pub const AUDIO_CHUNK_SIZE: usize = 512;

const _: () = assert!(AUDIO_CHUNK_SIZE <= crate::Frame::MAX_PAYLOAD_SIZE);

/// A chunk of silence.
#[must_use]
pub fn silence_chunk() -> bytes::Bytes {
    bytes::Bytes::from(vec![0u8; AUDIO_CHUNK_SIZE])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_silence_chunk() {
        let chunk = silence_chunk();
        assert_eq!(chunk.len(), AUDIO_CHUNK_SIZE);
        assert!(chunk.iter().all(|b| *b == 0));
    }
}
