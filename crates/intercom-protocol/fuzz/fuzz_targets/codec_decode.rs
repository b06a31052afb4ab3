#![no_main]

use bytes::Bytes;
use intercom_protocol::codec::{decode_frame, CodecError};
use intercom_protocol::frame::Frame;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let buf = Bytes::copy_from_slice(data);

    // Must never panic; a desync must only ever be reported for lengths
    // that really are over the limit.
    if let Err(CodecError::ProtocolDesync { length, max }) = decode_frame(&mut buf.clone()) {
        assert!(length > max);
        assert_eq!(max, Frame::MAX_PAYLOAD_SIZE);
    }
});
