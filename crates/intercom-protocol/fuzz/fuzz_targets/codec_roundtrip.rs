#![no_main]

use bytes::Bytes;
use intercom_protocol::codec::{decode_frame, encode_frame};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let buf = Bytes::copy_from_slice(data);

    if let Ok(frame) = decode_frame(&mut buf.clone()) {
        // Anything we can decode we must be able to encode back
        let encoded = encode_frame(&frame).expect("decoded frame must re-encode");
        let frame2 = decode_frame(&mut encoded.clone()).expect("re-encoded frame must decode");
        assert_eq!(frame, frame2);
    }
});
