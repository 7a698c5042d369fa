#![no_main]

use libfuzzer_sys::fuzz_target;
use tsbridge_codec::footer::{decode_payload, find_footer};
use tsbridge_codec::frame::decode_frame;

fuzz_target!(|data: &[u8]| {
    let (body, timestamp) = decode_payload(data);
    assert!(body.len() <= data.len());
    assert_eq!(timestamp.is_some(), find_footer(data).is_some());
    let _ = decode_frame(data);
});
