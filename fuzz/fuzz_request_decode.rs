//! Fuzz target for request envelope decoding.
//!
//! Run with: cargo +nightly fuzz run fuzz_request_decode
//!
//! Feeds arbitrary bytes to `decode_request`, the first thing the daemon
//! does with a request body. Anything that decodes must re-encode and decode
//! to the same method and scope.

#![no_main]

use libfuzzer_sys::fuzz_target;
use stagebox_core::protocol::{decode_request, encode_request};

fuzz_target!(|data: &[u8]| {
    let Ok(req) = decode_request(data) else {
        return;
    };
    let bytes = encode_request(&req).expect("decoded request must re-encode");
    let again = decode_request(&bytes).expect("re-encoded request must decode");
    assert_eq!(again.method, req.method);
    assert_eq!(again.state_key(), req.state_key());
});
