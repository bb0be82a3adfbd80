#![no_main]

use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let _ = midstream_core::parse_response_head(data, "GET");
    let _ = midstream_core::parse_response_head(data, "HEAD");
});
