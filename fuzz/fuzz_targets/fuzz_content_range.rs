#![no_main]
use libfuzzer_sys::fuzz_target;
use gosh_share::http::parse_content_range;

fuzz_target!(|data: &str| {
    // parse_content_range() should never panic on arbitrary UTF-8 strings
    let _ = parse_content_range(data);
});
