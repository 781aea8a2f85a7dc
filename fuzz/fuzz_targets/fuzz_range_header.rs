#![no_main]
use libfuzzer_sys::fuzz_target;
use gosh_share::http::{parse_range_header, RangeParse};

fuzz_target!(|data: (&str, Option<u64>)| {
    // parse_range_header() should never panic, and a parsed range must fit the content
    let (value, size) = data;
    if let RangeParse::Parsed(range) = parse_range_header(value, size) {
        if let (Some(size), Some(end)) = (size, range.end()) {
            assert!(end <= size);
        }
    }
});
