//! Fuzz target: `protocol::parse_status`
//!
//! Arbitrary reply lines must never panic the status parser, and every
//! accepted reply maps consecutive pins starting at the first status pin.
//!
//! cargo fuzz run fuzz_status_parser

#![no_main]

use armlink::protocol::parse_status;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let Ok(reply) = std::str::from_utf8(data) else {
        return;
    };
    if let Some(pins) = parse_status(reply, 2) {
        if let (Some(first), Some(last)) = (pins.keys().next(), pins.keys().last()) {
            assert_eq!(*first, 2);
            assert_eq!(usize::from(*last - *first) + 1, pins.len());
        }
    }
});
