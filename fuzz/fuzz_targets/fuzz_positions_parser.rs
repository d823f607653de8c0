//! Fuzz target: `protocol::parse_positions`
//!
//! cargo fuzz run fuzz_positions_parser

#![no_main]

use armlink::protocol::parse_positions;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let reply = String::from_utf8_lossy(data);
    if let Some(positions) = parse_positions(&reply) {
        assert!(!positions.is_empty());
        assert!(positions.iter().all(|p| p.is_finite()));
    }
});
