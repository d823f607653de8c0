//! Fuzz target: stored sequence documents
//!
//! Feeds arbitrary JSON through the sequence deserializer and step parser.
//! Malformed steps must come back as errors, never panics, and every step
//! that parses must be runnable.
//!
//! cargo fuzz run fuzz_step_parser

#![no_main]

use armlink::app::program::{Sequence, StepAction};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let Ok(sequence) = serde_json::from_slice::<Sequence>(data) else {
        return;
    };
    let _ = sequence.validate();
    for def in &sequence.steps {
        if let Ok(step) = def.parse() {
            if let StepAction::DigitalWrite { value, .. } = step.action {
                assert!(value <= 1);
            }
        }
    }
});
