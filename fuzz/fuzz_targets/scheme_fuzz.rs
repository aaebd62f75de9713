//! Fuzz test for stored scheme parsing
//!
//! Scheme sets hold whatever strings were written to them, so parsing must
//! accept any input and normalize it: fields sorted, deduplicated and
//! non-empty, with a stable encoding.
//!
//! Run with: cargo +nightly fuzz run scheme_fuzz -- -max_total_time=60

#![no_main]

use conjure_core::{FieldValue, RecordValues, Scheme};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    if let Ok(raw) = std::str::from_utf8(data) {
        let scheme = Scheme::parse(raw);

        let fields = scheme.fields();
        assert!(fields.iter().all(|f| !f.is_empty()));
        assert!(fields.windows(2).all(|w| w[0] < w[1]), "Fields sorted and unique");

        // Encoding is a fixed point of parsing.
        assert_eq!(Scheme::parse(&scheme.encode()), scheme);

        // A record reporting every field projects onto the scheme.
        let values: RecordValues = fields
            .iter()
            .map(|f| (f.clone(), FieldValue::Int(1)))
            .collect();
        let conjunction = scheme.project(&values).expect("all fields present");
        assert_eq!(conjunction.scheme(), scheme);
    }
});
