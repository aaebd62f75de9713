//! Fuzz test for hash tag extraction and colocation checks
//!
//! Arbitrary key bytes must never panic the tag extractor, and a key built
//! from an extracted tag must extract back to the same tag.
//!
//! Run with: cargo +nightly fuzz run hash_tag_fuzz -- -max_total_time=60

#![no_main]

use conjure_core::{ensure_colocated, HashTag};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    if let Ok(key) = std::str::from_utf8(data) {
        if let Some(tag) = HashTag::extract(key) {
            assert!(!tag.is_empty(), "Extracted tags are never empty");
            assert!(!tag.contains('}'), "Tag stops at the first closing brace");

            let rebuilt = HashTag::new(tag).apply("conj:t:");
            assert_eq!(HashTag::extract(&rebuilt), Some(tag));
        }

        // A key is always colocated with itself.
        assert!(ensure_colocated("fuzz", [key, key]).is_ok());
    }
});
