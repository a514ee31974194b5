//! Fuzz target for the filename codec and case-fold resolver
//!
//! Encoding must round trip, never produce characters that are unsafe on
//! any host, and collision resolution must always yield a unique name that
//! still decodes to the original component.

#![no_main]

use arbitrary::Arbitrary;
use dirkv_core::fs::case_fold::{self, FoldIndex};
use dirkv_core::fs::{decode_component, encode_component};
use libfuzzer_sys::fuzz_target;

#[derive(Debug, Arbitrary)]
struct Input {
    component: String,
    siblings: Vec<String>,
}

fuzz_target!(|input: Input| {
    if input.component.len() > 4096 || input.siblings.len() > 64 {
        return;
    }

    let encoded = encode_component(&input.component);
    let decoded = decode_component(&encoded).expect("Encoded names must decode");
    assert_eq!(decoded, input.component);
    assert!(!encoded.chars().any(|c| c.is_ascii_control()));
    assert!(!encoded.contains(['<', '>', ':', '"', '|', '\\', '?', '*', '/']));
    assert!(!encoded.ends_with(['.', ' ']));

    // Siblings are names the store could have produced itself.
    let mut index = FoldIndex::new();
    for sibling in &input.siblings {
        case_fold::register(&mut index, &encode_component(sibling));
    }
    if let Ok(resolved) = case_fold::resolve(&encoded, &index) {
        assert!(!index.contains_key(&case_fold::fold(&resolved)));
        assert_eq!(decode_component(&resolved).expect("Resolved names must decode"), input.component);
    }
});
