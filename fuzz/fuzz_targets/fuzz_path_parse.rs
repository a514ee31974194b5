//! Fuzz target for key canonicalization
//!
//! Arbitrary strings are parsed as keys. Parsing must never panic, and any
//! key that parses must render to a form that parses back to the same path.

#![no_main]

use dirkv_core::CanonicalPath;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|raw: &str| {
    // Limit input size to avoid OOM
    if raw.len() > 64 * 1024 {
        return;
    }

    let Ok(path) = CanonicalPath::parse(raw) else {
        return;
    };

    let rendered = path.render();
    let reparsed = CanonicalPath::parse(&rendered).expect("Rendered path must parse");
    assert_eq!(reparsed, path, "Canonicalization must be idempotent for {raw:?}");

    for component in path.components() {
        assert!(!matches!(component.as_str(), "" | "." | ".." | "index"));
    }
});
