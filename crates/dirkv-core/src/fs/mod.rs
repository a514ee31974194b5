//! Filesystem-facing helpers: component encoding, case folding and file
//! attributes.

pub mod attributes;
pub mod case_fold;
pub mod name;

pub use attributes::{AttributeBoundary, StdAttributes};
pub use case_fold::{FoldIndex, probe_case_insensitive};
pub use name::{NameContext, NameError, decode_component, encode_component};
