//! Filesystem-safe encoding of single path components.
//!
//! Every node in the store is a literal entry on disk, so each component has to
//! survive the strictest host we might run on. Encoding is applied in three
//! steps:
//!
//! 1. Characters that Windows or POSIX refuse in names (`< > : " | \ ? *`), the
//!    escape character `%`, the separator `/`, the C0 controls and DEL are
//!    written as `%XX` with uppercase hex digits.
//! 2. Windows device names (`con`, `prn`, `aux`, `nul`, `com1`-`com9`,
//!    `lpt1`-`lpt9`), optionally followed by an extension, get the last
//!    character of the device word escaped so the stem no longer matches.
//! 3. A trailing `.` or space, both silently stripped by Windows, is escaped.
//!
//! Decoding is plain percent-decoding: the escapes produced by steps 2 and 3
//! (and by the case-fold resolver) are ordinary `%XX` triples.

use percent_encoding::percent_decode_str;
use std::fmt;
use thiserror::Error;

/// Device names reserved by Windows, matched case-insensitively against the
/// part of a component before its first `.`.
const RESERVED_DEVICE_NAMES: [&str; 22] = [
    "con", "prn", "aux", "nul", "com1", "com2", "com3", "com4", "com5", "com6", "com7", "com8",
    "com9", "lpt1", "lpt2", "lpt3", "lpt4", "lpt5", "lpt6", "lpt7", "lpt8", "lpt9",
];

const HEX_UPPER: &[u8; 16] = b"0123456789ABCDEF";

/// Context for name operations, providing debugging information.
#[derive(Debug, Clone, Default)]
pub struct NameContext {
    /// The name as stored on disk (if available)
    pub encoded_name: Option<String>,
    /// The decoded component (if available, e.g., during encoding)
    pub component: Option<String>,
    /// Encoded name of the directory holding the entry
    pub parent: Option<String>,
}

impl NameContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_encoded_name(mut self, name: impl Into<String>) -> Self {
        self.encoded_name = Some(name.into());
        self
    }

    pub fn with_component(mut self, component: impl Into<String>) -> Self {
        self.component = Some(component.into());
        self
    }

    pub fn with_parent(mut self, parent: impl Into<String>) -> Self {
        self.parent = Some(parent.into());
        self
    }
}

impl fmt::Display for NameContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut parts = Vec::new();

        if let Some(ref component) = self.component {
            parts.push(format!("component '{component}'"));
        }
        if let Some(ref name) = self.encoded_name {
            parts.push(format!("encoded name '{name}'"));
        }
        if let Some(ref parent) = self.parent {
            let display_parent = if parent.is_empty() { "<root>" } else { parent.as_str() };
            parts.push(format!("in directory {display_parent}"));
        }

        if parts.is_empty() {
            write!(f, "(no context)")
        } else {
            write!(f, "{}", parts.join(" "))
        }
    }
}

/// Errors that can occur while encoding or decoding names.
#[derive(Error, Debug)]
pub enum NameError {
    /// The percent-decoded bytes of an on-disk name are not UTF-8.
    #[error("Invalid UTF-8 after percent-decoding {context}: {reason}")]
    Utf8Decode { reason: String, context: NameContext },

    /// Case-fold resolution escaped every eligible letter and the name still
    /// collides with a sibling.
    ///
    /// **[INVARIANT VIOLATION]** Only reachable with sibling sets that cannot
    /// be produced by realistic component lengths.
    #[error("[INVARIANT VIOLATION] Case-fold collision could not be resolved for {context}")]
    CollisionExhausted { context: NameContext },
}

/// Returns true for characters that must never appear literally in an
/// encoded name.
#[inline]
fn must_escape(c: char) -> bool {
    matches!(c, '<' | '>' | ':' | '"' | '|' | '\\' | '?' | '*' | '%' | '/')
        || c <= '\u{1f}'
        || c == '\u{7f}'
}

/// Appends `%XX` for a single ASCII byte.
#[inline]
pub(crate) fn push_escaped(out: &mut String, byte: u8) {
    out.push('%');
    out.push(char::from(HEX_UPPER[usize::from(byte >> 4)]));
    out.push(char::from(HEX_UPPER[usize::from(byte & 0x0f)]));
}

/// Returns the reserved device word `component` starts with, if any.
///
/// The word must make up the whole component or be followed by a `.`.
fn reserved_device_word(component: &str) -> Option<&'static str> {
    let stem = component.split('.').next().unwrap_or(component);
    RESERVED_DEVICE_NAMES
        .iter()
        .copied()
        .find(|reserved| stem.eq_ignore_ascii_case(reserved))
}

/// Replaces the ASCII byte at `index` with its `%XX` escape.
pub(crate) fn escape_byte_at(name: &mut String, index: usize) {
    let byte = name.as_bytes()[index];
    debug_assert!(byte.is_ascii());
    let mut escaped = String::with_capacity(3);
    push_escaped(&mut escaped, byte);
    name.replace_range(index..=index, &escaped);
}

/// Encode a component into a name that is safe to create on any host.
///
/// # Examples
///
/// ```
/// use dirkv_core::fs::name::encode_component;
///
/// assert_eq!(encode_component("prn"), "pr%6E");
/// assert_eq!(encode_component("file."), "file%2E");
/// assert_eq!(encode_component("a/b"), "a%2Fb");
/// ```
pub fn encode_component(component: &str) -> String {
    let mut encoded = String::with_capacity(component.len());
    for c in component.chars() {
        if must_escape(c) {
            // Every escaped character is ASCII.
            push_escaped(&mut encoded, c as u8);
        } else {
            encoded.push(c);
        }
    }

    // Device words are alphanumeric, so step 1 left them as a literal prefix.
    if let Some(word) = reserved_device_word(component) {
        escape_byte_at(&mut encoded, word.len() - 1);
    }

    if encoded.ends_with(['.', ' ']) {
        let last = encoded.len() - 1;
        escape_byte_at(&mut encoded, last);
    }

    encoded
}

/// Decode an on-disk name back into the component it encodes.
///
/// Escapes that do not form a valid `%XX` triple are kept verbatim.
///
/// # Errors
///
/// Returns `NameError::Utf8Decode` if the decoded bytes are not UTF-8, which
/// can only happen for names created outside the store.
pub fn decode_component(name: &str) -> Result<String, NameError> {
    percent_decode_str(name)
        .decode_utf8()
        .map(|decoded| decoded.into_owned())
        .map_err(|e| NameError::Utf8Decode {
            reason: e.to_string(),
            context: NameContext::new().with_encoded_name(name),
        })
}
