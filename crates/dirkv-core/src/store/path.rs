//! Canonical key paths.
//!
//! Callers address values with `/`-separated string keys. Each fragment is
//! percent-decoded and NFC-normalized so that equivalent spellings of a key
//! land on the same node, and the reserved `index` fragment cuts the key short
//! because it names a directory's own value on disk.

use percent_encoding::percent_decode_str;
use std::borrow::Cow;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use unicode_normalization::UnicodeNormalization;

use crate::fs::name::{decode_component, encode_component};

/// Separator between components in raw and rendered keys.
pub const SEPARATOR: char = '/';

/// Reserved entry name holding a directory node's own value.
pub const INDEX: &str = "index";

/// Errors raised while canonicalizing a raw key.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PathError {
    /// A fragment percent-decodes to bytes that are not UTF-8.
    #[error("Fragment '{fragment}' of key '{raw}' is not valid UTF-8 after decoding: {reason}")]
    InvalidUtf8 {
        raw: String,
        fragment: String,
        reason: String,
    },
}

/// One decoded segment of a canonical path.
///
/// A component is NFC-normalized and is never empty, `.`, `..` or `index`. It
/// may contain `/` and `%` as ordinary data.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Component(String);

impl Component {
    /// Build a component from already decoded text.
    ///
    /// Returns `None` for text that cannot be a component.
    pub fn new(decoded: &str) -> Option<Self> {
        let normalized: String = decoded.nfc().collect();
        match normalized.as_str() {
            "" | "." | ".." | INDEX => None,
            _ => Some(Component(normalized)),
        }
    }

    /// Build the component an on-disk entry name encodes.
    ///
    /// Returns `None` when the name does not decode to UTF-8 or decodes to
    /// something that cannot be a component.
    pub fn from_encoded(name: &str) -> Option<Self> {
        decode_component(name).ok().and_then(|decoded| Self::new(&decoded))
    }

    #[inline]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The filesystem-safe name for this component, before case-fold
    /// resolution.
    #[inline]
    pub fn encode(&self) -> String {
        encode_component(&self.0)
    }
}

impl AsRef<str> for Component {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Component {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Normalized address of a node in the store.
///
/// # Examples
///
/// ```
/// use dirkv_core::store::path::CanonicalPath;
///
/// let path = CanonicalPath::parse("/a/./b/../c").unwrap();
/// assert_eq!(path.render(), "a/c");
///
/// // Everything from the reserved `index` fragment on is dropped.
/// let path = CanonicalPath::parse("/a/b/c/index/x/y").unwrap();
/// assert_eq!(path.render(), "a/b/c");
///
/// // Escaped separators stay inside their component.
/// let path = CanonicalPath::parse("docs/a%2Fb").unwrap();
/// assert_eq!(path.len(), 2);
/// assert_eq!(path.file_name().unwrap().as_str(), "a/b");
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CanonicalPath(Vec<Component>);

impl CanonicalPath {
    /// The root path (no components).
    #[inline]
    pub fn root() -> Self {
        CanonicalPath(Vec::new())
    }

    /// Canonicalize a raw key.
    ///
    /// Malformed escapes (a `%` not followed by two hex digits) are kept as
    /// literal text.
    ///
    /// # Errors
    ///
    /// Returns `PathError::InvalidUtf8` if a fragment decodes to bytes that are
    /// not UTF-8.
    pub fn parse(raw: &str) -> Result<Self, PathError> {
        let trimmed = raw.strip_prefix(SEPARATOR).unwrap_or(raw);
        let mut components: Vec<Component> = Vec::new();

        for fragment in trimmed.split(SEPARATOR) {
            if fragment.is_empty() {
                continue;
            }
            let decoded = percent_decode_str(fragment).decode_utf8().map_err(|e| {
                PathError::InvalidUtf8 {
                    raw: raw.to_owned(),
                    fragment: fragment.to_owned(),
                    reason: e.to_string(),
                }
            })?;
            let normalized: String = decoded.nfc().collect();

            match normalized.as_str() {
                INDEX => break,
                "" | "." => {}
                ".." => {
                    components.pop();
                }
                _ => components.push(Component(normalized)),
            }
        }

        Ok(CanonicalPath(components))
    }

    /// Build a path from components that are already valid.
    pub fn from_components(components: impl IntoIterator<Item = Component>) -> Self {
        CanonicalPath(components.into_iter().collect())
    }

    /// Minimal string form: components joined with `/`, escaping only `%`
    /// and `/` inside each component. The root renders as `""`.
    pub fn render(&self) -> String {
        let mut rendered = String::new();
        for (i, component) in self.0.iter().enumerate() {
            if i > 0 {
                rendered.push(SEPARATOR);
            }
            rendered.push_str(&escape_minimal(component.as_str()));
        }
        rendered
    }

    #[inline]
    pub fn is_root(&self) -> bool {
        self.0.is_empty()
    }

    /// Number of components.
    #[inline]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    #[inline]
    pub fn components(&self) -> &[Component] {
        &self.0
    }

    /// Append a component.
    pub fn join(&self, component: Component) -> Self {
        let mut components = self.0.clone();
        components.push(component);
        CanonicalPath(components)
    }

    /// The first `depth` components as a path of their own.
    pub fn prefix(&self, depth: usize) -> Self {
        CanonicalPath(self.0[..depth.min(self.0.len())].to_vec())
    }

    /// Get the parent path, if any.
    ///
    /// Returns `None` for the root path.
    pub fn parent(&self) -> Option<Self> {
        if self.is_root() {
            None
        } else {
            Some(self.prefix(self.0.len() - 1))
        }
    }

    /// Final component, or `None` for the root.
    pub fn file_name(&self) -> Option<&Component> {
        self.0.last()
    }

    /// Whether `ancestor` is this path or one of its ancestors.
    pub fn starts_with(&self, ancestor: &CanonicalPath) -> bool {
        self.0.starts_with(&ancestor.0)
    }
}

fn escape_minimal(component: &str) -> Cow<'_, str> {
    if component.contains(['%', SEPARATOR]) {
        Cow::Owned(component.replace('%', "%25").replace(SEPARATOR, "%2F"))
    } else {
        Cow::Borrowed(component)
    }
}

impl fmt::Display for CanonicalPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "/{}", self.render())
    }
}

impl FromStr for CanonicalPath {
    type Err = PathError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        CanonicalPath::parse(s)
    }
}
