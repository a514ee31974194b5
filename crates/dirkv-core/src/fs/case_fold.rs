//! Sibling de-duplication for case-insensitive backing filesystems.
//!
//! On a case-insensitive host `File` and `file` name the same entry, so two
//! distinct components that differ only by case must not encode to names that
//! fold together. The resolver keeps the encoded name as close to the plain
//! encoding as possible: it escapes the fewest trailing letters needed to make
//! the folded form unique among siblings.

use super::name::{NameContext, NameError, escape_byte_at};
use std::collections::{HashMap, HashSet};
use std::io;
use std::path::Path;
use tracing::{debug, error, instrument, trace};

/// Folded form of each in-use sibling name, mapped to the encoded names that
/// produce it.
pub type FoldIndex = HashMap<String, HashSet<String>>;

/// Fold a name the way a case-insensitive filesystem compares it.
#[inline]
pub fn fold(name: &str) -> String {
    name.to_lowercase()
}

/// Record `encoded` as an in-use sibling name.
pub fn register(index: &mut FoldIndex, encoded: &str) {
    index.entry(fold(encoded)).or_default().insert(encoded.to_owned());
}

/// Forget `encoded`, dropping the folded key once no name maps to it.
pub fn unregister(index: &mut FoldIndex, encoded: &str) {
    let folded = fold(encoded);
    if let Some(names) = index.get_mut(&folded) {
        names.remove(encoded);
        if names.is_empty() {
            index.remove(&folded);
        }
    }
}

fn collides(candidate: &str, index: &FoldIndex) -> bool {
    index.contains_key(&fold(candidate))
}

/// Find the next letter left of `before` that may be escaped.
///
/// Hex digits of existing `%XX` triples are skipped: landing on a byte with
/// `%` two positions back means we are on the second digit, so the whole
/// triple is stepped over.
fn next_escapable_letter(name: &str, before: usize) -> Option<usize> {
    let bytes = name.as_bytes();
    let mut i = before;
    while i > 0 {
        i -= 1;
        if i >= 2 && bytes[i - 2] == b'%' {
            i -= 2;
            continue;
        }
        if bytes[i].is_ascii_alphabetic() {
            return Some(i);
        }
    }
    None
}

/// Make `candidate` unique among the siblings recorded in `index`.
///
/// Returns the candidate unchanged when it does not collide.
///
/// # Errors
///
/// Returns `NameError::CollisionExhausted` when every eligible letter has been
/// escaped and the name still collides.
#[instrument(level = "trace", skip(index), fields(siblings = index.len()))]
pub fn resolve(candidate: &str, index: &FoldIndex) -> Result<String, NameError> {
    let mut name = candidate.to_owned();
    let mut cursor = name.len();

    while collides(&name, index) {
        let Some(position) = next_escapable_letter(&name, cursor) else {
            error!(candidate, attempted = %name, "Case-fold collision could not be resolved");
            return Err(NameError::CollisionExhausted {
                context: NameContext::new().with_encoded_name(candidate),
            });
        };
        escape_byte_at(&mut name, position);
        cursor = position;
        trace!(attempt = %name, "Escaped letter to break case-fold collision");
    }

    if name != candidate {
        debug!(candidate, resolved = %name, "Resolved case-fold collision");
    }
    Ok(name)
}

/// Detect whether the filesystem holding `root` compares names
/// case-insensitively.
///
/// A uniquely named lowercase probe file is created in `root`; the host is
/// case-insensitive when the same name in uppercase resolves to it.
///
/// # Errors
///
/// Returns the I/O error if the probe file cannot be created.
#[instrument(level = "debug", fields(root = %root.display()))]
pub async fn probe_case_insensitive(root: &Path) -> io::Result<bool> {
    let probe_name = format!(".case-probe-{}", uuid::Uuid::new_v4().simple());
    let probe = root.join(&probe_name);
    tokio::fs::write(&probe, b"").await?;

    let upper = root.join(probe_name.to_uppercase());
    let insensitive = tokio::fs::symlink_metadata(&upper).await.is_ok();

    if let Err(e) = tokio::fs::remove_file(&probe).await {
        debug!(error = %e, probe = %probe.display(), "Failed to remove case probe");
    }
    debug!(insensitive, "Case sensitivity probed");
    Ok(insensitive)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn index_of(names: &[&str]) -> FoldIndex {
        let mut index = FoldIndex::new();
        for name in names {
            register(&mut index, name);
        }
        index
    }

    #[test]
    fn test_no_collision_keeps_candidate() {
        let index = index_of(&["other", "names"]);
        assert_eq!(resolve("File", &index).unwrap(), "File");
    }

    #[test]
    fn test_escapes_last_letter_first() {
        let index = index_of(&["File"]);
        assert_eq!(resolve("file", &index).unwrap(), "fil%65");
    }

    #[test]
    fn test_escapes_further_left_until_unique() {
        let index = index_of(&["File", "fil%65"]);
        assert_eq!(resolve("FILE", &index).unwrap(), "FIL%45");

        let index = index_of(&["File", "fil%45"]);
        assert_eq!(resolve("FILE", &index).unwrap(), "FI%4C%45");
    }

    #[test]
    fn test_existing_escape_triples_are_skipped() {
        // "a%41" folds to "a%41"; the "1" and "4" are escape digits, so the
        // resolver must move on to the leading "a".
        let index = index_of(&["A%41"]);
        assert_eq!(resolve("a%41", &index).unwrap(), "%61%41");
    }

    #[test]
    fn test_hex_letter_digits_are_not_escaped() {
        // "%3A" ends in a hex letter that belongs to the triple.
        let index = index_of(&["X%3A"]);
        assert_eq!(resolve("x%3A", &index).unwrap(), "%78%3A");
    }

    #[test]
    fn test_skips_non_letters() {
        let index = index_of(&["Ab12"]);
        assert_eq!(resolve("ab12", &index).unwrap(), "a%6212");
    }

    #[test]
    fn test_exhaustion_is_an_error() {
        let index = index_of(&["123", "%41"]);
        let err = resolve("123", &index).unwrap_err();
        assert!(matches!(err, NameError::CollisionExhausted { .. }));

        let err = resolve("%41", &index).unwrap_err();
        assert!(matches!(err, NameError::CollisionExhausted { .. }));
    }

    #[test]
    fn test_unregister_releases_folded_name() {
        let mut index = index_of(&["File"]);
        register(&mut index, "fil%65");
        unregister(&mut index, "File");
        assert!(collides("fIl%65", &index));
        unregister(&mut index, "fil%65");
        assert!(index.is_empty());
        assert_eq!(resolve("FILE", &index).unwrap(), "FILE");
    }

    #[tokio::test]
    async fn test_probe_leaves_no_files_behind() {
        let dir = tempfile::TempDir::new().unwrap();
        let result = probe_case_insensitive(dir.path()).await;
        assert!(result.is_ok(), "probe failed: {:?}", result.err());
        let leftover = std::fs::read_dir(dir.path()).unwrap().count();
        assert_eq!(leftover, 0);
    }
}
