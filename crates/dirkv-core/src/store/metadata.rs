//! Per-path annotations and last-seen modification times.
//!
//! The reconciler uses the last-seen mtime to tell genuinely new external
//! changes from events it has already reported, including across restarts
//! when the metadata is persisted.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tracing::{debug, instrument, trace, warn};

use super::path::CanonicalPath;

/// Free-form JSON annotations attached to a path.
pub type Annotations = serde_json::Map<String, serde_json::Value>;

const DOCUMENT_VERSION: u32 = 1;

/// Errors from the metadata store.
#[derive(Error, Debug)]
pub enum MetadataError {
    #[error("IO error for metadata file {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid metadata JSON in {}: {source}", path.display())]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Unsupported metadata version {found} (expected {expected})")]
    UnsupportedVersion { found: u32, expected: u32 },
}

/// Storage for path annotations and observation times.
///
/// Calls may block on disk I/O; async callers run them on blocking threads.
pub trait MetadataStore: Send + Sync + fmt::Debug {
    fn get(&self, path: &CanonicalPath) -> Option<Annotations>;

    /// Replace the annotations for `path`.
    fn set(&self, path: &CanonicalPath, annotations: Annotations) -> Result<(), MetadataError>;

    /// Shallow-merge `patch` into the annotations for `path`.
    fn update(&self, path: &CanonicalPath, patch: Annotations) -> Result<(), MetadataError>;

    /// Forget everything about `path`.
    fn delete(&self, path: &CanonicalPath) -> Result<(), MetadataError>;

    /// Record the modification time last observed for `path`.
    fn mark_as_seen(&self, path: &CanonicalPath, modified: SystemTime) -> Result<(), MetadataError>;

    fn last_seen(&self, path: &CanonicalPath) -> Option<SystemTime>;

    fn has_been_seen(&self, path: &CanonicalPath) -> bool {
        self.last_seen(path).is_some()
    }

    fn list_all_paths(&self) -> Vec<CanonicalPath>;
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
struct MetadataEntry {
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    annotations: Annotations,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    last_seen_mtime_ns: Option<u64>,
}

impl MetadataEntry {
    fn is_empty(&self) -> bool {
        self.annotations.is_empty() && self.last_seen_mtime_ns.is_none()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct MetadataDocument {
    version: u32,
    #[serde(default)]
    entries: BTreeMap<String, MetadataEntry>,
}

impl Default for MetadataDocument {
    fn default() -> Self {
        Self {
            version: DOCUMENT_VERSION,
            entries: BTreeMap::new(),
        }
    }
}

fn to_nanos(time: SystemTime) -> u64 {
    let since_epoch = time.duration_since(UNIX_EPOCH).unwrap_or_default();
    u64::try_from(since_epoch.as_nanos()).unwrap_or(u64::MAX)
}

fn from_nanos(nanos: u64) -> SystemTime {
    UNIX_EPOCH + Duration::from_nanos(nanos)
}

/// `MetadataStore` held in memory and optionally mirrored to a JSON file.
///
/// The file is rewritten after every mutation through a temporary sibling and
/// a rename, so readers never observe a partial document.
#[derive(Debug)]
pub struct JsonMetadataStore {
    path: Option<PathBuf>,
    document: Mutex<MetadataDocument>,
}

impl JsonMetadataStore {
    /// A store that never touches disk.
    pub fn in_memory() -> Self {
        Self {
            path: None,
            document: Mutex::new(MetadataDocument::default()),
        }
    }

    /// Open the store persisted at `path`, starting empty if the file does
    /// not exist yet.
    ///
    /// # Errors
    ///
    /// Returns `MetadataError` if the file exists but cannot be read or
    /// parsed.
    #[instrument(level = "debug", fields(path = %path.display()))]
    pub fn open(path: &Path) -> Result<Self, MetadataError> {
        let document = match std::fs::read(path) {
            Ok(bytes) => {
                let document: MetadataDocument =
                    serde_json::from_slice(&bytes).map_err(|source| MetadataError::Json {
                        path: path.to_path_buf(),
                        source,
                    })?;
                if document.version != DOCUMENT_VERSION {
                    return Err(MetadataError::UnsupportedVersion {
                        found: document.version,
                        expected: DOCUMENT_VERSION,
                    });
                }
                debug!(entries = document.entries.len(), "Loaded metadata");
                document
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("No metadata file yet, starting empty");
                MetadataDocument::default()
            }
            Err(source) => {
                return Err(MetadataError::Io {
                    path: path.to_path_buf(),
                    source,
                });
            }
        };

        Ok(Self {
            path: Some(path.to_path_buf()),
            document: Mutex::new(document),
        })
    }

    /// The backing file, if persisted.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    fn document(&self) -> MutexGuard<'_, MetadataDocument> {
        match self.document.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Apply `change` and persist the result. Persisting happens under the
    /// lock so files are written in mutation order.
    fn mutate(&self, change: impl FnOnce(&mut MetadataDocument)) -> Result<(), MetadataError> {
        let mut document = self.document();
        change(&mut document);
        self.persist(&document)
    }

    fn persist(&self, document: &MetadataDocument) -> Result<(), MetadataError> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let io_error = |source| MetadataError::Io {
            path: path.clone(),
            source,
        };

        let json = serde_json::to_vec_pretty(document).map_err(|source| MetadataError::Json {
            path: path.clone(),
            source,
        })?;

        let file_name = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        let temp = path.with_file_name(format!("{file_name}.tmp.{}", uuid::Uuid::new_v4().simple()));

        if let Err(e) = std::fs::write(&temp, &json) {
            let _ = std::fs::remove_file(&temp);
            return Err(io_error(e));
        }
        if let Err(e) = std::fs::rename(&temp, path) {
            warn!(error = %e, temp = %temp.display(), "Failed to move metadata into place");
            let _ = std::fs::remove_file(&temp);
            return Err(io_error(e));
        }
        trace!(entries = document.entries.len(), "Persisted metadata");
        Ok(())
    }
}

impl MetadataStore for JsonMetadataStore {
    fn get(&self, path: &CanonicalPath) -> Option<Annotations> {
        self.document()
            .entries
            .get(&path.render())
            .filter(|entry| !entry.annotations.is_empty())
            .map(|entry| entry.annotations.clone())
    }

    fn set(&self, path: &CanonicalPath, annotations: Annotations) -> Result<(), MetadataError> {
        let key = path.render();
        self.mutate(|document| {
            let entry = document.entries.entry(key.clone()).or_default();
            entry.annotations = annotations;
            if entry.is_empty() {
                document.entries.remove(&key);
            }
        })
    }

    fn update(&self, path: &CanonicalPath, patch: Annotations) -> Result<(), MetadataError> {
        let key = path.render();
        self.mutate(|document| {
            let entry = document.entries.entry(key).or_default();
            for (name, value) in patch {
                entry.annotations.insert(name, value);
            }
        })
    }

    fn delete(&self, path: &CanonicalPath) -> Result<(), MetadataError> {
        let key = path.render();
        if !self.document().entries.contains_key(&key) {
            return Ok(());
        }
        self.mutate(|document| {
            document.entries.remove(&key);
        })
    }

    fn mark_as_seen(&self, path: &CanonicalPath, modified: SystemTime) -> Result<(), MetadataError> {
        let key = path.render();
        self.mutate(|document| {
            document.entries.entry(key).or_default().last_seen_mtime_ns = Some(to_nanos(modified));
        })
    }

    fn last_seen(&self, path: &CanonicalPath) -> Option<SystemTime> {
        self.document()
            .entries
            .get(&path.render())
            .and_then(|entry| entry.last_seen_mtime_ns)
            .map(from_nanos)
    }

    fn list_all_paths(&self) -> Vec<CanonicalPath> {
        self.document()
            .entries
            .keys()
            .filter_map(|key| CanonicalPath::parse(key).ok())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn path(raw: &str) -> CanonicalPath {
        CanonicalPath::parse(raw).unwrap()
    }

    fn annotations(value: serde_json::Value) -> Annotations {
        match value {
            serde_json::Value::Object(map) => map,
            other => panic!("expected an object, got {other}"),
        }
    }

    #[test]
    fn test_annotations_set_update_delete() {
        let store = JsonMetadataStore::in_memory();
        let p = path("docs/readme");
        assert!(store.get(&p).is_none());

        store.set(&p, annotations(json!({"owner": "ops", "tier": 1}))).unwrap();
        store.update(&p, annotations(json!({"tier": 2, "tag": "x"}))).unwrap();
        assert_eq!(
            store.get(&p).unwrap(),
            annotations(json!({"owner": "ops", "tier": 2, "tag": "x"}))
        );

        store.delete(&p).unwrap();
        assert!(store.get(&p).is_none());
        assert!(store.list_all_paths().is_empty());
    }

    #[test]
    fn test_seen_times_round_trip_with_nanosecond_precision() {
        let store = JsonMetadataStore::in_memory();
        let p = path("a");
        assert!(!store.has_been_seen(&p));

        let modified = UNIX_EPOCH + Duration::new(1_700_000_000, 123_456_789);
        store.mark_as_seen(&p, modified).unwrap();
        assert!(store.has_been_seen(&p));
        assert_eq!(store.last_seen(&p), Some(modified));
        assert!(store.get(&p).is_none(), "seen time alone is not an annotation");
    }

    #[test]
    fn test_persisted_store_reloads() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("meta.json");
        let modified = UNIX_EPOCH + Duration::from_secs(42);

        {
            let store = JsonMetadataStore::open(&file).unwrap();
            store.mark_as_seen(&path("x/y%2Fz"), modified).unwrap();
            store.set(&path("x"), annotations(json!({"k": "v"}))).unwrap();
        }

        let store = JsonMetadataStore::open(&file).unwrap();
        assert_eq!(store.last_seen(&path("x/y%2Fz")), Some(modified));
        assert_eq!(store.get(&path("x")).unwrap(), annotations(json!({"k": "v"})));
        let mut paths = store.list_all_paths();
        paths.sort();
        assert_eq!(paths, vec![path("x"), path("x/y%2Fz")]);

        // No temp files are left next to the document.
        let names: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(names, vec![std::ffi::OsString::from("meta.json")]);
    }

    #[test]
    fn test_corrupt_file_is_an_error() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("meta.json");
        std::fs::write(&file, b"{not json").unwrap();
        assert!(matches!(
            JsonMetadataStore::open(&file),
            Err(MetadataError::Json { .. })
        ));

        std::fs::write(&file, br#"{"version": 99, "entries": {}}"#).unwrap();
        assert!(matches!(
            JsonMetadataStore::open(&file),
            Err(MetadataError::UnsupportedVersion { found: 99, .. })
        ));
    }
}
