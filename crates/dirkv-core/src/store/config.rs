//! Store configuration.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Default window during which events for a path we just wrote are treated
/// as our own. Matches the watcher's coalescing delay.
pub const DEFAULT_ANTICIPATION_WINDOW_MS: u64 = 500;

/// How component names are compared by the backing filesystem.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CaseSensitivity {
    /// Probe the root directory at open.
    #[default]
    Auto,
    /// Treat names as case-sensitive without probing.
    Sensitive,
    /// Treat names as case-insensitive without probing.
    Insensitive,
}

/// Errors loading a configuration file.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid config JSON: {0}")]
    Json(#[from] serde_json::Error),
}

/// Options for opening a [`Store`](super::Store).
///
/// # Examples
///
/// ```
/// use dirkv_core::store::config::{CaseSensitivity, StoreOptions};
///
/// let options: StoreOptions = serde_json::from_str(r#"{ "root": "/tmp/kv" }"#).unwrap();
/// assert_eq!(options.case_sensitivity, CaseSensitivity::Auto);
/// assert_eq!(options.anticipation_window_ms, 500);
/// assert!(options.watch);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreOptions {
    /// Backing directory; created if missing.
    pub root: PathBuf,

    #[serde(default)]
    pub case_sensitivity: CaseSensitivity,

    #[serde(default = "default_anticipation_window_ms")]
    pub anticipation_window_ms: u64,

    /// JSON file for annotations and last-seen times. `None` keeps them in
    /// memory only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata_path: Option<PathBuf>,

    /// Start a filesystem watcher on the root (requires the `watch` feature).
    #[serde(default = "default_true")]
    pub watch: bool,

    /// Feed existing content to the reconciler at open.
    #[serde(default = "default_true")]
    pub initial_scan: bool,
}

fn default_anticipation_window_ms() -> u64 {
    DEFAULT_ANTICIPATION_WINDOW_MS
}

fn default_true() -> bool {
    true
}

impl StoreOptions {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            case_sensitivity: CaseSensitivity::default(),
            anticipation_window_ms: DEFAULT_ANTICIPATION_WINDOW_MS,
            metadata_path: None,
            watch: true,
            initial_scan: true,
        }
    }

    pub fn with_case_sensitivity(mut self, case_sensitivity: CaseSensitivity) -> Self {
        self.case_sensitivity = case_sensitivity;
        self
    }

    pub fn with_anticipation_window(mut self, window: Duration) -> Self {
        self.anticipation_window_ms = u64::try_from(window.as_millis()).unwrap_or(u64::MAX);
        self
    }

    pub fn with_metadata_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.metadata_path = Some(path.into());
        self
    }

    pub fn with_watch(mut self, watch: bool) -> Self {
        self.watch = watch;
        self
    }

    pub fn with_initial_scan(mut self, initial_scan: bool) -> Self {
        self.initial_scan = initial_scan;
        self
    }

    #[inline]
    pub fn anticipation_window(&self) -> Duration {
        Duration::from_millis(self.anticipation_window_ms)
    }

    /// Parse options from a JSON document.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::Json` for malformed JSON or a missing `root`.
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(json)?)
    }

    /// Load options from a JSON file.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::Io` if the file cannot be read and
    /// `ConfigError::Json` if it does not parse.
    pub fn from_json_file(path: &Path) -> Result<Self, ConfigError> {
        let json = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json_str(&json)
    }
}
