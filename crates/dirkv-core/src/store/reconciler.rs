//! Reconciliation of filesystem events with the mirror tree.
//!
//! Events come from the watcher, from the initial scan at open, or from
//! callers feeding them by hand through [`Store::observe`](super::Store::observe).
//! The reconciler adopts entries it has not seen into the tree under their
//! on-disk names, drops nodes whose entries are gone, and reports value
//! changes that did not originate from this store to the change callback.
//!
//! A path the store has just written is *anticipated* for a short window;
//! file events for it are treated as our own and never reach the callback.
//! Independently of that, a value is only reported when its modification time
//! is newer than the last one recorded in the metadata store, so replays of
//! old events and rescans after a restart stay quiet.

use dashmap::DashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};
use tracing::{debug, info, instrument, trace, warn};
use walkdir::WalkDir;

use super::metadata::MetadataStore;
use super::metrics::StoreMetrics;
use super::path::{CanonicalPath, Component, INDEX};
use super::tree::{MirrorTree, Node, NodeKind};
use crate::fs::case_fold;

/// Anticipation entries are purged in bulk once the table grows past this.
const ANTICIPATION_PURGE_THRESHOLD: usize = 1024;

/// Kind of raw filesystem event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WatchEventKind {
    /// A file appeared.
    Added,
    /// A directory appeared.
    AddedDir,
    /// A file's content or metadata changed.
    Changed,
    /// A file disappeared.
    Removed,
    /// A directory disappeared.
    RemovedDir,
}

/// What happened to a value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChangeKind {
    Changed,
    Removed,
}

/// Report of a value changed outside this store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeNotification {
    pub path: CanonicalPath,
    pub kind: ChangeKind,
    /// Modification time of the new value; `None` for removals.
    pub modified: Option<SystemTime>,
}

/// Receiver of change notifications. Called on the thread that delivered the
/// event.
pub type ChangeCallback = Arc<dyn Fn(ChangeNotification) + Send + Sync>;

/// An event resolved to a canonical path.
#[derive(Debug)]
struct EventTarget {
    path: CanonicalPath,
    /// On-disk name of each component of `path`.
    names: Vec<String>,
    /// The event concerns the `index` entry of the directory at `path`.
    directory_value: bool,
}

/// Keeps the mirror tree in step with changes made outside the store.
pub struct ChangeReconciler {
    tree: Arc<MirrorTree>,
    metadata: Arc<dyn MetadataStore>,
    metrics: Arc<StoreMetrics>,
    anticipated: DashMap<CanonicalPath, Instant>,
    window: Duration,
    callback: Option<ChangeCallback>,
    ignored: Vec<PathBuf>,
}

impl fmt::Debug for ChangeReconciler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChangeReconciler")
            .field("root", &self.tree.root_path())
            .field("anticipated", &self.anticipated.len())
            .field("window", &self.window)
            .field("has_callback", &self.callback.is_some())
            .field("ignored", &self.ignored)
            .finish_non_exhaustive()
    }
}

impl ChangeReconciler {
    pub fn new(
        tree: Arc<MirrorTree>,
        metadata: Arc<dyn MetadataStore>,
        metrics: Arc<StoreMetrics>,
        window: Duration,
        callback: Option<ChangeCallback>,
    ) -> Self {
        Self {
            tree,
            metadata,
            metrics,
            anticipated: DashMap::new(),
            window,
            callback,
            ignored: Vec::new(),
        }
    }

    /// Never reconcile events for `path`, nor for temporary siblings whose
    /// names start with its file name.
    pub fn with_ignored(mut self, path: impl Into<PathBuf>) -> Self {
        self.ignored.push(path.into());
        self
    }

    #[inline]
    pub fn root(&self) -> &Path {
        self.tree.root_path()
    }

    /// Treat file events for `path` as self-caused until the window elapses.
    pub fn anticipate(&self, path: &CanonicalPath) {
        let now = Instant::now();
        if self.anticipated.len() > ANTICIPATION_PURGE_THRESHOLD {
            self.anticipated.retain(|_, deadline| *deadline > now);
        }
        self.anticipated.insert(path.clone(), now + self.window);
    }

    pub fn is_anticipated(&self, path: &CanonicalPath) -> bool {
        let now = Instant::now();
        let live = self
            .anticipated
            .get(path)
            .is_some_and(|deadline| *deadline > now);
        if !live {
            self.anticipated.remove_if(path, |_, deadline| *deadline <= now);
        }
        live
    }

    /// Apply one raw filesystem event.
    pub fn on_event(&self, full_path: &Path, kind: WatchEventKind) {
        self.metrics.record_event_observed();
        let Some(target) = self.classify(full_path) else {
            return;
        };
        trace!(
            path = %target.path,
            ?kind,
            directory_value = target.directory_value,
            "Reconciling event"
        );

        match kind {
            WatchEventKind::Added | WatchEventKind::Changed => self.on_file_present(&target, full_path),
            WatchEventKind::AddedDir => self.on_directory_present(&target, full_path),
            WatchEventKind::Removed | WatchEventKind::RemovedDir => {
                self.on_entry_gone(&target, full_path);
            }
        }
    }

    /// Feed every existing entry under the root to the reconciler as an add
    /// event. Returns the number of entries visited.
    #[instrument(level = "debug", skip(self), fields(root = %self.tree.root_path().display()))]
    pub fn scan_existing(&self) -> usize {
        let mut visited = 0;
        for entry in WalkDir::new(self.tree.root_path()).min_depth(1).follow_links(false) {
            match entry {
                Ok(entry) => {
                    let file_type = entry.file_type();
                    let kind = if file_type.is_dir() {
                        WatchEventKind::AddedDir
                    } else if file_type.is_file() {
                        WatchEventKind::Added
                    } else {
                        continue;
                    };
                    self.on_event(entry.path(), kind);
                    visited += 1;
                }
                Err(e) => warn!(error = %e, "Skipping unreadable entry during initial scan"),
            }
        }
        info!(entries = visited, "Initial scan complete");
        visited
    }

    fn is_ignored(&self, full_path: &Path) -> bool {
        self.ignored.iter().any(|ignored| {
            if full_path == ignored {
                return true;
            }
            let (Some(name), Some(ignored_name)) = (full_path.file_name(), ignored.file_name()) else {
                return false;
            };
            full_path.parent() == ignored.parent()
                && name
                    .to_string_lossy()
                    .starts_with(ignored_name.to_string_lossy().as_ref())
        })
    }

    /// Whether `name` is the entry holding a directory's value, compared the
    /// way the backing filesystem compares names.
    fn is_index_name(&self, name: &str) -> bool {
        name == INDEX || (self.tree.is_case_insensitive() && case_fold::fold(name) == INDEX)
    }

    fn classify(&self, full_path: &Path) -> Option<EventTarget> {
        let Ok(relative) = full_path.strip_prefix(self.tree.root_path()) else {
            trace!(path = %full_path.display(), "Ignoring event outside the store root");
            return None;
        };
        if self.is_ignored(full_path) {
            trace!(path = %full_path.display(), "Ignoring event for ignored path");
            return None;
        }

        let mut names = Vec::new();
        for part in relative.components() {
            let std::path::Component::Normal(name) = part else {
                trace!(path = %full_path.display(), "Ignoring event with unexpected path component");
                return None;
            };
            let Some(name) = name.to_str() else {
                warn!(path = %full_path.display(), "Ignoring event for non-UTF-8 name");
                return None;
            };
            names.push(name.to_owned());
        }

        if names.is_empty() {
            return None;
        }

        let directory_value = names.last().is_some_and(|name| self.is_index_name(name));
        if directory_value {
            names.pop();
        }
        if names.iter().any(|name| self.is_index_name(name)) {
            debug!(path = %full_path.display(), "Ignoring event below an index entry");
            return None;
        }

        let mut components = Vec::with_capacity(names.len());
        for name in &names {
            let Some(component) = Component::from_encoded(name) else {
                warn!(name = %name, path = %full_path.display(), "Ignoring event for undecodable name");
                return None;
            };
            components.push(component);
        }

        Some(EventTarget {
            path: CanonicalPath::from_components(components),
            names,
            directory_value,
        })
    }

    /// Walk to the node for `target`, adopting missing entries under their
    /// disk names. Intermediate nodes are directories on disk.
    fn adopt(&self, target: &EventTarget, terminal: NodeKind) -> Arc<Node> {
        let mut node = Arc::clone(self.tree.root());
        let depth = target.names.len();
        for (i, (component, name)) in target.path.components().iter().zip(&target.names).enumerate() {
            let kind = if i + 1 == depth { terminal } else { NodeKind::Directory };
            let (child, _) = node.child_or_insert_observed(component, name, kind);
            if kind == NodeKind::Directory {
                settle_directory(&child);
            }
            node = child;
        }
        node
    }

    fn on_file_present(&self, target: &EventTarget, full_path: &Path) {
        let metadata = match std::fs::symlink_metadata(full_path) {
            Ok(metadata) if metadata.is_file() => metadata,
            Ok(_) => {
                trace!(path = %target.path, "Ignoring file event for non-file entry");
                return;
            }
            Err(e) => {
                trace!(path = %target.path, error = %e, "Entry gone before it could be inspected");
                return;
            }
        };

        let terminal = if target.directory_value {
            NodeKind::Directory
        } else {
            NodeKind::File
        };
        let node = self.adopt(target, terminal);
        if !target.directory_value && node.kind() == NodeKind::Directory {
            debug!(path = %target.path, "File event for a directory node, ignoring");
            return;
        }

        self.notify_if_newer(&target.path, metadata.modified().ok());
    }

    fn on_directory_present(&self, target: &EventTarget, full_path: &Path) {
        if target.directory_value {
            debug!(path = %target.path, "Ignoring directory named index");
            return;
        }
        match std::fs::symlink_metadata(full_path) {
            Ok(metadata) if metadata.is_dir() => {
                self.adopt(target, NodeKind::Directory);
            }
            _ => trace!(path = %target.path, "Directory event for non-directory entry"),
        }
    }

    fn on_entry_gone(&self, target: &EventTarget, full_path: &Path) {
        if std::fs::symlink_metadata(full_path).is_ok() {
            trace!(path = %target.path, "Entry still on disk, ignoring removal");
            return;
        }
        if target.directory_value {
            self.notify_removed(&target.path);
            return;
        }

        let Some((node, _)) = self.tree.lookup(&target.path) else {
            return;
        };
        match node.kind() {
            NodeKind::Converting => {
                debug!(path = %target.path, "Ignoring removal of node being converted");
            }
            NodeKind::File => {
                if self.tree.remove_if_same(&target.path, &node) {
                    trace!(path = %target.path, "Dropped file node");
                    self.notify_removed(&target.path);
                }
            }
            NodeKind::Directory => {
                if self.tree.remove_if_same(&target.path, &node) {
                    debug!(path = %target.path, "Dropped directory subtree");
                }
            }
        }
    }

    fn notify_if_newer(&self, path: &CanonicalPath, modified: Option<SystemTime>) {
        if self.is_anticipated(path) {
            self.metrics.record_event_suppressed();
            debug!(path = %path, "Suppressed self-caused event");
            return;
        }
        let Some(modified) = modified else {
            return;
        };
        if let Some(last_seen) = self.metadata.last_seen(path)
            && modified <= last_seen
        {
            self.metrics.record_event_suppressed();
            trace!(path = %path, "Value not newer than last observation");
            return;
        }

        if let Err(e) = self.metadata.mark_as_seen(path, modified) {
            warn!(path = %path, error = %e, "Failed to record observation time");
        }
        self.fire(ChangeNotification {
            path: path.clone(),
            kind: ChangeKind::Changed,
            modified: Some(modified),
        });
    }

    fn notify_removed(&self, path: &CanonicalPath) {
        if self.is_anticipated(path) {
            self.metrics.record_event_suppressed();
            debug!(path = %path, "Suppressed self-caused removal");
            return;
        }
        if !self.metadata.has_been_seen(path) {
            self.metrics.record_event_suppressed();
            trace!(path = %path, "Removal of a value never reported");
            return;
        }
        if let Err(e) = self.metadata.delete(path) {
            warn!(path = %path, error = %e, "Failed to forget removed value");
        }
        self.fire(ChangeNotification {
            path: path.clone(),
            kind: ChangeKind::Removed,
            modified: None,
        });
    }

    fn fire(&self, notification: ChangeNotification) {
        self.metrics.record_callback_fired();
        debug!(path = %notification.path, kind = ?notification.kind, "External change");
        if let Some(callback) = &self.callback {
            callback(notification);
        }
    }
}

/// Bring a node in line with a directory observed on disk.
fn settle_directory(node: &Node) {
    if node.transition(NodeKind::File, NodeKind::Directory) {
        debug!(name = node.encoded_name(), "Node found as a directory on disk");
    }
    if node.kind() == NodeKind::Directory {
        node.mark_materialized();
    }
}
