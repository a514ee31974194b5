//! Filesystem watcher feeding the change reconciler.
//!
//! Wraps the platform watcher chosen by `notify` and translates its events
//! into the coarse kinds the reconciler understands.

use notify::event::{CreateKind, ModifyKind, RemoveKind, RenameMode};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tracing::{debug, info, trace, warn};

use super::reconciler::{ChangeReconciler, WatchEventKind};

/// Error type for watcher operations.
#[derive(Debug, Error)]
pub enum WatchError {
    /// Failed to create or configure the watcher
    #[error("failed to watch {}: {source}", root.display())]
    Watcher {
        root: PathBuf,
        #[source]
        source: notify::Error,
    },
}

/// Recursive watcher on a store root. Dropping it stops delivery.
pub struct StoreWatcher {
    watcher: Mutex<RecommendedWatcher>,
    root: PathBuf,
}

impl std::fmt::Debug for StoreWatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreWatcher").field("root", &self.root).finish_non_exhaustive()
    }
}

impl StoreWatcher {
    /// Start watching the reconciler's root.
    ///
    /// Events are applied on the watcher's own thread.
    ///
    /// # Errors
    ///
    /// Returns `WatchError::Watcher` if the platform watcher cannot be created
    /// or the root cannot be watched.
    pub fn start(reconciler: Arc<ChangeReconciler>) -> Result<Self, WatchError> {
        let root = reconciler.root().to_path_buf();
        let watch_error = |source| WatchError::Watcher {
            root: root.clone(),
            source,
        };

        let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| match res {
            Ok(event) => {
                for (path, kind) in translate_event(&event) {
                    reconciler.on_event(&path, kind);
                }
            }
            Err(e) => warn!(error = %e, "Filesystem watcher reported an error"),
        })
        .map_err(watch_error)?;

        watcher
            .watch(&root, RecursiveMode::Recursive)
            .map_err(watch_error)?;
        info!(root = %root.display(), "Watching store root");

        Ok(Self {
            watcher: Mutex::new(watcher),
            root,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Stop receiving events without dropping the watcher.
    ///
    /// # Errors
    ///
    /// Returns `WatchError::Watcher` if the platform watcher refuses.
    pub fn stop(&self) -> Result<(), WatchError> {
        let mut watcher = match self.watcher.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        watcher.unwatch(&self.root).map_err(|source| WatchError::Watcher {
            root: self.root.clone(),
            source,
        })?;
        info!(root = %self.root.display(), "Stopped watching store root");
        Ok(())
    }
}

/// Kind for an entry that may exist, decided by looking at it.
fn present_kind(path: &Path) -> WatchEventKind {
    match std::fs::symlink_metadata(path) {
        Ok(metadata) if metadata.is_dir() => WatchEventKind::AddedDir,
        _ => WatchEventKind::Added,
    }
}

/// Kind for an entry whose fate is unknown.
fn present_or_removed(path: &Path) -> WatchEventKind {
    match std::fs::symlink_metadata(path) {
        Ok(metadata) if metadata.is_dir() => WatchEventKind::AddedDir,
        Ok(_) => WatchEventKind::Changed,
        Err(_) => WatchEventKind::Removed,
    }
}

/// Translate a `notify` event into reconciler events.
pub fn translate_event(event: &Event) -> Vec<(PathBuf, WatchEventKind)> {
    let paths = &event.paths;
    let each = |kind: WatchEventKind| paths.iter().map(|p| (p.clone(), kind)).collect::<Vec<_>>();
    let each_with = |classify: fn(&Path) -> WatchEventKind| {
        paths.iter().map(|p| (p.clone(), classify(p))).collect::<Vec<_>>()
    };

    let translated = match event.kind {
        EventKind::Access(_) | EventKind::Other => Vec::new(),

        EventKind::Create(CreateKind::File) => each(WatchEventKind::Added),
        EventKind::Create(CreateKind::Folder) => each(WatchEventKind::AddedDir),
        EventKind::Create(_) => each_with(present_kind),

        EventKind::Modify(ModifyKind::Name(RenameMode::From)) => each(WatchEventKind::Removed),
        EventKind::Modify(ModifyKind::Name(RenameMode::To)) => each_with(present_kind),
        EventKind::Modify(ModifyKind::Name(RenameMode::Both)) if paths.len() == 2 => {
            vec![
                (paths[0].clone(), WatchEventKind::Removed),
                (paths[1].clone(), present_kind(&paths[1])),
            ]
        }
        EventKind::Modify(ModifyKind::Name(_)) => each_with(present_or_removed),
        EventKind::Modify(_) => paths
            .iter()
            .filter(|p| !p.is_dir())
            .map(|p| (p.clone(), WatchEventKind::Changed))
            .collect(),

        EventKind::Remove(RemoveKind::Folder) => each(WatchEventKind::RemovedDir),
        EventKind::Remove(_) => each(WatchEventKind::Removed),

        EventKind::Any => each_with(present_or_removed),
    };

    if translated.is_empty() {
        trace!(kind = ?event.kind, "Dropped watcher event");
    } else {
        debug!(kind = ?event.kind, count = translated.len(), "Translated watcher event");
    }
    translated
}

#[cfg(test)]
mod tests {
    use super::*;
    use notify::event::{AccessKind, DataChange, MetadataKind};
    use tempfile::TempDir;

    fn event(kind: EventKind, paths: &[&Path]) -> Event {
        let mut event = Event::new(kind);
        for path in paths {
            event = event.add_path(path.to_path_buf());
        }
        event
    }

    #[test]
    fn test_create_events() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("f");
        let sub = dir.path().join("d");
        std::fs::write(&file, b"x").unwrap();
        std::fs::create_dir(&sub).unwrap();

        assert_eq!(
            translate_event(&event(EventKind::Create(CreateKind::File), &[&file])),
            vec![(file.clone(), WatchEventKind::Added)]
        );
        assert_eq!(
            translate_event(&event(EventKind::Create(CreateKind::Folder), &[&sub])),
            vec![(sub.clone(), WatchEventKind::AddedDir)]
        );
        assert_eq!(
            translate_event(&event(EventKind::Create(CreateKind::Any), &[&file, &sub])),
            vec![(file, WatchEventKind::Added), (sub, WatchEventKind::AddedDir)]
        );
    }

    #[test]
    fn test_modify_events() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("f");
        std::fs::write(&file, b"x").unwrap();

        for kind in [
            ModifyKind::Data(DataChange::Content),
            ModifyKind::Metadata(MetadataKind::WriteTime),
            ModifyKind::Any,
        ] {
            assert_eq!(
                translate_event(&event(EventKind::Modify(kind), &[&file])),
                vec![(file.clone(), WatchEventKind::Changed)]
            );
        }

        // Directory metadata churn is not a value change.
        assert!(
            translate_event(&event(EventKind::Modify(ModifyKind::Any), &[dir.path()])).is_empty()
        );
    }

    #[test]
    fn test_rename_events() {
        let dir = TempDir::new().unwrap();
        let old = dir.path().join("old");
        let new = dir.path().join("new");
        std::fs::write(&new, b"x").unwrap();

        let rename = |mode| EventKind::Modify(ModifyKind::Name(mode));
        assert_eq!(
            translate_event(&event(rename(RenameMode::From), &[&old])),
            vec![(old.clone(), WatchEventKind::Removed)]
        );
        assert_eq!(
            translate_event(&event(rename(RenameMode::To), &[&new])),
            vec![(new.clone(), WatchEventKind::Added)]
        );
        assert_eq!(
            translate_event(&event(rename(RenameMode::Both), &[&old, &new])),
            vec![(old.clone(), WatchEventKind::Removed), (new.clone(), WatchEventKind::Added)]
        );
        assert_eq!(
            translate_event(&event(rename(RenameMode::Any), &[&old, &new])),
            vec![(old, WatchEventKind::Removed), (new, WatchEventKind::Changed)]
        );
    }

    #[test]
    fn test_remove_and_access_events() {
        let p = Path::new("/store/gone");
        assert_eq!(
            translate_event(&event(EventKind::Remove(RemoveKind::File), &[p])),
            vec![(p.to_path_buf(), WatchEventKind::Removed)]
        );
        assert_eq!(
            translate_event(&event(EventKind::Remove(RemoveKind::Folder), &[p])),
            vec![(p.to_path_buf(), WatchEventKind::RemovedDir)]
        );
        assert!(translate_event(&event(EventKind::Access(AccessKind::Any), &[p])).is_empty());
    }
}
