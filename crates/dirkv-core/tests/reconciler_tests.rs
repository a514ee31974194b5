//! Tests for reconciling changes made outside the store.
//!
//! Events are fed by hand through `Store::observe` unless a test says
//! otherwise, so timing does not depend on the platform watcher.

mod common;

use common::{disk_path, init_tracing, test_options};
use dirkv_core::store::Annotations;
use dirkv_core::{
    CanonicalPath, ChangeKind, ChangeNotification, Store, StoreBuilder, StoreOptions,
    WatchEventKind,
};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};
use tempfile::TempDir;

type Seen = Arc<Mutex<Vec<ChangeNotification>>>;

async fn open_recording(options: StoreOptions) -> (Store, Seen) {
    init_tracing();
    let seen: Seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let store = StoreBuilder::new(options)
        .on_change(move |change| sink.lock().unwrap().push(change))
        .open()
        .await
        .expect("Failed to open store");
    (store, seen)
}

fn path(raw: &str) -> CanonicalPath {
    CanonicalPath::parse(raw).unwrap()
}

/// Rewrite `file` and stamp it with a modification time in the future.
fn touch_newer(file: &std::path::Path, content: &[u8]) {
    std::fs::write(file, content).unwrap();
    let handle = std::fs::File::options().write(true).open(file).unwrap();
    handle
        .set_modified(SystemTime::now() + Duration::from_secs(60))
        .unwrap();
}

#[tokio::test]
async fn test_external_file_is_adopted_and_reported() {
    let dir = TempDir::new().unwrap();
    let (store, seen) = open_recording(test_options(&dir)).await;

    let file = disk_path(&store, &["external"]);
    std::fs::write(&file, b"from outside").unwrap();
    store.observe(&file, WatchEventKind::Added);
    store.observe(&file, WatchEventKind::Changed);

    {
        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1, "same mtime must be reported once");
        assert_eq!(seen[0].path, path("external"));
        assert_eq!(seen[0].kind, ChangeKind::Changed);
        assert!(seen[0].modified.is_some());
    }
    assert_eq!(
        store.read("external").await.unwrap(),
        Some(b"from outside".to_vec())
    );
}

#[tokio::test]
async fn test_own_writes_are_not_reported() {
    let dir = TempDir::new().unwrap();
    let (store, seen) = open_recording(test_options(&dir)).await;

    store.write("mine", "v").await.unwrap();
    store.observe(&disk_path(&store, &["mine"]), WatchEventKind::Added);
    store.observe(&disk_path(&store, &["mine"]), WatchEventKind::Changed);

    assert!(seen.lock().unwrap().is_empty());
    assert!(store.metrics().events_suppressed >= 2);
}

#[tokio::test]
async fn test_late_echo_of_own_write_is_not_reported() {
    let dir = TempDir::new().unwrap();
    let options = test_options(&dir).with_anticipation_window(Duration::from_millis(10));
    let (store, seen) = open_recording(options).await;

    store.write("mine", "v").await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    store.observe(&disk_path(&store, &["mine"]), WatchEventKind::Changed);

    assert!(seen.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_newer_external_change_is_reported() {
    let dir = TempDir::new().unwrap();
    let options = test_options(&dir).with_anticipation_window(Duration::from_millis(10));
    let (store, seen) = open_recording(options).await;

    store.write("shared", "ours").await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    let file = disk_path(&store, &["shared"]);
    touch_newer(&file, b"theirs");
    store.observe(&file, WatchEventKind::Changed);

    let seen = seen.lock().unwrap();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].path, path("shared"));
    assert_eq!(seen[0].kind, ChangeKind::Changed);
}

#[tokio::test]
async fn test_external_removal_is_reported() {
    let dir = TempDir::new().unwrap();
    let (store, seen) = open_recording(test_options(&dir)).await;

    let file = disk_path(&store, &["doomed"]);
    std::fs::write(&file, b"v").unwrap();
    store.observe(&file, WatchEventKind::Added);

    std::fs::remove_file(&file).unwrap();
    store.observe(&file, WatchEventKind::Removed);

    {
        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[1].path, path("doomed"));
        assert_eq!(seen[1].kind, ChangeKind::Removed);
        assert_eq!(seen[1].modified, None);
    }
    assert!(!store.metadata().has_been_seen(&path("doomed")));
    assert_eq!(store.read("doomed").await.unwrap(), None);
}

#[tokio::test]
async fn test_removal_of_present_entry_is_ignored() {
    let dir = TempDir::new().unwrap();
    let (store, seen) = open_recording(test_options(&dir)).await;

    let file = disk_path(&store, &["still-here"]);
    std::fs::write(&file, b"v").unwrap();
    store.observe(&file, WatchEventKind::Added);
    store.observe(&file, WatchEventKind::Removed);

    assert_eq!(seen.lock().unwrap().len(), 1);
    assert_eq!(store.read("still-here").await.unwrap(), Some(b"v".to_vec()));
}

#[tokio::test]
async fn test_directory_value_events() {
    let dir = TempDir::new().unwrap();
    let (store, seen) = open_recording(test_options(&dir)).await;

    let folder = disk_path(&store, &["folder"]);
    std::fs::create_dir(&folder).unwrap();
    store.observe(&folder, WatchEventKind::AddedDir);
    assert!(seen.lock().unwrap().is_empty(), "directories never fire");

    std::fs::write(folder.join("index"), b"folder value").unwrap();
    store.observe(&folder.join("index"), WatchEventKind::Added);
    assert_eq!(seen.lock().unwrap()[0].path, path("folder"));

    // The adopted directory takes children without conversion.
    store.write("folder/child", "c").await.unwrap();
    assert_eq!(store.metrics().conversions, 0);
    assert_eq!(
        store.read("folder").await.unwrap(),
        Some(b"folder value".to_vec())
    );
}

#[tokio::test]
async fn test_removed_directory_drops_subtree() {
    let dir = TempDir::new().unwrap();
    let (store, _seen) = open_recording(test_options(&dir)).await;

    store.write("tree/leaf", "v").await.unwrap();
    let folder = disk_path(&store, &["tree"]);
    std::fs::remove_dir_all(&folder).unwrap();
    store.observe(&folder, WatchEventKind::RemovedDir);

    assert_eq!(store.read("tree/leaf").await.unwrap(), None);
    // A new write recreates the hierarchy.
    store.write("tree/leaf", "again").await.unwrap();
    assert_eq!(
        std::fs::read(folder.join("leaf")).unwrap(),
        b"again"
    );
}

#[tokio::test]
async fn test_events_that_are_not_values_are_ignored() {
    let dir = TempDir::new().unwrap();
    let (store, seen) = open_recording(test_options(&dir)).await;

    let outside = dir.path().join("outside");
    std::fs::write(&outside, b"v").unwrap();
    store.observe(&outside, WatchEventKind::Added);

    let nested_index = disk_path(&store, &["a", "index", "b"]);
    std::fs::create_dir_all(nested_index.parent().unwrap()).unwrap();
    std::fs::write(&nested_index, b"v").unwrap();
    store.observe(&nested_index, WatchEventKind::Added);

    store.observe(store.root(), WatchEventKind::AddedDir);

    assert!(seen.lock().unwrap().is_empty());
    assert_eq!(store.metrics().events_observed, 3);
}

#[tokio::test]
async fn test_initial_scan_adopts_existing_content() {
    init_tracing();
    let dir = TempDir::new().unwrap();
    let options = test_options(&dir);
    let root = options.root.clone();
    std::fs::create_dir_all(root.join("dir")).unwrap();
    std::fs::write(root.join("pr%6E"), b"device").unwrap();
    std::fs::write(root.join("dir").join("index"), b"dir value").unwrap();
    std::fs::write(root.join("dir").join("child"), b"child").unwrap();

    let (store, seen) = open_recording(options).await;

    let mut reported: Vec<_> = seen.lock().unwrap().iter().map(|n| n.path.render()).collect();
    reported.sort();
    assert_eq!(reported, vec!["dir", "dir/child", "prn"]);

    assert_eq!(store.read("prn").await.unwrap(), Some(b"device".to_vec()));
    assert_eq!(store.read("dir").await.unwrap(), Some(b"dir value".to_vec()));
    assert_eq!(store.read("dir/child").await.unwrap(), Some(b"child".to_vec()));

    // Scanned files convert like written ones.
    store.write("prn/sub", "s").await.unwrap();
    assert_eq!(store.read("prn").await.unwrap(), Some(b"device".to_vec()));
    assert!(root.join("pr%6E").join("index").is_file());
}

#[tokio::test]
async fn test_metadata_persists_across_reopen() {
    init_tracing();
    let dir = TempDir::new().unwrap();
    let options = test_options(&dir).with_metadata_path(dir.path().join("meta").join("store.json"));

    {
        let (store, seen) = open_recording(options.clone()).await;
        store.write("kept", "v").await.unwrap();
        let mut annotations = Annotations::new();
        annotations.insert("owner".into(), "tests".into());
        store.metadata().set(&path("kept"), annotations).unwrap();
        assert!(seen.lock().unwrap().is_empty());
    }

    let (store, seen) = open_recording(options).await;
    assert!(
        seen.lock().unwrap().is_empty(),
        "values already seen before the restart are not reported again"
    );
    assert!(store.metadata().has_been_seen(&path("kept")));
    let annotations = store.metadata().get(&path("kept")).unwrap();
    assert_eq!(annotations.get("owner").and_then(|v| v.as_str()), Some("tests"));
    assert_eq!(store.read("kept").await.unwrap(), Some(b"v".to_vec()));
}

#[tokio::test]
async fn test_metadata_file_under_root_is_not_a_value() {
    init_tracing();
    let dir = TempDir::new().unwrap();
    let options = test_options(&dir);
    let options = options.clone().with_metadata_path(options.root.join("meta.json"));

    {
        let (store, _seen) = open_recording(options.clone()).await;
        store.write("a", "v").await.unwrap();
        assert!(store.root().join("meta.json").is_file());
    }

    let (store, seen) = open_recording(options).await;
    assert!(seen.lock().unwrap().is_empty());
    assert_eq!(store.read("meta.json").await.unwrap(), None);
}

#[cfg(feature = "watch")]
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_watcher_reports_external_writes() {
    init_tracing();
    let dir = TempDir::new().unwrap();
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    let store = StoreBuilder::new(test_options(&dir).with_watch(true))
        .on_change(move |change| {
            let _ = tx.send(change);
        })
        .open()
        .await
        .unwrap();
    assert!(store.is_watching());

    std::fs::write(store.root().join("dropped-in"), b"hello").unwrap();

    let change = tokio::time::timeout(Duration::from_secs(10), rx.recv())
        .await
        .expect("no change reported by the watcher")
        .expect("callback channel closed");
    assert_eq!(change.path, path("dropped-in"));
    assert_eq!(change.kind, ChangeKind::Changed);
}
