//! Shared helpers for store integration tests.

#![allow(dead_code)]

use dirkv_core::{CaseSensitivity, Store, StoreOptions};
use std::path::PathBuf;
use std::sync::Once;
use tempfile::TempDir;
use tracing_subscriber::EnvFilter;

static TRACING: Once = Once::new();

/// Install a test-writer subscriber once per test binary. Honors `RUST_LOG`.
pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
            )
            .with_test_writer()
            .try_init();
    });
}

/// Options for a store under `dir` with watching disabled, so tests drive
/// the reconciler by hand.
pub fn test_options(dir: &TempDir) -> StoreOptions {
    StoreOptions::new(dir.path().join("store"))
        .with_case_sensitivity(CaseSensitivity::Sensitive)
        .with_watch(false)
}

/// Open a case-sensitive, unwatched store in a fresh temp directory.
pub async fn open_test_store() -> (TempDir, Store) {
    init_tracing();
    let dir = TempDir::new().expect("Failed to create temp dir");
    let store = Store::open(test_options(&dir))
        .await
        .expect("Failed to open store");
    (dir, store)
}

/// Join encoded entry names under the store root.
pub fn disk_path(store: &Store, names: &[&str]) -> PathBuf {
    let mut path = store.root().to_path_buf();
    for name in names {
        path.push(name);
    }
    path
}
