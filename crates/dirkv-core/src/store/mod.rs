//! Store-level abstractions and operations

pub mod config;
pub mod metadata;
pub mod metrics;
pub mod operations;
pub mod path;
pub mod queue;
pub mod reconciler;
pub mod tree;

#[cfg(feature = "watch")]
pub mod watcher;

#[cfg(feature = "watch")]
pub use watcher::{StoreWatcher, WatchError, translate_event};

// Re-export commonly used types
pub use config::{CaseSensitivity, ConfigError, DEFAULT_ANTICIPATION_WINDOW_MS, StoreOptions};
pub use metadata::{Annotations, JsonMetadataStore, MetadataError, MetadataStore};
pub use metrics::{StoreMetrics, StoreMetricsSnapshot};
pub use operations::{Store, StoreBuilder, StoreError, StoreOpContext, StoreResult};
pub use path::{CanonicalPath, Component, PathError};
pub use queue::{OperationQueues, QueueSlot};
pub use reconciler::{
    ChangeCallback, ChangeKind, ChangeNotification, ChangeReconciler, WatchEventKind,
};
pub use tree::{MirrorTree, Node, NodeKind};
