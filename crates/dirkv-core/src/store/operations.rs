//! Async store operations.
//!
//! [`Store`] ties the pieces together: keys are canonicalized, each operation
//! reserves its place in the key's queue when it is called, and once its turn
//! comes the mirror tree is walked and the terminal I/O runs. Writes that pass
//! through a file node first turn that node into a directory whose previous
//! value moves to its `index` entry.

use std::fmt;
use std::future::Future;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tokio::fs;
use tracing::{debug, error, info, instrument, trace, warn};

use super::config::{CaseSensitivity, StoreOptions};
use super::metadata::{JsonMetadataStore, MetadataError, MetadataStore};
use super::metrics::{StoreMetrics, StoreMetricsSnapshot};
use super::path::{CanonicalPath, INDEX, PathError};
use super::queue::{OperationQueues, QueueSlot};
use super::reconciler::{ChangeCallback, ChangeNotification, ChangeReconciler, WatchEventKind};
use super::tree::{MirrorTree, Node, NodeKind, value_path};
#[cfg(feature = "watch")]
use super::watcher::{StoreWatcher, WatchError};
use crate::fs::attributes::{AttributeBoundary, StdAttributes};
use crate::fs::case_fold::probe_case_insensitive;
use crate::fs::name::NameError;

/// Context for store operations, providing debugging information.
#[derive(Debug, Clone, Default)]
pub struct StoreOpContext {
    /// What was being done (e.g. "write", "convert")
    pub operation: Option<&'static str>,
    /// The canonical path being operated on
    pub path: Option<String>,
    /// The entry on disk
    pub fs_path: Option<PathBuf>,
}

impl StoreOpContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_operation(mut self, operation: &'static str) -> Self {
        self.operation = Some(operation);
        self
    }

    pub fn with_path(mut self, path: &CanonicalPath) -> Self {
        self.path = Some(path.to_string());
        self
    }

    pub fn with_fs_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.fs_path = Some(path.into());
        self
    }
}

impl fmt::Display for StoreOpContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut parts = Vec::new();

        if let Some(operation) = self.operation {
            parts.push(operation.to_string());
        }
        if let Some(ref path) = self.path {
            parts.push(format!("path '{path}'"));
        }
        if let Some(ref fs_path) = self.fs_path {
            parts.push(format!("at {:?}", fs_path.display()));
        }

        if parts.is_empty() {
            write!(f, "(no context)")
        } else {
            write!(f, "{}", parts.join(", "))
        }
    }
}

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Invalid path: {0}")]
    InvalidPath(#[from] PathError),

    #[error("Filename error: {0}")]
    Name(#[from] NameError),

    #[error("IO error for {context}: {source}")]
    Io {
        #[source]
        source: io::Error,
        context: StoreOpContext,
    },

    #[error("Metadata error: {0}")]
    Metadata(#[from] MetadataError),

    #[cfg(feature = "watch")]
    #[error("Watcher error: {0}")]
    Watch(#[from] WatchError),
}

impl StoreError {
    pub fn is_invalid_path(&self) -> bool {
        matches!(self, StoreError::InvalidPath(_))
    }

    pub fn is_collision_exhausted(&self) -> bool {
        matches!(self, StoreError::Name(NameError::CollisionExhausted { .. }))
    }

    fn io(source: io::Error, context: StoreOpContext) -> Self {
        StoreError::Io { source, context }
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Whether a node was still in the tree once an operation got its turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Attachment {
    Attached,
    Detached,
}

/// Where a failed conversion left the disk.
enum ConversionFailure {
    /// The directory was never created; the node is still a file.
    BeforeDirectory(io::Error),
    /// The directory exists but the old value could not be moved into it.
    AfterDirectory(io::Error),
}

/// Opens a [`Store`] with collaborators that cannot be expressed in
/// [`StoreOptions`].
///
/// # Example
///
/// ```no_run
/// # async fn demo() -> Result<(), dirkv_core::StoreError> {
/// use dirkv_core::{StoreBuilder, StoreOptions};
///
/// let store = StoreBuilder::new(StoreOptions::new("/var/lib/app/kv"))
///     .on_change(|change| println!("{} changed on disk", change.path))
///     .open()
///     .await?;
/// store.write("settings/theme", "dark").await?;
/// # Ok(())
/// # }
/// ```
pub struct StoreBuilder {
    options: StoreOptions,
    callback: Option<ChangeCallback>,
    metadata: Option<Arc<dyn MetadataStore>>,
    attributes: Option<Arc<dyn AttributeBoundary>>,
}

impl fmt::Debug for StoreBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StoreBuilder")
            .field("options", &self.options)
            .field("has_callback", &self.callback.is_some())
            .field("metadata", &self.metadata)
            .finish_non_exhaustive()
    }
}

impl StoreBuilder {
    pub fn new(options: StoreOptions) -> Self {
        Self {
            options,
            callback: None,
            metadata: None,
            attributes: None,
        }
    }

    /// Call `callback` for every value changed or removed outside the store.
    pub fn on_change<F>(mut self, callback: F) -> Self
    where
        F: Fn(ChangeNotification) + Send + Sync + 'static,
    {
        self.callback = Some(Arc::new(callback));
        self
    }

    /// Use `store` instead of the JSON metadata store.
    pub fn metadata_store(mut self, store: Arc<dyn MetadataStore>) -> Self {
        self.metadata = Some(store);
        self
    }

    /// Use `attributes` instead of the standard permission-based boundary.
    pub fn attributes(mut self, attributes: Arc<dyn AttributeBoundary>) -> Self {
        self.attributes = Some(attributes);
        self
    }

    /// Open the store.
    ///
    /// Creates the root if needed, probes case sensitivity unless it is
    /// forced, starts the watcher and scans existing content, in that order
    /// so no change between the scan and the watch is missed.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::Io` if the root cannot be created or probed,
    /// `StoreError::Metadata` if the metadata file is unreadable, and
    /// `StoreError::Watch` if the watcher cannot start.
    #[instrument(level = "info", skip(self), fields(root = %self.options.root.display()))]
    pub async fn open(self) -> StoreResult<Store> {
        let Self {
            options,
            callback,
            metadata,
            attributes,
        } = self;
        let open_context = || StoreOpContext::new().with_operation("open").with_fs_path(&options.root);

        fs::create_dir_all(&options.root)
            .await
            .map_err(|source| StoreError::io(source, open_context()))?;
        let root = fs::canonicalize(&options.root)
            .await
            .map_err(|source| StoreError::io(source, open_context()))?;

        let case_insensitive = match options.case_sensitivity {
            CaseSensitivity::Auto => probe_case_insensitive(&root).await.map_err(|source| {
                StoreError::io(
                    source,
                    StoreOpContext::new()
                        .with_operation("probe case sensitivity")
                        .with_fs_path(&root),
                )
            })?,
            CaseSensitivity::Sensitive => false,
            CaseSensitivity::Insensitive => true,
        };

        let metadata_path = match &options.metadata_path {
            Some(path) => Some(prepare_metadata_path(path).await?),
            None => None,
        };
        let metadata: Arc<dyn MetadataStore> = match (metadata, &metadata_path) {
            (Some(store), _) => store,
            (None, Some(path)) => {
                let path = path.clone();
                let opened = tokio::task::spawn_blocking(move || JsonMetadataStore::open(&path))
                    .await
                    .map_err(|e| {
                        StoreError::io(
                            io::Error::other(e),
                            StoreOpContext::new().with_operation("open metadata"),
                        )
                    })??;
                Arc::new(opened)
            }
            (None, None) => Arc::new(JsonMetadataStore::in_memory()),
        };

        let attributes: Arc<dyn AttributeBoundary> = match attributes {
            Some(attributes) => attributes,
            None => Arc::new(StdAttributes),
        };

        let metrics = Arc::new(StoreMetrics::new());
        let tree = Arc::new(MirrorTree::new(root.clone(), case_insensitive));
        let mut reconciler = ChangeReconciler::new(
            Arc::clone(&tree),
            Arc::clone(&metadata),
            Arc::clone(&metrics),
            options.anticipation_window(),
            callback,
        );
        if let Some(path) = &metadata_path {
            reconciler = reconciler.with_ignored(path.clone());
        }
        let reconciler = Arc::new(reconciler);

        #[cfg(feature = "watch")]
        let watcher = if options.watch {
            Some(StoreWatcher::start(Arc::clone(&reconciler))?)
        } else {
            None
        };
        #[cfg(not(feature = "watch"))]
        {
            if options.watch {
                warn!("Watching requested but the `watch` feature is disabled");
            }
        }

        if options.initial_scan {
            let scanner = Arc::clone(&reconciler);
            tokio::task::spawn_blocking(move || scanner.scan_existing())
                .await
                .map_err(|e| {
                    StoreError::io(
                        io::Error::other(e),
                        StoreOpContext::new().with_operation("initial scan").with_fs_path(&root),
                    )
                })?;
        }

        info!(root = %root.display(), case_insensitive, "Store opened");
        Ok(Store {
            tree,
            queues: OperationQueues::new(Arc::clone(&metrics)),
            reconciler,
            metadata,
            attributes,
            metrics,
            #[cfg(feature = "watch")]
            watcher,
        })
    }
}

/// Make the metadata path absolute with a canonical parent, creating the
/// parent if needed, so watcher events for it can be recognized.
async fn prepare_metadata_path(path: &Path) -> StoreResult<PathBuf> {
    let context = || StoreOpContext::new().with_operation("prepare metadata path").with_fs_path(path);
    let absolute = std::path::absolute(path).map_err(|source| StoreError::io(source, context()))?;
    let (Some(parent), Some(name)) = (absolute.parent(), absolute.file_name()) else {
        return Ok(absolute);
    };
    fs::create_dir_all(parent)
        .await
        .map_err(|source| StoreError::io(source, context()))?;
    let parent = fs::canonicalize(parent)
        .await
        .map_err(|source| StoreError::io(source, context()))?;
    Ok(parent.join(name))
}

/// Hierarchical blob store backed by a directory tree.
///
/// # Thread Safety
///
/// `Store` is `Send` and `Sync`. Share it between tasks with an `Arc`, for
/// example through [`into_shared()`](Self::into_shared).
///
/// # Ordering
///
/// `read`, `write`, `delete` and the read-only accessors take their place in
/// the key's queue when they are *called*, not when the returned future is
/// first polled, so operations on one key complete in call order. Operations
/// on different keys run concurrently.
pub struct Store {
    tree: Arc<MirrorTree>,
    queues: OperationQueues,
    reconciler: Arc<ChangeReconciler>,
    metadata: Arc<dyn MetadataStore>,
    attributes: Arc<dyn AttributeBoundary>,
    metrics: Arc<StoreMetrics>,
    #[cfg(feature = "watch")]
    watcher: Option<StoreWatcher>,
}

impl fmt::Debug for Store {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Store")
            .field("root", &self.tree.root_path())
            .field("case_insensitive", &self.tree.is_case_insensitive())
            .field("pending_paths", &self.queues.len())
            .finish_non_exhaustive()
    }
}

impl Store {
    /// Open a store with default collaborators.
    ///
    /// # Errors
    ///
    /// See [`StoreBuilder::open`].
    pub async fn open(options: StoreOptions) -> StoreResult<Self> {
        StoreBuilder::new(options).open().await
    }

    pub fn builder(options: StoreOptions) -> StoreBuilder {
        StoreBuilder::new(options)
    }

    /// Wrap in an `Arc` for sharing between tasks.
    pub fn into_shared(self) -> Arc<Self> {
        Arc::new(self)
    }

    /// Canonical form of a raw key.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::InvalidPath` if the key does not decode to UTF-8.
    pub fn canonicalize(&self, path: &str) -> StoreResult<String> {
        Ok(CanonicalPath::parse(path)?.render())
    }

    /// Read the value stored at `path`. `None` means there is no value.
    ///
    /// I/O errors other than not-found are logged and also reported as `None`.
    ///
    /// # Errors
    ///
    /// Only `StoreError::InvalidPath`.
    pub fn read<'a>(
        &'a self,
        path: &str,
    ) -> impl Future<Output = StoreResult<Option<Vec<u8>>>> + Send + use<'a> {
        let reserved = self.reserve(path);
        async move {
            let (path, mut slot) = reserved?;
            slot.wait_turn().await;
            Ok(self.read_in_turn(&path).await)
        }
    }

    /// Store `value` at `path`, creating parent directories and converting
    /// file ancestors into directories as needed.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::InvalidPath` for undecodable keys,
    /// `StoreError::Name` if no sibling-unique name exists, and
    /// `StoreError::Io` if the disk refuses any step.
    pub fn write<'a, V>(
        &'a self,
        path: &str,
        value: V,
    ) -> impl Future<Output = StoreResult<()>> + Send + use<'a, V>
    where
        V: Into<Vec<u8>>,
    {
        let reserved = self.reserve(path);
        let bytes: Vec<u8> = value.into();
        async move {
            let (path, mut slot) = reserved?;
            slot.wait_turn().await;
            self.write_in_turn(&path, &bytes).await
        }
    }

    /// Remove the value at `path`. Returns whether a value was removed.
    ///
    /// Deleting a directory's value removes only its `index` entry; its
    /// children are untouched.
    ///
    /// # Errors
    ///
    /// Only `StoreError::InvalidPath`.
    pub fn delete<'a>(&'a self, path: &str) -> impl Future<Output = StoreResult<bool>> + Send + use<'a> {
        let reserved = self.reserve(path);
        async move {
            let (path, mut slot) = reserved?;
            slot.wait_turn().await;
            Ok(self.delete_in_turn(&path).await)
        }
    }

    /// Whether the value at `path` is marked read-only. Missing values are
    /// not read-only.
    ///
    /// # Errors
    ///
    /// Only `StoreError::InvalidPath`.
    pub fn is_read_only<'a>(&'a self, path: &str) -> impl Future<Output = StoreResult<bool>> + Send + use<'a> {
        let reserved = self.reserve(path);
        async move {
            let (path, mut slot) = reserved?;
            slot.wait_turn().await;
            Ok(self.is_read_only_in_turn(&path).await)
        }
    }

    /// Mark or unmark the value at `path` read-only. Returns false if there
    /// is no value.
    ///
    /// Writes through the store still succeed on read-only values.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::InvalidPath` for undecodable keys and
    /// `StoreError::Io` if the attribute cannot be changed.
    pub fn set_read_only<'a>(
        &'a self,
        path: &str,
        read_only: bool,
    ) -> impl Future<Output = StoreResult<bool>> + Send + use<'a> {
        let reserved = self.reserve(path);
        async move {
            let (path, mut slot) = reserved?;
            slot.wait_turn().await;
            self.set_read_only_in_turn(&path, read_only).await
        }
    }

    /// Feed one filesystem event to the reconciler by hand.
    ///
    /// May block briefly on metadata I/O.
    pub fn observe(&self, full_path: &Path, kind: WatchEventKind) {
        self.reconciler.on_event(full_path, kind);
    }

    pub fn metrics(&self) -> StoreMetricsSnapshot {
        self.metrics.snapshot()
    }

    pub fn metadata(&self) -> &dyn MetadataStore {
        self.metadata.as_ref()
    }

    #[inline]
    pub fn is_case_insensitive(&self) -> bool {
        self.tree.is_case_insensitive()
    }

    /// Canonical path of the backing directory.
    #[inline]
    pub fn root(&self) -> &Path {
        self.tree.root_path()
    }

    /// Number of keys with queued or running operations.
    pub fn pending_paths(&self) -> usize {
        self.queues.len()
    }

    /// Whether a filesystem watcher is running for this store.
    pub fn is_watching(&self) -> bool {
        #[cfg(feature = "watch")]
        {
            self.watcher.is_some()
        }
        #[cfg(not(feature = "watch"))]
        {
            false
        }
    }

    fn reserve(&self, raw: &str) -> StoreResult<(CanonicalPath, QueueSlot)> {
        let path = CanonicalPath::parse(raw).inspect_err(|e| {
            debug!(error = %e, "Rejected key");
        })?;
        let slot = self.queues.enqueue(&path);
        Ok((path, slot))
    }

    #[instrument(level = "debug", skip(self), fields(path = %path))]
    async fn read_in_turn(&self, path: &CanonicalPath) -> Option<Vec<u8>> {
        let Some((node, entry)) = self.resolve_existing(path).await else {
            trace!("No node for path");
            return None;
        };
        let target = value_path(node.kind(), &entry);

        match fs::read(&target).await {
            Ok(bytes) => {
                trace!(len = bytes.len(), "Read value");
                Some(bytes)
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                trace!("No value on disk");
                None
            }
            Err(e) => {
                self.metrics.record_read_failure();
                warn!(error = %e, target = %target.display(), "Read failed, reporting no value");
                None
            }
        }
    }

    #[instrument(level = "debug", skip(self, bytes), fields(path = %path, len = bytes.len()))]
    async fn write_in_turn(&self, path: &CanonicalPath, bytes: &[u8]) -> StoreResult<()> {
        let (node, entry, created) = self.walk_for_write(path).await?;
        let kind = node.kind();
        if kind == NodeKind::Directory {
            self.materialize(&node, path, &entry).await?;
        }
        let target = value_path(kind, &entry);

        self.reconciler.anticipate(path);
        if let Err(source) = self.write_value(&target, bytes).await {
            if created {
                self.tree.remove_if_same(path, &node);
            }
            return Err(StoreError::io(
                source,
                StoreOpContext::new()
                    .with_operation("write")
                    .with_path(path)
                    .with_fs_path(&target),
            ));
        }
        self.reconciler.anticipate(path);
        self.record_seen(path, &target).await;
        trace!("Value written");
        Ok(())
    }

    #[instrument(level = "debug", skip(self), fields(path = %path))]
    async fn delete_in_turn(&self, path: &CanonicalPath) -> bool {
        let Some((node, entry)) = self.resolve_existing(path).await else {
            trace!("No node for path");
            return false;
        };
        let kind = node.kind();
        let target = value_path(kind, &entry);

        self.reconciler.anticipate(path);
        match fs::remove_file(&target).await {
            Ok(()) => {
                if kind == NodeKind::File {
                    self.tree.remove_if_same(path, &node);
                }
                self.forget_seen(path).await;
                debug!("Value deleted");
                true
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                if kind == NodeKind::File {
                    self.tree.remove_if_same(path, &node);
                }
                trace!("No value on disk to delete");
                false
            }
            Err(e) => {
                warn!(error = %e, target = %target.display(), "Delete failed");
                false
            }
        }
    }

    #[instrument(level = "debug", skip(self), fields(path = %path))]
    async fn is_read_only_in_turn(&self, path: &CanonicalPath) -> bool {
        let Some((node, entry)) = self.resolve_existing(path).await else {
            return false;
        };
        let target = value_path(node.kind(), &entry);
        match self.attribute_call(&target, |attributes, p| attributes.is_read_only(p)).await {
            Ok(read_only) => read_only,
            Err(e) if e.kind() == io::ErrorKind::NotFound => false,
            Err(e) => {
                warn!(error = %e, target = %target.display(), "Could not read attributes");
                false
            }
        }
    }

    #[instrument(level = "debug", skip(self), fields(path = %path))]
    async fn set_read_only_in_turn(&self, path: &CanonicalPath, read_only: bool) -> StoreResult<bool> {
        let Some((node, entry)) = self.resolve_existing(path).await else {
            return Ok(false);
        };
        let target = value_path(node.kind(), &entry);
        match self
            .attribute_call(&target, move |attributes, p| attributes.set_read_only(p, read_only))
            .await
        {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(source) => Err(StoreError::io(
                source,
                StoreOpContext::new()
                    .with_operation("set read-only")
                    .with_path(path)
                    .with_fs_path(&target),
            )),
        }
    }

    /// Find the node for an existing key without creating anything, waiting
    /// out conversions of its ancestors.
    async fn resolve_existing(&self, path: &CanonicalPath) -> Option<(Arc<Node>, PathBuf)> {
        'walk: loop {
            let mut node = Arc::clone(self.tree.root());
            let mut entry = self.tree.root_path().to_path_buf();
            for (depth, component) in path.components().iter().enumerate() {
                if node.kind() == NodeKind::Converting {
                    let prefix = path.prefix(depth);
                    self.wait_for_conversion(&prefix).await;
                    if !self.tree.is_attached(&prefix, &node) {
                        trace!(path = %prefix, "Ancestor detached during conversion, resolving again");
                        continue 'walk;
                    }
                }
                let child = node.child(component)?;
                entry.push(child.encoded_name());
                node = child;
            }
            return Some((node, entry));
        }
    }

    /// Walk to the node for `path`, creating missing nodes and directories.
    ///
    /// Returns the terminal node, its entry on disk, and whether this walk
    /// created it.
    ///
    /// An ancestor found while walking can be detached from the tree before
    /// its conversion gets a turn, for example by a queued delete or a failed
    /// first write. The walk then starts over from the root so the missing
    /// nodes are inserted again.
    async fn walk_for_write(&self, path: &CanonicalPath) -> StoreResult<(Arc<Node>, PathBuf, bool)> {
        'walk: loop {
            let mut node = Arc::clone(self.tree.root());
            let mut entry = self.tree.root_path().to_path_buf();
            let mut created = false;

            for (depth, component) in path.components().iter().enumerate() {
                let prefix = path.prefix(depth);
                if self.ensure_directory(&node, &prefix, &entry).await? == Attachment::Detached {
                    debug!(path = %prefix, "Ancestor detached before conversion, walking again");
                    continue 'walk;
                }

                let kind = if depth + 1 == path.len() {
                    NodeKind::File
                } else {
                    NodeKind::Directory
                };
                let (child, inserted) = node.child_or_insert(component, kind)?;
                entry.push(child.encoded_name());
                node = child;
                created = inserted;
            }

            return Ok((node, entry, created));
        }
    }

    /// Make sure `node` is a directory that exists on disk.
    ///
    /// Returns `Attachment::Detached` without touching the disk if `node`
    /// left the tree while this call waited for its turn.
    async fn ensure_directory(
        &self,
        node: &Arc<Node>,
        path: &CanonicalPath,
        entry: &Path,
    ) -> StoreResult<Attachment> {
        loop {
            match node.kind() {
                NodeKind::Directory => {
                    self.materialize(node, path, entry).await?;
                    return Ok(Attachment::Attached);
                }
                NodeKind::File => {
                    if self.convert_to_directory(node, path, entry).await? == Attachment::Detached {
                        return Ok(Attachment::Detached);
                    }
                }
                NodeKind::Converting => {
                    self.wait_for_conversion(path).await;
                    if !self.tree.is_attached(path, node) {
                        return Ok(Attachment::Detached);
                    }
                }
            }
        }
    }

    async fn wait_for_conversion(&self, path: &CanonicalPath) {
        trace!(path = %path, "Waiting for conversion");
        let mut slot = self.queues.enqueue(path);
        slot.wait_turn().await;
    }

    async fn materialize(&self, node: &Node, path: &CanonicalPath, entry: &Path) -> StoreResult<()> {
        if node.is_materialized() {
            return Ok(());
        }
        node.materialize(|| async {
            match fs::create_dir(entry).await {
                Ok(()) => {
                    self.metrics.record_directory_created();
                    debug!(path = %path, "Created directory");
                    Ok(())
                }
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => Ok(()),
                Err(e) => Err(e),
            }
        })
        .await
        .map_err(|source| {
            StoreError::io(
                source,
                StoreOpContext::new()
                    .with_operation("create directory")
                    .with_path(path)
                    .with_fs_path(entry),
            )
        })
    }

    /// Turn the file node at `path` into a directory, moving its value to
    /// the `index` entry. Runs in `path`'s own queue.
    #[instrument(level = "info", skip(self, node, entry), fields(path = %path))]
    async fn convert_to_directory(
        &self,
        node: &Arc<Node>,
        path: &CanonicalPath,
        entry: &Path,
    ) -> StoreResult<Attachment> {
        let mut slot = self.queues.enqueue(path);
        slot.wait_turn().await;

        if !self.tree.is_attached(path, node) {
            trace!("Node detached while queued, not converting");
            return Ok(Attachment::Detached);
        }
        if !node.transition(NodeKind::File, NodeKind::Converting) {
            trace!("Node already converted");
            return Ok(Attachment::Attached);
        }
        let _settle = ConversionGuard { node, entry };
        self.reconciler.anticipate(path);

        let context = || {
            StoreOpContext::new()
                .with_operation("convert to directory")
                .with_path(path)
                .with_fs_path(entry)
        };
        match move_value_into_index(entry).await {
            Ok(()) => {
                node.mark_materialized();
                node.set_kind(NodeKind::Directory);
                self.metrics.record_conversion();
                self.reconciler.anticipate(path);
                info!("Converted file node to directory");
                Ok(Attachment::Attached)
            }
            Err(ConversionFailure::BeforeDirectory(source)) => {
                node.set_kind(NodeKind::File);
                warn!(error = %source, "Conversion failed, node stays a file");
                Err(StoreError::io(source, context()))
            }
            Err(ConversionFailure::AfterDirectory(source)) => {
                node.mark_materialized();
                node.set_kind(NodeKind::Directory);
                warn!(error = %source, "Directory created but value could not be moved into it");
                Err(StoreError::io(source, context()))
            }
        }
    }

    async fn write_value(&self, target: &Path, bytes: &[u8]) -> io::Result<()> {
        let read_only = self
            .attribute_call(target, |attributes, p| attributes.is_read_only(p))
            .await
            .unwrap_or(false);
        if read_only {
            debug!(target = %target.display(), "Clearing read-only flag for write");
            self.attribute_call(target, |attributes, p| attributes.set_read_only(p, false))
                .await?;
        }

        let result = fs::write(target, bytes).await;

        if read_only
            && let Err(e) = self
                .attribute_call(target, |attributes, p| attributes.set_read_only(p, true))
                .await
        {
            warn!(error = %e, target = %target.display(), "Failed to restore read-only flag");
        }
        result
    }

    async fn attribute_call<T, F>(&self, target: &Path, op: F) -> io::Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&dyn AttributeBoundary, &Path) -> io::Result<T> + Send + 'static,
    {
        let attributes = Arc::clone(&self.attributes);
        let target = target.to_path_buf();
        tokio::task::spawn_blocking(move || op(attributes.as_ref(), &target))
            .await
            .map_err(io::Error::other)?
    }

    async fn record_seen(&self, path: &CanonicalPath, target: &Path) {
        let modified = match fs::metadata(target).await.and_then(|m| m.modified()) {
            Ok(modified) => modified,
            Err(e) => {
                debug!(path = %path, error = %e, "No modification time to record");
                return;
            }
        };
        let metadata = Arc::clone(&self.metadata);
        let key = path.clone();
        match tokio::task::spawn_blocking(move || metadata.mark_as_seen(&key, modified)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(path = %path, error = %e, "Failed to record write time"),
            Err(e) => warn!(path = %path, error = %e, "Metadata task failed"),
        }
    }

    async fn forget_seen(&self, path: &CanonicalPath) {
        let metadata = Arc::clone(&self.metadata);
        let key = path.clone();
        match tokio::task::spawn_blocking(move || metadata.delete(&key)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(path = %path, error = %e, "Failed to forget deleted value"),
            Err(e) => warn!(path = %path, error = %e, "Metadata task failed"),
        }
    }
}

/// Settles a node left `Converting` when its conversion is dropped midway,
/// using whatever is on disk.
struct ConversionGuard<'a> {
    node: &'a Node,
    entry: &'a Path,
}

impl Drop for ConversionGuard<'_> {
    fn drop(&mut self) {
        if self.node.kind() != NodeKind::Converting {
            return;
        }
        if std::fs::symlink_metadata(self.entry).is_ok_and(|m| m.is_dir()) {
            self.node.mark_materialized();
            self.node.set_kind(NodeKind::Directory);
        } else {
            self.node.set_kind(NodeKind::File);
        }
        warn!(entry = %self.entry.display(), kind = ?self.node.kind(), "Conversion abandoned");
    }
}

/// Replace the file at `entry` with a directory holding the old content as
/// its `index` entry.
async fn move_value_into_index(entry: &Path) -> Result<(), ConversionFailure> {
    let prior = match fs::read(entry).await {
        Ok(bytes) => Some(bytes),
        Err(e) if e.kind() == io::ErrorKind::NotFound => None,
        Err(e) => return Err(ConversionFailure::BeforeDirectory(e)),
    };

    if prior.is_some() {
        match fs::remove_file(entry).await {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(ConversionFailure::BeforeDirectory(e)),
        }
    }

    if let Err(e) = fs::create_dir(entry).await
        && e.kind() != io::ErrorKind::AlreadyExists
    {
        if let Some(bytes) = &prior
            && let Err(restore) = fs::write(entry, bytes).await
        {
            error!(error = %restore, entry = %entry.display(), "Failed to restore value after conversion failure");
        }
        return Err(ConversionFailure::BeforeDirectory(e));
    }

    if let Some(bytes) = prior {
        fs::write(entry.join(INDEX), bytes)
            .await
            .map_err(ConversionFailure::AfterDirectory)?;
    }
    Ok(())
}
