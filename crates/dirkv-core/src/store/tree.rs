//! In-memory mirror of the on-disk hierarchy.
//!
//! Each [`Node`] knows the literal name of its entry on disk and guards its
//! kind, children and case-fold index with its own mutex. The mutex is never
//! held across an await; every method that takes it finishes synchronously.
//! Nodes are owned parent to child through `Arc`s and never point back up.

use std::collections::HashMap;
use std::future::Future;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::OnceCell;
use tracing::{error, trace};

use super::path::{CanonicalPath, Component, INDEX};
use crate::fs::case_fold::{self, FoldIndex};
use crate::fs::name::{NameContext, NameError};

/// What a node currently is on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    /// A regular file holding the node's value.
    File,
    /// A directory; its value, if any, lives in the `index` child entry.
    Directory,
    /// A file being turned into a directory.
    Converting,
}

#[derive(Debug)]
struct NodeState {
    kind: NodeKind,
    children: HashMap<Component, Arc<Node>>,
    fold_index: Option<FoldIndex>,
}

/// One entry of the mirror tree.
#[derive(Debug)]
pub struct Node {
    encoded_name: String,
    state: Mutex<NodeState>,
    materialized: OnceCell<()>,
}

impl Node {
    fn new(encoded_name: String, kind: NodeKind, case_insensitive: bool) -> Self {
        Self {
            encoded_name,
            state: Mutex::new(NodeState {
                kind,
                children: HashMap::new(),
                fold_index: case_insensitive.then(reserved_fold_index),
            }),
            materialized: OnceCell::new(),
        }
    }

    fn state(&self) -> MutexGuard<'_, NodeState> {
        // A poisoned node still holds a consistent map; recover it.
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Name of this node's entry inside its parent directory.
    #[inline]
    pub fn encoded_name(&self) -> &str {
        &self.encoded_name
    }

    pub fn kind(&self) -> NodeKind {
        self.state().kind
    }

    pub(crate) fn set_kind(&self, kind: NodeKind) {
        self.state().kind = kind;
    }

    /// Move from `from` to `to`, returning false if the node was in another
    /// state.
    pub(crate) fn transition(&self, from: NodeKind, to: NodeKind) -> bool {
        let mut state = self.state();
        if state.kind == from {
            state.kind = to;
            true
        } else {
            false
        }
    }

    /// Whether the directory for this node is known to exist on disk.
    #[inline]
    pub fn is_materialized(&self) -> bool {
        self.materialized.initialized()
    }

    pub(crate) fn mark_materialized(&self) {
        let _ = self.materialized.set(());
    }

    /// Run `create` once for this node's directory.
    ///
    /// Concurrent callers wait for the single in-flight creation. If it fails
    /// the node stays unmaterialized and the next caller tries again.
    pub(crate) async fn materialize<F, Fut>(&self, create: F) -> io::Result<()>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = io::Result<()>>,
    {
        self.materialized.get_or_try_init(create).await.map(|_| ())
    }

    pub fn child(&self, component: &Component) -> Option<Arc<Node>> {
        self.state().children.get(component).cloned()
    }

    pub fn child_count(&self) -> usize {
        self.state().children.len()
    }

    /// Components of all current children, in no particular order.
    pub fn child_components(&self) -> Vec<Component> {
        self.state().children.keys().cloned().collect()
    }

    /// Get the child for `component`, creating it with `kind` if missing.
    ///
    /// The lookup and insertion happen under this node's mutex. A new child's
    /// name is the encoded component, adjusted against siblings when the tree
    /// is case-insensitive. Returns whether the child was created.
    pub(crate) fn child_or_insert(
        &self,
        component: &Component,
        kind: NodeKind,
    ) -> Result<(Arc<Node>, bool), NameError> {
        let mut state = self.state();
        if let Some(existing) = state.children.get(component) {
            return Ok((Arc::clone(existing), false));
        }

        let candidate = component.encode();
        let case_insensitive = state.fold_index.is_some();
        let encoded_name = match state.fold_index.as_mut() {
            Some(index) => {
                let resolved = case_fold::resolve(&candidate, index).map_err(|e| {
                    error!(
                        component = %component,
                        parent = %self.encoded_name,
                        "Cannot create node: case-fold collision exhausted"
                    );
                    match e {
                        NameError::CollisionExhausted { .. } => NameError::CollisionExhausted {
                            context: NameContext::new()
                                .with_component(component.as_str())
                                .with_encoded_name(&candidate)
                                .with_parent(&self.encoded_name),
                        },
                        other => other,
                    }
                })?;
                case_fold::register(index, &resolved);
                resolved
            }
            None => candidate,
        };

        trace!(component = %component, encoded = %encoded_name, ?kind, "Created node");
        let child = Arc::new(Node::new(encoded_name, kind, case_insensitive));
        state.children.insert(component.clone(), Arc::clone(&child));
        Ok((child, true))
    }

    /// Get the child for `component`, creating it under the name it has on
    /// disk if missing.
    pub(crate) fn child_or_insert_observed(
        &self,
        component: &Component,
        encoded_name: &str,
        kind: NodeKind,
    ) -> (Arc<Node>, bool) {
        let mut state = self.state();
        if let Some(existing) = state.children.get(component) {
            return (Arc::clone(existing), false);
        }

        let case_insensitive = state.fold_index.is_some();
        if let Some(index) = state.fold_index.as_mut() {
            case_fold::register(index, encoded_name);
        }
        trace!(component = %component, encoded = encoded_name, ?kind, "Adopted node from disk");
        let child = Arc::new(Node::new(encoded_name.to_owned(), kind, case_insensitive));
        state.children.insert(component.clone(), Arc::clone(&child));
        (child, true)
    }

    /// Detach the child for `component` if it is `expected`.
    pub(crate) fn remove_child_if_same(&self, component: &Component, expected: &Arc<Node>) -> bool {
        let mut state = self.state();
        let same = state
            .children
            .get(component)
            .is_some_and(|child| Arc::ptr_eq(child, expected));
        if !same {
            return false;
        }
        state.children.remove(component);
        if let Some(index) = state.fold_index.as_mut() {
            case_fold::unregister(index, &expected.encoded_name);
        }
        true
    }

    /// Whether `name` is currently used by a child, compared the way the
    /// backing filesystem compares names.
    pub fn has_encoded_child(&self, name: &str) -> bool {
        let state = self.state();
        match &state.fold_index {
            Some(index) => index.contains_key(&case_fold::fold(name)),
            None => state.children.values().any(|child| child.encoded_name == name),
        }
    }
}

/// Fold index with the `index` value entry already taken, so no child can
/// fold onto a directory's own value.
fn reserved_fold_index() -> FoldIndex {
    let mut index = FoldIndex::new();
    case_fold::register(&mut index, INDEX);
    index
}

/// Where a node's value lives, given its kind and entry path.
pub fn value_path(kind: NodeKind, entry: &Path) -> PathBuf {
    match kind {
        NodeKind::Directory => entry.join(INDEX),
        NodeKind::File | NodeKind::Converting => entry.to_path_buf(),
    }
}

/// The node graph rooted at the store directory.
#[derive(Debug)]
pub struct MirrorTree {
    root: Arc<Node>,
    root_path: PathBuf,
    case_insensitive: bool,
}

impl MirrorTree {
    /// Create a tree whose root directory already exists at `root_path`.
    pub fn new(root_path: PathBuf, case_insensitive: bool) -> Self {
        let root = Node::new(String::new(), NodeKind::Directory, case_insensitive);
        root.mark_materialized();
        Self {
            root: Arc::new(root),
            root_path,
            case_insensitive,
        }
    }

    #[inline]
    pub fn root(&self) -> &Arc<Node> {
        &self.root
    }

    #[inline]
    pub fn root_path(&self) -> &Path {
        &self.root_path
    }

    #[inline]
    pub fn is_case_insensitive(&self) -> bool {
        self.case_insensitive
    }

    /// Find the node for `path` without creating anything.
    ///
    /// Returns the node and the path of its entry on disk.
    pub fn lookup(&self, path: &CanonicalPath) -> Option<(Arc<Node>, PathBuf)> {
        let mut node = Arc::clone(&self.root);
        let mut entry = self.root_path.clone();
        for component in path.components() {
            let child = node.child(component)?;
            entry.push(child.encoded_name());
            node = child;
        }
        Some((node, entry))
    }

    /// Whether `node` is still the node the tree holds for `path`.
    pub fn is_attached(&self, path: &CanonicalPath, node: &Arc<Node>) -> bool {
        self.lookup(path)
            .is_some_and(|(current, _)| Arc::ptr_eq(&current, node))
    }

    /// Detach the node at `path` from its parent if it is still `expected`.
    pub fn remove_if_same(&self, path: &CanonicalPath, expected: &Arc<Node>) -> bool {
        let (Some(parent), Some(name)) = (path.parent(), path.file_name()) else {
            return false;
        };
        match self.lookup(&parent) {
            Some((parent_node, _)) => parent_node.remove_child_if_same(name, expected),
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn component(s: &str) -> Component {
        Component::new(s).unwrap()
    }

    #[test]
    fn test_root_is_materialized_directory() {
        let tree = MirrorTree::new(PathBuf::from("/store"), false);
        assert_eq!(tree.root().kind(), NodeKind::Directory);
        assert!(tree.root().is_materialized());
        let (node, entry) = tree.lookup(&CanonicalPath::root()).unwrap();
        assert!(Arc::ptr_eq(&node, tree.root()));
        assert_eq!(entry, PathBuf::from("/store"));
    }

    #[test]
    fn test_child_or_insert_is_idempotent() {
        let tree = MirrorTree::new(PathBuf::from("/store"), false);
        let (first, created) = tree.root().child_or_insert(&component("a"), NodeKind::File).unwrap();
        assert!(created);
        let (second, created) =
            tree.root().child_or_insert(&component("a"), NodeKind::Directory).unwrap();
        assert!(!created);
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(second.kind(), NodeKind::File);
    }

    #[test]
    fn test_names_are_encoded() {
        let tree = MirrorTree::new(PathBuf::from("/store"), false);
        let (node, _) = tree.root().child_or_insert(&component("con"), NodeKind::File).unwrap();
        assert_eq!(node.encoded_name(), "co%6E");

        let path = CanonicalPath::parse("con").unwrap();
        let (_, entry) = tree.lookup(&path).unwrap();
        assert_eq!(entry, PathBuf::from("/store/co%6E"));
    }

    #[test]
    fn test_case_insensitive_siblings_get_distinct_names() {
        let tree = MirrorTree::new(PathBuf::from("/store"), true);
        let (upper, _) = tree.root().child_or_insert(&component("File"), NodeKind::File).unwrap();
        let (lower, _) = tree.root().child_or_insert(&component("file"), NodeKind::File).unwrap();
        assert_eq!(upper.encoded_name(), "File");
        assert_eq!(lower.encoded_name(), "fil%65");
        assert!(tree.root().has_encoded_child("FILE"));

        // Case-sensitive trees leave both names alone.
        let tree = MirrorTree::new(PathBuf::from("/store"), false);
        tree.root().child_or_insert(&component("File"), NodeKind::File).unwrap();
        let (lower, _) = tree.root().child_or_insert(&component("file"), NodeKind::File).unwrap();
        assert_eq!(lower.encoded_name(), "file");
    }

    #[test]
    fn test_case_insensitive_children_avoid_index_entry() {
        let tree = MirrorTree::new(PathBuf::from("/store"), true);
        let (node, _) = tree.root().child_or_insert(&component("Index"), NodeKind::File).unwrap();
        assert_eq!(node.encoded_name(), "Inde%78");
        let (node, _) = tree.root().child_or_insert(&component("INDEX"), NodeKind::File).unwrap();
        assert_eq!(node.encoded_name(), "INDE%58");
        assert!(tree.root().has_encoded_child("INDEX"));

        let tree = MirrorTree::new(PathBuf::from("/store"), false);
        let (node, _) = tree.root().child_or_insert(&component("Index"), NodeKind::File).unwrap();
        assert_eq!(node.encoded_name(), "Index");
    }

    #[test]
    fn test_is_attached() {
        let tree = MirrorTree::new(PathBuf::from("/store"), false);
        let path = CanonicalPath::parse("a").unwrap();
        let (old, _) = tree.root().child_or_insert(&component("a"), NodeKind::File).unwrap();
        assert!(tree.is_attached(&path, &old));

        assert!(tree.remove_if_same(&path, &old));
        assert!(!tree.is_attached(&path, &old));

        let (new, _) = tree.root().child_or_insert(&component("a"), NodeKind::File).unwrap();
        assert!(tree.is_attached(&path, &new));
        assert!(!tree.is_attached(&path, &old));
    }

    #[test]
    fn test_remove_releases_folded_name() {
        let tree = MirrorTree::new(PathBuf::from("/store"), true);
        let (upper, _) = tree.root().child_or_insert(&component("File"), NodeKind::File).unwrap();
        let path = CanonicalPath::parse("File").unwrap();
        assert!(tree.remove_if_same(&path, &upper));
        assert!(!tree.remove_if_same(&path, &upper));
        assert_eq!(tree.root().child_count(), 0);

        let (lower, _) = tree.root().child_or_insert(&component("file"), NodeKind::File).unwrap();
        assert_eq!(lower.encoded_name(), "file");
    }

    #[test]
    fn test_remove_ignores_replaced_node() {
        let tree = MirrorTree::new(PathBuf::from("/store"), false);
        let (old, _) = tree.root().child_or_insert(&component("a"), NodeKind::File).unwrap();
        let path = CanonicalPath::parse("a").unwrap();
        assert!(tree.remove_if_same(&path, &old));
        let (new, _) = tree.root().child_or_insert(&component("a"), NodeKind::File).unwrap();
        assert!(!tree.remove_if_same(&path, &old));
        assert!(Arc::ptr_eq(&tree.lookup(&path).unwrap().0, &new));
    }

    #[test]
    fn test_observed_children_keep_disk_names() {
        let tree = MirrorTree::new(PathBuf::from("/store"), true);
        let (node, created) =
            tree.root().child_or_insert_observed(&component("Report"), "Repor%74", NodeKind::File);
        assert!(created);
        assert_eq!(node.encoded_name(), "Repor%74");
        assert!(tree.root().has_encoded_child("repor%74"));
    }

    #[test]
    fn test_transition() {
        let tree = MirrorTree::new(PathBuf::from("/store"), false);
        let (node, _) = tree.root().child_or_insert(&component("a"), NodeKind::File).unwrap();
        assert!(node.transition(NodeKind::File, NodeKind::Converting));
        assert!(!node.transition(NodeKind::File, NodeKind::Converting));
        assert_eq!(node.kind(), NodeKind::Converting);
    }

    #[test]
    fn test_value_path() {
        let entry = Path::new("/store/a");
        assert_eq!(value_path(NodeKind::File, entry), PathBuf::from("/store/a"));
        assert_eq!(value_path(NodeKind::Directory, entry), PathBuf::from("/store/a/index"));
    }

    #[tokio::test]
    async fn test_materialize_retries_after_failure() {
        let tree = MirrorTree::new(PathBuf::from("/store"), false);
        let (node, _) = tree.root().child_or_insert(&component("d"), NodeKind::Directory).unwrap();

        let failed = node.materialize(|| async { Err(io::Error::other("disk full")) }).await;
        assert!(failed.is_err());
        assert!(!node.is_materialized());

        node.materialize(|| async { Ok(()) }).await.unwrap();
        assert!(node.is_materialized());

        // Already materialized: the closure is not run again.
        node.materialize(|| async { Err(io::Error::other("unreachable")) }).await.unwrap();
    }
}
