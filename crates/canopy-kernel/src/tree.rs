//! The resource tree.
//!
//! A persistent, copy-on-write hierarchy of [`Node`]s shared through `Arc`.
//! Cloning a [`ResourceTree`] is the snapshot operation: it copies one
//! pointer, and later writes through [`Arc::make_mut`] copy only the nodes
//! on the path they touch. Two snapshots can therefore be diffed node by
//! node, skipping every subtree they still share.
//!
//! Resources that do not exist are simply absent. Members of a closed
//! project stay in the tree but are hidden from [`ResourceTree::lookup`]
//! until the project is opened again.
//!
//! The tree has no locking of its own; the workspace only mutates it inside
//! a rule-holding critical section.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use canopy_types::{MarkerId, ResourceId, ResourceKind, ResourcePath};
use serde::Serialize;

use crate::markers::MarkerInfo;

/// One resource.
#[derive(Debug, Clone)]
pub(crate) struct Node {
    pub(crate) id: ResourceId,
    pub(crate) kind: ResourceKind,
    pub(crate) derived: bool,
    pub(crate) team_private: bool,
    pub(crate) read_only: bool,
    pub(crate) is_link: bool,
    /// Target of a link; cleared while the owning project is closed.
    pub(crate) linked_location: Option<PathBuf>,
    /// Modification stamp of file contents.
    pub(crate) content_stamp: u64,
    /// Only meaningful for projects.
    pub(crate) open: bool,
    pub(crate) markers: BTreeMap<MarkerId, Arc<MarkerInfo>>,
    pub(crate) children: BTreeMap<String, Arc<Node>>,
}

impl Node {
    pub(crate) fn new(id: ResourceId, kind: ResourceKind, stamp: u64) -> Self {
        Self {
            id,
            kind,
            derived: false,
            team_private: false,
            read_only: false,
            is_link: false,
            linked_location: None,
            content_stamp: stamp,
            open: true,
            markers: BTreeMap::new(),
            children: BTreeMap::new(),
        }
    }

    /// Closed projects hide their members.
    pub(crate) fn hides_children(&self) -> bool {
        self.kind == ResourceKind::Project && !self.open
    }

    /// Children visible to readers.
    pub(crate) fn visible_children(&self) -> impl Iterator<Item = (&String, &Arc<Node>)> {
        let hidden = self.hides_children();
        self.children.iter().filter(move |_| !hidden)
    }
}

/// Read-only view of one resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResourceInfo {
    pub path: ResourcePath,
    pub id: ResourceId,
    pub kind: ResourceKind,
    pub derived: bool,
    pub team_private: bool,
    pub read_only: bool,
    pub is_link: bool,
    pub linked_location: Option<PathBuf>,
    /// Projects only; always true for other kinds.
    pub open: bool,
    pub content_stamp: u64,
    pub marker_count: usize,
}

impl ResourceInfo {
    fn from_node(path: &ResourcePath, node: &Node) -> Self {
        Self {
            path: path.clone(),
            id: node.id,
            kind: node.kind,
            derived: node.derived,
            team_private: node.team_private,
            read_only: node.read_only,
            is_link: node.is_link,
            linked_location: node.linked_location.clone(),
            open: node.open,
            content_stamp: node.content_stamp,
            marker_count: node.markers.len(),
        }
    }
}

/// Immutable-by-default resource hierarchy. `Clone` is a cheap snapshot.
#[derive(Debug, Clone)]
pub struct ResourceTree {
    root: Arc<Node>,
}

impl ResourceTree {
    pub(crate) fn new(root_id: ResourceId) -> Self {
        Self {
            root: Arc::new(Node::new(root_id, ResourceKind::Root, 0)),
        }
    }

    /// A structurally shared, immutable copy.
    pub fn snapshot(&self) -> ResourceTree {
        self.clone()
    }

    /// The resource at `path`, if it exists and is visible.
    pub fn lookup(&self, path: &ResourcePath) -> Option<ResourceInfo> {
        self.node(path).map(|node| ResourceInfo::from_node(path, node))
    }

    pub fn exists(&self, path: &ResourcePath) -> bool {
        self.node(path).is_some()
    }

    /// Visible direct members of a container, in name order.
    pub fn members(&self, path: &ResourcePath) -> Vec<ResourcePath> {
        self.node(path)
            .map(|node| {
                node.visible_children()
                    .map(|(name, _)| path.append(name))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// `path` and every visible descendant, pre-order.
    pub fn descendants(&self, path: &ResourcePath) -> Vec<ResourcePath> {
        let mut out = Vec::new();
        if let Some(node) = self.node(path) {
            visit_visible(path, node, &mut |p, _| out.push(p.clone()));
        }
        out
    }

    /// The closed project that hides `path`, if any.
    pub fn closed_project_of(&self, path: &ResourcePath) -> Option<ResourcePath> {
        if path.segment_count() < 2 {
            return None;
        }
        let project = path.project()?;
        let node = self.raw_node(&project)?;
        node.hides_children().then_some(project)
    }

    /// Number of visible resources, root included.
    pub fn len(&self) -> usize {
        let mut count = 0;
        visit_visible(&ResourcePath::root(), &self.root, &mut |_, _| count += 1);
        count
    }

    pub fn is_empty(&self) -> bool {
        self.root.children.is_empty()
    }

    // ── Crate-internal access ───────────────────────────────────────────────

    pub(crate) fn root_node(&self) -> &Arc<Node> {
        &self.root
    }

    /// Visible node at `path`.
    pub(crate) fn node(&self, path: &ResourcePath) -> Option<&Node> {
        let mut node: &Node = &self.root;
        for segment in path.segments() {
            if node.hides_children() {
                return None;
            }
            node = node.children.get(segment)?;
        }
        Some(node)
    }

    /// Node at `path`, ignoring closed projects.
    pub(crate) fn raw_node(&self, path: &ResourcePath) -> Option<&Node> {
        let mut node: &Node = &self.root;
        for segment in path.segments() {
            node = node.children.get(segment)?;
        }
        Some(node)
    }

    /// Shared handle to the subtree at `path`, ignoring closed projects.
    pub(crate) fn subtree(&self, path: &ResourcePath) -> Option<Arc<Node>> {
        let (Some(parent), Some(name)) = (path.parent(), path.last_segment()) else {
            return Some(self.root.clone());
        };
        self.raw_node(&parent)?.children.get(name).cloned()
    }

    /// Mutable node at `path`, copying shared nodes along the way.
    pub(crate) fn node_mut(&mut self, path: &ResourcePath) -> Option<&mut Node> {
        let mut node = Arc::make_mut(&mut self.root);
        for segment in path.segments() {
            node = Arc::make_mut(node.children.get_mut(segment)?);
        }
        Some(node)
    }

    /// Attach `node` at `path`, replacing whatever was there. Returns false
    /// when the parent is missing.
    pub(crate) fn insert(&mut self, path: &ResourcePath, node: Arc<Node>) -> bool {
        let (Some(parent), Some(name)) = (path.parent(), path.last_segment()) else {
            return false;
        };
        match self.node_mut(&parent) {
            Some(parent) => {
                parent.children.insert(name.to_string(), node);
                true
            }
            None => false,
        }
    }

    /// Detach and return the subtree at `path`.
    pub(crate) fn remove(&mut self, path: &ResourcePath) -> Option<Arc<Node>> {
        let parent = path.parent()?;
        let name = path.last_segment()?;
        if !self.raw_node(&parent)?.children.contains_key(name) {
            return None;
        }
        self.node_mut(&parent)?.children.remove(name)
    }

    /// Graft `subtree` (or its absence) at `path`. Returns false when the
    /// parent is missing.
    pub(crate) fn replace_subtree(&mut self, path: &ResourcePath, subtree: Option<Arc<Node>>) -> bool {
        if path.is_root() {
            if let Some(root) = subtree {
                self.root = root;
            }
            return true;
        }
        match subtree {
            Some(node) => self.insert(path, node),
            None => {
                let parent_exists = path.parent().is_some_and(|p| self.raw_node(&p).is_some());
                self.remove(path);
                parent_exists
            }
        }
    }

    /// An existing sibling whose name equals the last segment of `path`
    /// ignoring case, but not exactly.
    pub(crate) fn case_variant(&self, path: &ResourcePath) -> Option<ResourcePath> {
        let parent = path.parent()?;
        let name = path.last_segment()?.to_lowercase();
        let exact = path.last_segment()?;
        self.raw_node(&parent)?
            .children
            .keys()
            .find(|sibling| sibling.as_str() != exact && sibling.to_lowercase() == name)
            .map(|sibling| parent.append(sibling))
    }
}

/// Pre-order walk over visible nodes.
pub(crate) fn visit_visible(
    path: &ResourcePath,
    node: &Node,
    f: &mut impl FnMut(&ResourcePath, &Node),
) {
    f(path, node);
    for (name, child) in node.visible_children() {
        visit_visible(&path.append(name), child, f);
    }
}

/// Pre-order walk over every node, hidden members included.
pub(crate) fn visit_raw(path: &ResourcePath, node: &Node, f: &mut impl FnMut(&ResourcePath, &Node)) {
    f(path, node);
    for (name, child) in &node.children {
        visit_raw(&path.append(name), child, f);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn p(s: &str) -> ResourcePath {
        ResourcePath::parse(s).unwrap()
    }

    fn node(id: u64, kind: ResourceKind) -> Arc<Node> {
        Arc::new(Node::new(ResourceId::from_raw(id), kind, 0))
    }

    fn sample() -> ResourceTree {
        let mut tree = ResourceTree::new(ResourceId::from_raw(0));
        assert!(tree.insert(&p("/P"), node(1, ResourceKind::Project)));
        assert!(tree.insert(&p("/P/a"), node(2, ResourceKind::Folder)));
        assert!(tree.insert(&p("/P/a/x"), node(3, ResourceKind::File)));
        assert!(tree.insert(&p("/P/b"), node(4, ResourceKind::Folder)));
        tree
    }

    #[test]
    fn test_insert_requires_parent() {
        let mut tree = sample();
        assert!(!tree.insert(&p("/P/missing/y"), node(9, ResourceKind::File)));
        assert!(!tree.exists(&p("/P/missing/y")));
    }

    #[test]
    fn test_lookup_and_members() {
        let tree = sample();
        let info = tree.lookup(&p("/P/a/x")).unwrap();
        assert_eq!(info.kind, ResourceKind::File);
        assert_eq!(info.id, ResourceId::from_raw(3));
        assert_eq!(tree.members(&p("/P")), vec![p("/P/a"), p("/P/b")]);
        assert_eq!(tree.len(), 5);
    }

    #[test]
    fn test_snapshot_is_isolated_from_writes() {
        let mut tree = sample();
        let before = tree.snapshot();

        tree.remove(&p("/P/a"));
        tree.node_mut(&p("/P/b")).unwrap().derived = true;

        assert!(before.exists(&p("/P/a/x")));
        assert!(!before.lookup(&p("/P/b")).unwrap().derived);
        assert!(!tree.exists(&p("/P/a/x")));
        assert!(tree.lookup(&p("/P/b")).unwrap().derived);
    }

    #[test]
    fn test_untouched_subtrees_stay_shared() {
        let mut tree = sample();
        let before = tree.snapshot();
        tree.node_mut(&p("/P/b")).unwrap().derived = true;

        let old_a = before.subtree(&p("/P/a")).unwrap();
        let new_a = tree.subtree(&p("/P/a")).unwrap();
        assert!(Arc::ptr_eq(&old_a, &new_a));
        assert!(!Arc::ptr_eq(
            &before.subtree(&p("/P/b")).unwrap(),
            &tree.subtree(&p("/P/b")).unwrap()
        ));
    }

    #[test]
    fn test_closed_project_hides_members() {
        let mut tree = sample();
        tree.node_mut(&p("/P")).unwrap().open = false;
        assert!(tree.exists(&p("/P")));
        assert!(!tree.exists(&p("/P/a")));
        assert!(tree.members(&p("/P")).is_empty());
        assert!(tree.raw_node(&p("/P/a/x")).is_some());
        assert_eq!(tree.closed_project_of(&p("/P/a/x")), Some(p("/P")));
        assert_eq!(tree.closed_project_of(&p("/P")), None);
    }

    #[test]
    fn test_replace_subtree_grafts() {
        let mut shared = sample();
        let mut local = shared.snapshot();
        local.insert(&p("/P/a/y"), node(5, ResourceKind::File));
        local.remove(&p("/P/b"));

        assert!(shared.replace_subtree(&p("/P/a"), local.subtree(&p("/P/a"))));
        assert!(shared.exists(&p("/P/a/y")));
        // /P/b was outside the grafted scope
        assert!(shared.exists(&p("/P/b")));

        assert!(shared.replace_subtree(&p("/P/b"), local.subtree(&p("/P/b"))));
        assert!(!shared.exists(&p("/P/b")));
    }

    #[test]
    fn test_case_variant() {
        let tree = sample();
        assert_eq!(tree.case_variant(&p("/P/A")), Some(p("/P/a")));
        assert_eq!(tree.case_variant(&p("/P/a")), None);
        assert_eq!(tree.case_variant(&p("/P/c")), None);
    }
}
