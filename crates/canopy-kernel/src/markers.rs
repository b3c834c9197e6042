//! Markers: typed, attributed annotations on resources.
//!
//! Markers live inside the resource tree nodes, so they are snapshotted,
//! moved and deleted together with their resource. The [`MarkerStore`]
//! adds a workspace-wide marker id counter, the type hierarchy and an
//! id → path index over the committed tree.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use canopy_types::{MarkerId, ResourcePath};
use dashmap::DashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

use crate::delta::{DeltaKind, MarkerDelta, MarkerDeltaKind, ResourceDelta};
use crate::error::{WorkspaceError, WorkspaceResult};
use crate::tree::{Node, ResourceTree, visit_visible};

pub const MARKER: &str = "canopy.marker";
pub const TEXT_MARKER: &str = "canopy.textmarker";
pub const PROBLEM_MARKER: &str = "canopy.problemmarker";
pub const TASK_MARKER: &str = "canopy.taskmarker";
pub const BOOKMARK: &str = "canopy.bookmark";

/// Conventional attribute keys.
pub mod attr {
    pub const MESSAGE: &str = "message";
    pub const SEVERITY: &str = "severity";
    pub const LINE_NUMBER: &str = "lineNumber";
    pub const PRIORITY: &str = "priority";
    pub const DONE: &str = "done";
}

/// A marker attribute value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MarkerValue {
    Bool(bool),
    Int(i64),
    String(String),
}

impl fmt::Display for MarkerValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MarkerValue::Bool(v) => write!(f, "{v}"),
            MarkerValue::Int(v) => write!(f, "{v}"),
            MarkerValue::String(v) => f.write_str(v),
        }
    }
}

impl From<bool> for MarkerValue {
    fn from(v: bool) -> Self {
        MarkerValue::Bool(v)
    }
}

impl From<i64> for MarkerValue {
    fn from(v: i64) -> Self {
        MarkerValue::Int(v)
    }
}

impl From<&str> for MarkerValue {
    fn from(v: &str) -> Self {
        MarkerValue::String(v.to_string())
    }
}

impl From<String> for MarkerValue {
    fn from(v: String) -> Self {
        MarkerValue::String(v)
    }
}

pub type MarkerAttributes = BTreeMap<String, MarkerValue>;

/// Marker state stored on a node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MarkerInfo {
    pub id: MarkerId,
    #[serde(rename = "type")]
    pub marker_type: String,
    pub attributes: MarkerAttributes,
}

/// A marker together with the resource it is attached to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Marker {
    pub path: ResourcePath,
    #[serde(flatten)]
    pub info: MarkerInfo,
}

impl Marker {
    pub fn id(&self) -> MarkerId {
        self.info.id
    }

    pub fn marker_type(&self) -> &str {
        &self.info.marker_type
    }

    pub fn attribute(&self, key: &str) -> Option<&MarkerValue> {
        self.info.attributes.get(key)
    }
}

/// How far below a resource a query reaches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Depth {
    Zero,
    One,
    Infinite,
}

/// Declared marker types and their supertypes.
#[derive(Debug)]
pub struct MarkerTypeRegistry {
    supertypes: RwLock<HashMap<String, Vec<String>>>,
}

impl Default for MarkerTypeRegistry {
    fn default() -> Self {
        let registry = Self {
            supertypes: RwLock::new(HashMap::new()),
        };
        registry.declare(MARKER, &[]);
        registry.declare(TEXT_MARKER, &[MARKER]);
        registry.declare(PROBLEM_MARKER, &[MARKER, TEXT_MARKER]);
        registry.declare(TASK_MARKER, &[MARKER, TEXT_MARKER]);
        registry.declare(BOOKMARK, &[MARKER]);
        registry
    }
}

impl MarkerTypeRegistry {
    /// Declare (or redeclare) a type with its direct supertypes.
    pub fn declare(&self, marker_type: &str, supertypes: &[&str]) {
        self.supertypes.write().insert(
            marker_type.to_string(),
            supertypes.iter().map(|s| s.to_string()).collect(),
        );
    }

    pub fn is_declared(&self, marker_type: &str) -> bool {
        self.supertypes.read().contains_key(marker_type)
    }

    /// True when `marker_type` is `ancestor` or inherits from it.
    pub fn is_subtype(&self, marker_type: &str, ancestor: &str) -> bool {
        if marker_type == ancestor {
            return true;
        }
        let supertypes = self.supertypes.read();
        let mut pending = vec![marker_type.to_string()];
        let mut seen = Vec::new();
        while let Some(current) = pending.pop() {
            if seen.contains(&current) {
                continue;
            }
            if let Some(parents) = supertypes.get(&current) {
                if parents.iter().any(|p| p == ancestor) {
                    return true;
                }
                pending.extend(parents.iter().cloned());
            }
            seen.push(current);
        }
        false
    }

    /// Filter used by finds and removals. `None` matches every type.
    pub fn matches(&self, marker_type: &str, filter: Option<&str>, include_subtypes: bool) -> bool {
        match filter {
            None => true,
            Some(wanted) if include_subtypes => self.is_subtype(marker_type, wanted),
            Some(wanted) => marker_type == wanted,
        }
    }
}

/// Marker bookkeeping shared by a workspace.
#[derive(Debug, Default)]
pub struct MarkerStore {
    types: MarkerTypeRegistry,
    next_id: AtomicU64,
    index: DashMap<MarkerId, ResourcePath>,
}

impl MarkerStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn types(&self) -> &MarkerTypeRegistry {
        &self.types
    }

    pub(crate) fn allocate(&self) -> MarkerId {
        MarkerId::from_raw(self.next_id.fetch_add(1, Ordering::Relaxed) + 1)
    }

    /// Attach a new marker to the resource at `path`.
    pub(crate) fn add(
        &self,
        tree: &mut ResourceTree,
        path: &ResourcePath,
        marker_type: &str,
        attributes: MarkerAttributes,
    ) -> WorkspaceResult<MarkerId> {
        if !tree.exists(path) {
            return Err(WorkspaceError::ResourceNotFound(path.clone()));
        }
        let id = self.allocate();
        let node = tree
            .node_mut(path)
            .ok_or_else(|| WorkspaceError::ResourceNotFound(path.clone()))?;
        node.markers.insert(
            id,
            Arc::new(MarkerInfo {
                id,
                marker_type: marker_type.to_string(),
                attributes,
            }),
        );
        Ok(id)
    }

    /// Resource carrying marker `id` in `tree`.
    ///
    /// The index covers committed markers; markers made inside a running
    /// operation are found by scanning.
    pub(crate) fn locate(&self, tree: &ResourceTree, id: MarkerId) -> Option<ResourcePath> {
        if let Some(path) = self.index.get(&id) {
            if tree.node(&path).is_some_and(|n| n.markers.contains_key(&id)) {
                return Some(path.clone());
            }
        }
        let mut found = None;
        visit_visible(&ResourcePath::root(), tree.root_node(), &mut |path, node| {
            if found.is_none() && node.markers.contains_key(&id) {
                found = Some(path.clone());
            }
        });
        found
    }

    pub(crate) fn remove(&self, tree: &mut ResourceTree, path: &ResourcePath, id: MarkerId) -> bool {
        if !tree.node(path).is_some_and(|n| n.markers.contains_key(&id)) {
            return false;
        }
        tree.node_mut(path)
            .is_some_and(|node| node.markers.remove(&id).is_some())
    }

    /// Remove matching markers at `path` down to `depth`. Returns the count.
    pub(crate) fn remove_matching(
        &self,
        tree: &mut ResourceTree,
        path: &ResourcePath,
        marker_type: Option<&str>,
        include_subtypes: bool,
        depth: Depth,
    ) -> WorkspaceResult<usize> {
        let targets = self.find(tree, path, marker_type, include_subtypes, depth)?;
        let mut removed = 0;
        for marker in targets {
            if self.remove(tree, &marker.path, marker.id()) {
                removed += 1;
            }
        }
        Ok(removed)
    }

    pub(crate) fn set_attribute(
        &self,
        tree: &mut ResourceTree,
        path: &ResourcePath,
        id: MarkerId,
        key: &str,
        value: Option<MarkerValue>,
    ) -> WorkspaceResult<()> {
        let node = tree
            .node_mut(path)
            .ok_or_else(|| WorkspaceError::ResourceNotFound(path.clone()))?;
        let marker = node
            .markers
            .get_mut(&id)
            .ok_or(WorkspaceError::MarkerNotFound(id))?;
        let marker = Arc::make_mut(marker);
        match value {
            Some(value) => marker.attributes.insert(key.to_string(), value),
            None => marker.attributes.remove(key),
        };
        Ok(())
    }

    /// Markers at `path` down to `depth`, ordered by resource path then id.
    pub fn find(
        &self,
        tree: &ResourceTree,
        path: &ResourcePath,
        marker_type: Option<&str>,
        include_subtypes: bool,
        depth: Depth,
    ) -> WorkspaceResult<Vec<Marker>> {
        let node = tree
            .node(path)
            .ok_or_else(|| WorkspaceError::ResourceNotFound(path.clone()))?;
        let mut out = Vec::new();
        let mut collect = |p: &ResourcePath, n: &Node| {
            for marker in n.markers.values() {
                if self.types.matches(&marker.marker_type, marker_type, include_subtypes) {
                    out.push(Marker {
                        path: p.clone(),
                        info: MarkerInfo::clone(marker),
                    });
                }
            }
        };
        match depth {
            Depth::Zero => collect(path, node),
            Depth::One => {
                collect(path, node);
                for (name, child) in node.visible_children() {
                    collect(&path.append(name), child);
                }
            }
            Depth::Infinite => visit_visible(path, node, &mut collect),
        }
        Ok(out)
    }

    pub fn find_marker(&self, tree: &ResourceTree, id: MarkerId) -> Option<Marker> {
        let path = self.locate(tree, id)?;
        let info = tree.node(&path)?.markers.get(&id)?;
        Some(Marker {
            path,
            info: MarkerInfo::clone(info),
        })
    }

    /// Bring the id index in line with a committed delta.
    pub(crate) fn reindex(&self, delta: &ResourceDelta) {
        let mut added = Vec::new();
        let mut removed = Vec::new();
        for node in delta.iter() {
            if node.kind == DeltaKind::Removed {
                removed.push(&node.path);
            }
            for change in &node.marker_deltas {
                match change.kind {
                    MarkerDeltaKind::Removed => {
                        self.index.remove(&change.marker.id);
                    }
                    MarkerDeltaKind::Added | MarkerDeltaKind::Changed => {
                        added.push(change);
                    }
                }
            }
        }
        // Members of a closed project are removed without marker deltas.
        if !removed.is_empty() {
            self.index
                .retain(|_, path| !removed.iter().any(|gone| gone.is_prefix_of(path)));
        }
        // A moved marker is removed at the source and added at the destination.
        for change in added {
            self.index.insert(change.marker.id, change.path.clone());
        }
    }

    pub fn indexed(&self) -> usize {
        self.index.len()
    }
}

/// Diff two marker sets of the same resource, ordered by id.
pub(crate) fn diff_markers(
    path: &ResourcePath,
    before: &BTreeMap<MarkerId, Arc<MarkerInfo>>,
    after: &BTreeMap<MarkerId, Arc<MarkerInfo>>,
) -> Vec<MarkerDelta> {
    let mut out = Vec::new();
    for (id, old) in before {
        match after.get(id) {
            None => out.push(MarkerDelta::new(MarkerDeltaKind::Removed, path, old, None)),
            Some(new) if !Arc::ptr_eq(old, new) && old != new => {
                out.push(MarkerDelta::new(
                    MarkerDeltaKind::Changed,
                    path,
                    new,
                    Some(old.attributes.clone()),
                ))
            }
            Some(_) => {}
        }
    }
    for (id, new) in after {
        if !before.contains_key(id) {
            out.push(MarkerDelta::new(MarkerDeltaKind::Added, path, new, None));
        }
    }
    out.sort_by_key(|d| d.marker.id);
    out
}
