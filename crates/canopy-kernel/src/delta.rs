//! Resource deltas.
//!
//! [`DeltaComputer::compute`] diffs two tree snapshots. Subtrees the two
//! snapshots still share are skipped without being visited, so the cost is
//! proportional to what changed. The result mirrors the tree shape and only
//! carries changed nodes and their ancestors; ancestors that changed only
//! through their members are `Changed` with empty flags.
//!
//! Children are ordered by segment name, so computing the same pair of
//! snapshots twice gives identical output.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use bitflags::bitflags;
use canopy_types::{ResourceId, ResourceKind, ResourcePath};
use serde::Serialize;
use strum::Display;

use crate::markers::{MarkerAttributes, MarkerInfo, diff_markers};
use crate::tree::{Node, ResourceTree};

bitflags! {
    /// What changed on a resource.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
    #[serde(transparent)]
    pub struct DeltaFlags: u32 {
        const CONTENT = 0x100;
        const MOVED_FROM = 0x1000;
        const MOVED_TO = 0x2000;
        const OPEN = 0x4000;
        const TYPE = 0x8000;
        const MARKERS = 0x20000;
        const REPLACED = 0x40000;
        const DERIVED_CHANGED = 0x40_0000;
        const TEAM_PRIVATE_CHANGED = 0x80_0000;
        const READ_ONLY_CHANGED = 0x100_0000;
        const LINK_CHANGED = 0x200_0000;
        const PROPERTIES = 0x400_0000;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum DeltaKind {
    Added,
    Removed,
    Changed,
    NoChange,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum MarkerDeltaKind {
    Added,
    Removed,
    Changed,
}

/// One marker change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MarkerDelta {
    pub kind: MarkerDeltaKind,
    pub path: ResourcePath,
    /// New state; the last known state for removals.
    pub marker: MarkerInfo,
    /// Attributes before a change.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub previous: Option<MarkerAttributes>,
}

impl MarkerDelta {
    pub(crate) fn new(
        kind: MarkerDeltaKind,
        path: &ResourcePath,
        marker: &MarkerInfo,
        previous: Option<MarkerAttributes>,
    ) -> Self {
        Self {
            kind,
            path: path.clone(),
            marker: marker.clone(),
            previous,
        }
    }
}

/// A node of the change tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResourceDelta {
    pub path: ResourcePath,
    pub kind: DeltaKind,
    pub flags: DeltaFlags,
    pub resource_kind: ResourceKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub moved_from: Option<ResourcePath>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub moved_to: Option<ResourcePath>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub marker_deltas: Vec<MarkerDelta>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<ResourceDelta>,
    #[serde(skip)]
    old_id: Option<ResourceId>,
    #[serde(skip)]
    new_id: Option<ResourceId>,
}

impl ResourceDelta {
    fn new(path: ResourcePath, kind: DeltaKind, resource_kind: ResourceKind) -> Self {
        Self {
            path,
            kind,
            flags: DeltaFlags::empty(),
            resource_kind,
            moved_from: None,
            moved_to: None,
            marker_deltas: Vec::new(),
            children: Vec::new(),
            old_id: None,
            new_id: None,
        }
    }

    /// The delta for `path`, if it is part of this tree.
    pub fn find_member(&self, path: &ResourcePath) -> Option<&ResourceDelta> {
        let rest = path.strip_prefix(&self.path)?;
        let mut node = self;
        for segment in rest {
            node = node
                .children
                .iter()
                .find(|child| child.path.last_segment() == Some(segment.as_str()))?;
        }
        Some(node)
    }

    /// Direct children, optionally only those of one kind.
    pub fn affected_children(&self, kind: Option<DeltaKind>) -> Vec<&ResourceDelta> {
        self.children
            .iter()
            .filter(|child| kind.is_none_or(|k| child.kind == k))
            .collect()
    }

    /// Pre-order walk over this node and every descendant.
    pub fn iter(&self) -> impl Iterator<Item = &ResourceDelta> {
        let mut stack = vec![self];
        std::iter::from_fn(move || {
            let next = stack.pop()?;
            stack.extend(next.children.iter().rev());
            Some(next)
        })
    }

    /// Visit nodes pre-order; returning false from `visitor` skips the
    /// node's children.
    pub fn accept(&self, visitor: &mut impl FnMut(&ResourceDelta) -> bool) {
        if visitor(self) {
            for child in &self.children {
                child.accept(visitor);
            }
        }
    }

    /// Every marker change in the tree, pre-order.
    pub fn marker_changes(&self) -> impl Iterator<Item = &MarkerDelta> {
        self.iter().flat_map(|node| node.marker_deltas.iter())
    }
}

/// Computes deltas between tree snapshots.
#[derive(Debug, Clone, Default)]
pub struct DeltaComputer {
    /// Resources whose persistent properties were written.
    pub touched_properties: BTreeSet<ResourcePath>,
}

impl DeltaComputer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_touched_properties(touched: BTreeSet<ResourcePath>) -> Self {
        Self {
            touched_properties: touched,
        }
    }

    /// Delta from `before` to `after` over the whole workspace, or `None`
    /// when nothing changed.
    pub fn compute(&self, before: &ResourceTree, after: &ResourceTree) -> Option<ResourceDelta> {
        self.compute_at(before, after, &ResourcePath::root())
    }

    /// Delta rooted at `path`.
    pub fn compute_at(
        &self,
        before: &ResourceTree,
        after: &ResourceTree,
        path: &ResourcePath,
    ) -> Option<ResourceDelta> {
        let old = visible_subtree(before, path);
        let new = visible_subtree(after, path);
        let mut delta = self.diff(path, old.as_deref(), new.as_deref())?;
        annotate_moves(&mut delta);
        Some(delta)
    }

    fn diff(&self, path: &ResourcePath, old: Option<&Node>, new: Option<&Node>) -> Option<ResourceDelta> {
        match (old, new) {
            (None, None) => None,
            (None, Some(new)) => Some(whole(path, new, DeltaKind::Added)),
            (Some(old), None) => Some(whole(path, old, DeltaKind::Removed)),
            (Some(old), Some(new)) => self.diff_both(path, old, new),
        }
    }

    fn diff_both(&self, path: &ResourcePath, old: &Node, new: &Node) -> Option<ResourceDelta> {
        let properties = self.touched_properties.contains(path);
        if std::ptr::eq(old, new) && !properties && !self.touched_below(path) {
            return None;
        }

        let mut delta = ResourceDelta::new(path.clone(), DeltaKind::Changed, new.kind);
        delta.old_id = Some(old.id);
        delta.new_id = Some(new.id);
        let mut flags = DeltaFlags::empty();

        if old.id != new.id {
            flags |= DeltaFlags::REPLACED;
            if old.kind != new.kind {
                flags |= DeltaFlags::TYPE;
            }
        }
        if new.kind == ResourceKind::File && old.content_stamp != new.content_stamp {
            flags |= DeltaFlags::CONTENT;
        }
        flags.set(DeltaFlags::DERIVED_CHANGED, old.derived != new.derived);
        flags.set(DeltaFlags::TEAM_PRIVATE_CHANGED, old.team_private != new.team_private);
        flags.set(DeltaFlags::READ_ONLY_CHANGED, old.read_only != new.read_only);
        flags.set(
            DeltaFlags::LINK_CHANGED,
            old.is_link != new.is_link || old.linked_location != new.linked_location,
        );
        flags.set(DeltaFlags::PROPERTIES, properties);

        delta.marker_deltas = diff_markers(path, &old.markers, &new.markers);
        flags.set(DeltaFlags::MARKERS, !delta.marker_deltas.is_empty());

        if old.open != new.open {
            // Members of a project appear or vanish wholesale with OPEN.
            flags |= DeltaFlags::OPEN;
        } else if !old.hides_children() {
            delta.children = self.diff_children(path, &old.children, &new.children);
        }

        delta.flags = flags;
        if flags.is_empty() && delta.children.is_empty() {
            return None;
        }
        Some(delta)
    }

    fn diff_children(
        &self,
        path: &ResourcePath,
        old: &BTreeMap<String, Arc<Node>>,
        new: &BTreeMap<String, Arc<Node>>,
    ) -> Vec<ResourceDelta> {
        let names: BTreeSet<&String> = old.keys().chain(new.keys()).collect();
        names
            .into_iter()
            .filter_map(|name| {
                let child_path = path.append(name);
                let before = old.get(name);
                let after = new.get(name);
                if let (Some(a), Some(b)) = (before, after) {
                    if Arc::ptr_eq(a, b)
                        && !self.touched_properties.contains(&child_path)
                        && !self.touched_below(&child_path)
                    {
                        return None;
                    }
                }
                self.diff(&child_path, before.map(|n| &**n), after.map(|n| &**n))
            })
            .collect()
    }

    fn touched_below(&self, path: &ResourcePath) -> bool {
        // Descendants sort directly after their ancestor.
        self.touched_properties
            .range(path.clone()..)
            .take_while(|touched| path.is_prefix_of(touched))
            .any(|touched| touched != path)
    }
}

fn visible_subtree(tree: &ResourceTree, path: &ResourcePath) -> Option<Arc<Node>> {
    if tree.closed_project_of(path).is_some() {
        return None;
    }
    tree.subtree(path)
}

/// Added or removed subtree, with every member and marker.
fn whole(path: &ResourcePath, node: &Node, kind: DeltaKind) -> ResourceDelta {
    let mut delta = ResourceDelta::new(path.clone(), kind, node.kind);
    let marker_kind = match kind {
        DeltaKind::Removed => MarkerDeltaKind::Removed,
        _ => MarkerDeltaKind::Added,
    };
    match kind {
        DeltaKind::Removed => delta.old_id = Some(node.id),
        _ => delta.new_id = Some(node.id),
    }
    delta.marker_deltas = node
        .markers
        .values()
        .map(|marker| MarkerDelta::new(marker_kind, path, marker, None))
        .collect();
    if !delta.marker_deltas.is_empty() {
        delta.flags |= DeltaFlags::MARKERS;
    }
    delta.children = node
        .visible_children()
        .map(|(name, child)| whole(&path.append(name), child, kind))
        .collect();
    delta
}

/// Pair removed and added resources that share an id.
fn annotate_moves(root: &mut ResourceDelta) {
    let mut removed: HashMap<ResourceId, ResourcePath> = HashMap::new();
    let mut added: HashMap<ResourceId, ResourcePath> = HashMap::new();
    for node in root.iter() {
        let replaced = node.flags.contains(DeltaFlags::REPLACED);
        if node.kind == DeltaKind::Removed || replaced {
            if let Some(id) = node.old_id {
                removed.insert(id, node.path.clone());
            }
        }
        if node.kind == DeltaKind::Added || replaced {
            if let Some(id) = node.new_id {
                added.insert(id, node.path.clone());
            }
        }
    }
    if removed.is_empty() || added.is_empty() {
        return;
    }
    mark_moves(root, &removed, &added);
}

fn mark_moves(
    node: &mut ResourceDelta,
    removed: &HashMap<ResourceId, ResourcePath>,
    added: &HashMap<ResourceId, ResourcePath>,
) {
    let replaced = node.flags.contains(DeltaFlags::REPLACED);
    if node.kind == DeltaKind::Removed || replaced {
        if let Some(to) = node.old_id.and_then(|id| added.get(&id)) {
            node.flags |= DeltaFlags::MOVED_TO;
            node.moved_to = Some(to.clone());
        }
    }
    if node.kind == DeltaKind::Added || replaced {
        if let Some(from) = node.new_id.and_then(|id| removed.get(&id)) {
            node.flags |= DeltaFlags::MOVED_FROM;
            node.moved_from = Some(from.clone());
        }
    }
    for child in &mut node.children {
        mark_moves(child, removed, added);
    }
}
