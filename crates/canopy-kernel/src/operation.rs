//! Batched workspace mutation.
//!
//! An [`Operation`] holds a scheduling rule for its whole lifetime and works
//! on a private copy of the resource tree. Each call inside the batch takes
//! its own rule reentrantly, so a call reaching outside the batch rule fails
//! with `IllegalNesting` before touching anything. A call that fails is
//! undone within the batch; a call that returns `MultiStatus` keeps the
//! parts that succeeded.
//!
//! Nothing is visible to readers until [`Operation::commit`]: the changed
//! scopes are grafted into the shared tree in one step, one delta is computed
//! and one `POST_CHANGE` event is dispatched after the rule is released.
//! Dropping or aborting an operation discards its model changes and undoes
//! the locations it created or renamed in the file store. Deleted locations
//! and overwritten contents stay as they are.

use std::collections::{BTreeSet, HashSet};
use std::path::PathBuf;
use std::sync::Arc;

use bitflags::bitflags;
use canopy_types::{JobId, MarkerId, QualifiedName, ResourceKind, ResourcePath};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::delta::{DeltaComputer, ResourceDelta};
use crate::description::{DescriptionEdit, LinkDescription, overlay_links};
use crate::error::{WorkspaceError, WorkspaceResult};
use crate::fs::FileStore;
use crate::lock::RuleGuard;
use crate::markers::{Depth, Marker, MarkerAttributes, MarkerValue};
use crate::notify::{ListenerFailure, ResourceChangeEvent};
use crate::properties::{PropertyEdit, PropertyStore};
use crate::rules::{RuleFactory, SchedulingRule};
use crate::tree::{Node, ResourceInfo, ResourceTree, visit_raw};
use crate::workspace::Workspace;

bitflags! {
    /// Options for structural operations.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    #[serde(transparent)]
    pub struct UpdateFlags: u32 {
        /// Proceed over out-of-sync or read-only state and reuse existing
        /// locations; create missing parent folders.
        const FORCE = 0x1;
        /// Create a link even when its target does not exist.
        const ALLOW_MISSING_LOCAL = 0x10;
        /// Let a link overwrite an existing resource.
        const REPLACE = 0x100;
        const DERIVED = 0x400;
        const TEAM_PRIVATE = 0x800;
    }
}

/// Outcome of a committed operation.
#[derive(Debug, Clone)]
pub struct CommitReport {
    /// `None` when the operation changed nothing observable.
    pub delta: Option<ResourceDelta>,
    /// Listeners that failed while being notified.
    pub listener_failures: Vec<ListenerFailure>,
}

/// File-store effect to reverse when the batch does not commit.
#[derive(Debug)]
enum Undo {
    Remove(PathBuf),
    Rename { from: PathBuf, to: PathBuf },
}

struct Checkpoint {
    tree: ResourceTree,
    property_edits: usize,
    description_edits: usize,
    touched: BTreeSet<ResourcePath>,
    pre_events: usize,
}

/// A batch of mutations under one scheduling rule.
pub struct Operation<'ws> {
    ws: &'ws Workspace,
    job: JobId,
    rule: SchedulingRule,
    guard: Option<RuleGuard>,
    cancel: CancellationToken,
    tree: ResourceTree,
    property_edits: Vec<PropertyEdit>,
    description_edits: Vec<DescriptionEdit>,
    touched: BTreeSet<ResourcePath>,
    pre_events: Vec<ResourceChangeEvent>,
    journal: Vec<Undo>,
}

impl std::fmt::Debug for Operation<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Operation")
            .field("job", &self.job)
            .field("rule", &self.rule)
            .field("property_edits", &self.property_edits.len())
            .field("description_edits", &self.description_edits.len())
            .field("journal", &self.journal.len())
            .finish_non_exhaustive()
    }
}

impl<'ws> Operation<'ws> {
    pub(crate) fn new(
        ws: &'ws Workspace,
        job: JobId,
        rule: SchedulingRule,
        guard: RuleGuard,
        cancel: CancellationToken,
        tree: ResourceTree,
    ) -> Self {
        Self {
            ws,
            job,
            rule,
            guard: Some(guard),
            cancel,
            tree,
            property_edits: Vec::new(),
            description_edits: Vec::new(),
            touched: BTreeSet::new(),
            pre_events: Vec::new(),
            journal: Vec::new(),
        }
    }

    pub fn job(&self) -> JobId {
        self.job
    }

    pub fn rule(&self) -> &SchedulingRule {
        &self.rule
    }

    /// The batch's view of the tree, including its own uncommitted changes.
    pub fn tree(&self) -> &ResourceTree {
        &self.tree
    }

    pub fn lookup(&self, path: &ResourcePath) -> Option<ResourceInfo> {
        self.tree.lookup(path)
    }

    pub fn exists(&self, path: &ResourcePath) -> bool {
        self.tree.exists(path)
    }

    // ── Structure ───────────────────────────────────────────────────────────

    /// Create a project or folder, or an empty file.
    pub async fn create(
        &mut self,
        path: &ResourcePath,
        kind: ResourceKind,
        flags: UpdateFlags,
    ) -> WorkspaceResult<()> {
        self.create_with_contents(path, kind, &[], flags).await
    }

    pub async fn create_file(
        &mut self,
        path: &ResourcePath,
        contents: &[u8],
        flags: UpdateFlags,
    ) -> WorkspaceResult<()> {
        self.create_with_contents(path, ResourceKind::File, contents, flags)
            .await
    }

    async fn create_with_contents(
        &mut self,
        path: &ResourcePath,
        kind: ResourceKind,
        contents: &[u8],
        flags: UpdateFlags,
    ) -> WorkspaceResult<()> {
        let force = flags.contains(UpdateFlags::FORCE);
        let _step = self
            .step(RuleFactory::create_rule(&self.tree, path, force))
            .await?;
        let checkpoint = self.checkpoint();
        let result = self.create_inner(path, kind, contents, flags).await;
        self.settle(checkpoint, result)
    }

    async fn create_inner(
        &mut self,
        path: &ResourcePath,
        kind: ResourceKind,
        contents: &[u8],
        flags: UpdateFlags,
    ) -> WorkspaceResult<()> {
        let force = flags.contains(UpdateFlags::FORCE);
        if kind == ResourceKind::Root || !kind.accepts_depth(path.segment_count()) {
            return Err(WorkspaceError::invalid_path(
                path,
                format!("a {kind} cannot live at depth {}", path.segment_count()),
            ));
        }
        self.check_name(path)?;
        if let Some(project) = self.tree.closed_project_of(path) {
            return Err(WorkspaceError::ProjectClosed(project));
        }
        if self.tree.exists(path) {
            return Err(WorkspaceError::AlreadyExists(path.clone()));
        }

        let mut missing = Vec::new();
        for ancestor in path.ancestors().skip(1) {
            match self.tree.node(&ancestor) {
                Some(node) if node.kind == ResourceKind::File => {
                    return Err(WorkspaceError::invalid_name(
                        path,
                        format!("{ancestor} is a file"),
                    ));
                }
                Some(_) => {}
                None if ancestor.segment_count() == 1 => {
                    return Err(WorkspaceError::ParentMissing(ancestor));
                }
                None if !force => {
                    return Err(WorkspaceError::ParentMissing(
                        path.remove_last_segments(1),
                    ));
                }
                None => {
                    self.check_name(&ancestor)?;
                    self.check_case(&ancestor, None)?;
                    missing.push(ancestor);
                }
            }
        }
        self.check_case(path, None)?;

        let mut created = Vec::new();
        if let Err(err) = self
            .materialize(path, kind, contents, force, &missing, &mut created)
            .await
        {
            revert(self.ws.files.as_ref(), &created).await;
            return Err(err);
        }
        self.journal.append(&mut created);

        for ancestor in &missing {
            let folder = self.new_node(ResourceKind::Folder);
            self.tree.insert(ancestor, Arc::new(folder));
        }
        let mut node = self.new_node(kind);
        node.derived = flags.contains(UpdateFlags::DERIVED);
        node.team_private = flags.contains(UpdateFlags::TEAM_PRIVATE);
        self.tree.insert(path, Arc::new(node));
        debug!(job = %self.job, %path, %kind, "created");
        Ok(())
    }

    /// Bring the file store in line with a pending create. Every location
    /// created here is pushed to `created` so a failure can undo it.
    async fn materialize(
        &self,
        path: &ResourcePath,
        kind: ResourceKind,
        contents: &[u8],
        force: bool,
        missing: &[ResourcePath],
        created: &mut Vec<Undo>,
    ) -> WorkspaceResult<()> {
        let files = &self.ws.files;
        for ancestor in missing {
            let location = self.location(ancestor)?;
            if !files.exists(&location).await {
                files
                    .mkdir(&location)
                    .await
                    .map_err(|e| WorkspaceError::io(ancestor, e))?;
                created.push(Undo::Remove(location));
            }
        }

        let location = self.location(path)?;
        let existed = files.exists(&location).await;
        match kind {
            // A project adopts an existing directory.
            ResourceKind::Project if existed => {}
            ResourceKind::Folder | ResourceKind::File if existed && !force => {
                return Err(WorkspaceError::AlreadyExists(path.clone()));
            }
            ResourceKind::File => {
                files
                    .write(&location, contents)
                    .await
                    .map_err(|e| WorkspaceError::io(path, e))?;
                if !existed {
                    created.push(Undo::Remove(location));
                }
            }
            _ if existed => {}
            _ => {
                files
                    .mkdir(&location)
                    .await
                    .map_err(|e| WorkspaceError::io(path, e))?;
                created.push(Undo::Remove(location));
            }
        }
        Ok(())
    }

    /// Delete a resource and everything below it.
    ///
    /// Members that cannot be deleted are reported together in a
    /// `MultiStatus`; the rest of the subtree is still removed.
    pub async fn delete(&mut self, path: &ResourcePath, flags: UpdateFlags) -> WorkspaceResult<()> {
        let _step = self.step(RuleFactory::delete_rule(path)).await?;
        let checkpoint = self.checkpoint();
        let result = self.delete_inner(path, flags).await;
        self.settle(checkpoint, result)
    }

    async fn delete_inner(&mut self, path: &ResourcePath, flags: UpdateFlags) -> WorkspaceResult<()> {
        let force = flags.contains(UpdateFlags::FORCE);
        if path.is_root() {
            return Err(WorkspaceError::invalid_path(path, "the workspace root cannot be deleted"));
        }
        if let Some(project) = self.tree.closed_project_of(path) {
            return Err(WorkspaceError::ProjectClosed(project));
        }
        let top = match (self.tree.node(path), self.tree.subtree(path)) {
            (Some(_), Some(top)) => top,
            _ => return Err(WorkspaceError::ResourceNotFound(path.clone())),
        };
        if top.kind == ResourceKind::Project {
            self.pre_events
                .push(ResourceChangeEvent::pre_delete(path.clone()));
        }

        let mut order = Vec::new();
        collect_physical(path, &top, &mut order);
        let planned: Vec<(ResourcePath, Arc<Node>, Option<PathBuf>)> = order
            .into_iter()
            .map(|(p, n)| {
                let location = self.ws.location_in(&self.tree, &p);
                (p, n, location)
            })
            .collect();

        let ws = self.ws;
        let files = &ws.files;
        let mut errors = Vec::new();
        // Reverse pre-order visits members before their container.
        for (p, node, location) in planned.into_iter().rev() {
            if node.is_link {
                self.tree.remove(&p);
                self.forget_link(&p);
                self.property_edits.push(PropertyEdit::RemoveSubtree(p));
                continue;
            }
            if node.kind.is_container()
                && self.tree.raw_node(&p).is_some_and(|n| !n.children.is_empty())
            {
                // A member failed and is still there.
                continue;
            }
            if node.kind == ResourceKind::File && node.read_only && !force {
                errors.push(WorkspaceError::ReadOnly(p));
                continue;
            }
            match location {
                Some(location) if files.exists(&location).await => {
                    if node.read_only {
                        if let Err(error) = files.set_read_only(&location, false).await {
                            debug!(%p, %error, "could not clear read-only bit");
                        }
                    }
                    if let Err(error) = files.remove(&location).await {
                        errors.push(WorkspaceError::io(&p, error));
                        continue;
                    }
                }
                _ if !force => {
                    errors.push(WorkspaceError::OutOfSync(p));
                    continue;
                }
                _ => {}
            }
            self.tree.remove(&p);
            self.property_edits.push(PropertyEdit::RemoveSubtree(p));
        }

        if top.kind == ResourceKind::Project && self.tree.raw_node(path).is_none() {
            if let Some(name) = path.last_segment() {
                self.description_edits
                    .push(DescriptionEdit::RemoveProject(name.to_string()));
            }
        }

        match errors.len() {
            0 => {
                debug!(job = %self.job, %path, "deleted");
                Ok(())
            }
            1 if top.kind == ResourceKind::File => Err(errors.remove(0)),
            _ => Err(WorkspaceError::MultiStatus {
                path: path.clone(),
                errors,
            }),
        }
    }

    /// Move or rename a resource. The moved subtree keeps its ids and
    /// markers; its persistent properties are dropped.
    pub async fn move_resource(
        &mut self,
        source: &ResourcePath,
        destination: &ResourcePath,
        flags: UpdateFlags,
    ) -> WorkspaceResult<()> {
        let _step = self
            .step(RuleFactory::move_rule(source, destination))
            .await?;
        let checkpoint = self.checkpoint();
        let result = self.move_inner(source, destination, flags).await;
        self.settle(checkpoint, result)
    }

    async fn move_inner(
        &mut self,
        source: &ResourcePath,
        destination: &ResourcePath,
        _flags: UpdateFlags,
    ) -> WorkspaceResult<()> {
        let node = self.validate_transfer(source, destination, true)?;
        self.ensure_backed(source, &node).await?;

        let case_rename = source.matches(destination, false);
        if !node.is_link {
            let from = self.location(source)?;
            let to = self.location(destination)?;
            let files = &self.ws.files;
            if !case_rename && files.exists(&to).await {
                return Err(WorkspaceError::AlreadyExists(destination.clone()));
            }
            files
                .rename(&from, &to)
                .await
                .map_err(|e| WorkspaceError::io(source, e))?;
            self.journal.push(Undo::Rename { from: to, to: from });
        }

        let mut links = Vec::new();
        visit_raw(source, &node, &mut |p, n| {
            if n.is_link {
                links.push((p.clone(), n.kind, n.linked_location.clone()));
            }
        });
        if node.kind == ResourceKind::Project {
            if let Some(name) = source.last_segment() {
                self.description_edits
                    .push(DescriptionEdit::RemoveProject(name.to_string()));
            }
        }
        for (old, kind, location) in links {
            self.forget_link(&old);
            let (Some(new), Some(location)) = (old.replace_prefix(source, destination), location)
            else {
                continue;
            };
            self.describe_link(LinkDescription {
                path: new,
                kind,
                location,
            });
        }

        self.tree.remove(source);
        self.tree.insert(destination, node);
        self.property_edits
            .push(PropertyEdit::RemoveSubtree(source.clone()));
        debug!(job = %self.job, %source, %destination, "moved");
        Ok(())
    }

    /// Copy a resource tree. Copies get fresh ids, no markers and no
    /// properties; linked resources are copied as plain resources.
    pub async fn copy(
        &mut self,
        source: &ResourcePath,
        destination: &ResourcePath,
        flags: UpdateFlags,
    ) -> WorkspaceResult<()> {
        let _step = self.step(RuleFactory::copy_rule(destination)).await?;
        let checkpoint = self.checkpoint();
        let result = self.copy_inner(source, destination, flags).await;
        self.settle(checkpoint, result)
    }

    async fn copy_inner(
        &mut self,
        source: &ResourcePath,
        destination: &ResourcePath,
        flags: UpdateFlags,
    ) -> WorkspaceResult<()> {
        let force = flags.contains(UpdateFlags::FORCE);
        let node = self.validate_transfer(source, destination, false)?;
        self.ensure_backed(source, &node).await?;
        let target = self.location(destination)?;
        if self.ws.files.exists(&target).await && !force {
            return Err(WorkspaceError::AlreadyExists(destination.clone()));
        }

        let mut plan = Vec::new();
        visit_raw(source, &node, &mut |p, n| plan.push((p.clone(), n.kind, n.read_only)));
        let mut created = Vec::new();
        if let Err(err) = self
            .copy_files(source, destination, &plan, &mut created)
            .await
        {
            revert(self.ws.files.as_ref(), &created).await;
            return Err(err);
        }
        self.journal.append(&mut created);

        let copy = self.fresh_copy(&node);
        self.tree.insert(destination, copy);
        debug!(job = %self.job, %source, %destination, nodes = plan.len(), "copied");
        Ok(())
    }

    async fn copy_files(
        &self,
        source: &ResourcePath,
        destination: &ResourcePath,
        plan: &[(ResourcePath, ResourceKind, bool)],
        created: &mut Vec<Undo>,
    ) -> WorkspaceResult<()> {
        let files = &self.ws.files;
        for (path, kind, read_only) in plan {
            if self.cancel.is_cancelled() {
                return Err(WorkspaceError::OperationCanceled);
            }
            let Some(target) = path.replace_prefix(source, destination) else {
                continue;
            };
            let to = self.location(&target)?;
            let existed = files.exists(&to).await;
            if kind.is_container() {
                if !existed {
                    files
                        .mkdir(&to)
                        .await
                        .map_err(|e| WorkspaceError::io(&target, e))?;
                    created.push(Undo::Remove(to));
                }
                continue;
            }
            let from = self.location(path)?;
            let data = files
                .read(&from)
                .await
                .map_err(|e| WorkspaceError::io(path, e))?;
            files
                .write(&to, &data)
                .await
                .map_err(|e| WorkspaceError::io(&target, e))?;
            if !existed {
                created.push(Undo::Remove(to.clone()));
            }
            if *read_only {
                files
                    .set_read_only(&to, true)
                    .await
                    .map_err(|e| WorkspaceError::io(&target, e))?;
            }
        }
        Ok(())
    }

    /// Create a linked folder or file pointing at `location`.
    pub async fn create_link(
        &mut self,
        path: &ResourcePath,
        kind: ResourceKind,
        location: PathBuf,
        flags: UpdateFlags,
    ) -> WorkspaceResult<()> {
        let _step = self
            .step(RuleFactory::create_rule(&self.tree, path, false))
            .await?;
        let checkpoint = self.checkpoint();
        let result = self.create_link_inner(path, kind, location, flags).await;
        self.settle(checkpoint, result)
    }

    async fn create_link_inner(
        &mut self,
        path: &ResourcePath,
        kind: ResourceKind,
        location: PathBuf,
        flags: UpdateFlags,
    ) -> WorkspaceResult<()> {
        if !matches!(kind, ResourceKind::Folder | ResourceKind::File) || path.segment_count() < 2 {
            return Err(WorkspaceError::invalid_path(
                path,
                "only folders and files inside a project can be links",
            ));
        }
        self.check_name(path)?;
        if let Some(project) = self.tree.closed_project_of(path) {
            return Err(WorkspaceError::ProjectClosed(project));
        }
        let parent = path.remove_last_segments(1);
        match self.tree.node(&parent) {
            None => return Err(WorkspaceError::ParentMissing(parent)),
            Some(node) if !node.kind.is_container() => {
                return Err(WorkspaceError::invalid_name(path, format!("{parent} is a file")));
            }
            Some(_) => {}
        }
        if let Some(existing) = self.tree.node(path) {
            if !flags.contains(UpdateFlags::REPLACE) {
                return Err(WorkspaceError::AlreadyExists(path.clone()));
            }
            let was_link = existing.is_link;
            self.tree.remove(path);
            if was_link {
                self.forget_link(path);
            }
            self.property_edits
                .push(PropertyEdit::RemoveSubtree(path.clone()));
        }
        self.check_case(path, None)?;
        if !flags.contains(UpdateFlags::ALLOW_MISSING_LOCAL) && !self.ws.files.exists(&location).await
        {
            return Err(WorkspaceError::MissingLinkTarget {
                path: path.clone(),
                location,
            });
        }

        let mut node = self.new_node(kind);
        node.is_link = true;
        node.linked_location = Some(location.clone());
        node.derived = flags.contains(UpdateFlags::DERIVED);
        node.team_private = flags.contains(UpdateFlags::TEAM_PRIVATE);
        self.tree.insert(path, Arc::new(node));
        self.describe_link(LinkDescription {
            path: path.clone(),
            kind,
            location,
        });
        debug!(job = %self.job, %path, "linked");
        Ok(())
    }

    // ── Contents and attributes ─────────────────────────────────────────────

    pub async fn read_contents(&self, path: &ResourcePath) -> WorkspaceResult<Vec<u8>> {
        self.ws.read_in(&self.tree, path).await
    }

    /// Replace a file's contents.
    pub async fn set_contents(
        &mut self,
        path: &ResourcePath,
        contents: &[u8],
        flags: UpdateFlags,
    ) -> WorkspaceResult<()> {
        let _step = self.step(RuleFactory::modify_rule(path)).await?;
        let checkpoint = self.checkpoint();
        let result = self.set_contents_inner(path, contents, flags).await;
        self.settle(checkpoint, result)
    }

    async fn set_contents_inner(
        &mut self,
        path: &ResourcePath,
        contents: &[u8],
        flags: UpdateFlags,
    ) -> WorkspaceResult<()> {
        let force = flags.contains(UpdateFlags::FORCE);
        let node = self.require(path)?;
        if node.kind != ResourceKind::File {
            return Err(WorkspaceError::invalid_path(path, "not a file"));
        }
        let read_only = node.read_only;
        if read_only && !force {
            return Err(WorkspaceError::ReadOnly(path.clone()));
        }
        let location = self.location(path)?;
        let ws = self.ws;
        let files = &ws.files;
        if !force && !files.exists(&location).await {
            return Err(WorkspaceError::OutOfSync(path.clone()));
        }

        if read_only {
            files
                .set_read_only(&location, false)
                .await
                .map_err(|e| WorkspaceError::io(path, e))?;
        }
        let written = files.write(&location, contents).await;
        if read_only {
            if let Err(error) = files.set_read_only(&location, true).await {
                warn!(%path, %error, "could not restore read-only bit");
            }
        }
        written.map_err(|e| WorkspaceError::io(path, e))?;

        let stamp = self.ws.next_stamp();
        if let Some(node) = self.tree.node_mut(path) {
            node.content_stamp = stamp;
        }
        Ok(())
    }

    pub async fn set_derived(&mut self, path: &ResourcePath, derived: bool) -> WorkspaceResult<()> {
        let _step = self.step(RuleFactory::modify_rule(path)).await?;
        self.set_flag(path, |node| &mut node.derived, derived)
    }

    pub async fn set_team_private(
        &mut self,
        path: &ResourcePath,
        team_private: bool,
    ) -> WorkspaceResult<()> {
        let _step = self.step(RuleFactory::modify_rule(path)).await?;
        self.set_flag(path, |node| &mut node.team_private, team_private)
    }

    /// Change the read-only attribute of a file or folder, on disk and in
    /// the model.
    pub async fn set_read_only(&mut self, path: &ResourcePath, read_only: bool) -> WorkspaceResult<()> {
        let _step = self.step(RuleFactory::modify_rule(path)).await?;
        let node = self.require(path)?;
        if !matches!(node.kind, ResourceKind::Folder | ResourceKind::File) {
            return Err(WorkspaceError::invalid_path(
                path,
                "only files and folders carry a read-only attribute",
            ));
        }
        if node.read_only == read_only {
            return Ok(());
        }
        let location = self.location(path)?;
        self.ws
            .files
            .set_read_only(&location, read_only)
            .await
            .map_err(|e| WorkspaceError::io(path, e))?;
        if let Some(node) = self.tree.node_mut(path) {
            node.read_only = read_only;
        }
        Ok(())
    }

    fn set_flag(
        &mut self,
        path: &ResourcePath,
        field: impl FnOnce(&mut Node) -> &mut bool,
        value: bool,
    ) -> WorkspaceResult<()> {
        if path.is_root() {
            return Err(WorkspaceError::invalid_path(path, "the workspace root has no attributes"));
        }
        self.require(path)?;
        if let Some(node) = self.tree.node_mut(path) {
            *field(node) = value;
        }
        Ok(())
    }

    // ── Projects ────────────────────────────────────────────────────────────

    /// Close a project. Its members stay in the model but are hidden until
    /// it is opened again.
    pub async fn close_project(&mut self, path: &ResourcePath) -> WorkspaceResult<()> {
        let _step = self.step(RuleFactory::modify_rule(path)).await?;
        let node = self.project_node(path)?;
        if !node.open {
            return Ok(());
        }
        self.pre_events
            .push(ResourceChangeEvent::pre_close(path.clone()));
        if let Some(node) = self.tree.node_mut(path) {
            node.open = false;
            detach_links(node);
        }
        info!(job = %self.job, project = %path, "project closed");
        Ok(())
    }

    /// Open a project, restoring its links from the project description.
    pub async fn open_project(&mut self, path: &ResourcePath) -> WorkspaceResult<()> {
        let _step = self.step(RuleFactory::modify_rule(path)).await?;
        if self.project_node(path)?.open {
            return Ok(());
        }
        let name = path.last_segment().unwrap_or_default().to_string();
        let links = overlay_links(
            self.ws.descriptions.as_ref(),
            &name,
            &self.description_edits,
        );
        if let Some(node) = self.tree.node_mut(path) {
            node.open = true;
        }

        let described: HashSet<&ResourcePath> = links.iter().map(|link| &link.path).collect();
        let mut stale = Vec::new();
        if let Some(project) = self.tree.subtree(path) {
            visit_raw(path, &project, &mut |p, n| {
                if n.is_link && !described.contains(p) {
                    stale.push(p.clone());
                }
            });
        }
        for p in stale {
            self.tree.remove(&p);
            self.property_edits.push(PropertyEdit::RemoveSubtree(p));
        }

        for link in &links {
            if !path.is_strict_prefix_of(&link.path) {
                continue;
            }
            match self.tree.raw_node(&link.path).map(|n| n.kind) {
                Some(kind) if kind == link.kind => {
                    if let Some(node) = self.tree.node_mut(&link.path) {
                        node.is_link = true;
                        node.linked_location = Some(link.location.clone());
                    }
                }
                _ => {
                    let mut node = self.new_node(link.kind);
                    node.is_link = true;
                    node.linked_location = Some(link.location.clone());
                    if !self.tree.insert(&link.path, Arc::new(node)) {
                        warn!(link = %link.path, "parent of described link is missing");
                    }
                }
            }
        }
        info!(job = %self.job, project = %path, links = links.len(), "project opened");
        Ok(())
    }

    fn project_node(&self, path: &ResourcePath) -> WorkspaceResult<&Node> {
        let node = self
            .tree
            .node(path)
            .ok_or_else(|| WorkspaceError::ResourceNotFound(path.clone()))?;
        if node.kind != ResourceKind::Project {
            return Err(WorkspaceError::invalid_path(path, "not a project"));
        }
        Ok(node)
    }

    // ── Markers ─────────────────────────────────────────────────────────────

    pub async fn create_marker(
        &mut self,
        path: &ResourcePath,
        marker_type: &str,
        attributes: MarkerAttributes,
    ) -> WorkspaceResult<MarkerId> {
        let _step = self.step(RuleFactory::marker_rule(path)).await?;
        self.require(path)?;
        self.ws
            .markers
            .add(&mut self.tree, path, marker_type, attributes)
    }

    /// Delete a marker. Returns false when no such marker exists.
    pub async fn delete_marker(&mut self, id: MarkerId) -> WorkspaceResult<bool> {
        let Some(path) = self.ws.markers.locate(&self.tree, id) else {
            return Ok(false);
        };
        let _step = self.step(RuleFactory::marker_rule(&path)).await?;
        Ok(self.ws.markers.remove(&mut self.tree, &path, id))
    }

    /// Remove markers of `marker_type` (all types when `None`) at `path`
    /// down to `depth`. Returns how many were removed.
    pub async fn remove_markers(
        &mut self,
        path: &ResourcePath,
        marker_type: Option<&str>,
        include_subtypes: bool,
        depth: Depth,
    ) -> WorkspaceResult<usize> {
        let _step = self.step(RuleFactory::marker_rule(path)).await?;
        self.require(path)?;
        self.ws
            .markers
            .remove_matching(&mut self.tree, path, marker_type, include_subtypes, depth)
    }

    /// Set (or with `None`, clear) one marker attribute.
    pub async fn set_marker_attribute(
        &mut self,
        id: MarkerId,
        key: &str,
        value: Option<MarkerValue>,
    ) -> WorkspaceResult<()> {
        let path = self
            .ws
            .markers
            .locate(&self.tree, id)
            .ok_or(WorkspaceError::MarkerNotFound(id))?;
        let _step = self.step(RuleFactory::marker_rule(&path)).await?;
        self.ws
            .markers
            .set_attribute(&mut self.tree, &path, id, key, value)
    }

    pub fn find_markers(
        &self,
        path: &ResourcePath,
        marker_type: Option<&str>,
        include_subtypes: bool,
        depth: Depth,
    ) -> WorkspaceResult<Vec<Marker>> {
        self.ws
            .markers
            .find(&self.tree, path, marker_type, include_subtypes, depth)
    }

    // ── Persistent properties ───────────────────────────────────────────────

    /// Value of a persistent property as this batch sees it.
    pub fn get_property(
        &self,
        path: &ResourcePath,
        name: &QualifiedName,
    ) -> WorkspaceResult<Option<String>> {
        if !self.tree.exists(path) {
            return Err(WorkspaceError::ResourceNotFound(path.clone()));
        }
        for edit in self.property_edits.iter().rev() {
            if let Some(value) = edit.resolve(path, name) {
                return Ok(value);
            }
        }
        self.ws.properties.get(path, name)
    }

    /// Set (or with `None`, remove) a persistent property. Written to the
    /// store on commit.
    pub async fn set_property(
        &mut self,
        path: &ResourcePath,
        name: &QualifiedName,
        value: Option<&str>,
    ) -> WorkspaceResult<()> {
        let _step = self.step(RuleFactory::modify_rule(path)).await?;
        if !self.tree.exists(path) {
            return Err(WorkspaceError::ResourceNotFound(path.clone()));
        }
        PropertyStore::validate(path, name, value)?;
        self.property_edits.push(PropertyEdit::Set {
            path: path.clone(),
            name: name.clone(),
            value: value.map(str::to_string),
        });
        self.touched.insert(path.clone());
        Ok(())
    }

    // ── Completion ──────────────────────────────────────────────────────────

    /// Publish the batch: write properties and descriptions, notify
    /// `PRE_*` listeners, graft the changed scopes into the shared tree and
    /// deliver `POST_CHANGE` once the rule is released.
    pub async fn commit(mut self) -> WorkspaceResult<CommitReport> {
        let ws = self.ws;
        let mut listener_failures = Vec::new();
        for event in &self.pre_events {
            listener_failures.extend(ws.dispatcher.dispatch(event).await);
        }

        ws.properties.apply(&self.property_edits)?;
        for edit in &self.description_edits {
            edit.apply(ws.descriptions.as_ref());
        }

        let (before, after) = {
            let mut shared = ws.tree.write();
            let before = shared.clone();
            for scope in self.rule.scopes() {
                if !shared.replace_subtree(scope, self.tree.subtree(scope)) {
                    debug!(%scope, "scope has no parent, nothing to graft");
                }
            }
            (before, shared.clone())
        };
        self.journal.clear();

        let touched = if ws.config.track_property_changes {
            std::mem::take(&mut self.touched)
        } else {
            BTreeSet::new()
        };
        let delta = DeltaComputer::with_touched_properties(touched).compute(&before, &after);
        if let Some(delta) = &delta {
            ws.markers.reindex(delta);
            info!(job = %self.job, rule = %self.rule, changes = delta.iter().count(), "operation committed");
        } else {
            debug!(job = %self.job, "operation committed without changes");
        }

        drop(self.guard.take());

        if let Some(delta) = &delta {
            let event = ResourceChangeEvent::post_change(delta.clone());
            listener_failures.extend(ws.dispatcher.dispatch(&event).await);
        }
        Ok(CommitReport {
            delta,
            listener_failures,
        })
    }

    /// Discard the batch, undo its file-store creations and renames, then
    /// release its rule.
    pub async fn abort(mut self) {
        let journal = std::mem::take(&mut self.journal);
        revert(self.ws.files.as_ref(), &journal).await;
        debug!(job = %self.job, rule = %self.rule, undone = journal.len(), "operation aborted");
    }

    // ── Helpers ─────────────────────────────────────────────────────────────

    async fn step(&self, rule: SchedulingRule) -> WorkspaceResult<RuleGuard> {
        if self.cancel.is_cancelled() {
            return Err(WorkspaceError::OperationCanceled);
        }
        self.ws
            .rules
            .acquire(self.job, rule, &self.cancel, None)
            .await
    }

    fn checkpoint(&self) -> Checkpoint {
        Checkpoint {
            tree: self.tree.clone(),
            property_edits: self.property_edits.len(),
            description_edits: self.description_edits.len(),
            touched: self.touched.clone(),
            pre_events: self.pre_events.len(),
        }
    }

    /// Undo everything since `checkpoint` unless `result` is a success or a
    /// partial success.
    fn settle<T>(&mut self, checkpoint: Checkpoint, result: WorkspaceResult<T>) -> WorkspaceResult<T> {
        if let Err(err) = &result {
            if !err.is_multi_status() {
                self.tree = checkpoint.tree;
                self.property_edits.truncate(checkpoint.property_edits);
                self.description_edits
                    .truncate(checkpoint.description_edits);
                self.touched = checkpoint.touched;
                self.pre_events.truncate(checkpoint.pre_events);
            }
        }
        result
    }

    fn require(&self, path: &ResourcePath) -> WorkspaceResult<&Node> {
        if let Some(project) = self.tree.closed_project_of(path) {
            return Err(WorkspaceError::ProjectClosed(project));
        }
        self.tree
            .node(path)
            .ok_or_else(|| WorkspaceError::ResourceNotFound(path.clone()))
    }

    fn location(&self, path: &ResourcePath) -> WorkspaceResult<PathBuf> {
        self.ws
            .location_in(&self.tree, path)
            .ok_or_else(|| WorkspaceError::OutOfSync(path.clone()))
    }

    fn new_node(&self, kind: ResourceKind) -> Node {
        Node::new(self.ws.next_resource_id(), kind, self.ws.next_stamp())
    }

    fn fresh_copy(&self, node: &Node) -> Arc<Node> {
        let mut copy = self.new_node(node.kind);
        copy.derived = node.derived;
        copy.team_private = node.team_private;
        copy.read_only = node.read_only;
        copy.children = node
            .children
            .iter()
            .map(|(name, child)| (name.clone(), self.fresh_copy(child)))
            .collect();
        Arc::new(copy)
    }

    fn check_name(&self, path: &ResourcePath) -> WorkspaceResult<()> {
        let name = path.last_segment().unwrap_or_default();
        self.ws
            .names
            .check(name, self.ws.config.platform)
            .map_err(|reason| WorkspaceError::invalid_name(path, reason))
    }

    /// On a case-insensitive workspace, reject `path` when a sibling differs
    /// from it only in case. `allowed` is a sibling that may match.
    fn check_case(&self, path: &ResourcePath, allowed: Option<&ResourcePath>) -> WorkspaceResult<()> {
        if self.ws.config.case_sensitive {
            return Ok(());
        }
        match self.tree.case_variant(path) {
            Some(existing) if Some(&existing) != allowed => Err(WorkspaceError::CaseVariantExists {
                path: path.clone(),
                existing,
            }),
            _ => Ok(()),
        }
    }

    /// Shared checks of move and copy. Returns the source subtree.
    fn validate_transfer(
        &self,
        source: &ResourcePath,
        destination: &ResourcePath,
        is_move: bool,
    ) -> WorkspaceResult<Arc<Node>> {
        if source.is_root() || destination.is_root() {
            return Err(WorkspaceError::invalid_path(source, "the workspace root cannot be moved or copied"));
        }
        if let Some(project) = self.tree.closed_project_of(source) {
            return Err(WorkspaceError::ProjectClosed(project));
        }
        let node = match (self.tree.node(source), self.tree.subtree(source)) {
            (Some(_), Some(node)) => node,
            _ => return Err(WorkspaceError::ResourceNotFound(source.clone())),
        };
        if node.hides_children() {
            return Err(WorkspaceError::ProjectClosed(source.clone()));
        }
        if is_move && source == destination {
            return Err(WorkspaceError::invalid_path(destination, "source and destination are the same"));
        }
        if source.is_strict_prefix_of(destination) {
            return Err(WorkspaceError::invalid_path(
                destination,
                format!("cannot place {source} inside itself"),
            ));
        }
        if (node.kind == ResourceKind::Project) != (destination.segment_count() == 1) {
            return Err(WorkspaceError::invalid_path(
                destination,
                "projects map to projects and members to members",
            ));
        }
        self.check_name(destination)?;
        if let Some(project) = self.tree.closed_project_of(destination) {
            return Err(WorkspaceError::ProjectClosed(project));
        }
        if self.tree.exists(destination) {
            return Err(WorkspaceError::AlreadyExists(destination.clone()));
        }
        let case_rename = is_move && source.matches(destination, false);
        self.check_case(destination, case_rename.then_some(source))?;
        if destination.segment_count() > 1 {
            let parent = destination.remove_last_segments(1);
            match self.tree.node(&parent) {
                None => return Err(WorkspaceError::ParentMissing(parent)),
                Some(p) if !p.kind.is_container() => {
                    return Err(WorkspaceError::invalid_name(destination, format!("{parent} is a file")));
                }
                Some(_) => {}
            }
        }
        Ok(node)
    }

    /// Fail with `OutOfSync` unless every resource of the subtree exists in
    /// the file store.
    async fn ensure_backed(&self, path: &ResourcePath, node: &Node) -> WorkspaceResult<()> {
        let mut paths = Vec::new();
        visit_raw(path, node, &mut |p, _| paths.push(p.clone()));
        for p in paths {
            let location = self.location(&p)?;
            if !self.ws.files.exists(&location).await {
                return Err(WorkspaceError::OutOfSync(p));
            }
        }
        Ok(())
    }

    fn describe_link(&mut self, link: LinkDescription) {
        if let Some(project) = link.path.segment(0) {
            self.description_edits
                .push(DescriptionEdit::Set(project.to_string(), link));
        }
    }

    fn forget_link(&mut self, path: &ResourcePath) {
        if let Some(project) = path.segment(0) {
            self.description_edits
                .push(DescriptionEdit::Remove(project.to_string(), path.clone()));
        }
    }
}

/// Pre-order list of the nodes a delete touches on disk. Members of a link
/// live elsewhere, so the walk stops at links.
impl Drop for Operation<'_> {
    fn drop(&mut self) {
        if self.journal.is_empty() {
            return;
        }
        let journal = std::mem::take(&mut self.journal);
        // The rule stays held until the store is back in line.
        let guard = self.guard.take();
        let files = Arc::clone(&self.ws.files);
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                debug!(job = %self.job, undone = journal.len(), "dropped operation, reverting");
                runtime.spawn(async move {
                    revert(files.as_ref(), &journal).await;
                    drop(guard);
                });
            }
            Err(_) => {
                warn!(job = %self.job, entries = journal.len(), "dropped outside a runtime, file store left as is");
            }
        }
    }
}

/// Reverse `journal`, newest entry first.
async fn revert(files: &dyn FileStore, journal: &[Undo]) {
    for entry in journal.iter().rev() {
        let outcome = match entry {
            Undo::Remove(location) => {
                if matches!(files.is_read_only(location).await, Ok(true)) {
                    if let Err(error) = files.set_read_only(location, false).await {
                        debug!(location = %location.display(), %error, "could not clear read-only bit");
                    }
                }
                files.remove(location).await
            }
            Undo::Rename { from, to } => files.rename(from, to).await,
        };
        if let Err(error) = outcome {
            warn!(?entry, %error, "could not undo file-store change");
        }
    }
}

fn collect_physical(path: &ResourcePath, node: &Arc<Node>, out: &mut Vec<(ResourcePath, Arc<Node>)>) {
    out.push((path.clone(), node.clone()));
    if node.is_link {
        return;
    }
    for (name, child) in &node.children {
        collect_physical(&path.append(name), child, out);
    }
}

fn contains_link(node: &Node) -> bool {
    node.is_link || node.children.values().any(|child| contains_link(child))
}

/// Drop the target locations of every link below `node`.
fn detach_links(node: &mut Node) {
    for child in node.children.values_mut() {
        if contains_link(child) {
            let child = Arc::make_mut(child);
            if child.is_link {
                child.linked_location = None;
            }
            detach_links(child);
        }
    }
}
