//! The workspace: shared resource tree plus its collaborators.
//!
//! Reads go straight to the committed tree. Mutations run inside an
//! [`Operation`] obtained from [`Workspace::begin`]; the one-call helpers
//! below open a single-step operation with the rule the step needs and
//! commit it.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use canopy_types::{JobId, MarkerId, QualifiedName, ResourceId, ResourceKind, ResourcePath, WorkspaceId};
use parking_lot::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::WorkspaceConfig;
use crate::description::{InMemoryDescriptions, LinkDescription, ProjectDescriptions};
use crate::error::{WorkspaceError, WorkspaceResult};
use crate::fs::{FileStore, MemoryFileStore};
use crate::lock::RuleManager;
use crate::markers::{Depth, Marker, MarkerAttributes, MarkerStore, MarkerTypeRegistry, MarkerValue};
use crate::names::{NameValidator, PlatformNameRules};
use crate::notify::{EventKind, ListenerId, NotificationDispatcher, ResourceChangeListener, Subscription};
use crate::operation::{Operation, UpdateFlags};
use crate::properties::PropertyStore;
use crate::rules::{RuleFactory, SchedulingRule};
use crate::tree::{Node, ResourceInfo, ResourceTree};

/// Assembles a [`Workspace`] from a config and optional collaborators.
#[derive(Debug, Default)]
pub struct WorkspaceBuilder {
    config: WorkspaceConfig,
    files: Option<Arc<dyn FileStore>>,
    names: Option<Arc<dyn NameValidator>>,
    descriptions: Option<Arc<dyn ProjectDescriptions>>,
}

impl WorkspaceBuilder {
    pub fn new(config: WorkspaceConfig) -> Self {
        Self {
            config,
            ..Self::default()
        }
    }

    /// Backing store. Defaults to a [`MemoryFileStore`].
    pub fn file_store(mut self, files: Arc<dyn FileStore>) -> Self {
        self.files = Some(files);
        self
    }

    pub fn name_validator(mut self, names: Arc<dyn NameValidator>) -> Self {
        self.names = Some(names);
        self
    }

    pub fn descriptions(mut self, descriptions: Arc<dyn ProjectDescriptions>) -> Self {
        self.descriptions = Some(descriptions);
        self
    }

    pub fn build(self) -> WorkspaceResult<Arc<Workspace>> {
        let properties = match &self.config.properties_db {
            Some(path) => PropertyStore::open(path)?,
            None => PropertyStore::in_memory()?,
        };
        let id = WorkspaceId::new();
        info!(workspace = %id.short(), location = %self.config.location.display(), "workspace opened");
        Ok(Arc::new(Workspace {
            id,
            dispatcher: NotificationDispatcher::new(self.config.listener_capacity),
            tree: RwLock::new(ResourceTree::new(ResourceId::from_raw(0))),
            rules: Arc::new(RuleManager::new()),
            files: self
                .files
                .unwrap_or_else(|| Arc::new(MemoryFileStore::new())),
            names: self.names.unwrap_or_else(|| Arc::new(PlatformNameRules)),
            descriptions: self
                .descriptions
                .unwrap_or_else(|| Arc::new(InMemoryDescriptions::new())),
            markers: MarkerStore::new(),
            properties,
            next_resource: AtomicU64::new(1),
            next_stamp: AtomicU64::new(1),
            next_job: AtomicU64::new(1),
            config: self.config,
        }))
    }
}

/// A resource workspace.
pub struct Workspace {
    id: WorkspaceId,
    pub(crate) config: WorkspaceConfig,
    pub(crate) tree: RwLock<ResourceTree>,
    pub(crate) rules: Arc<RuleManager>,
    pub(crate) files: Arc<dyn FileStore>,
    pub(crate) names: Arc<dyn NameValidator>,
    pub(crate) descriptions: Arc<dyn ProjectDescriptions>,
    pub(crate) markers: MarkerStore,
    pub(crate) properties: PropertyStore,
    pub(crate) dispatcher: NotificationDispatcher,
    next_resource: AtomicU64,
    next_stamp: AtomicU64,
    next_job: AtomicU64,
}

impl std::fmt::Debug for Workspace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Workspace")
            .field("id", &self.id)
            .field("location", &self.config.location)
            .field("files", &self.files)
            .finish_non_exhaustive()
    }
}

impl Workspace {
    /// Workspace with default config and in-memory collaborators.
    pub fn in_memory() -> WorkspaceResult<Arc<Self>> {
        WorkspaceBuilder::default().build()
    }

    pub fn builder(config: WorkspaceConfig) -> WorkspaceBuilder {
        WorkspaceBuilder::new(config)
    }

    pub fn id(&self) -> WorkspaceId {
        self.id
    }

    pub fn config(&self) -> &WorkspaceConfig {
        &self.config
    }

    pub fn rules(&self) -> &Arc<RuleManager> {
        &self.rules
    }

    pub fn marker_types(&self) -> &MarkerTypeRegistry {
        self.markers.types()
    }

    pub fn file_store(&self) -> &Arc<dyn FileStore> {
        &self.files
    }

    // ── Operations ──────────────────────────────────────────────────────────

    /// Start a batch under `rule`, waiting up to the configured lock timeout.
    pub async fn begin(&self, rule: SchedulingRule) -> WorkspaceResult<Operation<'_>> {
        self.begin_with(rule, &CancellationToken::new(), self.config.lock_timeout())
            .await
    }

    /// Start a batch under `rule` with an explicit cancel token and timeout.
    pub async fn begin_with(
        &self,
        rule: SchedulingRule,
        cancel: &CancellationToken,
        timeout: Option<Duration>,
    ) -> WorkspaceResult<Operation<'_>> {
        self.begin_as(self.allocate_job(), rule, cancel, timeout)
            .await
    }

    /// Start a batch owned by `job`. A job runs one batch at a time; its
    /// steps nest inside that batch instead.
    pub(crate) async fn begin_as(
        &self,
        job: JobId,
        rule: SchedulingRule,
        cancel: &CancellationToken,
        timeout: Option<Duration>,
    ) -> WorkspaceResult<Operation<'_>> {
        if let Some(held) = self.rules.held_by(job) {
            return Err(WorkspaceError::IllegalNesting {
                requested: rule,
                held,
            });
        }
        let guard = self.rules.acquire(job, rule.clone(), cancel, timeout).await?;
        let tree = self.tree.read().clone();
        debug!(%job, %rule, "operation started");
        Ok(Operation::new(self, job, rule, guard, cancel.clone(), tree))
    }

    /// Wait until no job holds or waits for a rule conflicting with `rule`.
    pub async fn join(
        &self,
        rule: &SchedulingRule,
        cancel: &CancellationToken,
        timeout: Option<Duration>,
    ) -> WorkspaceResult<()> {
        self.rules.join(rule, cancel, timeout).await
    }

    // ── Reads ───────────────────────────────────────────────────────────────

    /// Immutable view of the committed tree.
    pub fn snapshot(&self) -> ResourceTree {
        self.tree.read().clone()
    }

    pub fn lookup(&self, path: &ResourcePath) -> Option<ResourceInfo> {
        self.tree.read().lookup(path)
    }

    pub fn exists(&self, path: &ResourcePath) -> bool {
        self.tree.read().exists(path)
    }

    pub fn members(&self, path: &ResourcePath) -> Vec<ResourcePath> {
        self.tree.read().members(path)
    }

    /// File-store location backing `path`, if it can be resolved.
    pub fn location(&self, path: &ResourcePath) -> Option<PathBuf> {
        self.location_in(&self.tree.read(), path)
    }

    pub async fn read_contents(&self, path: &ResourcePath) -> WorkspaceResult<Vec<u8>> {
        let tree = self.snapshot();
        self.read_in(&tree, path).await
    }

    pub fn find_markers(
        &self,
        path: &ResourcePath,
        marker_type: Option<&str>,
        include_subtypes: bool,
        depth: Depth,
    ) -> WorkspaceResult<Vec<Marker>> {
        let tree = self.snapshot();
        self.markers
            .find(&tree, path, marker_type, include_subtypes, depth)
    }

    pub fn find_marker(&self, id: MarkerId) -> Option<Marker> {
        let tree = self.snapshot();
        self.markers.find_marker(&tree, id)
    }

    pub fn get_property(
        &self,
        path: &ResourcePath,
        name: &QualifiedName,
    ) -> WorkspaceResult<Option<String>> {
        if !self.exists(path) {
            return Err(WorkspaceError::ResourceNotFound(path.clone()));
        }
        self.properties.get(path, name)
    }

    /// Every persistent property of `path`, ordered by name.
    pub fn properties(&self, path: &ResourcePath) -> WorkspaceResult<Vec<(QualifiedName, String)>> {
        if !self.exists(path) {
            return Err(WorkspaceError::ResourceNotFound(path.clone()));
        }
        self.properties.list(path)
    }

    /// Links currently described for `project`.
    pub fn project_links(&self, project: &str) -> Vec<LinkDescription> {
        self.descriptions.links(project)
    }

    // ── Notification ────────────────────────────────────────────────────────

    pub fn add_listener(
        &self,
        listener: Arc<dyn ResourceChangeListener>,
        mask: EventKind,
    ) -> ListenerId {
        self.dispatcher.add_listener(listener, mask)
    }

    pub fn remove_listener(&self, id: ListenerId) -> bool {
        self.dispatcher.remove_listener(id)
    }

    pub fn subscribe(&self, mask: EventKind) -> Subscription {
        self.dispatcher.subscribe(mask)
    }

    // ── One-call operations ─────────────────────────────────────────────────

    pub async fn create(
        &self,
        path: &ResourcePath,
        kind: ResourceKind,
        flags: UpdateFlags,
    ) -> WorkspaceResult<()> {
        let rule = self.with_tree(|tree| {
            RuleFactory::create_rule(tree, path, flags.contains(UpdateFlags::FORCE))
        });
        let mut op = self.begin(rule).await?;
        let result = op.create(path, kind, flags).await;
        finish(op, result).await
    }

    pub async fn create_file(
        &self,
        path: &ResourcePath,
        contents: &[u8],
        flags: UpdateFlags,
    ) -> WorkspaceResult<()> {
        let rule = self.with_tree(|tree| {
            RuleFactory::create_rule(tree, path, flags.contains(UpdateFlags::FORCE))
        });
        let mut op = self.begin(rule).await?;
        let result = op.create_file(path, contents, flags).await;
        finish(op, result).await
    }

    pub async fn create_link(
        &self,
        path: &ResourcePath,
        kind: ResourceKind,
        location: PathBuf,
        flags: UpdateFlags,
    ) -> WorkspaceResult<()> {
        let rule = self.with_tree(|tree| RuleFactory::create_rule(tree, path, false));
        let mut op = self.begin(rule).await?;
        let result = op.create_link(path, kind, location, flags).await;
        finish(op, result).await
    }

    pub async fn delete(&self, path: &ResourcePath, flags: UpdateFlags) -> WorkspaceResult<()> {
        let mut op = self.begin(RuleFactory::delete_rule(path)).await?;
        let result = op.delete(path, flags).await;
        finish(op, result).await
    }

    pub async fn move_resource(
        &self,
        source: &ResourcePath,
        destination: &ResourcePath,
        flags: UpdateFlags,
    ) -> WorkspaceResult<()> {
        let mut op = self
            .begin(RuleFactory::move_rule(source, destination))
            .await?;
        let result = op.move_resource(source, destination, flags).await;
        finish(op, result).await
    }

    pub async fn copy(
        &self,
        source: &ResourcePath,
        destination: &ResourcePath,
        flags: UpdateFlags,
    ) -> WorkspaceResult<()> {
        let mut op = self.begin(RuleFactory::copy_rule(destination)).await?;
        let result = op.copy(source, destination, flags).await;
        finish(op, result).await
    }

    pub async fn set_contents(
        &self,
        path: &ResourcePath,
        contents: &[u8],
        flags: UpdateFlags,
    ) -> WorkspaceResult<()> {
        let mut op = self.begin(RuleFactory::modify_rule(path)).await?;
        let result = op.set_contents(path, contents, flags).await;
        finish(op, result).await
    }

    pub async fn set_derived(&self, path: &ResourcePath, derived: bool) -> WorkspaceResult<()> {
        let mut op = self.begin(RuleFactory::modify_rule(path)).await?;
        let result = op.set_derived(path, derived).await;
        finish(op, result).await
    }

    pub async fn set_team_private(&self, path: &ResourcePath, team_private: bool) -> WorkspaceResult<()> {
        let mut op = self.begin(RuleFactory::modify_rule(path)).await?;
        let result = op.set_team_private(path, team_private).await;
        finish(op, result).await
    }

    pub async fn set_read_only(&self, path: &ResourcePath, read_only: bool) -> WorkspaceResult<()> {
        let mut op = self.begin(RuleFactory::modify_rule(path)).await?;
        let result = op.set_read_only(path, read_only).await;
        finish(op, result).await
    }

    pub async fn open_project(&self, path: &ResourcePath) -> WorkspaceResult<()> {
        let mut op = self.begin(RuleFactory::modify_rule(path)).await?;
        let result = op.open_project(path).await;
        finish(op, result).await
    }

    pub async fn close_project(&self, path: &ResourcePath) -> WorkspaceResult<()> {
        let mut op = self.begin(RuleFactory::modify_rule(path)).await?;
        let result = op.close_project(path).await;
        finish(op, result).await
    }

    pub async fn create_marker(
        &self,
        path: &ResourcePath,
        marker_type: &str,
        attributes: MarkerAttributes,
    ) -> WorkspaceResult<MarkerId> {
        let mut op = self.begin(RuleFactory::marker_rule(path)).await?;
        let result = op.create_marker(path, marker_type, attributes).await;
        finish(op, result).await
    }

    pub async fn delete_marker(&self, id: MarkerId) -> WorkspaceResult<bool> {
        let Some(path) = self.find_marker(id).map(|marker| marker.path) else {
            return Ok(false);
        };
        let mut op = self.begin(RuleFactory::marker_rule(&path)).await?;
        let result = op.delete_marker(id).await;
        finish(op, result).await
    }

    pub async fn remove_markers(
        &self,
        path: &ResourcePath,
        marker_type: Option<&str>,
        include_subtypes: bool,
        depth: Depth,
    ) -> WorkspaceResult<usize> {
        let mut op = self.begin(RuleFactory::marker_rule(path)).await?;
        let result = op
            .remove_markers(path, marker_type, include_subtypes, depth)
            .await;
        finish(op, result).await
    }

    pub async fn set_marker_attribute(
        &self,
        id: MarkerId,
        key: &str,
        value: Option<MarkerValue>,
    ) -> WorkspaceResult<()> {
        let path = self
            .find_marker(id)
            .map(|marker| marker.path)
            .ok_or(WorkspaceError::MarkerNotFound(id))?;
        let mut op = self.begin(RuleFactory::marker_rule(&path)).await?;
        let result = op.set_marker_attribute(id, key, value).await;
        finish(op, result).await
    }

    pub async fn set_property(
        &self,
        path: &ResourcePath,
        name: &QualifiedName,
        value: Option<&str>,
    ) -> WorkspaceResult<()> {
        let mut op = self.begin(RuleFactory::modify_rule(path)).await?;
        let result = op.set_property(path, name, value).await;
        finish(op, result).await
    }

    // ── Crate-internal ──────────────────────────────────────────────────────

    fn with_tree<T>(&self, f: impl FnOnce(&ResourceTree) -> T) -> T {
        f(&self.tree.read())
    }

    pub(crate) fn next_resource_id(&self) -> ResourceId {
        ResourceId::from_raw(self.next_resource.fetch_add(1, Ordering::Relaxed))
    }

    pub(crate) fn next_stamp(&self) -> u64 {
        self.next_stamp.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn allocate_job(&self) -> JobId {
        JobId::from_raw(self.next_job.fetch_add(1, Ordering::Relaxed))
    }

    /// Resolve the file-store location of `path` in `tree`.
    ///
    /// A project lives at `<workspace location>/<name>`, a link at its
    /// target, anything else below its parent's location. Paths that do not
    /// exist yet resolve below their deepest existing ancestor. `None` when
    /// the path runs through a link whose target is unknown.
    pub(crate) fn location_in(&self, tree: &ResourceTree, path: &ResourcePath) -> Option<PathBuf> {
        let mut location = self.config.location.clone();
        let mut node: Option<&Node> = Some(tree.root_node());
        for segment in path.segments() {
            let child = node.and_then(|n| n.children.get(segment));
            location = match child {
                Some(child) if child.is_link => child.linked_location.clone()?,
                _ => location.join(segment),
            };
            node = child.map(|c| &**c);
        }
        Some(location)
    }

    pub(crate) async fn read_in(&self, tree: &ResourceTree, path: &ResourcePath) -> WorkspaceResult<Vec<u8>> {
        if let Some(project) = tree.closed_project_of(path) {
            return Err(WorkspaceError::ProjectClosed(project));
        }
        let kind = tree
            .node(path)
            .map(|node| node.kind)
            .ok_or_else(|| WorkspaceError::ResourceNotFound(path.clone()))?;
        if kind != ResourceKind::File {
            return Err(WorkspaceError::invalid_path(path, "not a file"));
        }
        let location = self
            .location_in(tree, path)
            .ok_or_else(|| WorkspaceError::OutOfSync(path.clone()))?;
        self.files
            .read(&location)
            .await
            .map_err(|e| WorkspaceError::io(path, e))
    }
}

/// Commit a one-call operation. A partial success is committed and still
/// reported as an error.
async fn finish<T>(op: Operation<'_>, result: WorkspaceResult<T>) -> WorkspaceResult<T> {
    match result {
        Ok(value) => {
            op.commit().await?;
            Ok(value)
        }
        Err(err) if err.is_multi_status() => {
            op.commit().await?;
            Err(err)
        }
        Err(err) => {
            op.abort().await;
            Err(err)
        }
    }
}
