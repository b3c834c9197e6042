//! Project descriptions: the source of truth for linked resources.
//!
//! Only the link set of each project is modeled. When a project is closed
//! its in-memory link locations are dropped; opening it re-reads them from
//! here.

use std::collections::{BTreeMap, HashMap};
use std::fmt::Debug;
use std::path::PathBuf;

use canopy_types::{ResourceKind, ResourcePath};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

/// One linked resource of a project.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkDescription {
    /// Full resource path of the link.
    pub path: ResourcePath,
    /// `Folder` or `File`.
    pub kind: ResourceKind,
    /// Target location in the file store.
    pub location: PathBuf,
}

/// Collaborator holding the per-project link sets.
pub trait ProjectDescriptions: Send + Sync + Debug {
    /// Links described for `project`, ordered by path.
    fn links(&self, project: &str) -> Vec<LinkDescription>;

    /// Add or replace a link entry.
    fn set_link(&self, project: &str, link: LinkDescription);

    /// Remove a link entry. Returns whether it existed.
    fn remove_link(&self, project: &str, path: &ResourcePath) -> bool;

    /// Forget a project entirely.
    fn remove_project(&self, project: &str);
}

/// In-memory descriptions, the default collaborator.
#[derive(Debug, Default)]
pub struct InMemoryDescriptions {
    projects: RwLock<HashMap<String, BTreeMap<ResourcePath, LinkDescription>>>,
}

impl InMemoryDescriptions {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ProjectDescriptions for InMemoryDescriptions {
    fn links(&self, project: &str) -> Vec<LinkDescription> {
        self.projects
            .read()
            .get(project)
            .map(|links| links.values().cloned().collect())
            .unwrap_or_default()
    }

    fn set_link(&self, project: &str, link: LinkDescription) {
        self.projects
            .write()
            .entry(project.to_string())
            .or_default()
            .insert(link.path.clone(), link);
    }

    fn remove_link(&self, project: &str, path: &ResourcePath) -> bool {
        let mut projects = self.projects.write();
        let Some(links) = projects.get_mut(project) else {
            return false;
        };
        let removed = links.remove(path).is_some();
        if links.is_empty() {
            projects.remove(project);
        }
        removed
    }

    fn remove_project(&self, project: &str) {
        self.projects.write().remove(project);
    }
}

/// A description change recorded by an operation and applied on commit.
#[derive(Debug, Clone)]
pub(crate) enum DescriptionEdit {
    Set(String, LinkDescription),
    Remove(String, ResourcePath),
    RemoveProject(String),
}

impl DescriptionEdit {
    pub(crate) fn apply(&self, descriptions: &dyn ProjectDescriptions) {
        match self {
            DescriptionEdit::Set(project, link) => descriptions.set_link(project, link.clone()),
            DescriptionEdit::Remove(project, path) => {
                descriptions.remove_link(project, path);
            }
            DescriptionEdit::RemoveProject(project) => descriptions.remove_project(project),
        }
    }
}

/// Links of `project` as they will look once `pending` is applied.
pub(crate) fn overlay_links(
    descriptions: &dyn ProjectDescriptions,
    project: &str,
    pending: &[DescriptionEdit],
) -> Vec<LinkDescription> {
    let mut links: BTreeMap<ResourcePath, LinkDescription> = descriptions
        .links(project)
        .into_iter()
        .map(|link| (link.path.clone(), link))
        .collect();
    for edit in pending {
        match edit {
            DescriptionEdit::Set(p, link) if p == project => {
                links.insert(link.path.clone(), link.clone());
            }
            DescriptionEdit::Remove(p, path) if p == project => {
                links.remove(path);
            }
            DescriptionEdit::RemoveProject(p) if p == project => links.clear(),
            _ => {}
        }
    }
    links.into_values().collect()
}
