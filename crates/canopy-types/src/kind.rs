//! Resource kinds and qualified property names.

use std::fmt;

use serde::{Deserialize, Serialize};
use strum::{Display, EnumString, IntoStaticStr};

/// The tag of a resource node.
///
/// Resources are one tagged variant rather than a type hierarchy; callers
/// ask capability questions such as [`ResourceKind::is_container`].
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Display,
    EnumString, IntoStaticStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ResourceKind {
    /// The workspace root. Exactly one, at the empty path.
    Root,
    /// A project, always a direct child of the root.
    Project,
    /// A folder inside a project.
    Folder,
    /// A file. Never has children.
    File,
}

impl ResourceKind {
    /// True for kinds that may have children.
    pub fn is_container(&self) -> bool {
        !matches!(self, ResourceKind::File)
    }

    /// Segment count a path must have for this kind: exact for root and
    /// projects, a minimum of two for folders and files.
    pub fn accepts_depth(&self, segments: usize) -> bool {
        match self {
            ResourceKind::Root => segments == 0,
            ResourceKind::Project => segments == 1,
            ResourceKind::Folder | ResourceKind::File => segments >= 2,
        }
    }
}

/// Two-part name used as the key of persistent properties.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct QualifiedName {
    /// Namespace, usually a plug-in or tool id. May be empty.
    pub qualifier: String,
    /// Name within the namespace. Never empty for a stored property.
    pub local_name: String,
}

impl QualifiedName {
    pub fn new(qualifier: impl Into<String>, local_name: impl Into<String>) -> Self {
        Self {
            qualifier: qualifier.into(),
            local_name: local_name.into(),
        }
    }
}

impl fmt::Display for QualifiedName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.qualifier.is_empty() {
            f.write_str(&self.local_name)
        } else {
            write!(f, "{}:{}", self.qualifier, self.local_name)
        }
    }
}
