//! Workspace error types.

use std::path::PathBuf;

use canopy_types::{JobId, MarkerId, ResourcePath};
use strum::IntoStaticStr;
use thiserror::Error;

use crate::fs::FsError;
use crate::rules::SchedulingRule;

/// Errors raised by workspace operations.
///
/// Every variant that concerns a resource carries the offending path so
/// callers can tell "already in the desired state" apart from a genuine
/// failure.
#[derive(Debug, Error, IntoStaticStr)]
pub enum WorkspaceError {
    #[error("resource already exists: {0}")]
    AlreadyExists(ResourcePath),

    #[error("a resource differing only in case already exists: {path} (existing {existing})")]
    CaseVariantExists {
        path: ResourcePath,
        existing: ResourcePath,
    },

    #[error("parent does not exist: {0}")]
    ParentMissing(ResourcePath),

    #[error("invalid name at {path}: {reason}")]
    InvalidName { path: ResourcePath, reason: String },

    #[error("invalid path {path}: {reason}")]
    InvalidPath { path: ResourcePath, reason: String },

    #[error("resource not found: {0}")]
    ResourceNotFound(ResourcePath),

    #[error("marker not found: {0}")]
    MarkerNotFound(MarkerId),

    #[error("project is closed: {0}")]
    ProjectClosed(ResourcePath),

    #[error("resource is out of sync with the file system: {0}")]
    OutOfSync(ResourcePath),

    #[error("resource is read-only: {0}")]
    ReadOnly(ResourcePath),

    #[error("link target of {path} does not exist: {}", location.display())]
    MissingLinkTarget {
        path: ResourcePath,
        location: PathBuf,
    },

    #[error("invalid value for {path}: {reason}")]
    InvalidValue { path: ResourcePath, reason: String },

    /// File store failure, wrapping the collaborator's error.
    #[error("I/O failure at {path}: {source}")]
    IoFailure {
        path: ResourcePath,
        #[source]
        source: FsError,
    },

    #[error("timed out acquiring rule {0}")]
    LockTimeout(SchedulingRule),

    #[error("timed out waiting for {0}")]
    WaitTimeout(String),

    #[error("operation canceled")]
    OperationCanceled,

    #[error("rule {requested} cannot be taken while holding {held}")]
    IllegalNesting {
        requested: SchedulingRule,
        held: SchedulingRule,
    },

    /// Aggregate of failures from a recursive operation that kept going.
    #[error("{} problem(s) under {path}", errors.len())]
    MultiStatus {
        path: ResourcePath,
        errors: Vec<WorkspaceError>,
    },

    #[error("property storage: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("configuration: {0}")]
    Config(String),

    #[error("job {job} failed: {reason}")]
    JobFailed { job: JobId, reason: String },
}

impl WorkspaceError {
    pub fn invalid_path(path: &ResourcePath, reason: impl Into<String>) -> Self {
        Self::InvalidPath {
            path: path.clone(),
            reason: reason.into(),
        }
    }

    pub fn invalid_name(path: &ResourcePath, reason: impl Into<String>) -> Self {
        Self::InvalidName {
            path: path.clone(),
            reason: reason.into(),
        }
    }

    pub fn io(path: &ResourcePath, source: FsError) -> Self {
        Self::IoFailure {
            path: path.clone(),
            source,
        }
    }

    /// Variant name, e.g. `"AlreadyExists"`.
    pub fn kind_name(&self) -> &'static str {
        self.into()
    }

    pub fn is_multi_status(&self) -> bool {
        matches!(self, Self::MultiStatus { .. })
    }

    /// Offending resource paths. A multi-status lists the paths of its
    /// members, not its own root.
    pub fn paths(&self) -> Vec<ResourcePath> {
        match self {
            Self::AlreadyExists(path)
            | Self::ParentMissing(path)
            | Self::ResourceNotFound(path)
            | Self::ProjectClosed(path)
            | Self::OutOfSync(path)
            | Self::ReadOnly(path)
            | Self::CaseVariantExists { path, .. }
            | Self::InvalidName { path, .. }
            | Self::InvalidPath { path, .. }
            | Self::MissingLinkTarget { path, .. }
            | Self::InvalidValue { path, .. }
            | Self::IoFailure { path, .. } => vec![path.clone()],
            Self::MultiStatus { errors, .. } => errors.iter().flat_map(Self::paths).collect(),
            Self::LockTimeout(rule) | Self::IllegalNesting { requested: rule, .. } => {
                rule.scopes().to_vec()
            }
            Self::MarkerNotFound(_)
            | Self::WaitTimeout(_)
            | Self::OperationCanceled
            | Self::Storage(_)
            | Self::Config(_)
            | Self::JobFailed { .. } => Vec::new(),
        }
    }
}

/// Workspace result type.
pub type WorkspaceResult<T> = Result<T, WorkspaceError>;

#[cfg(test)]
mod tests {
    use super::*;

    fn p(s: &str) -> ResourcePath {
        ResourcePath::parse(s).unwrap()
    }

    #[test]
    fn test_multi_status_flattens_paths() {
        let err = WorkspaceError::MultiStatus {
            path: p("/P/c"),
            errors: vec![
                WorkspaceError::ReadOnly(p("/P/c/x")),
                WorkspaceError::io(&p("/P/c/y"), FsError::other("disk gone")),
            ],
        };
        assert!(err.is_multi_status());
        assert_eq!(err.paths(), vec![p("/P/c/x"), p("/P/c/y")]);
        assert_eq!(err.to_string(), "2 problem(s) under /P/c");
    }

    #[test]
    fn test_kind_name() {
        assert_eq!(WorkspaceError::AlreadyExists(p("/P")).kind_name(), "AlreadyExists");
        assert_eq!(WorkspaceError::OperationCanceled.kind_name(), "OperationCanceled");
    }
}
