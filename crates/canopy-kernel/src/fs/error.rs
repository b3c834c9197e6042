//! File store error types.

use std::io;
use std::path::Path;

use thiserror::Error;

/// Errors raised by a [`FileStore`](super::FileStore).
///
/// These are collaborator-level failures, kept apart from model-level
/// [`WorkspaceError`](crate::WorkspaceError)s; the kernel wraps them in
/// `WorkspaceError::IoFailure` together with the offending resource path.
#[derive(Debug, Error)]
pub enum FsError {
    /// File or directory not found.
    #[error("not found: {0}")]
    NotFound(String),

    /// Location already exists.
    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// Permission denied (including writes to read-only files).
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// Expected a directory.
    #[error("not a directory: {0}")]
    NotADirectory(String),

    /// Expected a file.
    #[error("is a directory: {0}")]
    IsADirectory(String),

    /// Directory not empty.
    #[error("directory not empty: {0}")]
    DirectoryNotEmpty(String),

    /// Location escapes the confinement root.
    #[error("path escapes root: {0}")]
    PathEscapesRoot(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Other error.
    #[error("{0}")]
    Other(String),
}

impl FsError {
    pub fn not_found(location: &Path) -> Self {
        Self::NotFound(location.display().to_string())
    }

    pub fn already_exists(location: &Path) -> Self {
        Self::AlreadyExists(location.display().to_string())
    }

    pub fn permission_denied(location: &Path) -> Self {
        Self::PermissionDenied(location.display().to_string())
    }

    pub fn not_a_directory(location: &Path) -> Self {
        Self::NotADirectory(location.display().to_string())
    }

    pub fn is_a_directory(location: &Path) -> Self {
        Self::IsADirectory(location.display().to_string())
    }

    pub fn directory_not_empty(location: &Path) -> Self {
        Self::DirectoryNotEmpty(location.display().to_string())
    }

    pub fn other(msg: impl Into<String>) -> Self {
        Self::Other(msg.into())
    }

    /// Map a `std::io::Error` to the closest variant, keeping the location.
    pub fn from_io(location: &Path, err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::NotFound => Self::not_found(location),
            io::ErrorKind::AlreadyExists => Self::already_exists(location),
            io::ErrorKind::PermissionDenied => Self::permission_denied(location),
            io::ErrorKind::NotADirectory => Self::not_a_directory(location),
            io::ErrorKind::IsADirectory => Self::is_a_directory(location),
            io::ErrorKind::DirectoryNotEmpty => Self::directory_not_empty(location),
            _ => Self::Io(err),
        }
    }

    /// True when the location was missing.
    pub fn is_not_found(&self) -> bool {
        match self {
            Self::NotFound(_) => true,
            Self::Io(e) => e.kind() == io::ErrorKind::NotFound,
            _ => false,
        }
    }
}

/// Convert FsError to std::io::Error for compatibility.
impl From<FsError> for io::Error {
    fn from(e: FsError) -> Self {
        match e {
            FsError::NotFound(msg) => io::Error::new(io::ErrorKind::NotFound, msg),
            FsError::AlreadyExists(msg) => io::Error::new(io::ErrorKind::AlreadyExists, msg),
            FsError::PermissionDenied(msg) => io::Error::new(io::ErrorKind::PermissionDenied, msg),
            FsError::NotADirectory(msg) => io::Error::new(io::ErrorKind::NotADirectory, msg),
            FsError::IsADirectory(msg) => io::Error::new(io::ErrorKind::IsADirectory, msg),
            FsError::DirectoryNotEmpty(msg) => {
                io::Error::new(io::ErrorKind::DirectoryNotEmpty, msg)
            }
            FsError::PathEscapesRoot(msg) => io::Error::new(io::ErrorKind::PermissionDenied, msg),
            FsError::Io(e) => e,
            FsError::Other(msg) => io::Error::other(msg),
        }
    }
}

/// File store result type.
pub type FsResult<T> = Result<T, FsError>;
