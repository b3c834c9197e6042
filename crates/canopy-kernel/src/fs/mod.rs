//! File-system collaborator.
//!
//! The kernel never touches disk directly. Every structural operation goes
//! through a [`FileStore`], addressed by absolute *locations* (plain
//! `std::path` paths) that the kernel resolves from resource paths, project
//! default locations and link targets.
//!
//! - [`MemoryFileStore`] - in-memory store (default, tests)
//! - [`LocalFileStore`] - real file system via `tokio::fs`
//!
//! All calls may fail with an [`FsError`], which is distinct from the
//! model-level errors the kernel raises.

mod error;
mod local;
mod memory;

use async_trait::async_trait;
use std::path::Path;

pub use error::{FsError, FsResult};
pub use local::LocalFileStore;
pub use memory::MemoryFileStore;

/// Backing storage for resources.
///
/// Implementations must be thread-safe; the kernel calls them from any task.
/// None of the operations create missing parent directories.
#[async_trait]
pub trait FileStore: Send + Sync + std::fmt::Debug {
    /// Read a whole file.
    async fn read(&self, location: &Path) -> FsResult<Vec<u8>>;

    /// Create or truncate a file and write `data`.
    async fn write(&self, location: &Path, data: &[u8]) -> FsResult<()>;

    /// Create one directory. Fails if it already exists.
    async fn mkdir(&self, location: &Path) -> FsResult<()>;

    /// Remove a file or an empty directory.
    async fn remove(&self, location: &Path) -> FsResult<()>;

    /// Rename a file or directory (with everything below it).
    async fn rename(&self, from: &Path, to: &Path) -> FsResult<()>;

    /// True if something exists at `location`.
    async fn exists(&self, location: &Path) -> bool;

    /// Whether the entry at `location` is read-only.
    async fn is_read_only(&self, location: &Path) -> FsResult<bool>;

    /// Change the read-only bit of the entry at `location`.
    async fn set_read_only(&self, location: &Path, read_only: bool) -> FsResult<()>;
}
