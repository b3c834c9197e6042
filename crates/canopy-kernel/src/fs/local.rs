//! Local file system store.
//!
//! Locations are absolute host paths. An optional confinement root rejects
//! any location outside it, so a misconfigured link cannot reach the rest of
//! the disk.

use async_trait::async_trait;
use std::path::{Component, Path, PathBuf};
use tokio::fs;

use super::error::{FsError, FsResult};
use super::FileStore;

/// Local file system store backed by `tokio::fs`.
#[derive(Debug, Clone, Default)]
pub struct LocalFileStore {
    root: Option<PathBuf>,
}

impl LocalFileStore {
    /// A store that accepts any absolute location.
    pub fn new() -> Self {
        Self { root: None }
    }

    /// A store that only accepts locations under `root`.
    ///
    /// The root is canonicalized at construction time to handle symlinks
    /// (e.g. macOS `/tmp` → `/private/tmp`).
    pub fn confined(root: impl Into<PathBuf>) -> Self {
        let root: PathBuf = root.into();
        let root = root.canonicalize().unwrap_or(root);
        Self { root: Some(root) }
    }

    /// The confinement root, if any.
    pub fn root(&self) -> Option<&Path> {
        self.root.as_deref()
    }

    /// Lexically normalize and check confinement.
    fn resolve(&self, location: &Path) -> FsResult<PathBuf> {
        let mut resolved = PathBuf::new();
        for component in location.components() {
            match component {
                Component::ParentDir => {
                    resolved.pop();
                }
                Component::CurDir => {}
                other => resolved.push(other.as_os_str()),
            }
        }

        let Some(root) = &self.root else {
            return Ok(resolved);
        };

        // Compare against the canonical parent so symlinked temp dirs match.
        let canonical = match resolved.parent() {
            Some(parent) if parent.exists() => match (parent.canonicalize(), resolved.file_name()) {
                (Ok(parent), Some(name)) => parent.join(name),
                _ => resolved.clone(),
            },
            _ => resolved.clone(),
        };
        if !canonical.starts_with(root) && !resolved.starts_with(root) {
            return Err(FsError::PathEscapesRoot(format!(
                "{} is not under {}",
                resolved.display(),
                root.display()
            )));
        }
        Ok(resolved)
    }
}

#[async_trait]
impl FileStore for LocalFileStore {
    async fn read(&self, location: &Path) -> FsResult<Vec<u8>> {
        let full = self.resolve(location)?;
        fs::read(&full).await.map_err(|e| FsError::from_io(location, e))
    }

    async fn write(&self, location: &Path, data: &[u8]) -> FsResult<()> {
        let full = self.resolve(location)?;
        fs::write(&full, data)
            .await
            .map_err(|e| FsError::from_io(location, e))
    }

    async fn mkdir(&self, location: &Path) -> FsResult<()> {
        let full = self.resolve(location)?;
        fs::create_dir(&full)
            .await
            .map_err(|e| FsError::from_io(location, e))
    }

    async fn remove(&self, location: &Path) -> FsResult<()> {
        let full = self.resolve(location)?;
        let meta = fs::symlink_metadata(&full)
            .await
            .map_err(|e| FsError::from_io(location, e))?;
        let result = if meta.is_dir() {
            fs::remove_dir(&full).await
        } else {
            fs::remove_file(&full).await
        };
        result.map_err(|e| FsError::from_io(location, e))
    }

    async fn rename(&self, from: &Path, to: &Path) -> FsResult<()> {
        let from_full = self.resolve(from)?;
        let to_full = self.resolve(to)?;
        // A case-only rename on a case-folding disk sees the destination as existing.
        let case_only = from_full
            .to_string_lossy()
            .eq_ignore_ascii_case(&to_full.to_string_lossy());
        if !case_only && fs::try_exists(&to_full).await.unwrap_or(false) {
            return Err(FsError::already_exists(to));
        }
        fs::rename(&from_full, &to_full)
            .await
            .map_err(|e| FsError::from_io(from, e))
    }

    async fn exists(&self, location: &Path) -> bool {
        match self.resolve(location) {
            Ok(full) => fs::try_exists(&full).await.unwrap_or(false),
            Err(_) => false,
        }
    }

    async fn is_read_only(&self, location: &Path) -> FsResult<bool> {
        let full = self.resolve(location)?;
        let meta = fs::metadata(&full)
            .await
            .map_err(|e| FsError::from_io(location, e))?;
        Ok(meta.permissions().readonly())
    }

    async fn set_read_only(&self, location: &Path, read_only: bool) -> FsResult<()> {
        let full = self.resolve(location)?;
        let meta = fs::metadata(&full)
            .await
            .map_err(|e| FsError::from_io(location, e))?;
        let mut perms = meta.permissions();
        #[allow(clippy::permissions_set_readonly_false)]
        perms.set_readonly(read_only);
        fs::set_permissions(&full, perms)
            .await
            .map_err(|e| FsError::from_io(location, e))
    }
}
