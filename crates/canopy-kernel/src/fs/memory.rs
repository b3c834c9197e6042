//! In-memory file store.
//!
//! Default store for new workspaces and for tests. All data is ephemeral.

use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};

use super::error::{FsError, FsResult};
use super::FileStore;

/// Entry in the memory store.
#[derive(Debug, Clone)]
enum Entry {
    File { data: Vec<u8>, read_only: bool },
    Directory { read_only: bool },
}

impl Entry {
    fn read_only(&self) -> bool {
        match self {
            Entry::File { read_only, .. } | Entry::Directory { read_only } => *read_only,
        }
    }

    fn set_read_only(&mut self, value: bool) {
        match self {
            Entry::File { read_only, .. } | Entry::Directory { read_only } => *read_only = value,
        }
    }
}

/// In-memory file store.
///
/// Thread-safe via an internal `RwLock`. The root directory always exists;
/// every other directory must be created explicitly.
#[derive(Debug)]
pub struct MemoryFileStore {
    entries: RwLock<HashMap<PathBuf, Entry>>,
}

impl Default for MemoryFileStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryFileStore {
    /// Create a new store holding only the root directory.
    pub fn new() -> Self {
        let mut entries = HashMap::new();
        entries.insert(PathBuf::new(), Entry::Directory { read_only: false });
        Self {
            entries: RwLock::new(entries),
        }
    }

    /// Normalize a location: drop the root, resolve `.` and `..`.
    fn normalize(location: &Path) -> PathBuf {
        let mut result = PathBuf::new();
        for component in location.components() {
            match component {
                Component::RootDir | Component::CurDir | Component::Prefix(_) => {}
                Component::ParentDir => {
                    result.pop();
                }
                Component::Normal(s) => result.push(s),
            }
        }
        result
    }

    fn parent_is_dir(entries: &HashMap<PathBuf, Entry>, normalized: &Path) -> FsResult<()> {
        let parent = normalized.parent().unwrap_or(Path::new(""));
        match entries.get(parent) {
            Some(Entry::Directory { .. }) => Ok(()),
            Some(Entry::File { .. }) => Err(FsError::not_a_directory(parent)),
            None => Err(FsError::not_found(parent)),
        }
    }

    /// Number of entries, including the root. Handy in tests.
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// True when only the root directory exists.
    pub fn is_empty(&self) -> bool {
        self.len() == 1
    }
}

#[async_trait]
impl FileStore for MemoryFileStore {
    async fn read(&self, location: &Path) -> FsResult<Vec<u8>> {
        let normalized = Self::normalize(location);
        let entries = self.entries.read();
        match entries.get(&normalized) {
            Some(Entry::File { data, .. }) => Ok(data.clone()),
            Some(Entry::Directory { .. }) => Err(FsError::is_a_directory(location)),
            None => Err(FsError::not_found(location)),
        }
    }

    async fn write(&self, location: &Path, data: &[u8]) -> FsResult<()> {
        let normalized = Self::normalize(location);
        let mut entries = self.entries.write();
        Self::parent_is_dir(&entries, &normalized)?;

        match entries.get_mut(&normalized) {
            Some(Entry::File { read_only: true, .. }) => Err(FsError::permission_denied(location)),
            Some(Entry::File { data: existing, .. }) => {
                *existing = data.to_vec();
                Ok(())
            }
            Some(Entry::Directory { .. }) => Err(FsError::is_a_directory(location)),
            None => {
                entries.insert(
                    normalized,
                    Entry::File {
                        data: data.to_vec(),
                        read_only: false,
                    },
                );
                Ok(())
            }
        }
    }

    async fn mkdir(&self, location: &Path) -> FsResult<()> {
        let normalized = Self::normalize(location);
        let mut entries = self.entries.write();
        if entries.contains_key(&normalized) {
            return Err(FsError::already_exists(location));
        }
        Self::parent_is_dir(&entries, &normalized)?;
        entries.insert(normalized, Entry::Directory { read_only: false });
        Ok(())
    }

    async fn remove(&self, location: &Path) -> FsResult<()> {
        let normalized = Self::normalize(location);
        if normalized.as_os_str().is_empty() {
            return Err(FsError::permission_denied(location));
        }

        let mut entries = self.entries.write();
        match entries.get(&normalized) {
            Some(Entry::Directory { .. }) => {
                let has_children = entries.keys().any(|k| k.parent() == Some(&normalized));
                if has_children {
                    return Err(FsError::directory_not_empty(location));
                }
            }
            Some(Entry::File { .. }) => {}
            None => return Err(FsError::not_found(location)),
        }
        entries.remove(&normalized);
        Ok(())
    }

    async fn rename(&self, from: &Path, to: &Path) -> FsResult<()> {
        let from_normalized = Self::normalize(from);
        let to_normalized = Self::normalize(to);

        let mut entries = self.entries.write();
        if !entries.contains_key(&from_normalized) {
            return Err(FsError::not_found(from));
        }
        if entries.contains_key(&to_normalized) {
            return Err(FsError::already_exists(to));
        }
        if to_normalized.starts_with(&from_normalized) {
            return Err(FsError::other(format!(
                "cannot move {} below itself",
                from.display()
            )));
        }
        Self::parent_is_dir(&entries, &to_normalized)?;

        // Move the entry together with everything below it.
        let moved: Vec<PathBuf> = entries
            .keys()
            .filter(|k| k.starts_with(&from_normalized))
            .cloned()
            .collect();
        for old in moved {
            if let Some(entry) = entries.remove(&old) {
                let relative = old.strip_prefix(&from_normalized).unwrap_or(Path::new(""));
                let new_path = if relative.as_os_str().is_empty() {
                    to_normalized.clone()
                } else {
                    to_normalized.join(relative)
                };
                entries.insert(new_path, entry);
            }
        }
        Ok(())
    }

    async fn exists(&self, location: &Path) -> bool {
        self.entries.read().contains_key(&Self::normalize(location))
    }

    async fn is_read_only(&self, location: &Path) -> FsResult<bool> {
        self.entries
            .read()
            .get(&Self::normalize(location))
            .map(Entry::read_only)
            .ok_or_else(|| FsError::not_found(location))
    }

    async fn set_read_only(&self, location: &Path, read_only: bool) -> FsResult<()> {
        let mut entries = self.entries.write();
        let entry = entries
            .get_mut(&Self::normalize(location))
            .ok_or_else(|| FsError::not_found(location))?;
        entry.set_read_only(read_only);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_write_and_read() {
        let fs = MemoryFileStore::new();
        fs.write(Path::new("/test.txt"), b"hello world").await.unwrap();
        assert_eq!(fs.read(Path::new("/test.txt")).await.unwrap(), b"hello world");
    }

    #[tokio::test]
    async fn test_write_requires_parent() {
        let fs = MemoryFileStore::new();
        let err = fs.write(Path::new("/missing/file.txt"), b"x").await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_mkdir_twice_fails() {
        let fs = MemoryFileStore::new();
        fs.mkdir(Path::new("/dir")).await.unwrap();
        assert!(matches!(
            fs.mkdir(Path::new("/dir")).await,
            Err(FsError::AlreadyExists(_))
        ));
    }

    #[tokio::test]
    async fn test_remove_non_empty_dir_fails() {
        let fs = MemoryFileStore::new();
        fs.mkdir(Path::new("/dir")).await.unwrap();
        fs.write(Path::new("/dir/f"), b"").await.unwrap();
        assert!(matches!(
            fs.remove(Path::new("/dir")).await,
            Err(FsError::DirectoryNotEmpty(_))
        ));
        fs.remove(Path::new("/dir/f")).await.unwrap();
        fs.remove(Path::new("/dir")).await.unwrap();
        assert!(fs.is_empty());
    }

    #[tokio::test]
    async fn test_rename_moves_children() {
        let fs = MemoryFileStore::new();
        fs.mkdir(Path::new("/a")).await.unwrap();
        fs.mkdir(Path::new("/a/b")).await.unwrap();
        fs.write(Path::new("/a/b/c.txt"), b"content").await.unwrap();

        fs.rename(Path::new("/a"), Path::new("/z")).await.unwrap();

        assert!(!fs.exists(Path::new("/a")).await);
        assert_eq!(fs.read(Path::new("/z/b/c.txt")).await.unwrap(), b"content");
    }

    #[tokio::test]
    async fn test_rename_case_only() {
        let fs = MemoryFileStore::new();
        fs.mkdir(Path::new("/folder")).await.unwrap();
        fs.rename(Path::new("/folder"), Path::new("/Folder")).await.unwrap();
        assert!(fs.exists(Path::new("/Folder")).await);
        assert!(!fs.exists(Path::new("/folder")).await);
    }

    #[tokio::test]
    async fn test_read_only_blocks_write() {
        let fs = MemoryFileStore::new();
        fs.write(Path::new("/f"), b"1").await.unwrap();
        fs.set_read_only(Path::new("/f"), true).await.unwrap();
        assert!(fs.is_read_only(Path::new("/f")).await.unwrap());
        assert!(matches!(
            fs.write(Path::new("/f"), b"2").await,
            Err(FsError::PermissionDenied(_))
        ));
    }

    #[tokio::test]
    async fn test_path_normalization() {
        let fs = MemoryFileStore::new();
        fs.mkdir(Path::new("/a")).await.unwrap();
        fs.write(Path::new("/a/c.txt"), b"").await.unwrap();
        assert!(fs.exists(Path::new("a/c.txt")).await);
        assert!(fs.exists(Path::new("/a/./c.txt")).await);
        assert!(fs.exists(Path::new("/a/../a/c.txt")).await);
    }
}
