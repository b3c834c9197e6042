//! SQLite persistence for persistent properties.
//!
//! One row per (resource path, qualified name). Paths are stored in their
//! textual form, so a subtree is every row whose path equals the subtree
//! root or starts with `<root>/`.
//!
//! The store itself knows nothing about the tree; the workspace checks that
//! a resource exists before reading or writing its properties.

use std::path::Path;

use canopy_types::{QualifiedName, ResourcePath};
use parking_lot::Mutex;
use rusqlite::{Connection, OptionalExtension, params};

use crate::error::{WorkspaceError, WorkspaceResult};

/// Longest accepted property value, in characters.
pub const MAX_VALUE_LEN: usize = 2048;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS properties (
    path TEXT NOT NULL,
    qualifier TEXT NOT NULL,
    local_name TEXT NOT NULL,
    value TEXT NOT NULL,
    PRIMARY KEY (path, qualifier, local_name)
);
"#;

/// A property write recorded by an operation and applied on commit.
#[derive(Debug, Clone)]
pub(crate) enum PropertyEdit {
    Set {
        path: ResourcePath,
        name: QualifiedName,
        value: Option<String>,
    },
    RemoveSubtree(ResourcePath),
}

impl PropertyEdit {
    /// What this edit says about (`path`, `name`), if anything.
    pub(crate) fn resolve(&self, path: &ResourcePath, name: &QualifiedName) -> Option<Option<String>> {
        match self {
            PropertyEdit::Set {
                path: p,
                name: n,
                value,
            } if p == path && n == name => Some(value.clone()),
            PropertyEdit::RemoveSubtree(root) if root.is_prefix_of(path) => Some(None),
            _ => None,
        }
    }
}

/// Database handle for persistent properties.
pub struct PropertyStore {
    conn: Mutex<Connection>,
}

impl std::fmt::Debug for PropertyStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PropertyStore").finish_non_exhaustive()
    }
}

impl PropertyStore {
    /// Open or create a database file.
    pub fn open<P: AsRef<Path>>(path: P) -> WorkspaceResult<Self> {
        let conn = Connection::open(path)?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// In-memory database.
    pub fn in_memory() -> WorkspaceResult<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Reject names and values the store will not hold.
    pub fn validate(path: &ResourcePath, name: &QualifiedName, value: Option<&str>) -> WorkspaceResult<()> {
        if name.local_name.is_empty() {
            return Err(WorkspaceError::InvalidValue {
                path: path.clone(),
                reason: "property local name is empty".into(),
            });
        }
        if let Some(value) = value {
            let len = value.chars().count();
            if len > MAX_VALUE_LEN {
                return Err(WorkspaceError::InvalidValue {
                    path: path.clone(),
                    reason: format!(
                        "value of {name} is {len} characters, limit is {MAX_VALUE_LEN}"
                    ),
                });
            }
        }
        Ok(())
    }

    pub fn get(&self, path: &ResourcePath, name: &QualifiedName) -> WorkspaceResult<Option<String>> {
        let conn = self.conn.lock();
        let value = conn
            .query_row(
                "SELECT value FROM properties WHERE path = ?1 AND qualifier = ?2 AND local_name = ?3",
                params![path.to_string(), name.qualifier, name.local_name],
                |row| row.get(0),
            )
            .optional()?;
        Ok(value)
    }

    /// Write a value; `None` deletes it.
    pub fn set(&self, path: &ResourcePath, name: &QualifiedName, value: Option<&str>) -> WorkspaceResult<()> {
        Self::validate(path, name, value)?;
        let conn = self.conn.lock();
        write(&conn, path, name, value)?;
        Ok(())
    }

    /// All properties of one resource, ordered by name.
    pub fn list(&self, path: &ResourcePath) -> WorkspaceResult<Vec<(QualifiedName, String)>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT qualifier, local_name, value FROM properties WHERE path = ?1
             ORDER BY qualifier, local_name",
        )?;
        let rows = stmt.query_map(params![path.to_string()], |row| {
            Ok((
                QualifiedName::new(row.get::<_, String>(0)?, row.get::<_, String>(1)?),
                row.get::<_, String>(2)?,
            ))
        })?;
        let list = rows.collect::<Result<Vec<_>, _>>()?;
        Ok(list)
    }

    /// Delete the properties of `path` and everything below it.
    pub fn remove_subtree(&self, path: &ResourcePath) -> WorkspaceResult<usize> {
        let conn = self.conn.lock();
        Ok(remove_subtree(&conn, path)?)
    }

    /// Apply recorded edits in one transaction.
    pub(crate) fn apply(&self, edits: &[PropertyEdit]) -> WorkspaceResult<()> {
        if edits.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        for edit in edits {
            match edit {
                PropertyEdit::Set { path, name, value } => write(&tx, path, name, value.as_deref())?,
                PropertyEdit::RemoveSubtree(path) => {
                    remove_subtree(&tx, path)?;
                }
            }
        }
        tx.commit()?;
        Ok(())
    }

    /// Number of stored properties across all resources.
    pub fn count(&self) -> WorkspaceResult<usize> {
        let conn = self.conn.lock();
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM properties", [], |row| row.get(0))?;
        Ok(count as usize)
    }
}

fn write(
    conn: &Connection,
    path: &ResourcePath,
    name: &QualifiedName,
    value: Option<&str>,
) -> rusqlite::Result<()> {
    match value {
        Some(value) => conn.execute(
            "INSERT INTO properties (path, qualifier, local_name, value) VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(path, qualifier, local_name) DO UPDATE SET value = excluded.value",
            params![path.to_string(), name.qualifier, name.local_name, value],
        )?,
        None => conn.execute(
            "DELETE FROM properties WHERE path = ?1 AND qualifier = ?2 AND local_name = ?3",
            params![path.to_string(), name.qualifier, name.local_name],
        )?,
    };
    Ok(())
}

fn remove_subtree(conn: &Connection, path: &ResourcePath) -> rusqlite::Result<usize> {
    if path.is_root() {
        return conn.execute("DELETE FROM properties", []);
    }
    let root = path.to_string();
    let prefix = format!("{root}/");
    conn.execute(
        "DELETE FROM properties WHERE path = ?1 OR substr(path, 1, length(?2)) = ?2",
        params![root, prefix],
    )
}
