//! Workspace configuration.
//!
//! Loaded from TOML; every field has a default so an empty document is a
//! valid configuration.
//!
//! ```toml
//! location = "/home/me/workspace"
//! case_sensitive = false
//! platform = "windows"
//! lock_timeout_ms = 5000
//! listener_capacity = 128
//! track_property_changes = true
//! properties_db = "/home/me/workspace/.canopy/properties.db"
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{WorkspaceError, WorkspaceResult};
use crate::names::Platform;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkspaceConfig {
    /// Location of the workspace root. A project's default location is
    /// `<location>/<project name>`.
    pub location: PathBuf,
    /// When false, names differing only in case collide.
    pub case_sensitive: bool,
    /// Platform hint for name validation.
    pub platform: Platform,
    /// Default rule-acquisition timeout for one-call operations.
    pub lock_timeout_ms: Option<u64>,
    /// Queue size of channel subscriptions.
    pub listener_capacity: usize,
    /// Set the PROPERTIES delta flag on persistent-property writes.
    pub track_property_changes: bool,
    /// SQLite file for persistent properties; in-memory when unset.
    pub properties_db: Option<PathBuf>,
}

impl Default for WorkspaceConfig {
    fn default() -> Self {
        Self {
            location: PathBuf::from("/"),
            case_sensitive: true,
            platform: Platform::host(),
            lock_timeout_ms: None,
            listener_capacity: 64,
            track_property_changes: false,
            properties_db: None,
        }
    }
}

impl WorkspaceConfig {
    pub fn from_toml_str(text: &str) -> WorkspaceResult<Self> {
        let config: Self =
            toml::from_str(text).map_err(|e| WorkspaceError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> WorkspaceResult<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| WorkspaceError::Config(format!("{}: {e}", path.display())))?;
        Self::from_toml_str(&text)
    }

    pub fn lock_timeout(&self) -> Option<Duration> {
        self.lock_timeout_ms.map(Duration::from_millis)
    }

    fn validate(&self) -> WorkspaceResult<()> {
        if self.listener_capacity == 0 {
            return Err(WorkspaceError::Config(
                "listener_capacity must be at least 1".into(),
            ));
        }
        Ok(())
    }
}
