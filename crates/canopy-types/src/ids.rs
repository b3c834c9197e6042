//! Typed identifiers.
//!
//! Resource, marker and job ids are plain counters scoped to one workspace
//! instance; they are allocated by the kernel and never reused while the
//! workspace lives. `WorkspaceId` wraps a UUIDv7 so independent workspaces
//! stay distinguishable in logs.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Identity of a resource node. Survives a move, changes on copy or re-create.
#[derive(Clone, Copy, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResourceId(u64);

/// Identity of a marker, unique within a workspace.
#[derive(Clone, Copy, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MarkerId(u64);

/// Identity of a unit of work holding scheduling rules.
#[derive(Clone, Copy, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(u64);

// ── Shared behavior ─────────────────────────────────────────────────────────

macro_rules! impl_counter_id {
    ($T:ident, $prefix:literal) => {
        impl $T {
            /// Wrap a raw counter value.
            pub const fn from_raw(raw: u64) -> Self {
                Self(raw)
            }

            /// The raw counter value.
            pub const fn as_u64(&self) -> u64 {
                self.0
            }
        }

        impl From<u64> for $T {
            fn from(raw: u64) -> Self {
                Self(raw)
            }
        }

        impl From<$T> for u64 {
            fn from(id: $T) -> u64 {
                id.0
            }
        }

        impl fmt::Display for $T {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!($prefix, "{}"), self.0)
            }
        }

        impl fmt::Debug for $T {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!(stringify!($T), "({})"), self.0)
            }
        }
    };
}

impl_counter_id!(ResourceId, "r");
impl_counter_id!(MarkerId, "m");
impl_counter_id!(JobId, "job-");

/// Identity of a workspace instance (UUIDv7).
#[derive(Clone, Copy, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkspaceId(uuid::Uuid);

impl WorkspaceId {
    /// Create a new time-ordered ID.
    pub fn new() -> Self {
        Self(uuid::Uuid::now_v7())
    }

    /// First 8 hex characters, for display only.
    pub fn short(&self) -> String {
        self.0.as_simple().to_string()[..8].to_string()
    }
}

impl Default for WorkspaceId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for WorkspaceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Debug for WorkspaceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "WorkspaceId({})", self.short())
    }
}
