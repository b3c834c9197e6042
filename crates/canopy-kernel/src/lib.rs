//! # canopy-kernel
//!
//! Workspace resource manager: a tree of projects, folders and files backed
//! by a file store, mutated in rule-scoped batches.
//!
//! A workspace:
//! - Owns the resource tree and publishes immutable snapshots of it
//! - Serializes mutations through hierarchical scheduling rules
//! - Reports every committed batch as one resource delta
//! - Keeps markers in the tree and persistent properties in SQLite
//! - Resolves linked resources through per-project descriptions

pub mod config;
pub mod delta;
pub mod description;
pub mod error;
pub mod fs;
pub mod jobs;
pub mod lock;
pub mod markers;
pub mod names;
pub mod notify;
pub mod operation;
pub mod properties;
pub mod rules;
pub mod tree;
pub mod workspace;

pub use config::WorkspaceConfig;
pub use delta::{DeltaComputer, DeltaFlags, DeltaKind, MarkerDelta, MarkerDeltaKind, ResourceDelta};
pub use description::{InMemoryDescriptions, LinkDescription, ProjectDescriptions};
pub use error::{WorkspaceError, WorkspaceResult};
pub use fs::{FileStore, FsError, FsResult, LocalFileStore, MemoryFileStore};
pub use jobs::{JobContext, JobHandle};
pub use lock::{RuleGuard, RuleManager};
pub use markers::{
    Depth, Marker, MarkerAttributes, MarkerInfo, MarkerStore, MarkerTypeRegistry, MarkerValue,
};
pub use names::{NameValidator, Platform, PlatformNameRules};
pub use notify::{
    EventKind, ListenerError, ListenerFailure, ListenerId, NotificationDispatcher,
    ResourceChangeEvent, ResourceChangeListener, Subscription,
};
pub use operation::{CommitReport, Operation, UpdateFlags};
pub use properties::PropertyStore;
pub use rules::{RuleFactory, SchedulingRule};
pub use tree::{ResourceInfo, ResourceTree};
pub use workspace::{Workspace, WorkspaceBuilder};

pub use canopy_types::{
    JobId, MarkerId, QualifiedName, ResourceId, ResourceKind, ResourcePath, WorkspaceId,
};
