//! Shared value types for canopy.
//!
//! This is the leaf crate of the workspace: it has **no internal canopy
//! dependencies**. Everything here is a plain value that the kernel, the CLI
//! and tests pass around.
//!
//! |--------------------|----------------------------------------------|
//! | Type               | Purpose                                      |
//! |--------------------|----------------------------------------------|
//! | [`ResourcePath`]   | Slash-segmented resource identifier          |
//! | [`ResourceKind`]   | Root / project / folder / file tag           |
//! | [`QualifiedName`]  | Key of a persistent property                 |
//! | [`ResourceId`]     | Node identity (kept across move)             |
//! | [`MarkerId`]       | Marker identity                              |
//! | [`JobId`]          | Holder identity for scheduling rules         |
//! | [`WorkspaceId`]    | Which workspace instance                     |
//! |--------------------|----------------------------------------------|

pub mod ids;
pub mod kind;
pub mod path;

pub use ids::{JobId, MarkerId, ResourceId, WorkspaceId};
pub use kind::{QualifiedName, ResourceKind};
pub use path::{PathError, ResourcePath};
