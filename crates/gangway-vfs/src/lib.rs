//! Virtual filesystem layer for the gangway SSH file server.
//!
//! A small filesystem algebra behind one contract:
//!
//! - [`FileSystem`] - the operations every mount implements
//! - [`DirMount`] - a native host directory, with containment and an
//!   optional read-only flag
//! - [`EmptyMount`] - the null filesystem, the safe fallback when building
//!   a user's tree fails
//! - [`MemMount`] - an in-memory tree (test support)
//! - [`UnionMount`] - several mounts under named subdirectories of a
//!   synthetic root
//! - [`PermissionWrapper`] - read/write/hide regex policies applied in
//!   front of any of the above
//!
//! ## Design decisions
//!
//! - **Paths are validated strings**: virtual paths arrive from the wire
//!   as strings; [`path::normalize`] rejects traversal instead of
//!   resolving it, and mounts re-check containment on host translation.
//! - **Positional I/O, no cursors**: readers and writers take explicit
//!   offsets. Adapters that need stream semantics own their offsets.
//! - **Caller-driven listings**: [`DirLister::fill`] serves slices at the
//!   caller's offset so protocol adapters can resume a listing from any
//!   point.

mod dir_mount;
mod empty_mount;
mod error;
mod mem_mount;
mod ops;
pub mod path;
mod perm_wrapper;
mod policy;
mod types;
mod union_mount;

pub use dir_mount::DirMount;
pub use empty_mount::EmptyMount;
pub use error::{FsError, FsResult};
pub use mem_mount::MemMount;
pub use ops::{DirLister, FileSystem, RandomRead, RandomWrite};
pub use perm_wrapper::PermissionWrapper;
pub use policy::AccessPolicy;
pub use types::{FileInfo, FileKind, ListChunk, StatChanges};
pub use union_mount::UnionMount;
