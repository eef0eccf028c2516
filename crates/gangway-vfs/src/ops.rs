//! The filesystem contract.
//!
//! All operations are path-based and take already-normalized virtual
//! paths (see [`crate::path`]). Reads and writes are positional: the
//! contract exposes no cursor, so adapters that need stream semantics own
//! their offsets. Directory listings are caller-driven offset iterators.

use async_trait::async_trait;

use crate::dir_mount::DirMount;
use crate::error::FsResult;
use crate::types::{FileInfo, ListChunk, StatChanges};

/// Caller-driven directory listing iterator.
///
/// `fill(max, offset)` yields at most `max` entries starting at the
/// zero-based `offset` within the full listing, marking `eof` on the call
/// that delivers the final entry. For a stable directory the sequence is
/// consistent across calls; reopening the listing resets any state.
#[async_trait]
pub trait DirLister: Send {
    async fn fill(&mut self, max: usize, offset: u64) -> FsResult<ListChunk>;
}

/// Positional reader. `read_at` returns up to `max` bytes from `offset`;
/// an empty result means end of file.
#[async_trait]
pub trait RandomRead: Send {
    async fn read_at(&mut self, max: usize, offset: u64) -> FsResult<Vec<u8>>;

    /// Release the underlying resource.
    async fn close(&mut self) -> FsResult<()> {
        Ok(())
    }
}

/// Positional writer. `write_at` writes the whole buffer at `offset`.
#[async_trait]
pub trait RandomWrite: Send {
    async fn write_at(&mut self, data: &[u8], offset: u64) -> FsResult<usize>;

    /// Flush and release the underlying resource.
    async fn close(&mut self) -> FsResult<()> {
        Ok(())
    }
}

/// The operations every mount implements.
///
/// Implementations: [`DirMount`] for a native host directory,
/// [`crate::EmptyMount`] as the null fallback, [`crate::MemMount`] for
/// in-memory trees, [`crate::UnionMount`] to compose mounts under a
/// synthetic root and [`crate::PermissionWrapper`] to apply access
/// policies on top.
#[async_trait]
pub trait FileSystem: Send + Sync {
    /// Open a directory listing.
    async fn list(&self, path: &str) -> FsResult<Box<dyn DirLister>>;

    /// Metadata, following symlinks.
    async fn stat(&self, path: &str) -> FsResult<FileInfo>;

    /// Metadata of the entry itself, not following symlinks.
    async fn lstat(&self, path: &str) -> FsResult<FileInfo>;

    /// Follow a symbolic link one step and return the target's metadata,
    /// named by the link target.
    async fn readlink(&self, path: &str) -> FsResult<FileInfo>;

    /// Open a positional reader.
    async fn reader(&self, path: &str) -> FsResult<Box<dyn RandomRead>>;

    /// Open a positional writer, creating the file if absent.
    async fn writer(&self, path: &str) -> FsResult<Box<dyn RandomWrite>>;

    /// Apply the populated attribute changes in the fixed order
    /// size, permissions, owner, times.
    async fn set_stat(&self, path: &str, changes: &StatChanges) -> FsResult<()>;

    /// Rename `src` to `dst`.
    async fn rename(&self, src: &str, dst: &str) -> FsResult<()>;

    /// Remove an empty directory. Fails on non-directories.
    async fn rmdir(&self, path: &str) -> FsResult<()>;

    /// Remove a file. Fails on directories.
    async fn rm(&self, path: &str) -> FsResult<()>;

    /// Create a directory.
    async fn mkdir(&self, path: &str) -> FsResult<()>;

    /// Create a hard link at `dst` referring to `src`.
    async fn link(&self, src: &str, dst: &str) -> FsResult<()>;

    /// Create a symbolic link at `dst` pointing to `src`.
    async fn symlink(&self, src: &str, dst: &str) -> FsResult<()>;

    /// Native-directory capability probe. Cross-mount fast paths ask for
    /// this instead of downcasting.
    fn as_native(&self) -> Option<&DirMount> {
        None
    }
}
