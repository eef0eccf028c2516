//! Core filesystem types.
//!
//! Everything here is path-based and protocol-neutral; the SFTP and WebDAV
//! adapters translate these into their wire representations.

use std::time::SystemTime;

/// File type enumeration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    /// Regular file.
    File,
    /// Directory.
    Directory,
    /// Symbolic link.
    Symlink,
}

/// File metadata as served to clients.
#[derive(Debug, Clone)]
pub struct FileInfo {
    /// Entry name. For stat results this is the base name of the path;
    /// union mounts rename it when serving a mount root under another name.
    pub name: String,
    /// Size in bytes.
    pub size: u64,
    /// Unix permission bits (no file-type bits).
    pub perm: u32,
    /// Last modification time.
    pub mtime: SystemTime,
    /// Entry type.
    pub kind: FileKind,
}

impl FileInfo {
    /// Metadata for a synthesized virtual directory (union roots, the
    /// empty mount). The timestamp is fixed so listings are stable.
    pub fn virtual_dir(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            size: 0,
            perm: 0o755,
            mtime: SystemTime::UNIX_EPOCH,
            kind: FileKind::Directory,
        }
    }

    /// The same metadata under a different name.
    pub fn renamed(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Returns true if this is a directory.
    pub fn is_dir(&self) -> bool {
        matches!(self.kind, FileKind::Directory)
    }

    /// Returns true if this is a symbolic link.
    pub fn is_symlink(&self) -> bool {
        matches!(self.kind, FileKind::Symlink)
    }

    /// Permission bits with the file-type bits folded in, as the wire
    /// protocols expect them.
    pub fn wire_mode(&self) -> u32 {
        let type_bits = match self.kind {
            FileKind::File => 0o100000,
            FileKind::Directory => 0o040000,
            FileKind::Symlink => 0o120000,
        };
        type_bits | (self.perm & 0o7777)
    }

    /// Modification time as seconds since the Unix epoch.
    pub fn mtime_secs(&self) -> u64 {
        self.mtime
            .duration_since(SystemTime::UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0)
    }
}

/// Attribute changes for `set_stat`. Only the populated fields are
/// applied, in the fixed order size, permissions, owner, times.
#[derive(Debug, Clone, Default)]
pub struct StatChanges {
    /// Truncate or extend to this size.
    pub size: Option<u64>,
    /// New permission bits.
    pub perm: Option<u32>,
    /// New owner as (uid, gid).
    pub owner: Option<(u32, u32)>,
    /// New (atime, mtime).
    pub times: Option<(SystemTime, SystemTime)>,
}

impl StatChanges {
    /// No changes.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true if no field is populated.
    pub fn is_empty(&self) -> bool {
        self.size.is_none() && self.perm.is_none() && self.owner.is_none() && self.times.is_none()
    }
}

/// One batch of a directory listing.
#[derive(Debug, Default)]
pub struct ListChunk {
    /// Entries starting at the requested offset, at most the requested
    /// count.
    pub entries: Vec<FileInfo>,
    /// Set on the call that delivers the final entry, and on every call
    /// whose offset is at or past the end of the listing.
    pub eof: bool,
}

impl ListChunk {
    /// An empty terminal chunk.
    pub fn end() -> Self {
        Self {
            entries: Vec::new(),
            eof: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_mode_folds_type_bits() {
        let mut info = FileInfo::virtual_dir("x");
        assert_eq!(info.wire_mode(), 0o040755);

        info.kind = FileKind::File;
        info.perm = 0o644;
        assert_eq!(info.wire_mode(), 0o100644);

        info.kind = FileKind::Symlink;
        info.perm = 0o777;
        assert_eq!(info.wire_mode(), 0o120777);
    }

    #[test]
    fn renamed_keeps_metadata() {
        let info = FileInfo::virtual_dir("/").renamed("docs");
        assert_eq!(info.name, "docs");
        assert!(info.is_dir());
    }
}
