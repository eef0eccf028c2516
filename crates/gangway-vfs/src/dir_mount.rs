//! Native host-directory mount.
//!
//! Maps virtual paths onto a host directory with containment enforced on
//! every translation. Reads are always permitted; every mutation is
//! refused when the mount is read-only.

use std::io::SeekFrom;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use async_trait::async_trait;
use filetime::FileTime;
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};

use crate::error::{FsError, FsResult};
use crate::ops::{DirLister, FileSystem, RandomRead, RandomWrite};
use crate::path;
use crate::types::{FileInfo, FileKind, ListChunk, StatChanges};

/// A mount backed by a directory on the host filesystem.
#[derive(Debug, Clone)]
pub struct DirMount {
    root: PathBuf,
    read_only: bool,
}

impl DirMount {
    /// Create a mount over `root`, which must be an absolute host path.
    pub fn new(root: impl Into<PathBuf>, read_only: bool) -> FsResult<Self> {
        let root: PathBuf = root.into();
        if !root.is_absolute() {
            return Err(FsError::invalid(format!(
                "mount root must be absolute: {}",
                root.display()
            )));
        }
        Ok(Self { root, read_only })
    }

    /// The host directory this mount serves.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Reads are always granted on a native mount.
    pub fn can_read(&self) -> bool {
        true
    }

    /// Writes are denied on read-only mounts.
    pub fn can_write(&self) -> bool {
        !self.read_only
    }

    /// Translate a virtual path into the host path it maps to.
    ///
    /// The virtual path is re-validated and the result must still be
    /// contained in the mount root.
    pub fn host_path(&self, vpath: &str) -> FsResult<PathBuf> {
        if !path::is_valid(vpath) {
            return Err(FsError::invalid(format!("bad path: {vpath}")));
        }
        let trimmed = vpath.trim_start_matches('/');
        let abs = if trimmed.is_empty() {
            self.root.clone()
        } else {
            self.root.join(trimmed)
        };
        if !abs.starts_with(&self.root) {
            return Err(FsError::invalid(format!("path escapes mount: {vpath}")));
        }
        Ok(abs)
    }

    fn check_writable(&self, vpath: &str) -> FsResult<()> {
        if self.read_only {
            Err(FsError::forbidden(vpath))
        } else {
            Ok(())
        }
    }

    fn meta_to_info(name: impl Into<String>, meta: &std::fs::Metadata) -> FileInfo {
        let kind = if meta.is_dir() {
            FileKind::Directory
        } else if meta.file_type().is_symlink() {
            FileKind::Symlink
        } else {
            FileKind::File
        };
        FileInfo {
            name: name.into(),
            size: meta.len(),
            perm: meta.permissions().mode() & 0o7777,
            mtime: meta.modified().unwrap_or(SystemTime::UNIX_EPOCH),
            kind,
        }
    }
}

/// Lister over an eagerly materialized, sorted snapshot of a directory.
struct SliceLister {
    entries: Vec<FileInfo>,
}

#[async_trait]
impl DirLister for SliceLister {
    async fn fill(&mut self, max: usize, offset: u64) -> FsResult<ListChunk> {
        let total = self.entries.len() as u64;
        if offset >= total {
            return Ok(ListChunk::end());
        }
        let start = offset as usize;
        let end = (start + max).min(self.entries.len());
        Ok(ListChunk {
            entries: self.entries[start..end].to_vec(),
            eof: end as u64 >= total,
        })
    }
}

struct HostReader {
    file: fs::File,
    vpath: String,
}

#[async_trait]
impl RandomRead for HostReader {
    async fn read_at(&mut self, max: usize, offset: u64) -> FsResult<Vec<u8>> {
        self.file
            .seek(SeekFrom::Start(offset))
            .await
            .map_err(|e| FsError::from_io(e, &self.vpath))?;
        let mut buf = vec![0u8; max];
        let mut filled = 0;
        while filled < max {
            let n = self
                .file
                .read(&mut buf[filled..])
                .await
                .map_err(|e| FsError::from_io(e, &self.vpath))?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        buf.truncate(filled);
        Ok(buf)
    }
}

struct HostWriter {
    file: fs::File,
    vpath: String,
}

#[async_trait]
impl RandomWrite for HostWriter {
    async fn write_at(&mut self, data: &[u8], offset: u64) -> FsResult<usize> {
        self.file
            .seek(SeekFrom::Start(offset))
            .await
            .map_err(|e| FsError::from_io(e, &self.vpath))?;
        self.file
            .write_all(data)
            .await
            .map_err(|e| FsError::from_io(e, &self.vpath))?;
        Ok(data.len())
    }

    async fn close(&mut self) -> FsResult<()> {
        self.file
            .flush()
            .await
            .map_err(|e| FsError::from_io(e, &self.vpath))
    }
}

#[async_trait]
impl FileSystem for DirMount {
    async fn list(&self, vpath: &str) -> FsResult<Box<dyn DirLister>> {
        let abs = self.host_path(vpath)?;
        let mut dir = fs::read_dir(&abs)
            .await
            .map_err(|e| FsError::from_io(e, vpath))?;
        let mut entries = Vec::new();
        while let Some(entry) = dir
            .next_entry()
            .await
            .map_err(|e| FsError::from_io(e, vpath))?
        {
            let meta = entry
                .metadata()
                .await
                .map_err(|e| FsError::from_io(e, vpath))?;
            entries.push(Self::meta_to_info(
                entry.file_name().to_string_lossy().into_owned(),
                &meta,
            ));
        }
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(Box::new(SliceLister { entries }))
    }

    async fn stat(&self, vpath: &str) -> FsResult<FileInfo> {
        let abs = self.host_path(vpath)?;
        let meta = fs::metadata(&abs)
            .await
            .map_err(|e| FsError::from_io(e, vpath))?;
        Ok(Self::meta_to_info(path::base_name(vpath), &meta))
    }

    async fn lstat(&self, vpath: &str) -> FsResult<FileInfo> {
        let abs = self.host_path(vpath)?;
        let meta = fs::symlink_metadata(&abs)
            .await
            .map_err(|e| FsError::from_io(e, vpath))?;
        Ok(Self::meta_to_info(path::base_name(vpath), &meta))
    }

    async fn readlink(&self, vpath: &str) -> FsResult<FileInfo> {
        let abs = self.host_path(vpath)?;
        let target = fs::read_link(&abs)
            .await
            .map_err(|e| FsError::from_io(e, vpath))?;
        // Follow one step only, and the target must stay inside the mount.
        let resolved = if target.is_absolute() {
            target.clone()
        } else {
            abs.parent().unwrap_or(&self.root).join(&target)
        };
        if !resolved.starts_with(&self.root) {
            return Err(FsError::forbidden(vpath));
        }
        let meta = fs::metadata(&resolved)
            .await
            .map_err(|e| FsError::from_io(e, vpath))?;
        Ok(Self::meta_to_info(
            target.to_string_lossy().into_owned(),
            &meta,
        ))
    }

    async fn reader(&self, vpath: &str) -> FsResult<Box<dyn RandomRead>> {
        let abs = self.host_path(vpath)?;
        let file = fs::File::open(&abs)
            .await
            .map_err(|e| FsError::from_io(e, vpath))?;
        Ok(Box::new(HostReader {
            file,
            vpath: vpath.to_string(),
        }))
    }

    async fn writer(&self, vpath: &str) -> FsResult<Box<dyn RandomWrite>> {
        self.check_writable(vpath)?;
        let abs = self.host_path(vpath)?;
        let file = fs::OpenOptions::new()
            .write(true)
            .create(true)
            .mode(0o644)
            .open(&abs)
            .await
            .map_err(|e| FsError::from_io(e, vpath))?;
        Ok(Box::new(HostWriter {
            file,
            vpath: vpath.to_string(),
        }))
    }

    async fn set_stat(&self, vpath: &str, changes: &StatChanges) -> FsResult<()> {
        self.check_writable(vpath)?;
        let abs = self.host_path(vpath)?;
        if let Some(size) = changes.size {
            let file = fs::OpenOptions::new()
                .write(true)
                .open(&abs)
                .await
                .map_err(|e| FsError::from_io(e, vpath))?;
            file.set_len(size)
                .await
                .map_err(|e| FsError::from_io(e, vpath))?;
        }
        if let Some(perm) = changes.perm {
            fs::set_permissions(&abs, std::fs::Permissions::from_mode(perm & 0o7777))
                .await
                .map_err(|e| FsError::from_io(e, vpath))?;
        }
        if let Some((uid, gid)) = changes.owner {
            std::os::unix::fs::chown(&abs, Some(uid), Some(gid))
                .map_err(|e| FsError::from_io(e, vpath))?;
        }
        if let Some((atime, mtime)) = changes.times {
            filetime::set_file_times(
                &abs,
                FileTime::from_system_time(atime),
                FileTime::from_system_time(mtime),
            )
            .map_err(|e| FsError::from_io(e, vpath))?;
        }
        Ok(())
    }

    async fn rename(&self, src: &str, dst: &str) -> FsResult<()> {
        let abs_src = self.host_path(src)?;
        let abs_dst = self.host_path(dst)?;
        if !self.can_write() {
            return Err(FsError::forbidden(src));
        }
        fs::rename(&abs_src, &abs_dst)
            .await
            .map_err(|e| FsError::from_io(e, src))
    }

    async fn rmdir(&self, vpath: &str) -> FsResult<()> {
        self.check_writable(vpath)?;
        let abs = self.host_path(vpath)?;
        let meta = fs::metadata(&abs)
            .await
            .map_err(|e| FsError::from_io(e, vpath))?;
        if !meta.is_dir() {
            return Err(FsError::invalid(format!("not a directory: {vpath}")));
        }
        fs::remove_dir(&abs)
            .await
            .map_err(|e| FsError::from_io(e, vpath))
    }

    async fn rm(&self, vpath: &str) -> FsResult<()> {
        self.check_writable(vpath)?;
        let abs = self.host_path(vpath)?;
        let meta = fs::metadata(&abs)
            .await
            .map_err(|e| FsError::from_io(e, vpath))?;
        if meta.is_dir() {
            return Err(FsError::invalid(format!("is a directory: {vpath}")));
        }
        fs::remove_file(&abs)
            .await
            .map_err(|e| FsError::from_io(e, vpath))
    }

    async fn mkdir(&self, vpath: &str) -> FsResult<()> {
        self.check_writable(vpath)?;
        let abs = self.host_path(vpath)?;
        fs::create_dir(&abs)
            .await
            .map_err(|e| FsError::from_io(e, vpath))
    }

    async fn link(&self, src: &str, dst: &str) -> FsResult<()> {
        self.check_writable(dst)?;
        let abs_src = self.host_path(src)?;
        let abs_dst = self.host_path(dst)?;
        fs::hard_link(&abs_src, &abs_dst)
            .await
            .map_err(|e| FsError::from_io(e, dst))
    }

    async fn symlink(&self, src: &str, dst: &str) -> FsResult<()> {
        self.check_writable(dst)?;
        let abs_src = self.host_path(src)?;
        let abs_dst = self.host_path(dst)?;
        fs::symlink(&abs_src, &abs_dst)
            .await
            .map_err(|e| FsError::from_io(e, dst))
    }

    fn as_native(&self) -> Option<&DirMount> {
        Some(self)
    }
}
