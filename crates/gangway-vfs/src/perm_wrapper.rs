//! Permission wrapper: applies an [`AccessPolicy`] in front of another
//! filesystem.
//!
//! Every operation is gated on the virtual path as the caller presented
//! it, before the inner filesystem is touched. Hidden paths fail every
//! operation and are filtered out of listings without disturbing the
//! caller-driven offset contract.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::{FsError, FsResult};
use crate::ops::{DirLister, FileSystem, RandomRead, RandomWrite};
use crate::path;
use crate::policy::AccessPolicy;
use crate::types::{FileInfo, ListChunk, StatChanges};

/// Wraps a filesystem with read/write/hide policies.
pub struct PermissionWrapper {
    inner: Arc<dyn FileSystem>,
    policy: Arc<AccessPolicy>,
}

impl PermissionWrapper {
    pub fn new(inner: Arc<dyn FileSystem>, policy: AccessPolicy) -> Self {
        Self {
            inner,
            policy: Arc::new(policy),
        }
    }

    fn check_read(&self, vpath: &str) -> FsResult<()> {
        if self.policy.can_read(vpath) && !self.policy.should_hide(vpath) {
            Ok(())
        } else {
            Err(FsError::forbidden(vpath))
        }
    }

    fn check_write(&self, vpath: &str) -> FsResult<()> {
        if self.policy.can_write(vpath) && !self.policy.should_hide(vpath) {
            Ok(())
        } else {
            Err(FsError::forbidden(vpath))
        }
    }
}

/// Filters hidden entries out of an inner listing while honoring the
/// visible-offset contract.
///
/// `hidden` caches the inner offsets already classified as hidden and
/// `max_seen` is the highest inner offset whose hide-status is known, so
/// successive calls with advancing offsets do not re-probe the prefix.
struct FilteredLister {
    inner: Box<dyn DirLister>,
    listing_path: String,
    policy: Arc<AccessPolicy>,
    hidden: HashSet<u64>,
    max_seen: u64,
}

impl FilteredLister {
    fn classify(&mut self, inner_offset: u64, name: &str) -> bool {
        let full = path::join(&self.listing_path, name);
        let hide = self.policy.should_hide(&full);
        if hide {
            self.hidden.insert(inner_offset);
        }
        self.max_seen = self.max_seen.max(inner_offset + 1);
        hide
    }
}

#[async_trait]
impl DirLister for FilteredLister {
    async fn fill(&mut self, max: usize, offset: u64) -> FsResult<ListChunk> {
        // Translate the visible offset into the inner offset, skipping
        // entries already known hidden and probing unknown positions one
        // at a time.
        let mut inner_offset = 0u64;
        let mut visible = 0u64;
        while visible < offset {
            if inner_offset < self.max_seen {
                if !self.hidden.contains(&inner_offset) {
                    visible += 1;
                }
                inner_offset += 1;
                continue;
            }
            let probe = self.inner.fill(1, inner_offset).await?;
            match probe.entries.first() {
                None => return Ok(ListChunk::end()),
                Some(info) => {
                    if !self.classify(inner_offset, &info.name) {
                        visible += 1;
                    }
                    inner_offset += 1;
                }
            }
        }

        // Pull inner batches until something visible shows up or the
        // inner listing ends.
        let mut out: Vec<FileInfo> = Vec::new();
        let mut eof = false;
        while out.is_empty() && !eof {
            let chunk = self.inner.fill(max, inner_offset).await?;
            eof = chunk.eof;
            if chunk.entries.is_empty() {
                break;
            }
            let read = chunk.entries.len() as u64;
            for (i, info) in chunk.entries.into_iter().enumerate() {
                if !self.classify(inner_offset + i as u64, &info.name) {
                    out.push(info);
                }
            }
            inner_offset += read;
        }
        Ok(ListChunk { entries: out, eof })
    }
}

#[async_trait]
impl FileSystem for PermissionWrapper {
    async fn list(&self, vpath: &str) -> FsResult<Box<dyn DirLister>> {
        self.check_read(vpath)?;
        let inner = self.inner.list(vpath).await?;
        if self.policy.hide_rules_empty() {
            return Ok(inner);
        }
        Ok(Box::new(FilteredLister {
            inner,
            listing_path: vpath.to_string(),
            policy: Arc::clone(&self.policy),
            hidden: HashSet::new(),
            max_seen: 0,
        }))
    }

    async fn stat(&self, vpath: &str) -> FsResult<FileInfo> {
        self.check_read(vpath)?;
        self.inner.stat(vpath).await
    }

    async fn lstat(&self, vpath: &str) -> FsResult<FileInfo> {
        self.check_read(vpath)?;
        self.inner.lstat(vpath).await
    }

    async fn readlink(&self, vpath: &str) -> FsResult<FileInfo> {
        self.check_read(vpath)?;
        self.inner.readlink(vpath).await
    }

    async fn reader(&self, vpath: &str) -> FsResult<Box<dyn RandomRead>> {
        self.check_read(vpath)?;
        self.inner.reader(vpath).await
    }

    async fn writer(&self, vpath: &str) -> FsResult<Box<dyn RandomWrite>> {
        self.check_write(vpath)?;
        self.inner.writer(vpath).await
    }

    async fn set_stat(&self, vpath: &str, changes: &StatChanges) -> FsResult<()> {
        self.check_write(vpath)?;
        self.inner.set_stat(vpath, changes).await
    }

    async fn rename(&self, src: &str, dst: &str) -> FsResult<()> {
        self.check_write(src)?;
        self.check_write(dst)?;
        self.inner.rename(src, dst).await
    }

    async fn rmdir(&self, vpath: &str) -> FsResult<()> {
        self.check_write(vpath)?;
        self.inner.rmdir(vpath).await
    }

    async fn rm(&self, vpath: &str) -> FsResult<()> {
        self.check_write(vpath)?;
        self.inner.rm(vpath).await
    }

    async fn mkdir(&self, vpath: &str) -> FsResult<()> {
        self.check_write(vpath)?;
        self.inner.mkdir(vpath).await
    }

    async fn link(&self, src: &str, dst: &str) -> FsResult<()> {
        self.check_read(src)?;
        self.check_write(dst)?;
        self.inner.link(src, dst).await
    }

    async fn symlink(&self, src: &str, dst: &str) -> FsResult<()> {
        self.check_read(src)?;
        self.check_write(dst)?;
        self.inner.symlink(src, dst).await
    }
}
