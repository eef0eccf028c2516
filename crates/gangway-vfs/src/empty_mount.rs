//! The null filesystem.
//!
//! Substituted for a user's filesystem when construction from their
//! configuration fails, so the session still comes up instead of exposing
//! a half-built tree.

use async_trait::async_trait;

use crate::error::{FsError, FsResult};
use crate::ops::{DirLister, FileSystem, RandomRead, RandomWrite};
use crate::types::{FileInfo, ListChunk, StatChanges};

/// A filesystem with no content at all.
#[derive(Debug, Clone, Copy, Default)]
pub struct EmptyMount;

struct EmptyLister;

#[async_trait]
impl DirLister for EmptyLister {
    async fn fill(&mut self, _max: usize, _offset: u64) -> FsResult<ListChunk> {
        Ok(ListChunk::end())
    }
}

impl EmptyMount {
    fn root_info(&self) -> FileInfo {
        FileInfo::virtual_dir("/")
    }

    fn stat_path(&self, path: &str) -> FsResult<FileInfo> {
        if path == "/" {
            Ok(self.root_info())
        } else {
            Err(FsError::invalid(path))
        }
    }
}

#[async_trait]
impl FileSystem for EmptyMount {
    async fn list(&self, _path: &str) -> FsResult<Box<dyn DirLister>> {
        Ok(Box::new(EmptyLister))
    }

    async fn stat(&self, path: &str) -> FsResult<FileInfo> {
        self.stat_path(path)
    }

    async fn lstat(&self, path: &str) -> FsResult<FileInfo> {
        self.stat_path(path)
    }

    async fn readlink(&self, path: &str) -> FsResult<FileInfo> {
        self.stat_path(path)
    }

    async fn reader(&self, path: &str) -> FsResult<Box<dyn RandomRead>> {
        Err(FsError::not_found(path))
    }

    async fn writer(&self, path: &str) -> FsResult<Box<dyn RandomWrite>> {
        Err(FsError::forbidden(path))
    }

    async fn set_stat(&self, path: &str, _changes: &StatChanges) -> FsResult<()> {
        Err(FsError::forbidden(path))
    }

    async fn rename(&self, src: &str, _dst: &str) -> FsResult<()> {
        Err(FsError::forbidden(src))
    }

    async fn rmdir(&self, path: &str) -> FsResult<()> {
        Err(FsError::forbidden(path))
    }

    async fn rm(&self, path: &str) -> FsResult<()> {
        Err(FsError::forbidden(path))
    }

    async fn mkdir(&self, path: &str) -> FsResult<()> {
        Err(FsError::forbidden(path))
    }

    async fn link(&self, _src: &str, dst: &str) -> FsResult<()> {
        Err(FsError::forbidden(dst))
    }

    async fn symlink(&self, _src: &str, dst: &str) -> FsResult<()> {
        Err(FsError::forbidden(dst))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn listings_are_empty() {
        let fs = EmptyMount;
        let mut lister = fs.list("/").await.unwrap();
        let chunk = lister.fill(16, 0).await.unwrap();
        assert!(chunk.entries.is_empty());
        assert!(chunk.eof);
    }

    #[tokio::test]
    async fn only_root_stats() {
        let fs = EmptyMount;
        assert!(fs.stat("/").await.unwrap().is_dir());
        assert!(matches!(fs.stat("/x").await, Err(FsError::Invalid(_))));
        assert!(matches!(fs.lstat("/x").await, Err(FsError::Invalid(_))));
    }

    #[tokio::test]
    async fn mutations_are_forbidden() {
        let fs = EmptyMount;
        assert!(fs.writer("/x").await.unwrap_err().is_forbidden());
        assert!(fs.mkdir("/x").await.unwrap_err().is_forbidden());
        assert!(fs.rename("/a", "/b").await.unwrap_err().is_forbidden());
        assert!(fs.reader("/x").await.unwrap_err().is_not_found());
    }
}
