//! Union mount: several filesystems under named subdirectories of a
//! synthetic root.
//!
//! The root itself is immutable. Operations on `/name/...` are routed to
//! the mount registered under `name`; renames and links that span two
//! mounts either take a direct host-filesystem path (when both sides are
//! native) or fall back to copy-then-delete (rename only).

use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::warn;

use crate::error::{FsError, FsResult};
use crate::ops::{DirLister, FileSystem, RandomRead, RandomWrite};
use crate::path;
use crate::types::{FileInfo, ListChunk, StatChanges};

/// Bytes per copy step in the rename fallback.
const COPY_CHUNK: usize = 32 * 1024;
/// Listing batch size while walking a directory in the rename fallback.
const COPY_LIST_BATCH: usize = 64;

/// Composes mounts under a synthetic root directory.
///
/// Nesting unions is not recommended; the configuration layer never
/// produces one.
pub struct UnionMount {
    mounts: BTreeMap<String, Arc<dyn FileSystem>>,
}

impl UnionMount {
    /// Create a union over the given mount table. Mount names must be
    /// non-empty single path segments.
    pub fn new(mounts: BTreeMap<String, Arc<dyn FileSystem>>) -> FsResult<Self> {
        for name in mounts.keys() {
            if name.is_empty() || name.contains('/') {
                return Err(FsError::invalid(format!("bad mount name: {name:?}")));
            }
        }
        Ok(Self { mounts })
    }

    /// Route a non-root path to its mount: returns the sub-path within
    /// the mount (leading `/` preserved, `/` for the mount root itself)
    /// and the mount.
    fn extract(&self, vpath: &str) -> FsResult<(String, &Arc<dyn FileSystem>)> {
        let trimmed = vpath.strip_prefix('/').unwrap_or(vpath);
        for (name, fs) in &self.mounts {
            if let Some(rest) = trimmed.strip_prefix(name.as_str()) {
                if rest.is_empty() {
                    return Ok(("/".to_string(), fs));
                }
                if rest.starts_with('/') {
                    return Ok((rest.to_string(), fs));
                }
            }
        }
        Err(FsError::not_found(vpath))
    }

    fn root_info(&self) -> FileInfo {
        FileInfo::virtual_dir("/")
    }
}

/// Lister for the union root: one entry per mount, lexicographic, each
/// carrying the inner root's metadata under the mount name.
struct RootLister {
    mounts: Vec<(String, Arc<dyn FileSystem>)>,
}

#[async_trait]
impl DirLister for RootLister {
    async fn fill(&mut self, max: usize, offset: u64) -> FsResult<ListChunk> {
        let total = self.mounts.len() as u64;
        if offset >= total {
            return Ok(ListChunk::end());
        }
        let start = offset as usize;
        let end = (start + max).min(self.mounts.len());
        let mut entries = Vec::with_capacity(end - start);
        for (name, fs) in &self.mounts[start..end] {
            let info = fs.stat("/").await.map_err(|e| {
                warn!(mount = %name, error = %e, "stat of mount root failed");
                e
            })?;
            entries.push(info.renamed(name.clone()));
        }
        Ok(ListChunk {
            entries,
            eof: end as u64 >= total,
        })
    }
}

/// Copy one file across mounts through the positional contract, then
/// remove the source.
async fn rename_file_fallback(
    src_fs: &dyn FileSystem,
    dst_fs: &dyn FileSystem,
    src: &str,
    dst: &str,
) -> FsResult<()> {
    let mut reader = src_fs.reader(src).await?;
    let mut writer = dst_fs.writer(dst).await?;
    let mut offset = 0u64;
    loop {
        let buf = reader.read_at(COPY_CHUNK, offset).await?;
        if buf.is_empty() {
            break;
        }
        let n = writer.write_at(&buf, offset).await?;
        offset += n as u64;
    }
    writer.close().await?;
    reader.close().await?;
    src_fs.rm(src).await
}

/// Recursively copy a directory across mounts (directories first, then
/// file contents), deleting the source bottom-up. Not atomic: a failure
/// leaves a partial destination and the source intact from the failed
/// item on.
fn rename_dir_fallback<'a>(
    src_fs: &'a dyn FileSystem,
    dst_fs: &'a dyn FileSystem,
    src: &'a str,
    dst: &'a str,
) -> Pin<Box<dyn Future<Output = FsResult<()>> + Send + 'a>> {
    Box::pin(async move {
        dst_fs.mkdir(dst).await?;
        let mut lister = src_fs.list(src).await?;
        let mut offset = 0u64;
        loop {
            let chunk = lister.fill(COPY_LIST_BATCH, offset).await?;
            offset += chunk.entries.len() as u64;
            for entry in &chunk.entries {
                let sub_src = path::join(src, &entry.name);
                let sub_dst = path::join(dst, &entry.name);
                if entry.is_dir() {
                    rename_dir_fallback(src_fs, dst_fs, &sub_src, &sub_dst).await?;
                } else {
                    rename_file_fallback(src_fs, dst_fs, &sub_src, &sub_dst).await?;
                }
            }
            if chunk.eof || chunk.entries.is_empty() {
                break;
            }
        }
        src_fs.rmdir(src).await
    })
}

#[async_trait]
impl FileSystem for UnionMount {
    async fn list(&self, vpath: &str) -> FsResult<Box<dyn DirLister>> {
        if vpath == "/" {
            let mounts = self
                .mounts
                .iter()
                .map(|(name, fs)| (name.clone(), Arc::clone(fs)))
                .collect();
            return Ok(Box::new(RootLister { mounts }));
        }
        let (sub, fs) = self.extract(vpath)?;
        fs.list(&sub).await
    }

    async fn stat(&self, vpath: &str) -> FsResult<FileInfo> {
        if vpath == "/" {
            return Ok(self.root_info());
        }
        let (sub, fs) = self.extract(vpath)?;
        let info = fs.stat(&sub).await?;
        // A mount root is served under the union's name for it, not the
        // host directory's own name.
        if sub == "/" {
            return Ok(info.renamed(path::base_name(vpath)));
        }
        Ok(info)
    }

    async fn lstat(&self, vpath: &str) -> FsResult<FileInfo> {
        if vpath == "/" {
            return Ok(self.root_info());
        }
        let (sub, fs) = self.extract(vpath)?;
        let info = fs.lstat(&sub).await?;
        if sub == "/" {
            return Ok(info.renamed(path::base_name(vpath)));
        }
        Ok(info)
    }

    async fn readlink(&self, vpath: &str) -> FsResult<FileInfo> {
        if vpath == "/" {
            return Ok(self.root_info());
        }
        let (sub, fs) = self.extract(vpath)?;
        fs.readlink(&sub).await
    }

    async fn reader(&self, vpath: &str) -> FsResult<Box<dyn RandomRead>> {
        if vpath == "/" {
            return Err(FsError::invalid("is a directory: /"));
        }
        let (sub, fs) = self.extract(vpath)?;
        fs.reader(&sub).await
    }

    async fn writer(&self, vpath: &str) -> FsResult<Box<dyn RandomWrite>> {
        if vpath == "/" {
            return Err(FsError::invalid("is a directory: /"));
        }
        let (sub, fs) = self.extract(vpath)?;
        fs.writer(&sub).await
    }

    async fn set_stat(&self, vpath: &str, changes: &StatChanges) -> FsResult<()> {
        if vpath == "/" {
            return Err(FsError::forbidden(vpath));
        }
        let (sub, fs) = self.extract(vpath)?;
        fs.set_stat(&sub, changes).await
    }

    async fn rename(&self, src: &str, dst: &str) -> FsResult<()> {
        if src == "/" || dst == "/" {
            return Err(FsError::forbidden(src));
        }
        if src == dst {
            return Ok(());
        }
        let (sub_src, src_fs) = self.extract(src)?;
        let (sub_dst, dst_fs) = self.extract(dst)?;
        if sub_src == "/" || sub_dst == "/" {
            return Err(FsError::invalid("cannot rename a mount root"));
        }
        if Arc::ptr_eq(src_fs, dst_fs) {
            return src_fs.rename(&sub_src, &sub_dst).await;
        }
        // Both native: a single host rename is possible.
        if let (Some(src_native), Some(dst_native)) = (src_fs.as_native(), dst_fs.as_native()) {
            if !src_native.can_write() || !dst_native.can_write() {
                return Err(FsError::forbidden(src));
            }
            let abs_src = src_native.host_path(&sub_src)?;
            let abs_dst = dst_native.host_path(&sub_dst)?;
            return tokio::fs::rename(&abs_src, &abs_dst)
                .await
                .map_err(|e| FsError::from_io(e, src));
        }
        // Copy-then-delete fallback. Refuses to overwrite: recursive
        // replacement of an existing destination is not performed.
        let src_info = src_fs.stat(&sub_src).await?;
        match dst_fs.stat(&sub_dst).await {
            Ok(_) => return Err(FsError::already_exists(dst)),
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e),
        }
        if src_info.is_dir() {
            rename_dir_fallback(src_fs.as_ref(), dst_fs.as_ref(), &sub_src, &sub_dst).await
        } else {
            rename_file_fallback(src_fs.as_ref(), dst_fs.as_ref(), &sub_src, &sub_dst).await
        }
    }

    async fn rmdir(&self, vpath: &str) -> FsResult<()> {
        if vpath == "/" {
            return Err(FsError::forbidden(vpath));
        }
        let (sub, fs) = self.extract(vpath)?;
        if sub == "/" {
            return Err(FsError::forbidden(vpath));
        }
        fs.rmdir(&sub).await
    }

    async fn rm(&self, vpath: &str) -> FsResult<()> {
        if vpath == "/" {
            return Err(FsError::forbidden(vpath));
        }
        let (sub, fs) = self.extract(vpath)?;
        if sub == "/" {
            return Err(FsError::forbidden(vpath));
        }
        fs.rm(&sub).await
    }

    async fn mkdir(&self, vpath: &str) -> FsResult<()> {
        if vpath == "/" {
            return Err(FsError::forbidden(vpath));
        }
        let (sub, fs) = self.extract(vpath)?;
        if sub == "/" {
            return Err(FsError::forbidden(vpath));
        }
        fs.mkdir(&sub).await
    }

    async fn link(&self, src: &str, dst: &str) -> FsResult<()> {
        if src == "/" || dst == "/" {
            return Err(FsError::forbidden(src));
        }
        let (sub_src, src_fs) = self.extract(src)?;
        let (sub_dst, dst_fs) = self.extract(dst)?;
        if sub_src == "/" || sub_dst == "/" {
            return Err(FsError::forbidden(src));
        }
        if Arc::ptr_eq(src_fs, dst_fs) {
            return src_fs.link(&sub_src, &sub_dst).await;
        }
        if let (Some(src_native), Some(dst_native)) = (src_fs.as_native(), dst_fs.as_native()) {
            if !src_native.can_write() || !dst_native.can_write() {
                return Err(FsError::forbidden(src));
            }
            let abs_src = src_native.host_path(&sub_src)?;
            let abs_dst = dst_native.host_path(&sub_dst)?;
            return tokio::fs::hard_link(&abs_src, &abs_dst)
                .await
                .map_err(|e| FsError::from_io(e, dst));
        }
        Err(FsError::CrossMount)
    }

    async fn symlink(&self, src: &str, dst: &str) -> FsResult<()> {
        if src == "/" || dst == "/" {
            return Err(FsError::forbidden(src));
        }
        let (sub_src, src_fs) = self.extract(src)?;
        let (sub_dst, dst_fs) = self.extract(dst)?;
        if sub_src == "/" || sub_dst == "/" {
            return Err(FsError::forbidden(src));
        }
        if Arc::ptr_eq(src_fs, dst_fs) {
            return src_fs.symlink(&sub_src, &sub_dst).await;
        }
        if let (Some(src_native), Some(dst_native)) = (src_fs.as_native(), dst_fs.as_native()) {
            if !src_native.can_write() || !dst_native.can_write() {
                return Err(FsError::forbidden(src));
            }
            let abs_src = src_native.host_path(&sub_src)?;
            let abs_dst = dst_native.host_path(&sub_dst)?;
            return tokio::fs::symlink(&abs_src, &abs_dst)
                .await
                .map_err(|e| FsError::from_io(e, dst));
        }
        Err(FsError::CrossMount)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dir_mount::DirMount;
    use crate::mem_mount::MemMount;
    use tempfile::TempDir;

    fn union_of(mounts: Vec<(&str, Arc<dyn FileSystem>)>) -> UnionMount {
        let table = mounts
            .into_iter()
            .map(|(name, fs)| (name.to_string(), fs))
            .collect();
        UnionMount::new(table).unwrap()
    }

    async fn write_all(fs: &dyn FileSystem, vpath: &str, data: &[u8]) {
        let mut w = fs.writer(vpath).await.unwrap();
        w.write_at(data, 0).await.unwrap();
        w.close().await.unwrap();
    }

    async fn read_all(fs: &dyn FileSystem, vpath: &str) -> Vec<u8> {
        let mut r = fs.reader(vpath).await.unwrap();
        let mut out = Vec::new();
        loop {
            let chunk = r.read_at(1024, out.len() as u64).await.unwrap();
            if chunk.is_empty() {
                break;
            }
            out.extend_from_slice(&chunk);
        }
        out
    }

    #[tokio::test]
    async fn root_lists_mounts_in_order() {
        let a = TempDir::new().unwrap();
        let b = TempDir::new().unwrap();
        let union = union_of(vec![
            (
                "pics",
                Arc::new(DirMount::new(b.path(), false).unwrap()) as Arc<dyn FileSystem>,
            ),
            (
                "docs",
                Arc::new(DirMount::new(a.path(), true).unwrap()) as Arc<dyn FileSystem>,
            ),
        ]);

        let mut lister = union.list("/").await.unwrap();
        let chunk = lister.fill(8, 0).await.unwrap();
        let names: Vec<_> = chunk.entries.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, ["docs", "pics"]);
        assert!(chunk.entries.iter().all(|e| e.is_dir()));
        assert!(chunk.eof);
    }

    #[tokio::test]
    async fn extraction_requires_exact_mount_prefix() {
        let m: Arc<dyn FileSystem> = Arc::new(MemMount::new());
        let union = union_of(vec![("doc", Arc::clone(&m))]);

        assert!(union.extract("/doc").is_ok());
        assert_eq!(union.extract("/doc/x").unwrap().0, "/x");
        assert_eq!(union.extract("/doc").unwrap().0, "/");
        assert!(union.extract("/docs/x").unwrap_err().is_not_found());
        assert!(union.extract("/other").unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn mount_root_stat_is_renamed() {
        let dir = TempDir::new().unwrap();
        let union = union_of(vec![(
            "docs",
            Arc::new(DirMount::new(dir.path(), false).unwrap()) as Arc<dyn FileSystem>,
        )]);

        let info = union.stat("/docs").await.unwrap();
        assert_eq!(info.name, "docs");
        assert!(info.is_dir());
    }

    #[tokio::test]
    async fn root_is_immutable() {
        let m: Arc<dyn FileSystem> = Arc::new(MemMount::new());
        let union = union_of(vec![("data", m)]);

        assert!(union.mkdir("/").await.unwrap_err().is_forbidden());
        assert!(union.rm("/data").await.unwrap_err().is_forbidden());
        assert!(union.rmdir("/data").await.unwrap_err().is_forbidden());
        assert!(union.mkdir("/data").await.unwrap_err().is_forbidden());
        assert!(matches!(
            union.rename("/data/x", "/data").await,
            Err(FsError::Invalid(_))
        ));
    }

    #[tokio::test]
    async fn same_mount_rename_delegates() {
        let m: Arc<dyn FileSystem> = Arc::new(MemMount::new());
        let union = union_of(vec![("data", m)]);
        write_all(&union, "/data/a", b"payload").await;

        union.rename("/data/a", "/data/b").await.unwrap();
        assert!(union.stat("/data/a").await.unwrap_err().is_not_found());
        assert_eq!(read_all(&union, "/data/b").await, b"payload");
    }

    #[tokio::test]
    async fn native_pair_renames_directly() {
        let a = TempDir::new().unwrap();
        let b = TempDir::new().unwrap();
        let union = union_of(vec![
            (
                "docs",
                Arc::new(DirMount::new(a.path(), false).unwrap()) as Arc<dyn FileSystem>,
            ),
            (
                "pics",
                Arc::new(DirMount::new(b.path(), false).unwrap()) as Arc<dyn FileSystem>,
            ),
        ]);
        let payload = vec![7u8; 1024];
        write_all(&union, "/docs/x.txt", &payload).await;

        union.rename("/docs/x.txt", "/pics/x.txt").await.unwrap();
        assert!(union.stat("/docs/x.txt").await.unwrap_err().is_not_found());
        assert_eq!(read_all(&union, "/pics/x.txt").await, payload);
    }

    #[tokio::test]
    async fn native_rename_requires_writable_mounts() {
        let a = TempDir::new().unwrap();
        let b = TempDir::new().unwrap();
        std::fs::write(a.path().join("x"), b"data").unwrap();
        let union = union_of(vec![
            (
                "ro",
                Arc::new(DirMount::new(a.path(), true).unwrap()) as Arc<dyn FileSystem>,
            ),
            (
                "rw",
                Arc::new(DirMount::new(b.path(), false).unwrap()) as Arc<dyn FileSystem>,
            ),
        ]);

        let err = union.rename("/ro/x", "/rw/x").await.unwrap_err();
        assert!(err.is_forbidden());
    }

    #[tokio::test]
    async fn fallback_rename_copies_file_bytes() {
        let dir = TempDir::new().unwrap();
        let union = union_of(vec![
            (
                "docs",
                Arc::new(DirMount::new(dir.path(), false).unwrap()) as Arc<dyn FileSystem>,
            ),
            ("scratch", Arc::new(MemMount::new()) as Arc<dyn FileSystem>),
        ]);
        // Larger than one copy chunk so the loop advances its offset.
        let payload: Vec<u8> = (0..(COPY_CHUNK + 777)).map(|i| (i % 251) as u8).collect();
        write_all(&union, "/docs/big.bin", &payload).await;

        union
            .rename("/docs/big.bin", "/scratch/big.bin")
            .await
            .unwrap();
        assert!(union.stat("/docs/big.bin").await.unwrap_err().is_not_found());
        assert_eq!(read_all(&union, "/scratch/big.bin").await, payload);
    }

    #[tokio::test]
    async fn fallback_rename_copies_directories_recursively() {
        let dir = TempDir::new().unwrap();
        let union = union_of(vec![
            (
                "docs",
                Arc::new(DirMount::new(dir.path(), false).unwrap()) as Arc<dyn FileSystem>,
            ),
            ("scratch", Arc::new(MemMount::new()) as Arc<dyn FileSystem>),
        ]);
        union.mkdir("/docs/tree").await.unwrap();
        union.mkdir("/docs/tree/nested").await.unwrap();
        write_all(&union, "/docs/tree/a.txt", b"alpha").await;
        write_all(&union, "/docs/tree/nested/b.txt", b"beta").await;

        union.rename("/docs/tree", "/scratch/tree").await.unwrap();

        assert!(union.stat("/docs/tree").await.unwrap_err().is_not_found());
        assert_eq!(read_all(&union, "/scratch/tree/a.txt").await, b"alpha");
        assert_eq!(
            read_all(&union, "/scratch/tree/nested/b.txt").await,
            b"beta"
        );
    }

    #[tokio::test]
    async fn fallback_rename_refuses_existing_destination() {
        let dir = TempDir::new().unwrap();
        let union = union_of(vec![
            (
                "docs",
                Arc::new(DirMount::new(dir.path(), false).unwrap()) as Arc<dyn FileSystem>,
            ),
            ("scratch", Arc::new(MemMount::new()) as Arc<dyn FileSystem>),
        ]);
        write_all(&union, "/docs/x", b"new").await;
        write_all(&union, "/scratch/x", b"old").await;

        assert!(matches!(
            union.rename("/docs/x", "/scratch/x").await,
            Err(FsError::AlreadyExists(_))
        ));
        // Source intact, destination untouched.
        assert_eq!(read_all(&union, "/docs/x").await, b"new");
        assert_eq!(read_all(&union, "/scratch/x").await, b"old");
    }

    #[tokio::test]
    async fn cross_mount_link_requires_native_pair() {
        let dir = TempDir::new().unwrap();
        let union = union_of(vec![
            (
                "docs",
                Arc::new(DirMount::new(dir.path(), false).unwrap()) as Arc<dyn FileSystem>,
            ),
            ("scratch", Arc::new(MemMount::new()) as Arc<dyn FileSystem>),
        ]);
        write_all(&union, "/docs/x", b"data").await;

        assert!(matches!(
            union.link("/docs/x", "/scratch/x").await,
            Err(FsError::CrossMount)
        ));
        assert!(matches!(
            union.symlink("/docs/x", "/scratch/x").await,
            Err(FsError::CrossMount)
        ));
    }
}
