//! In-memory filesystem.
//!
//! Implements the full contract over a map of virtual paths. Exercised by
//! the union-fallback, permission-wrapper and adapter tests, where a
//! non-native mount is required and touching the host filesystem is not.

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};
use std::time::SystemTime;

use async_trait::async_trait;

use crate::error::{FsError, FsResult};
use crate::ops::{DirLister, FileSystem, RandomRead, RandomWrite};
use crate::path;
use crate::types::{FileInfo, FileKind, ListChunk, StatChanges};

#[derive(Debug, Clone)]
enum Entry {
    File { data: Vec<u8>, perm: u32, mtime: SystemTime },
    Dir { perm: u32 },
    Symlink { target: String },
}

type Store = Arc<RwLock<BTreeMap<String, Entry>>>;

/// An in-memory mount. The root directory always exists; all content is
/// lost on drop.
#[derive(Debug, Clone, Default)]
pub struct MemMount {
    entries: Store,
}

fn parent_of(key: &str) -> Option<&str> {
    if key == "/" {
        return None;
    }
    match key.rfind('/') {
        Some(0) => Some("/"),
        Some(idx) => Some(&key[..idx]),
        None => None,
    }
}

fn lock_err() -> FsError {
    FsError::invalid("lock poisoned")
}

impl MemMount {
    /// Create a new empty in-memory mount.
    pub fn new() -> Self {
        Self::default()
    }

    fn entry_info(key: &str, entry: &Entry) -> FileInfo {
        let name = path::base_name(key).to_string();
        match entry {
            Entry::File { data, perm, mtime } => FileInfo {
                name,
                size: data.len() as u64,
                perm: *perm,
                mtime: *mtime,
                kind: FileKind::File,
            },
            Entry::Dir { perm } => FileInfo {
                name,
                size: 0,
                perm: *perm,
                mtime: SystemTime::UNIX_EPOCH,
                kind: FileKind::Directory,
            },
            Entry::Symlink { target } => FileInfo {
                name,
                size: target.len() as u64,
                perm: 0o777,
                mtime: SystemTime::UNIX_EPOCH,
                kind: FileKind::Symlink,
            },
        }
    }

    fn lookup(&self, key: &str) -> FsResult<FileInfo> {
        if key == "/" {
            return Ok(FileInfo::virtual_dir("/"));
        }
        let entries = self.entries.read().map_err(|_| lock_err())?;
        entries
            .get(key)
            .map(|e| Self::entry_info(key, e))
            .ok_or_else(|| FsError::not_found(key))
    }

    fn is_dir(&self, key: &str) -> FsResult<bool> {
        Ok(self.lookup(key)?.is_dir())
    }

    fn has_children(&self, key: &str) -> FsResult<bool> {
        let entries = self.entries.read().map_err(|_| lock_err())?;
        Ok(entries.keys().any(|k| parent_of(k) == Some(key)))
    }

    fn require_parent_dir(&self, key: &str) -> FsResult<()> {
        match parent_of(key) {
            None => Err(FsError::invalid(key)),
            Some("/") => Ok(()),
            Some(p) => {
                if self.is_dir(p)? {
                    Ok(())
                } else {
                    Err(FsError::invalid(format!("not a directory: {p}")))
                }
            }
        }
    }
}

struct MemReader {
    data: Vec<u8>,
}

#[async_trait]
impl RandomRead for MemReader {
    async fn read_at(&mut self, max: usize, offset: u64) -> FsResult<Vec<u8>> {
        let len = self.data.len() as u64;
        if offset >= len {
            return Ok(Vec::new());
        }
        let start = offset as usize;
        let end = (start + max).min(self.data.len());
        Ok(self.data[start..end].to_vec())
    }
}

struct MemWriter {
    store: Store,
    key: String,
}

#[async_trait]
impl RandomWrite for MemWriter {
    async fn write_at(&mut self, data: &[u8], offset: u64) -> FsResult<usize> {
        let mut entries = self.store.write().map_err(|_| lock_err())?;
        match entries.get_mut(&self.key) {
            Some(Entry::File {
                data: content,
                mtime,
                ..
            }) => {
                let end = offset as usize + data.len();
                if content.len() < end {
                    content.resize(end, 0);
                }
                content[offset as usize..end].copy_from_slice(data);
                *mtime = SystemTime::now();
                Ok(data.len())
            }
            Some(_) => Err(FsError::invalid(format!("is a directory: {}", self.key))),
            None => Err(FsError::not_found(&self.key)),
        }
    }
}

struct MemLister {
    entries: Vec<FileInfo>,
}

#[async_trait]
impl DirLister for MemLister {
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

#[async_trait]
impl FileSystem for MemMount {
    async fn list(&self, vpath: &str) -> FsResult<Box<dyn DirLister>> {
        if !self.is_dir(vpath)? {
            return Err(FsError::invalid(format!("not a directory: {vpath}")));
        }
        let entries = self.entries.read().map_err(|_| lock_err())?;
        // BTreeMap order makes the listing lexicographic for free.
        let infos = entries
            .iter()
            .filter(|(k, _)| parent_of(k) == Some(vpath))
            .map(|(k, e)| Self::entry_info(k, e))
            .collect();
        Ok(Box::new(MemLister { entries: infos }))
    }

    async fn stat(&self, vpath: &str) -> FsResult<FileInfo> {
        let info = self.lookup(vpath)?;
        if info.is_symlink() {
            let entries = self.entries.read().map_err(|_| lock_err())?;
            if let Some(Entry::Symlink { target }) = entries.get(vpath) {
                let target = target.clone();
                drop(entries);
                return self.lookup(&target);
            }
        }
        Ok(info)
    }

    async fn lstat(&self, vpath: &str) -> FsResult<FileInfo> {
        self.lookup(vpath)
    }

    async fn readlink(&self, vpath: &str) -> FsResult<FileInfo> {
        let entries = self.entries.read().map_err(|_| lock_err())?;
        match entries.get(vpath) {
            Some(Entry::Symlink { target }) => {
                let target = target.clone();
                drop(entries);
                Ok(self.lookup(&target)?.renamed(target))
            }
            Some(_) => Err(FsError::invalid(format!("not a symlink: {vpath}"))),
            None => Err(FsError::not_found(vpath)),
        }
    }

    async fn reader(&self, vpath: &str) -> FsResult<Box<dyn RandomRead>> {
        let entries = self.entries.read().map_err(|_| lock_err())?;
        match entries.get(vpath) {
            Some(Entry::File { data, .. }) => Ok(Box::new(MemReader { data: data.clone() })),
            Some(_) => Err(FsError::invalid(format!("is a directory: {vpath}"))),
            None => Err(FsError::not_found(vpath)),
        }
    }

    async fn writer(&self, vpath: &str) -> FsResult<Box<dyn RandomWrite>> {
        self.require_parent_dir(vpath)?;
        {
            let mut entries = self.entries.write().map_err(|_| lock_err())?;
            match entries.get(vpath) {
                Some(Entry::File { .. }) => {}
                Some(_) => return Err(FsError::invalid(format!("is a directory: {vpath}"))),
                None => {
                    entries.insert(
                        vpath.to_string(),
                        Entry::File {
                            data: Vec::new(),
                            perm: 0o644,
                            mtime: SystemTime::now(),
                        },
                    );
                }
            }
        }
        Ok(Box::new(MemWriter {
            store: Arc::clone(&self.entries),
            key: vpath.to_string(),
        }))
    }

    async fn set_stat(&self, vpath: &str, changes: &StatChanges) -> FsResult<()> {
        let mut entries = self.entries.write().map_err(|_| lock_err())?;
        let entry = entries
            .get_mut(vpath)
            .ok_or_else(|| FsError::not_found(vpath))?;
        if let Some(size) = changes.size {
            if let Entry::File { data, .. } = entry {
                data.resize(size as usize, 0);
            }
        }
        if let Some(perm) = changes.perm {
            match entry {
                Entry::File { perm: p, .. } | Entry::Dir { perm: p } => *p = perm & 0o7777,
                Entry::Symlink { .. } => {}
            }
        }
        if let Some((_, mtime)) = changes.times {
            if let Entry::File { mtime: m, .. } = entry {
                *m = mtime;
            }
        }
        Ok(())
    }

    async fn rename(&self, src: &str, dst: &str) -> FsResult<()> {
        let mut entries = self.entries.write().map_err(|_| lock_err())?;
        if !entries.contains_key(src) {
            return Err(FsError::not_found(src));
        }
        let prefix = format!("{src}/");
        let moved: Vec<String> = entries
            .keys()
            .filter(|k| k.as_str() == src || k.starts_with(&prefix))
            .cloned()
            .collect();
        for key in moved {
            if let Some(entry) = entries.remove(&key) {
                let new_key = format!("{dst}{}", &key[src.len()..]);
                entries.insert(new_key, entry);
            }
        }
        Ok(())
    }

    async fn rmdir(&self, vpath: &str) -> FsResult<()> {
        if !self.is_dir(vpath)? {
            return Err(FsError::invalid(format!("not a directory: {vpath}")));
        }
        if self.has_children(vpath)? {
            return Err(FsError::invalid(format!("directory not empty: {vpath}")));
        }
        let mut entries = self.entries.write().map_err(|_| lock_err())?;
        entries.remove(vpath);
        Ok(())
    }

    async fn rm(&self, vpath: &str) -> FsResult<()> {
        if self.is_dir(vpath)? {
            return Err(FsError::invalid(format!("is a directory: {vpath}")));
        }
        let mut entries = self.entries.write().map_err(|_| lock_err())?;
        entries.remove(vpath);
        Ok(())
    }

    async fn mkdir(&self, vpath: &str) -> FsResult<()> {
        self.require_parent_dir(vpath)?;
        let mut entries = self.entries.write().map_err(|_| lock_err())?;
        if entries.contains_key(vpath) {
            return Err(FsError::already_exists(vpath));
        }
        entries.insert(vpath.to_string(), Entry::Dir { perm: 0o755 });
        Ok(())
    }

    async fn link(&self, src: &str, dst: &str) -> FsResult<()> {
        self.require_parent_dir(dst)?;
        let mut entries = self.entries.write().map_err(|_| lock_err())?;
        // Hard links are materialized as copies; the map has no inodes.
        let copied = match entries.get(src) {
            Some(Entry::File { data, perm, mtime }) => Entry::File {
                data: data.clone(),
                perm: *perm,
                mtime: *mtime,
            },
            Some(_) => return Err(FsError::invalid(format!("is a directory: {src}"))),
            None => return Err(FsError::not_found(src)),
        };
        if entries.contains_key(dst) {
            return Err(FsError::already_exists(dst));
        }
        entries.insert(dst.to_string(), copied);
        Ok(())
    }

    async fn symlink(&self, src: &str, dst: &str) -> FsResult<()> {
        self.require_parent_dir(dst)?;
        let mut entries = self.entries.write().map_err(|_| lock_err())?;
        if entries.contains_key(dst) {
            return Err(FsError::already_exists(dst));
        }
        entries.insert(
            dst.to_string(),
            Entry::Symlink {
                target: src.to_string(),
            },
        );
        Ok(())
    }
}
