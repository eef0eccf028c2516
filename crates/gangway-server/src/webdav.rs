//! WebDAV adapter: serves a [`FileSystem`] through HTTP/WebDAV, reachable
//! only via the virtual port fabric.
//!
//! The protocol handler wants seekable file handles; the contract only
//! has positional readers and writers. Open flags therefore synthesize
//! one of three handle variants (read-only, write-only, read-write), each
//! owning its offset and opening the positional ends lazily.

use std::fmt;
use std::io::SeekFrom;
use std::sync::Arc;
use std::time::SystemTime;

use bytes::{Buf, Bytes};
use dav_server::davpath::DavPath;
use dav_server::fs::{
    DavDirEntry, DavFile, DavFileSystem, DavMetaData, FsError as DavError, FsFuture, FsResult,
    FsStream, OpenOptions, ReadDirMeta,
};
use dav_server::memls::MemLs;
use dav_server::DavHandler;
use futures::StreamExt;
use hyper_util::rt::TokioIo;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use gangway_vfs::{path as vfs_path, FileInfo, FileSystem, FsError, RandomRead, RandomWrite};

use crate::fabric::VirtualListener;
use crate::ssh::ForwardedChannel;

/// Entries pulled from a lister per batch while serving PROPFIND.
const LIST_BATCH: usize = 10;

fn map_err(e: FsError) -> DavError {
    match e {
        FsError::NotFound(_) => DavError::NotFound,
        FsError::Forbidden(_) => DavError::Forbidden,
        FsError::AlreadyExists(_) => DavError::Exists,
        _ => DavError::GeneralFailure,
    }
}

fn virt_path(path: &DavPath) -> FsResult<String> {
    let rel = path.as_rel_ospath();
    let joined = match rel.to_str() {
        Some("") => "/".to_string(),
        Some(s) => format!("/{s}"),
        None => return Err(DavError::GeneralFailure),
    };
    vfs_path::normalize(&joined).map_err(|_| DavError::Forbidden)
}

#[derive(Debug, Clone)]
struct DavMeta(FileInfo);

impl DavMetaData for DavMeta {
    fn len(&self) -> u64 {
        self.0.size
    }

    fn modified(&self) -> FsResult<SystemTime> {
        Ok(self.0.mtime)
    }

    fn is_dir(&self) -> bool {
        self.0.is_dir()
    }

    fn is_symlink(&self) -> bool {
        self.0.is_symlink()
    }

    fn executable(&self) -> FsResult<bool> {
        Ok(self.0.perm & 0o100 != 0)
    }
}

struct DavEntry(FileInfo);

impl DavDirEntry for DavEntry {
    fn name(&self) -> Vec<u8> {
        self.0.name.clone().into_bytes()
    }

    fn metadata(&self) -> FsFuture<Box<dyn DavMetaData>> {
        let meta = DavMeta(self.0.clone());
        Box::pin(async move { Ok(Box::new(meta) as Box<dyn DavMetaData>) })
    }
}

/// Which directions a handle serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HandleMode {
    ReadOnly,
    WriteOnly,
    ReadWrite,
}

/// A WebDAV file handle over the positional contract: lazily opened
/// reader/writer, a handle-owned offset and a cached stat. Callers must
/// not share a handle across tasks; the offset is the handle's state.
struct VirtHandle {
    fs: Arc<dyn FileSystem>,
    vpath: String,
    mode: HandleMode,
    reader: Option<Box<dyn RandomRead>>,
    writer: Option<Box<dyn RandomWrite>>,
    offset: u64,
    cached: Option<FileInfo>,
}

impl fmt::Debug for VirtHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VirtHandle")
            .field("path", &self.vpath)
            .field("mode", &self.mode)
            .field("offset", &self.offset)
            .finish()
    }
}

impl VirtHandle {
    async fn stat(&mut self) -> FsResult<FileInfo> {
        if let Some(info) = &self.cached {
            return Ok(info.clone());
        }
        let info = self.fs.stat(&self.vpath).await.map_err(map_err)?;
        self.cached = Some(info.clone());
        Ok(info)
    }

    async fn reader(&mut self) -> FsResult<&mut Box<dyn RandomRead>> {
        if self.reader.is_none() {
            let opened = self.fs.reader(&self.vpath).await.map_err(map_err)?;
            self.reader = Some(opened);
        }
        Ok(self.reader.as_mut().expect("reader just opened"))
    }

    async fn writer(&mut self) -> FsResult<&mut Box<dyn RandomWrite>> {
        if self.writer.is_none() {
            let opened = self.fs.writer(&self.vpath).await.map_err(map_err)?;
            self.writer = Some(opened);
        }
        Ok(self.writer.as_mut().expect("writer just opened"))
    }

    async fn write_all_at_offset(&mut self, data: &[u8]) -> FsResult<()> {
        if self.mode == HandleMode::ReadOnly {
            return Err(DavError::Forbidden);
        }
        let offset = self.offset;
        let writer = self.writer().await?;
        let n = writer.write_at(data, offset).await.map_err(map_err)?;
        self.offset += n as u64;
        // The cached size is stale after a write.
        self.cached = None;
        Ok(())
    }
}

impl DavFile for VirtHandle {
    fn metadata(&mut self) -> FsFuture<Box<dyn DavMetaData>> {
        Box::pin(async move {
            let info = self.stat().await?;
            Ok(Box::new(DavMeta(info)) as Box<dyn DavMetaData>)
        })
    }

    fn write_buf(&mut self, mut buf: Box<dyn Buf + Send>) -> FsFuture<()> {
        Box::pin(async move {
            while buf.has_remaining() {
                let chunk = buf.chunk().to_vec();
                self.write_all_at_offset(&chunk).await?;
                buf.advance(chunk.len());
            }
            Ok(())
        })
    }

    fn write_bytes(&mut self, buf: Bytes) -> FsFuture<()> {
        Box::pin(async move { self.write_all_at_offset(&buf).await })
    }

    fn read_bytes(&mut self, count: usize) -> FsFuture<Bytes> {
        Box::pin(async move {
            if self.mode == HandleMode::WriteOnly {
                return Err(DavError::Forbidden);
            }
            let offset = self.offset;
            let reader = self.reader().await?;
            let data = reader.read_at(count, offset).await.map_err(map_err)?;
            self.offset += data.len() as u64;
            Ok(Bytes::from(data))
        })
    }

    fn seek(&mut self, pos: SeekFrom) -> FsFuture<u64> {
        Box::pin(async move {
            let size = self.stat().await?.size as i64;
            let target = match pos {
                SeekFrom::Start(o) => o as i64,
                SeekFrom::Current(d) => self.offset as i64 + d,
                // End(d) is the last byte minus d, one short of POSIX
                // SEEK_END; End(0) lands on the last byte.
                SeekFrom::End(d) => size - 1 - d,
            };
            if target < 0 || target >= size {
                return Err(DavError::GeneralFailure);
            }
            self.offset = target as u64;
            Ok(self.offset)
        })
    }

    fn flush(&mut self) -> FsFuture<()> {
        Box::pin(async move {
            if let Some(writer) = self.writer.as_mut() {
                writer.close().await.map_err(map_err)?;
                self.writer = None;
            }
            Ok(())
        })
    }
}

/// The [`DavFileSystem`] bridge over a user's filesystem chain.
#[derive(Clone)]
pub struct DavBridge {
    fs: Arc<dyn FileSystem>,
}

impl DavBridge {
    pub fn new(fs: Arc<dyn FileSystem>) -> Self {
        Self { fs }
    }
}

impl DavFileSystem for DavBridge {
    fn open<'a>(&'a self, path: &'a DavPath, options: OpenOptions) -> FsFuture<'a, Box<dyn DavFile>> {
        Box::pin(async move {
            let vpath = virt_path(path)?;
            let mode = if options.write && options.read {
                HandleMode::ReadWrite
            } else if options.write {
                HandleMode::WriteOnly
            } else {
                HandleMode::ReadOnly
            };
            let mut handle = VirtHandle {
                fs: Arc::clone(&self.fs),
                vpath,
                mode,
                reader: None,
                writer: None,
                offset: 0,
                cached: None,
            };
            match mode {
                HandleMode::ReadOnly => {
                    if options.create_new {
                        return Err(DavError::Forbidden);
                    }
                    // Surface missing files and policy refusals now.
                    handle.reader().await?;
                }
                HandleMode::WriteOnly | HandleMode::ReadWrite => {
                    if options.create_new && self.fs.stat(&handle.vpath).await.is_ok() {
                        return Err(DavError::Exists);
                    }
                    // Opening the writer creates the file.
                    handle.writer().await?;
                }
            }
            Ok(Box::new(handle) as Box<dyn DavFile>)
        })
    }

    fn read_dir<'a>(
        &'a self,
        path: &'a DavPath,
        _meta: ReadDirMeta,
    ) -> FsFuture<'a, FsStream<Box<dyn DavDirEntry>>> {
        Box::pin(async move {
            let vpath = virt_path(path)?;
            let mut lister = self.fs.list(&vpath).await.map_err(map_err)?;
            let mut entries: Vec<Box<dyn DavDirEntry>> = Vec::new();
            let mut offset = 0u64;
            loop {
                let chunk = lister.fill(LIST_BATCH, offset).await.map_err(map_err)?;
                offset += chunk.entries.len() as u64;
                let at_end = chunk.eof || chunk.entries.is_empty();
                for info in chunk.entries {
                    entries.push(Box::new(DavEntry(info)));
                }
                if at_end {
                    break;
                }
            }
            let stream: FsStream<Box<dyn DavDirEntry>> = futures::stream::iter(entries).boxed();
            Ok(stream)
        })
    }

    fn metadata<'a>(&'a self, path: &'a DavPath) -> FsFuture<'a, Box<dyn DavMetaData>> {
        Box::pin(async move {
            let vpath = virt_path(path)?;
            let info = self.fs.stat(&vpath).await.map_err(map_err)?;
            Ok(Box::new(DavMeta(info)) as Box<dyn DavMetaData>)
        })
    }

    fn create_dir<'a>(&'a self, path: &'a DavPath) -> FsFuture<'a, ()> {
        Box::pin(async move {
            let vpath = virt_path(path)?;
            self.fs.mkdir(&vpath).await.map_err(map_err)
        })
    }

    fn remove_file<'a>(&'a self, path: &'a DavPath) -> FsFuture<'a, ()> {
        Box::pin(async move {
            let vpath = virt_path(path)?;
            self.fs.rm(&vpath).await.map_err(map_err)
        })
    }

    fn remove_dir<'a>(&'a self, path: &'a DavPath) -> FsFuture<'a, ()> {
        Box::pin(async move {
            let vpath = virt_path(path)?;
            self.fs.rmdir(&vpath).await.map_err(map_err)
        })
    }

    fn rename<'a>(&'a self, from: &'a DavPath, to: &'a DavPath) -> FsFuture<'a, ()> {
        Box::pin(async move {
            let src = virt_path(from)?;
            let dst = virt_path(to)?;
            self.fs.rename(&src, &dst).await.map_err(map_err)
        })
    }
}

/// Serve WebDAV for one user over their virtual listener until the root
/// context is cancelled.
pub fn spawn_webdav(
    fs: Arc<dyn FileSystem>,
    mut listener: VirtualListener<ForwardedChannel>,
    cancel: CancellationToken,
) {
    let handler = DavHandler::builder()
        .filesystem(Box::new(DavBridge::new(fs)))
        .locksystem(MemLs::new())
        .build_handler();
    info!(addr = %listener.local_addr(), user = %listener.user(), "webdav service ready");

    tokio::spawn(async move {
        loop {
            let forwarded = match listener.accept().await {
                Ok(f) => f,
                Err(_) => break,
            };
            debug!(user = %forwarded.info.username, "forwarded webdav connection accepted");
            let handler = handler.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                let io = TokioIo::new(forwarded.channel.into_stream());
                let service = hyper::service::service_fn(move |req| {
                    let handler = handler.clone();
                    async move {
                        Ok::<_, std::convert::Infallible>(handler.handle(req).await)
                    }
                });
                let conn = hyper::server::conn::http1::Builder::new().serve_connection(io, service);
                tokio::pin!(conn);
                tokio::select! {
                    result = conn.as_mut() => {
                        if let Err(e) = result {
                            debug!(error = %e, "webdav connection ended");
                        }
                    }
                    _ = cancel.cancelled() => {
                        conn.as_mut().graceful_shutdown();
                        let _ = conn.await;
                    }
                }
            });
        }
        debug!("webdav listener stopped");
    });
}
