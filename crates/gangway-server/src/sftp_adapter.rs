//! SFTP adapter: serves a [`FileSystem`] through the SFTP subsystem.
//!
//! Each protocol request is normalized, translated into exactly one
//! contract call and recorded as exactly one access-log entry with status
//! `ok`, `forbidden` or `error`. Forbidden maps to the protocol's
//! permission-denied status, not-found to no-such-file, everything else
//! to failure.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use russh_sftp::protocol::{
    Attrs, Data, File, FileAttributes, Handle, Name, OpenFlags, Status, StatusCode, Version,
};
use tracing::debug;

use gangway_vfs::{path, DirLister, FileSystem, FsError, RandomRead, RandomWrite, StatChanges};

use crate::access_log::{AccessLog, ConnectionInfo};

/// Entries pulled from a lister per READDIR request.
const READDIR_BATCH: usize = 128;

struct DirHandle {
    lister: Box<dyn DirLister>,
    offset: u64,
}

struct FileHandle {
    path: String,
    reader: Option<Box<dyn RandomRead>>,
    writer: Option<Box<dyn RandomWrite>>,
}

enum HandleState {
    Dir(DirHandle),
    File(FileHandle),
}

/// One SFTP session over one SSH channel.
pub struct SftpSession {
    fs: Arc<dyn FileSystem>,
    info: ConnectionInfo,
    access: AccessLog,
    version: Option<u32>,
    handles: HashMap<String, HandleState>,
    next_handle: u64,
}

impl SftpSession {
    pub fn new(fs: Arc<dyn FileSystem>, info: ConnectionInfo, access: AccessLog) -> Self {
        Self {
            fs,
            info,
            access,
            version: None,
            handles: HashMap::new(),
            next_handle: 0,
        }
    }

    fn fresh_handle(&mut self) -> String {
        self.next_handle += 1;
        format!("h{}", self.next_handle)
    }

    /// Normalize a request path; a rejected path is logged as an error.
    async fn guard(&self, raw: &str, op: &str) -> Result<String, StatusCode> {
        match path::normalize(raw) {
            Ok(p) => Ok(p),
            Err(e) => {
                debug!(path = raw, error = %e, "path rejected");
                self.access.access(&self.info, raw, op, "error").await;
                Err(StatusCode::Failure)
            }
        }
    }

    /// Log the outcome of a contract call and map its error to a status.
    async fn finish<T>(
        &self,
        vpath: &str,
        op: &str,
        result: Result<T, FsError>,
    ) -> Result<T, StatusCode> {
        match result {
            Ok(value) => {
                self.access.access(&self.info, vpath, op, "ok").await;
                Ok(value)
            }
            Err(e) if e.is_forbidden() => {
                self.access.access(&self.info, vpath, op, "forbidden").await;
                Err(StatusCode::PermissionDenied)
            }
            Err(e) => {
                debug!(path = vpath, op, error = %e, "request failed");
                self.access.access(&self.info, vpath, op, "error").await;
                Err(status_of(&e))
            }
        }
    }

    fn ok_status(&self, id: u32) -> Status {
        Status {
            id,
            status_code: StatusCode::Ok,
            error_message: "Ok".to_string(),
            language_tag: "en-US".to_string(),
        }
    }

    fn file_handle(&mut self, handle: &str) -> Result<&mut FileHandle, StatusCode> {
        match self.handles.get_mut(handle) {
            Some(HandleState::File(f)) => Ok(f),
            _ => Err(StatusCode::Failure),
        }
    }
}

fn status_of(e: &FsError) -> StatusCode {
    match e {
        FsError::NotFound(_) => StatusCode::NoSuchFile,
        FsError::Forbidden(_) => StatusCode::PermissionDenied,
        _ => StatusCode::Failure,
    }
}

fn to_wire(info: &gangway_vfs::FileInfo) -> FileAttributes {
    FileAttributes {
        size: Some(info.size),
        permissions: Some(info.wire_mode()),
        atime: Some(info.mtime_secs() as u32),
        mtime: Some(info.mtime_secs() as u32),
        ..Default::default()
    }
}

fn from_wire(attrs: &FileAttributes) -> StatChanges {
    StatChanges {
        size: attrs.size,
        perm: attrs.permissions.map(|p| p & 0o7777),
        owner: attrs.uid.zip(attrs.gid),
        times: attrs.atime.zip(attrs.mtime).map(|(a, m)| {
            (
                SystemTime::UNIX_EPOCH + Duration::from_secs(a as u64),
                SystemTime::UNIX_EPOCH + Duration::from_secs(m as u64),
            )
        }),
    }
}

#[async_trait]
impl russh_sftp::server::Handler for SftpSession {
    type Error = StatusCode;

    fn unimplemented(&self) -> Self::Error {
        StatusCode::OpUnsupported
    }

    fn init(
        &mut self,
        version: u32,
        _extensions: HashMap<String, String>,
    ) -> impl Future<Output = Result<Version, Self::Error>> + Send {
        async move {
        if self.version.is_some() {
            return Err(StatusCode::BadMessage);
        }
        self.version = Some(version);
        Ok(Version::new())
    }
        }

    fn open(
        &mut self,
        id: u32,
        filename: String,
        pflags: OpenFlags,
        _attrs: FileAttributes,
    ) -> impl Future<Output = Result<Handle, Self::Error>> + Send {
        async move {
        let wants_write = pflags.intersects(
            OpenFlags::WRITE | OpenFlags::APPEND | OpenFlags::CREATE | OpenFlags::TRUNCATE,
        );
        let op = if wants_write { "Write" } else { "Read" };
        let vpath = self.guard(&filename, op).await?;

        if pflags.contains(OpenFlags::EXCLUDE) && self.fs.stat(&vpath).await.is_ok() {
            self.access.access(&self.info, &vpath, op, "error").await;
            return Err(StatusCode::Failure);
        }

        // Writer first so a read-write open of a new file can be read
        // back; creation happens here.
        let writer = if wants_write {
            Some(self.finish(&vpath, op, self.fs.writer(&vpath).await).await?)
        } else {
            None
        };
        let reader = if pflags.contains(OpenFlags::READ) {
            let opened = self.fs.reader(&vpath).await;
            if wants_write {
                // Already logged for the write side; surface errors only.
                match opened {
                    Ok(r) => Some(r),
                    Err(e) => return Err(status_of(&e)),
                }
            } else {
                Some(self.finish(&vpath, op, opened).await?)
            }
        } else {
            None
        };

        let handle = self.fresh_handle();
        self.handles.insert(
            handle.clone(),
            HandleState::File(FileHandle {
                path: vpath,
                reader,
                writer,
            }),
        );
        Ok(Handle { id, handle })
    }
        }

    fn close(&mut self, id: u32, handle: String) -> impl Future<Output = Result<Status, Self::Error>> + Send {
        async move {
        match self.handles.remove(&handle) {
            Some(HandleState::File(mut file)) => {
                if let Some(writer) = file.writer.as_mut() {
                    writer.close().await.map_err(|e| status_of(&e))?;
                }
                if let Some(reader) = file.reader.as_mut() {
                    reader.close().await.map_err(|e| status_of(&e))?;
                }
                Ok(self.ok_status(id))
            }
            Some(HandleState::Dir(_)) => Ok(self.ok_status(id)),
            None => Err(StatusCode::Failure),
        }
    }
        }

    fn read(
        &mut self,
        id: u32,
        handle: String,
        offset: u64,
        len: u32,
    ) -> impl Future<Output = Result<Data, Self::Error>> + Send {
        async move {
        let file = self.file_handle(&handle)?;
        let reader = file.reader.as_mut().ok_or(StatusCode::PermissionDenied)?;
        let data = reader
            .read_at(len as usize, offset)
            .await
            .map_err(|e| status_of(&e))?;
        if data.is_empty() {
            return Err(StatusCode::Eof);
        }
        Ok(Data { id, data })
    }
        }

    fn write(
        &mut self,
        id: u32,
        handle: String,
        offset: u64,
        data: Vec<u8>,
    ) -> impl Future<Output = Result<Status, Self::Error>> + Send {
        async move {
        let file = self.file_handle(&handle)?;
        let writer = file.writer.as_mut().ok_or(StatusCode::PermissionDenied)?;
        writer
            .write_at(&data, offset)
            .await
            .map_err(|e| status_of(&e))?;
        Ok(self.ok_status(id))
    }
        }

    fn lstat(&mut self, id: u32, path: String) -> impl Future<Output = Result<Attrs, Self::Error>> + Send {
        async move {
        let vpath = self.guard(&path, "Lstat").await?;
        let info = self.finish(&vpath, "Lstat", self.fs.lstat(&vpath).await).await?;
        Ok(Attrs {
            id,
            attrs: to_wire(&info),
        })
    }
        }

    fn fstat(&mut self, id: u32, handle: String) -> impl Future<Output = Result<Attrs, Self::Error>> + Send {
        async move {
        let vpath = self.file_handle(&handle)?.path.clone();
        let info = self.finish(&vpath, "Stat", self.fs.stat(&vpath).await).await?;
        Ok(Attrs {
            id,
            attrs: to_wire(&info),
        })
    }
        }

    fn setstat(
        &mut self,
        id: u32,
        path: String,
        attrs: FileAttributes,
    ) -> impl Future<Output = Result<Status, Self::Error>> + Send {
        async move {
        let vpath = self.guard(&path, "Setstat").await?;
        let changes = from_wire(&attrs);
        self.finish(&vpath, "Setstat", self.fs.set_stat(&vpath, &changes).await)
            .await?;
        Ok(self.ok_status(id))
    }
        }

    fn fsetstat(
        &mut self,
        id: u32,
        handle: String,
        attrs: FileAttributes,
    ) -> impl Future<Output = Result<Status, Self::Error>> + Send {
        async move {
        let vpath = self.file_handle(&handle)?.path.clone();
        let changes = from_wire(&attrs);
        self.finish(&vpath, "Setstat", self.fs.set_stat(&vpath, &changes).await)
            .await?;
        Ok(self.ok_status(id))
    }
        }

    fn opendir(&mut self, id: u32, path: String) -> impl Future<Output = Result<Handle, Self::Error>> + Send {
        async move {
        let vpath = self.guard(&path, "List").await?;
        let lister = self.finish(&vpath, "List", self.fs.list(&vpath).await).await?;
        let handle = self.fresh_handle();
        self.handles
            .insert(handle.clone(), HandleState::Dir(DirHandle { lister, offset: 0 }));
        Ok(Handle { id, handle })
    }
        }

    fn readdir(&mut self, id: u32, handle: String) -> impl Future<Output = Result<Name, Self::Error>> + Send {
        async move {
        let dir = match self.handles.get_mut(&handle) {
            Some(HandleState::Dir(d)) => d,
            _ => return Err(StatusCode::Failure),
        };
        let chunk = dir
            .lister
            .fill(READDIR_BATCH, dir.offset)
            .await
            .map_err(|e| status_of(&e))?;
        if chunk.entries.is_empty() {
            return Err(StatusCode::Eof);
        }
        dir.offset += chunk.entries.len() as u64;
        let files = chunk
            .entries
            .into_iter()
            .map(|info| File::new(info.name.clone(), to_wire(&info)))
            .collect();
        Ok(Name { id, files })
    }
        }

    fn remove(&mut self, id: u32, filename: String) -> impl Future<Output = Result<Status, Self::Error>> + Send {
        async move {
        let vpath = self.guard(&filename, "Remove").await?;
        self.finish(&vpath, "Remove", self.fs.rm(&vpath).await).await?;
        Ok(self.ok_status(id))
    }
        }

    fn mkdir(
        &mut self,
        id: u32,
        path: String,
        _attrs: FileAttributes,
    ) -> impl Future<Output = Result<Status, Self::Error>> + Send {
        async move {
        let vpath = self.guard(&path, "Mkdir").await?;
        self.finish(&vpath, "Mkdir", self.fs.mkdir(&vpath).await).await?;
        Ok(self.ok_status(id))
    }
        }

    fn rmdir(&mut self, id: u32, path: String) -> impl Future<Output = Result<Status, Self::Error>> + Send {
        async move {
        let vpath = self.guard(&path, "Rmdir").await?;
        self.finish(&vpath, "Rmdir", self.fs.rmdir(&vpath).await).await?;
        Ok(self.ok_status(id))
    }
        }

    fn realpath(&mut self, id: u32, path: String) -> impl Future<Output = Result<Name, Self::Error>> + Send {
        async move {
        // Clients send `.` and relative paths here; resolve lexically
        // against the virtual root.
        let resolved = path::resolve_dots(&path);
        Ok(Name {
            id,
            files: vec![File::new(resolved, FileAttributes::default())],
        })
    }
        }

    fn stat(&mut self, id: u32, path: String) -> impl Future<Output = Result<Attrs, Self::Error>> + Send {
        async move {
        let vpath = self.guard(&path, "Stat").await?;
        let info = self.finish(&vpath, "Stat", self.fs.stat(&vpath).await).await?;
        Ok(Attrs {
            id,
            attrs: to_wire(&info),
        })
    }
        }

    fn rename(
        &mut self,
        id: u32,
        oldpath: String,
        newpath: String,
    ) -> impl Future<Output = Result<Status, Self::Error>> + Send {
        async move {
        let src = self.guard(&oldpath, "Rename").await?;
        let dst = self.guard(&newpath, "Rename").await?;
        self.finish(&src, "Rename", self.fs.rename(&src, &dst).await)
            .await?;
        Ok(self.ok_status(id))
    }
        }

    fn readlink(&mut self, id: u32, path: String) -> impl Future<Output = Result<Name, Self::Error>> + Send {
        async move {
        let vpath = self.guard(&path, "Readlink").await?;
        let info = self
            .finish(&vpath, "Readlink", self.fs.readlink(&vpath).await)
            .await?;
        Ok(Name {
            id,
            files: vec![File::new(info.name.clone(), to_wire(&info))],
        })
    }
        }

    fn symlink(
        &mut self,
        id: u32,
        linkpath: String,
        targetpath: String,
    ) -> impl Future<Output = Result<Status, Self::Error>> + Send {
        async move {
        let link = self.guard(&linkpath, "Symlink").await?;
        let target = self.guard(&targetpath, "Symlink").await?;
        self.finish(&link, "Symlink", self.fs.symlink(&target, &link).await)
            .await?;
        Ok(self.ok_status(id))
    }
        }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gangway_vfs::{AccessPolicy, MemMount, PermissionWrapper};
    use russh_sftp::server::Handler;

    fn session_over(fs: Arc<dyn FileSystem>) -> SftpSession {
        let info = ConnectionInfo {
            username: "amy".to_string(),
            remote_ip: "127.0.0.1:9".to_string(),
        };
        SftpSession::new(fs, info, AccessLog::stdout())
    }

    async fn seeded() -> Arc<dyn FileSystem> {
        let fs = MemMount::new();
        let mut w = fs.writer("/hello.txt").await.unwrap();
        w.write_at(b"hello world", 0).await.unwrap();
        fs.mkdir("/sub").await.unwrap();
        Arc::new(fs)
    }

    #[tokio::test]
    async fn open_read_close_cycle() {
        let mut s = session_over(seeded().await);

        let handle = s
            .open(1, "/hello.txt".into(), OpenFlags::READ, FileAttributes::default())
            .await
            .unwrap()
            .handle;
        let data = s.read(2, handle.clone(), 0, 5).await.unwrap();
        assert_eq!(data.data, b"hello");
        let data = s.read(3, handle.clone(), 6, 32).await.unwrap();
        assert_eq!(data.data, b"world");
        assert_eq!(s.read(4, handle.clone(), 11, 8).await.unwrap_err(), StatusCode::Eof);
        let status = s.close(5, handle).await.unwrap();
        assert_eq!(status.status_code, StatusCode::Ok);
    }

    #[tokio::test]
    async fn write_creates_and_persists() {
        let fs = seeded().await;
        let mut s = session_over(Arc::clone(&fs));

        let flags = OpenFlags::WRITE | OpenFlags::CREATE;
        let handle = s
            .open(1, "/new.bin".into(), flags, FileAttributes::default())
            .await
            .unwrap()
            .handle;
        s.write(2, handle.clone(), 0, b"abcd".to_vec()).await.unwrap();
        s.write(3, handle.clone(), 4, b"efgh".to_vec()).await.unwrap();
        s.close(4, handle).await.unwrap();

        let mut r = fs.reader("/new.bin").await.unwrap();
        assert_eq!(r.read_at(16, 0).await.unwrap(), b"abcdefgh");
    }

    #[tokio::test]
    async fn exclusive_create_fails_on_existing() {
        let mut s = session_over(seeded().await);
        let flags = OpenFlags::WRITE | OpenFlags::CREATE | OpenFlags::EXCLUDE;
        assert!(s
            .open(1, "/hello.txt".into(), flags, FileAttributes::default())
            .await
            .is_err());
    }

    #[tokio::test]
    async fn read_on_write_only_handle_is_denied() {
        let mut s = session_over(seeded().await);
        let handle = s
            .open(
                1,
                "/hello.txt".into(),
                OpenFlags::WRITE,
                FileAttributes::default(),
            )
            .await
            .unwrap()
            .handle;
        assert_eq!(
            s.read(2, handle, 0, 4).await.unwrap_err(),
            StatusCode::PermissionDenied
        );
    }

    #[tokio::test]
    async fn readdir_walks_to_eof() {
        let mut s = session_over(seeded().await);
        let handle = s.opendir(1, "/".into()).await.unwrap().handle;

        let name = s.readdir(2, handle.clone()).await.unwrap();
        let names: Vec<_> = name.files.iter().map(|f| f.filename.clone()).collect();
        assert_eq!(names, ["hello.txt", "sub"]);
        assert_eq!(s.readdir(3, handle.clone()).await.unwrap_err(), StatusCode::Eof);
        s.close(4, handle).await.unwrap();
    }

    #[tokio::test]
    async fn stat_reports_wire_attributes() {
        let mut s = session_over(seeded().await);
        let attrs = s.stat(1, "/hello.txt".into()).await.unwrap().attrs;
        assert_eq!(attrs.size, Some(11));
        assert_eq!(attrs.permissions.unwrap() & 0o170000, 0o100000);

        let attrs = s.lstat(2, "/sub".into()).await.unwrap().attrs;
        assert_eq!(attrs.permissions.unwrap() & 0o170000, 0o040000);
    }

    #[tokio::test]
    async fn missing_files_map_to_no_such_file() {
        let mut s = session_over(seeded().await);
        assert_eq!(
            s.stat(1, "/nope".into()).await.unwrap_err(),
            StatusCode::NoSuchFile
        );
    }

    #[tokio::test]
    async fn traversal_paths_are_refused() {
        let mut s = session_over(seeded().await);
        assert_eq!(
            s.stat(1, "/a/../b".into()).await.unwrap_err(),
            StatusCode::Failure
        );
        assert_eq!(
            s.opendir(2, "/a//b".into()).await.unwrap_err(),
            StatusCode::Failure
        );
    }

    #[tokio::test]
    async fn hidden_paths_are_permission_denied() {
        let inner = seeded().await;
        let policy = AccessPolicy::new(
            &[".*".to_string()],
            &[".*".to_string()],
            &["^/hello\\.txt$".to_string()],
        )
        .unwrap();
        let mut s = session_over(Arc::new(PermissionWrapper::new(inner, policy)));

        assert_eq!(
            s.stat(1, "/hello.txt".into()).await.unwrap_err(),
            StatusCode::PermissionDenied
        );
        assert_eq!(
            s.open(
                2,
                "/hello.txt".into(),
                OpenFlags::READ,
                FileAttributes::default()
            )
            .await
            .unwrap_err(),
            StatusCode::PermissionDenied
        );
    }

    #[tokio::test]
    async fn rename_and_remove_roundtrip() {
        let fs = seeded().await;
        let mut s = session_over(Arc::clone(&fs));

        s.rename(1, "/hello.txt".into(), "/moved.txt".into())
            .await
            .unwrap();
        assert!(fs.stat("/hello.txt").await.unwrap_err().is_not_found());
        s.remove(2, "/moved.txt".into()).await.unwrap();
        assert!(fs.stat("/moved.txt").await.unwrap_err().is_not_found());

        s.mkdir(3, "/d".into(), FileAttributes::default()).await.unwrap();
        s.rmdir(4, "/d".into()).await.unwrap();
    }

    #[tokio::test]
    async fn realpath_resolves_client_relative_paths() {
        let mut s = session_over(seeded().await);
        let name = s.realpath(1, ".".into()).await.unwrap();
        assert_eq!(name.files[0].filename, "/");
        let name = s.realpath(2, "sub/./x".into()).await.unwrap();
        assert_eq!(name.files[0].filename, "/sub/x");
    }

    #[tokio::test]
    async fn symlink_and_readlink() {
        let fs = seeded().await;
        let mut s = session_over(Arc::clone(&fs));

        s.symlink(1, "/ln".into(), "/hello.txt".into()).await.unwrap();
        let name = s.readlink(2, "/ln".into()).await.unwrap();
        assert_eq!(name.files[0].filename, "/hello.txt");
    }

    #[tokio::test]
    async fn setstat_truncates_through_the_contract() {
        let fs = seeded().await;
        let mut s = session_over(Arc::clone(&fs));

        let attrs = FileAttributes {
            size: Some(5),
            ..Default::default()
        };
        s.setstat(1, "/hello.txt".into(), attrs).await.unwrap();
        assert_eq!(fs.stat("/hello.txt").await.unwrap().size, 5);
    }
}
