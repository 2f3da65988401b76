//! Host filesystem transport.
//!
//! `LocalTransport` serves the "local filesystem" connect target from a
//! directory on the host. Logical paths are absolute within that directory:
//! with root `/srv/data`, the logical path `/a/b` is `/srv/data/a/b` on disk.
//! [`LocalTransport::new`] roots at `/`.
//!
//! The host has no blocks or replicas. Every file reports a single replica
//! on `localhost` per [`LOCAL_BLOCK_SIZE`] span, and replication changes are
//! accepted and ignored.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::os::unix::fs::{FileExt, MetadataExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use filetime::FileTime;
use nix::unistd::{Gid, Group, Uid, User};
use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::codec::{EntryKind, RawEntryList, RawEntryRecord, RawHostTable};
use crate::error::{RawReturn, Sentinel};

use super::{ConnectTarget, OpenFlags, OpenHints, SessionRef, StreamRef, Transport, resolve_path};

/// Block size reported for host files (32 MiB).
pub const LOCAL_BLOCK_SIZE: u64 = 32 * 1024 * 1024;

const LOCAL_HOST: &str = "localhost";

#[derive(Debug)]
struct LocalSession {
    cwd: String,
}

#[derive(Debug)]
struct LocalStream {
    session: SessionRef,
    path: String,
    file: File,
    writable: bool,
}

/// The host filesystem, rooted at a directory.
#[derive(Debug)]
pub struct LocalTransport {
    root: PathBuf,
    sessions: DashMap<SessionRef, LocalSession>,
    streams: DashMap<StreamRef, Arc<Mutex<LocalStream>>>,
    next_session: AtomicU64,
    next_stream: AtomicU64,
}

impl Default for LocalTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalTransport {
    /// The whole host filesystem.
    pub fn new() -> Self {
        Self::rooted("/")
    }

    /// The host filesystem below `root`.
    pub fn rooted(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            sessions: DashMap::new(),
            streams: DashMap::new(),
            next_session: AtomicU64::new(1),
            next_stream: AtomicU64::new(1),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn respond<T: Sentinel>(result: io::Result<T>) -> RawReturn<T> {
        match result {
            Ok(value) => RawReturn::ok(value),
            Err(e) => RawReturn::failed(e),
        }
    }

    /// Logical absolute path for `path` in `session`.
    fn logical(&self, session: SessionRef, path: &str) -> io::Result<String> {
        let cwd = self
            .sessions
            .get(&session)
            .map(|s| s.cwd.clone())
            .ok_or_else(|| bad_handle(format!("unknown {session}")))?;
        resolve_path(&cwd, path)
    }

    fn host_path(&self, logical: &str) -> PathBuf {
        self.root.join(logical.trim_start_matches('/'))
    }

    fn resolve(&self, session: SessionRef, path: &str) -> io::Result<PathBuf> {
        Ok(self.host_path(&self.logical(session, path)?))
    }

    fn stream(&self, session: SessionRef, stream: StreamRef) -> io::Result<Arc<Mutex<LocalStream>>> {
        let state = self
            .streams
            .get(&stream)
            .map(|s| Arc::clone(s.value()))
            .ok_or_else(|| bad_handle(format!("unknown {stream}")))?;
        if state.lock().session != session {
            return Err(bad_handle(format!("{stream} does not belong to {session}")));
        }
        Ok(state)
    }

    fn do_connect(&self, target: &ConnectTarget) -> io::Result<SessionRef> {
        if let ConnectTarget::Remote { host, port } = target {
            return Err(io::Error::new(
                io::ErrorKind::ConnectionRefused,
                format!("{host}:{port} is not served by the local transport"),
            ));
        }
        let session = SessionRef(self.next_session.fetch_add(1, Ordering::Relaxed));
        debug!(%session, root = %self.root.display(), "local session opened");
        self.sessions.insert(session, LocalSession { cwd: "/".to_string() });
        Ok(session)
    }

    fn do_disconnect(&self, session: SessionRef) -> io::Result<()> {
        self.sessions
            .remove(&session)
            .ok_or_else(|| bad_handle(format!("unknown {session}")))?;
        self.streams.retain(|_, stream| stream.lock().session != session);
        Ok(())
    }

    fn do_open(&self, session: SessionRef, path: &str, flags: OpenFlags) -> io::Result<StreamRef> {
        let logical = self.logical(session, path)?;
        let host = self.host_path(&logical);

        if flags.contains(OpenFlags::RDWR) || flags.contains(OpenFlags::CREATE | OpenFlags::EXCL) {
            return Err(io::Error::new(io::ErrorKind::Unsupported, "unsupported open flags"));
        }

        let writable = flags.contains(OpenFlags::WRONLY);
        let mut options = OpenOptions::new();
        if !writable {
            options.read(true);
        } else if flags.contains(OpenFlags::APPEND) {
            options.append(true);
        } else {
            options.write(true).create(true).truncate(true);
        }
        let file = options.open(&host)?;
        if file.metadata()?.is_dir() {
            return Err(io::Error::new(
                io::ErrorKind::IsADirectory,
                format!("{logical}: is a directory"),
            ));
        }

        let stream = StreamRef(self.next_stream.fetch_add(1, Ordering::Relaxed));
        debug!(%stream, path = %logical, "local stream opened");
        self.streams.insert(
            stream,
            Arc::new(Mutex::new(LocalStream {
                session,
                path: logical,
                file,
                writable,
            })),
        );
        Ok(stream)
    }

    fn do_close(&self, session: SessionRef, stream: StreamRef) -> io::Result<()> {
        let state = self.stream(session, stream)?;
        self.streams.remove(&stream);
        let mut state = state.lock();
        if state.writable {
            state.file.flush()?;
        }
        debug!(%stream, path = %state.path, "local stream closed");
        Ok(())
    }

    fn do_read(&self, session: SessionRef, stream: StreamRef, buf: &mut [u8]) -> io::Result<i32> {
        let state = self.stream(session, stream)?;
        let mut state = state.lock();
        let len = buf.len().min(i32::MAX as usize);
        Ok(state.file.read(&mut buf[..len])? as i32)
    }

    fn do_pread(&self, session: SessionRef, stream: StreamRef, position: i64, buf: &mut [u8]) -> io::Result<i32> {
        let position = u64::try_from(position)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, format!("negative position {position}")))?;
        let state = self.stream(session, stream)?;
        let state = state.lock();
        let len = buf.len().min(i32::MAX as usize);
        Ok(state.file.read_at(&mut buf[..len], position)? as i32)
    }

    fn do_write(&self, session: SessionRef, stream: StreamRef, data: &[u8]) -> io::Result<i32> {
        let state = self.stream(session, stream)?;
        let mut state = state.lock();
        let len = data.len().min(i32::MAX as usize);
        Ok(state.file.write(&data[..len])? as i32)
    }

    fn do_seek(&self, session: SessionRef, stream: StreamRef, position: i64) -> io::Result<()> {
        let position = u64::try_from(position)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, format!("negative position {position}")))?;
        let state = self.stream(session, stream)?;
        let mut state = state.lock();
        if state.writable {
            return Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "seek is only supported on streams open for reading",
            ));
        }
        state.file.seek(SeekFrom::Start(position))?;
        Ok(())
    }

    fn do_tell(&self, session: SessionRef, stream: StreamRef) -> io::Result<i64> {
        let state = self.stream(session, stream)?;
        let mut state = state.lock();
        Ok(state.file.stream_position()? as i64)
    }

    fn do_flush(&self, session: SessionRef, stream: StreamRef) -> io::Result<()> {
        let state = self.stream(session, stream)?;
        let mut state = state.lock();
        state.file.flush()?;
        state.file.sync_data()
    }

    fn do_available(&self, session: SessionRef, stream: StreamRef) -> io::Result<i32> {
        let state = self.stream(session, stream)?;
        let mut state = state.lock();
        let len = state.file.metadata()?.len();
        let position = state.file.stream_position()?;
        Ok(len.saturating_sub(position).min(i32::MAX as u64) as i32)
    }

    fn do_copy(&self, session: SessionRef, src: &str, dst_session: SessionRef, dst: &str) -> io::Result<()> {
        let src = self.resolve(session, src)?;
        let dst = self.resolve(dst_session, dst)?;
        if dst.exists() {
            return Err(already_exists(&dst));
        }
        copy_tree(&src, &dst)
    }

    fn do_move(&self, session: SessionRef, src: &str, dst_session: SessionRef, dst: &str) -> io::Result<()> {
        let src = self.resolve(session, src)?;
        let dst = self.resolve(dst_session, dst)?;
        if dst.exists() {
            return Err(already_exists(&dst));
        }
        fs::rename(src, dst)
    }

    fn do_delete(&self, session: SessionRef, path: &str) -> io::Result<()> {
        let logical = self.logical(session, path)?;
        if logical == "/" {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "cannot delete the root directory"));
        }
        let path = self.host_path(&logical);
        if fs::symlink_metadata(&path)?.is_dir() {
            fs::remove_dir_all(path)
        } else {
            fs::remove_file(path)
        }
    }

    fn do_set_working_directory(&self, session: SessionRef, path: &str) -> io::Result<()> {
        let logical = self.logical(session, path)?;
        let mut state = self
            .sessions
            .get_mut(&session)
            .ok_or_else(|| bad_handle(format!("unknown {session}")))?;
        state.cwd = logical;
        Ok(())
    }

    fn do_list(&self, session: SessionRef, path: &str) -> io::Result<RawEntryList> {
        let logical = self.logical(session, path)?;
        let host = self.host_path(&logical);
        let metadata = fs::metadata(&host)?;
        if !metadata.is_dir() {
            return Ok(RawEntryList::new(vec![record(&logical, &metadata)]));
        }

        let mut names: Vec<String> = fs::read_dir(&host)?
            .map(|entry| entry.map(|e| e.file_name().to_string_lossy().into_owned()))
            .collect::<io::Result<_>>()?;
        names.sort();

        let prefix = if logical == "/" { String::new() } else { logical };
        let records = names
            .into_iter()
            .map(|name| {
                let child = format!("{prefix}/{name}");
                fs::metadata(self.host_path(&child)).map(|m| record(&child, &m))
            })
            .collect::<io::Result<Vec<_>>>()?;
        Ok(RawEntryList::new(records))
    }

    fn do_path_info(&self, session: SessionRef, path: &str) -> io::Result<RawEntryRecord> {
        let logical = self.logical(session, path)?;
        let metadata = fs::metadata(self.host_path(&logical))?;
        Ok(record(&logical, &metadata))
    }

    fn do_hosts(&self, session: SessionRef, path: &str, start: i64, length: i64) -> io::Result<RawHostTable> {
        let (start, length) = match (u64::try_from(start), u64::try_from(length)) {
            (Ok(s), Ok(l)) => (s, l),
            _ => {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("invalid range {start}+{length}"),
                ));
            }
        };
        let len = fs::metadata(self.resolve(session, path)?)?.len();
        if length == 0 || start >= len {
            return Ok(RawHostTable::from_blocks::<&str>(&[]));
        }
        let first = start / LOCAL_BLOCK_SIZE;
        let last = (start.saturating_add(length).min(len) - 1) / LOCAL_BLOCK_SIZE;
        let blocks: Vec<Vec<&str>> = (first..=last).map(|_| vec![LOCAL_HOST]).collect();
        Ok(RawHostTable::from_blocks(&blocks))
    }

    fn do_statistics(&self, session: SessionRef) -> io::Result<(i64, i64)> {
        self.logical(session, "/")?;
        let stat = nix::sys::statvfs::statvfs(&self.root)?;
        let fragment = stat.fragment_size() as u64;
        let blocks = stat.blocks() as u64;
        let free = stat.blocks_free() as u64;
        Ok(((blocks * fragment) as i64, (blocks.saturating_sub(free) * fragment) as i64))
    }

    fn do_chown(&self, session: SessionRef, path: &str, owner: Option<&str>, group: Option<&str>) -> io::Result<()> {
        let path = self.resolve(session, path)?;
        let uid = owner
            .map(|name| {
                User::from_name(name)?
                    .map(|u| u.uid)
                    .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, format!("unknown user {name}")))
            })
            .transpose()?;
        let gid = group
            .map(|name| {
                Group::from_name(name)?
                    .map(|g| g.gid)
                    .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, format!("unknown group {name}")))
            })
            .transpose()?;
        nix::unistd::chown(&path, uid, gid)?;
        Ok(())
    }

    fn do_chmod(&self, session: SessionRef, path: &str, mode: i16) -> io::Result<()> {
        let path = self.resolve(session, path)?;
        let mode = u16::try_from(mode)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, format!("invalid mode {mode}")))?;
        fs::set_permissions(path, fs::Permissions::from_mode(u32::from(mode & 0o7777)))
    }

    fn do_utime(&self, session: SessionRef, path: &str, mtime: i64, atime: i64) -> io::Result<()> {
        let path = self.resolve(session, path)?;
        if mtime != 0 {
            filetime::set_file_mtime(&path, FileTime::from_unix_time(mtime, 0))?;
        }
        if atime != 0 {
            filetime::set_file_atime(&path, FileTime::from_unix_time(atime, 0))?;
        }
        Ok(())
    }
}

impl Transport for LocalTransport {
    fn connect(&self, target: &ConnectTarget, _user: Option<&str>) -> RawReturn<Option<SessionRef>> {
        trace!(filesystem = %target, "local connect");
        Self::respond(self.do_connect(target).map(Some))
    }

    fn disconnect(&self, session: SessionRef) -> RawReturn<i32> {
        Self::respond(self.do_disconnect(session).map(|()| 0))
    }

    fn open_stream(
        &self,
        session: SessionRef,
        path: &str,
        flags: OpenFlags,
        _hints: OpenHints,
    ) -> RawReturn<Option<StreamRef>> {
        Self::respond(self.do_open(session, path, flags).map(Some))
    }

    fn close_stream(&self, session: SessionRef, stream: StreamRef) -> RawReturn<i32> {
        Self::respond(self.do_close(session, stream).map(|()| 0))
    }

    fn exists(&self, session: SessionRef, path: &str) -> RawReturn<i32> {
        Self::respond(
            self.resolve(session, path)
                .and_then(fs::symlink_metadata)
                .map(|_| 0),
        )
    }

    fn read(&self, session: SessionRef, stream: StreamRef, buf: &mut [u8]) -> RawReturn<i32> {
        Self::respond(self.do_read(session, stream, buf))
    }

    fn pread(&self, session: SessionRef, stream: StreamRef, position: i64, buf: &mut [u8]) -> RawReturn<i32> {
        Self::respond(self.do_pread(session, stream, position, buf))
    }

    fn write(&self, session: SessionRef, stream: StreamRef, data: &[u8]) -> RawReturn<i32> {
        Self::respond(self.do_write(session, stream, data))
    }

    fn seek(&self, session: SessionRef, stream: StreamRef, position: i64) -> RawReturn<i32> {
        Self::respond(self.do_seek(session, stream, position).map(|()| 0))
    }

    fn tell(&self, session: SessionRef, stream: StreamRef) -> RawReturn<i64> {
        Self::respond(self.do_tell(session, stream))
    }

    fn flush(&self, session: SessionRef, stream: StreamRef) -> RawReturn<i32> {
        Self::respond(self.do_flush(session, stream).map(|()| 0))
    }

    fn available(&self, session: SessionRef, stream: StreamRef) -> RawReturn<i32> {
        Self::respond(self.do_available(session, stream))
    }

    fn copy(&self, session: SessionRef, src: &str, dst_session: SessionRef, dst: &str) -> RawReturn<i32> {
        Self::respond(self.do_copy(session, src, dst_session, dst).map(|()| 0))
    }

    fn move_path(&self, session: SessionRef, src: &str, dst_session: SessionRef, dst: &str) -> RawReturn<i32> {
        Self::respond(self.do_move(session, src, dst_session, dst).map(|()| 0))
    }

    fn delete(&self, session: SessionRef, path: &str) -> RawReturn<i32> {
        Self::respond(self.do_delete(session, path).map(|()| 0))
    }

    fn rename(&self, session: SessionRef, old_path: &str, new_path: &str) -> RawReturn<i32> {
        Self::respond(self.do_move(session, old_path, session, new_path).map(|()| 0))
    }

    fn working_directory(&self, session: SessionRef) -> RawReturn<Option<String>> {
        let cwd = self
            .sessions
            .get(&session)
            .map(|s| s.cwd.clone())
            .ok_or_else(|| bad_handle(format!("unknown {session}")));
        Self::respond(cwd.map(Some))
    }

    fn set_working_directory(&self, session: SessionRef, path: &str) -> RawReturn<i32> {
        Self::respond(self.do_set_working_directory(session, path).map(|()| 0))
    }

    fn create_directory(&self, session: SessionRef, path: &str) -> RawReturn<i32> {
        Self::respond(self.resolve(session, path).and_then(fs::create_dir_all).map(|()| 0))
    }

    fn set_replication(&self, session: SessionRef, path: &str, _replication: i16) -> RawReturn<i32> {
        Self::respond(self.resolve(session, path).and_then(fs::metadata).map(|_| 0))
    }

    fn list_directory(&self, session: SessionRef, path: &str) -> RawReturn<Option<RawEntryList>> {
        Self::respond(self.do_list(session, path).map(Some))
    }

    fn path_info(&self, session: SessionRef, path: &str) -> RawReturn<Option<RawEntryRecord>> {
        Self::respond(self.do_path_info(session, path).map(Some))
    }

    fn hosts(&self, session: SessionRef, path: &str, start: i64, length: i64) -> RawReturn<Option<RawHostTable>> {
        Self::respond(self.do_hosts(session, path, start, length).map(Some))
    }

    fn default_block_size(&self, session: SessionRef) -> RawReturn<i64> {
        Self::respond(self.logical(session, "/").map(|_| LOCAL_BLOCK_SIZE as i64))
    }

    fn capacity(&self, session: SessionRef) -> RawReturn<i64> {
        Self::respond(self.do_statistics(session).map(|(capacity, _)| capacity))
    }

    fn used(&self, session: SessionRef) -> RawReturn<i64> {
        Self::respond(self.do_statistics(session).map(|(_, used)| used))
    }

    fn chown(&self, session: SessionRef, path: &str, owner: Option<&str>, group: Option<&str>) -> RawReturn<i32> {
        Self::respond(self.do_chown(session, path, owner, group).map(|()| 0))
    }

    fn chmod(&self, session: SessionRef, path: &str, mode: i16) -> RawReturn<i32> {
        Self::respond(self.do_chmod(session, path, mode).map(|()| 0))
    }

    fn utime(&self, session: SessionRef, path: &str, mtime: i64, atime: i64) -> RawReturn<i32> {
        Self::respond(self.do_utime(session, path, mtime, atime).map(|()| 0))
    }
}

fn record(logical: &str, metadata: &fs::Metadata) -> RawEntryRecord {
    let kind = if metadata.is_dir() { EntryKind::Directory } else { EntryKind::File };
    let owner = User::from_uid(Uid::from_raw(metadata.uid()))
        .ok()
        .flatten()
        .map_or_else(|| metadata.uid().to_string(), |u| u.name);
    let group = Group::from_gid(Gid::from_raw(metadata.gid()))
        .ok()
        .flatten()
        .map_or_else(|| metadata.gid().to_string(), |g| g.name);
    let (size, replication, block_size) = if metadata.is_dir() {
        (0, 0, 0)
    } else {
        (metadata.len() as i64, 1, LOCAL_BLOCK_SIZE as i64)
    };

    RawEntryRecord {
        kind: kind.as_byte(),
        name: Some(logical.as_bytes().to_vec()),
        last_mod: metadata.mtime(),
        size,
        replication,
        block_size,
        owner: Some(owner.into_bytes()),
        group: Some(group.into_bytes()),
        permissions: (metadata.mode() & 0o7777) as i16,
        last_access: metadata.atime(),
    }
}

fn copy_tree(src: &Path, dst: &Path) -> io::Result<()> {
    if fs::metadata(src)?.is_dir() {
        fs::create_dir(dst)?;
        for entry in fs::read_dir(src)? {
            let entry = entry?;
            copy_tree(&entry.path(), &dst.join(entry.file_name()))?;
        }
        Ok(())
    } else {
        fs::copy(src, dst).map(|_| ())
    }
}

fn already_exists(path: &Path) -> io::Error {
    io::Error::new(io::ErrorKind::AlreadyExists, format!("{}: already exists", path.display()))
}

fn bad_handle(message: String) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidInput, message)
}
