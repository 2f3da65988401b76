//! Filesystem handles.
//!
//! A [`FilesystemHandle`] owns one transport session. Every file opened
//! through it shares the session's [`SessionCore`], so disconnecting the
//! filesystem invalidates its open files without touching their memory:
//! their next operation reports [`InvalidHandle`](crate::error::ErrorKind::InvalidHandle).

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::{SystemTime, UNIX_EPOCH};

use dashmap::DashMap;
use parking_lot::RwLock;
use tracing::{debug, info, instrument, trace, warn};

use crate::codec::{
    BlockHostMap, EntryInfo, EntryKind, decode_entries, decode_entry, decode_hosts, system_time_to_seconds,
};
use crate::error::{DfsError, OpContext, OperationKind, RawReturn, Result, normalize, normalize_status};
use crate::session::SessionRegistry;
use crate::session::registry::LiveSession;
use crate::transport::{ConnectTarget, OpenFlags, OpenHints, SessionRef, StreamRef, Transport};

use super::file::FileHandle;
use super::mode::OpenMode;

/// Passing this to [`FilesystemHandle::utime`] leaves that timestamp
/// unchanged.
///
/// Transports treat a timestamp of `0` as "no change", so an explicit
/// request for the epoch itself cannot be expressed. This is a property of
/// the transport contract and is kept as is.
pub const UTIME_UNCHANGED: SystemTime = UNIX_EPOCH;

/// Chunk size for copies between different transports.
pub const DEFAULT_COPY_BUFFER_SIZE: usize = 64 * 1024;

/// Upper bound for the streamed copy chunk size.
pub const MAX_COPY_BUFFER_SIZE: usize = 64 * 1024 * 1024;

/// State shared by a filesystem handle and the files opened through it.
#[derive(Debug)]
pub(crate) struct SessionCore {
    pub(super) transport: Arc<dyn Transport>,
    pub(super) session: SessionRef,
    target: ConnectTarget,
    user: Option<String>,
    connected: AtomicBool,
    /// Open streams and the path each was opened on
    open_streams: DashMap<StreamRef, String>,
    default_hints: RwLock<OpenHints>,
    copy_buffer_size: AtomicUsize,
    registry: Arc<SessionRegistry>,
    registry_id: OnceLock<u64>,
}

impl SessionCore {
    pub(super) fn context(&self, operation: &'static str) -> OpContext {
        OpContext::for_operation(operation).with_target(&self.target)
    }

    pub(super) fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    pub(super) fn ensure_connected(&self, operation: &'static str) -> Result<()> {
        if self.is_connected() {
            Ok(())
        } else {
            Err(DfsError::invalid_handle(self.context(operation)))
        }
    }

    pub(super) fn track_stream(&self, stream: StreamRef, path: &str) {
        self.open_streams.insert(stream, path.to_string());
    }

    pub(super) fn untrack_stream(&self, stream: StreamRef) {
        self.open_streams.remove(&stream);
    }

    pub(super) fn path_info(&self, path: &str) -> Result<EntryInfo> {
        self.ensure_connected("path info")?;
        let context = || self.context("path info").with_path(path);
        let raw = self.transport.path_info(self.session, path);
        let record = normalize(raw, OperationKind::PathInfo, context)?;
        decode_entry(&record).map_err(|e| e.in_context(&context()))
    }

    /// Move to the disconnected state, then release the session.
    ///
    /// The state changes before the transport is called, so the session is
    /// released at most once. Returns `Ok(false)` if it already was.
    fn release(&self) -> Result<bool> {
        if !self.connected.swap(false, Ordering::AcqRel) {
            return Ok(false);
        }

        if !self.open_streams.is_empty() {
            let paths: Vec<String> = self.open_streams.iter().map(|e| e.value().clone()).collect();
            warn!(
                filesystem = %self.target,
                open_streams = paths.len(),
                ?paths,
                "Disconnecting with streams still open"
            );
            self.open_streams.clear();
        }
        if let Some(id) = self.registry_id.get() {
            self.registry.deregister(*id);
        }

        let raw = self.transport.disconnect(self.session);
        normalize_status(raw, OperationKind::Disconnect, || self.context("disconnect"))?;
        info!(session = %self.session, filesystem = %self.target, "Disconnected");
        Ok(true)
    }
}

impl LiveSession for SessionCore {
    fn shutdown(&self) -> Result<bool> {
        self.release()
    }
}

/// A session to one filesystem.
///
/// Created by one of the connect functions, released by
/// [`disconnect`](Self::disconnect) or on drop. Once disconnected, every
/// operation fails with `InvalidHandle`, including a second disconnect.
///
/// # Example
///
/// ```
/// use std::sync::Arc;
/// use oxdfs_core::client::{FilesystemHandle, OpenMode};
/// use oxdfs_core::transport::MemoryTransport;
///
/// let fs = FilesystemHandle::connect(Arc::new(MemoryTransport::new()), "default", 0)?;
/// fs.create_directory("/tmp")?;
///
/// let file = fs.open("/tmp/greeting", OpenMode::WriteCreate)?;
/// file.write(b"hello")?;
/// file.close()?;
///
/// assert_eq!(fs.path_info("/tmp/greeting")?.size, 5);
/// fs.disconnect()?;
/// # Ok::<(), oxdfs_core::error::DfsError>(())
/// ```
#[derive(Debug)]
pub struct FilesystemHandle {
    core: Arc<SessionCore>,
}

impl FilesystemHandle {
    /// Connect as the ambient user, tracked by the global registry.
    ///
    /// `host = ""` selects the local filesystem, `host = "default"` with
    /// `port = 0` the transport's default filesystem.
    pub fn connect(transport: Arc<dyn Transport>, host: &str, port: u16) -> Result<Self> {
        Self::connect_with_registry(transport, host, port, "", SessionRegistry::global())
    }

    /// Connect as `user`, tracked by the global registry. An empty user
    /// means the ambient identity.
    pub fn connect_as_user(transport: Arc<dyn Transport>, host: &str, port: u16, user: &str) -> Result<Self> {
        Self::connect_with_registry(transport, host, port, user, SessionRegistry::global())
    }

    /// Connect and register the session with `registry`.
    #[instrument(level = "info", skip(transport, registry))]
    pub fn connect_with_registry(
        transport: Arc<dyn Transport>,
        host: &str,
        port: u16,
        user: &str,
        registry: Arc<SessionRegistry>,
    ) -> Result<Self> {
        let target = ConnectTarget::parse(host, port);
        let user = (!user.is_empty()).then(|| user.to_string());

        let raw = transport.connect(&target, user.as_deref());
        let session = normalize(raw, OperationKind::Connect, || {
            OpContext::for_operation("connect").with_target(&target)
        })?;

        let core = Arc::new(SessionCore {
            transport,
            session,
            target: target.clone(),
            user: user.clone(),
            connected: AtomicBool::new(true),
            open_streams: DashMap::new(),
            default_hints: RwLock::new(OpenHints::default()),
            copy_buffer_size: AtomicUsize::new(DEFAULT_COPY_BUFFER_SIZE),
            registry: Arc::clone(&registry),
            registry_id: OnceLock::new(),
        });
        let live: Arc<dyn LiveSession> = core.clone();
        let id = registry.register(target, user, session, Arc::downgrade(&live));
        core.registry_id.get_or_init(|| id);

        info!(%session, filesystem = %core.target, "Connected");
        Ok(Self { core })
    }

    /// Release the session.
    ///
    /// The handle is disconnected afterwards even if the transport reports
    /// a failure, which surfaces as a `ConnectionError`. A second call
    /// returns `InvalidHandle` and never reaches the transport.
    #[instrument(level = "info", skip(self), fields(filesystem = %self.core.target))]
    pub fn disconnect(&self) -> Result<()> {
        if self.core.release()? {
            Ok(())
        } else {
            Err(DfsError::invalid_handle(self.core.context("disconnect")))
        }
    }

    pub fn is_connected(&self) -> bool {
        self.core.is_connected()
    }

    /// The filesystem this handle was connected to.
    pub fn target(&self) -> &ConnectTarget {
        &self.core.target
    }

    /// The user this handle was connected as, `None` for the ambient identity.
    pub fn user(&self) -> Option<&str> {
        self.core.user.as_deref()
    }

    /// Number of files opened through this handle and not yet closed.
    pub fn open_file_count(&self) -> usize {
        self.core.open_streams.len()
    }

    /// Hints used by [`open`](Self::open) and by streamed copies.
    pub fn set_default_hints(&self, hints: OpenHints) {
        *self.core.default_hints.write() = hints;
    }

    pub fn default_hints(&self) -> OpenHints {
        *self.core.default_hints.read()
    }

    /// Chunk size for copies and moves between different transports,
    /// clamped to `1..=MAX_COPY_BUFFER_SIZE`.
    pub fn set_copy_buffer_size(&self, size: usize) {
        self.core
            .copy_buffer_size
            .store(size.clamp(1, MAX_COPY_BUFFER_SIZE), Ordering::Relaxed);
    }

    pub fn copy_buffer_size(&self) -> usize {
        self.core.copy_buffer_size.load(Ordering::Relaxed)
    }

    /// Whether `path` exists.
    ///
    /// The transport signals existence only by whether the check succeeds,
    /// so any failure reads as `false`.
    #[instrument(level = "debug", skip(self))]
    pub fn exists(&self, path: &str) -> Result<bool> {
        self.core.ensure_connected("exists")?;
        let raw = self.core.transport.exists(self.core.session, path);
        match normalize_status(raw, OperationKind::Exists, || self.core.context("exists").with_path(path)) {
            Ok(()) => Ok(true),
            Err(e) => {
                trace!(error = %e, "Existence check failed");
                Ok(false)
            }
        }
    }

    /// Open a file with `fcntl`-style flags.
    ///
    /// Unsupported flag combinations are rejected before the transport is
    /// called; see [`OpenMode::from_flags`].
    #[instrument(level = "debug", skip(self))]
    pub fn open_file(&self, path: &str, flags: OpenFlags, hints: OpenHints) -> Result<FileHandle> {
        let context = self.core.context("open").with_path(path);
        let mode = OpenMode::from_flags(flags).map_err(|e| e.in_context(&context))?;
        FileHandle::open(Arc::clone(&self.core), path, mode, hints)
    }

    /// Open a file with this handle's default hints.
    #[instrument(level = "debug", skip(self))]
    pub fn open(&self, path: &str, mode: OpenMode) -> Result<FileHandle> {
        FileHandle::open(Arc::clone(&self.core), path, mode, self.default_hints())
    }

    fn shares_transport(&self, other: &FilesystemHandle) -> bool {
        std::ptr::addr_eq(Arc::as_ptr(&self.core.transport), Arc::as_ptr(&other.core.transport))
    }

    /// Copy `src` on this filesystem to `dst_path` on `dst`.
    ///
    /// Handles on the same transport copy inside the transport. Otherwise
    /// each file is streamed through a reader here and a writer on `dst`,
    /// and directories are recreated on `dst` entry by entry.
    #[instrument(level = "debug", skip(self, dst), fields(dst_target = %dst.core.target))]
    pub fn copy(&self, src: &str, dst: &FilesystemHandle, dst_path: &str) -> Result<()> {
        self.core.ensure_connected("copy")?;
        dst.core.ensure_connected("copy")?;

        if self.shares_transport(dst) {
            let raw = self.core.transport.copy(self.core.session, src, dst.core.session, dst_path);
            normalize_status(raw, OperationKind::Namespace, || self.core.context("copy").with_path(src))
        } else {
            self.stream_copy(src, dst, dst_path).map(|_| ())
        }
    }

    /// Move `src` on this filesystem to `dst_path` on `dst`.
    ///
    /// Between different transports this is a streamed copy followed by a
    /// delete of the source. The source is only deleted once the whole copy,
    /// every file of a directory tree included, has been closed successfully.
    #[instrument(level = "debug", skip(self, dst), fields(dst_target = %dst.core.target))]
    pub fn move_to(&self, src: &str, dst: &FilesystemHandle, dst_path: &str) -> Result<()> {
        self.core.ensure_connected("move")?;
        dst.core.ensure_connected("move")?;

        if self.shares_transport(dst) {
            let raw = self
                .core
                .transport
                .move_path(self.core.session, src, dst.core.session, dst_path);
            normalize_status(raw, OperationKind::Namespace, || self.core.context("move").with_path(src))
        } else {
            self.stream_copy(src, dst, dst_path)?;
            self.delete(src)
        }
    }

    fn stream_copy(&self, src: &str, dst: &FilesystemHandle, dst_path: &str) -> Result<u64> {
        // A source that cannot be described is left to the open to report
        match self.path_info(src) {
            Ok(info) if info.kind == EntryKind::Directory => self.stream_tree(src, dst, dst_path),
            _ => self.stream_file(src, dst, dst_path),
        }
    }

    fn stream_tree(&self, src: &str, dst: &FilesystemHandle, dst_path: &str) -> Result<u64> {
        dst.create_directory(dst_path)?;
        let mut copied = 0;
        for entry in self.list_directory(src)? {
            let name = entry_file_name(&entry.name).ok_or_else(|| {
                DfsError::decode(
                    format!("listing entry {:?} has no file name", entry.name),
                    self.core.context("copy").with_path(src),
                )
            })?;
            let (child_src, child_dst) = (child_path(src, name), child_path(dst_path, name));
            copied += match entry.kind {
                EntryKind::Directory => self.stream_tree(&child_src, dst, &child_dst)?,
                EntryKind::File => self.stream_file(&child_src, dst, &child_dst)?,
            };
        }
        debug!(bytes = copied, src, dst = dst_path, "Streamed directory copy complete");
        Ok(copied)
    }

    fn stream_file(&self, src: &str, dst: &FilesystemHandle, dst_path: &str) -> Result<u64> {
        let reader = self.open(src, OpenMode::ReadOnly)?;
        let writer = match dst.open(dst_path, OpenMode::WriteCreate) {
            Ok(writer) => writer,
            Err(e) => {
                close_after_copy(reader);
                return Err(e);
            }
        };

        let mut buf = vec![0u8; self.copy_buffer_size()];
        let pumped = pump(&reader, &writer, &mut buf);
        let writer_closed = writer.close();
        close_after_copy(reader);

        let copied = pumped?;
        writer_closed?;
        debug!(bytes = copied, src, dst = dst_path, "Streamed copy complete");
        Ok(copied)
    }

    /// Delete a file or a directory tree.
    #[instrument(level = "debug", skip(self))]
    pub fn delete(&self, path: &str) -> Result<()> {
        self.core.ensure_connected("delete")?;
        let raw = self.core.transport.delete(self.core.session, path);
        normalize_status(raw, OperationKind::Namespace, || self.core.context("delete").with_path(path))
    }

    #[instrument(level = "debug", skip(self))]
    pub fn rename(&self, old_path: &str, new_path: &str) -> Result<()> {
        self.core.ensure_connected("rename")?;
        let raw = self.core.transport.rename(self.core.session, old_path, new_path);
        normalize_status(raw, OperationKind::Namespace, || {
            self.core.context("rename").with_path(old_path)
        })
    }

    #[instrument(level = "debug", skip(self))]
    pub fn working_directory(&self) -> Result<String> {
        self.core.ensure_connected("working directory")?;
        let raw = self.core.transport.working_directory(self.core.session);
        normalize(raw, OperationKind::Namespace, || self.core.context("working directory"))
    }

    /// Relative paths on this handle resolve against `path` from now on.
    /// Other handles are unaffected.
    #[instrument(level = "debug", skip(self))]
    pub fn set_working_directory(&self, path: &str) -> Result<()> {
        self.core.ensure_connected("set working directory")?;
        let raw = self.core.transport.set_working_directory(self.core.session, path);
        normalize_status(raw, OperationKind::Namespace, || {
            self.core.context("set working directory").with_path(path)
        })
    }

    /// Create `path` and any missing ancestors.
    #[instrument(level = "debug", skip(self))]
    pub fn create_directory(&self, path: &str) -> Result<()> {
        self.core.ensure_connected("create directory")?;
        let raw = self.core.transport.create_directory(self.core.session, path);
        normalize_status(raw, OperationKind::Namespace, || {
            self.core.context("create directory").with_path(path)
        })
    }

    #[instrument(level = "debug", skip(self))]
    pub fn set_replication(&self, path: &str, replication: u16) -> Result<()> {
        let context = || self.core.context("set replication").with_path(path);
        self.core.ensure_connected("set replication")?;
        let replication = i16::try_from(replication).map_err(|_| {
            DfsError::invalid_argument(format!("replication factor {replication} is too large"), context())
        })?;
        let raw = self.core.transport.set_replication(self.core.session, path, replication);
        normalize_status(raw, OperationKind::Attributes, context)
    }

    /// Entries of a directory, in the order the transport returns them.
    ///
    /// An empty directory yields an empty list. Listing a file yields that
    /// file's own entry.
    #[instrument(level = "debug", skip(self))]
    pub fn list_directory(&self, path: &str) -> Result<Vec<EntryInfo>> {
        let context = || self.core.context("list directory").with_path(path);
        self.core.ensure_connected("list directory")?;
        let raw = self.core.transport.list_directory(self.core.session, path);
        let list = normalize(raw, OperationKind::Listing, context)?;
        decode_entries(&list).map_err(|e| e.in_context(&context()))
    }

    /// Metadata for one path. A missing path is `NotFoundError`.
    #[instrument(level = "debug", skip(self))]
    pub fn path_info(&self, path: &str) -> Result<EntryInfo> {
        self.core.path_info(path)
    }

    /// Replica hosts for every block overlapping `[start, start + length)`.
    #[instrument(level = "debug", skip(self))]
    pub fn hosts(&self, path: &str, start: u64, length: u64) -> Result<BlockHostMap> {
        let context = || self.core.context("hosts").with_path(path);
        self.core.ensure_connected("hosts")?;
        let (Ok(start), Ok(length)) = (i64::try_from(start), i64::try_from(length)) else {
            return Err(DfsError::invalid_argument(
                format!("byte range {start}+{length} is out of range"),
                context(),
            ));
        };
        let raw = self.core.transport.hosts(self.core.session, path, start, length);
        let table = normalize(raw, OperationKind::Listing, context)?;
        decode_hosts(&table).map_err(|e| e.in_context(&context()))
    }

    fn statistic(
        &self,
        operation: &'static str,
        call: impl FnOnce(&dyn Transport, SessionRef) -> RawReturn<i64>,
    ) -> Result<u64> {
        self.core.ensure_connected(operation)?;
        let raw = call(self.core.transport.as_ref(), self.core.session);
        let value = normalize(raw, OperationKind::Statistics, || self.core.context(operation))?;
        Ok(value as u64)
    }

    #[instrument(level = "debug", skip(self))]
    pub fn default_block_size(&self) -> Result<u64> {
        self.statistic("default block size", |t, s| t.default_block_size(s))
    }

    /// Raw capacity of the filesystem in bytes.
    #[instrument(level = "debug", skip(self))]
    pub fn capacity(&self) -> Result<u64> {
        self.statistic("capacity", |t, s| t.capacity(s))
    }

    /// Raw bytes in use, replicas included.
    #[instrument(level = "debug", skip(self))]
    pub fn used(&self) -> Result<u64> {
        self.statistic("used", |t, s| t.used(s))
    }

    /// Change owner and/or group. An empty name leaves that field
    /// unchanged; both empty is an invalid argument.
    #[instrument(level = "debug", skip(self))]
    pub fn chown(&self, path: &str, owner: &str, group: &str) -> Result<()> {
        let context = || self.core.context("chown").with_path(path);
        self.core.ensure_connected("chown")?;
        if owner.is_empty() && group.is_empty() {
            return Err(DfsError::invalid_argument("owner and group are both empty", context()));
        }
        let owner = (!owner.is_empty()).then_some(owner);
        let group = (!group.is_empty()).then_some(group);
        let raw = self.core.transport.chown(self.core.session, path, owner, group);
        normalize_status(raw, OperationKind::Attributes, context)
    }

    /// Set permission bits. Only the low twelve bits are meaningful.
    #[instrument(level = "debug", skip(self))]
    pub fn chmod(&self, path: &str, mode: u16) -> Result<()> {
        let context = || self.core.context("chmod").with_path(path);
        self.core.ensure_connected("chmod")?;
        if mode > 0o7777 {
            return Err(DfsError::invalid_argument(format!("mode {mode:o} has bits above 0o7777"), context()));
        }
        let raw = self.core.transport.chmod(self.core.session, path, mode as i16);
        normalize_status(raw, OperationKind::Attributes, context)
    }

    /// Set modification and access times, at second granularity.
    ///
    /// [`UTIME_UNCHANGED`] (the epoch) leaves the corresponding time as it
    /// is, so the epoch itself cannot be set.
    #[instrument(level = "debug", skip(self))]
    pub fn utime(&self, path: &str, mtime: SystemTime, atime: SystemTime) -> Result<()> {
        self.core.ensure_connected("utime")?;
        let raw = self.core.transport.utime(
            self.core.session,
            path,
            system_time_to_seconds(mtime),
            system_time_to_seconds(atime),
        );
        normalize_status(raw, OperationKind::Attributes, || self.core.context("utime").with_path(path))
    }
}

impl Drop for FilesystemHandle {
    fn drop(&mut self) {
        if let Err(e) = self.core.release() {
            warn!(error = %e, "Failed to disconnect on drop");
        }
    }
}

fn pump(reader: &FileHandle, writer: &FileHandle, buf: &mut [u8]) -> Result<u64> {
    let mut total = 0u64;
    loop {
        let n = reader.read(buf)?;
        if n == 0 {
            return Ok(total);
        }
        writer.write_all(&buf[..n])?;
        total += n as u64;
    }
}

/// Last path component of a listing name, which may be a full path or URI.
fn entry_file_name(name: &str) -> Option<&str> {
    name.trim_end_matches('/').rsplit('/').next().filter(|n| !n.is_empty())
}

fn child_path(dir: &str, name: &str) -> String {
    format!("{}/{name}", dir.trim_end_matches('/'))
}

fn close_after_copy(file: FileHandle) {
    if let Err(e) = file.close() {
        warn!(path = file.path(), error = %e, "Failed to close copy source");
    }
}
