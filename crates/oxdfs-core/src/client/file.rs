//! File handles.
//!
//! # Concurrency
//!
//! Each [`FileHandle`] carries its own reader/writer lock around its stream
//! reference. Operations that are independent of the stream cursor take it
//! shared and may run in parallel:
//!
//! - [`pread`](FileHandle::pread)
//! - [`available`](FileHandle::available)
//! - [`tell`](FileHandle::tell)
//!
//! Operations that move or depend on the cursor, and `close`, take it
//! exclusively: [`read`](FileHandle::read), [`write`](FileHandle::write),
//! [`seek`](FileHandle::seek), [`flush`](FileHandle::flush) and
//! [`close`](FileHandle::close). Concurrent writes on one handle are
//! therefore serialized whole; no two writes interleave.
//!
//! Different handles never contend with each other, even on the same path.

use std::io;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, trace, warn};

use crate::error::{DfsError, OpContext, OperationKind, Result, normalize, normalize_status};
use crate::transport::{OpenHints, StreamRef};

use super::filesystem::SessionCore;
use super::mode::OpenMode;

/// Largest single transfer the transport contract can express.
const MAX_TRANSFER: usize = i32::MAX as usize;

/// Hints must fit the signed fields file metadata reports them in.
fn check_hints(hints: &OpenHints) -> std::result::Result<(), String> {
    if i16::try_from(hints.replication).is_err() {
        return Err(format!("replication factor {} is too large", hints.replication));
    }
    if i64::try_from(hints.block_size).is_err() {
        return Err(format!("block size {} is too large", hints.block_size));
    }
    if i32::try_from(hints.buffer_size).is_err() {
        return Err(format!("buffer size {} is too large", hints.buffer_size));
    }
    Ok(())
}

/// An open stream on a filesystem.
///
/// Open until [`close`](Self::close) or drop; closed exactly once even when
/// `close` races with other calls. Any operation after close, or after the
/// owning filesystem disconnected, returns `InvalidHandle`.
///
/// `&FileHandle` implements [`std::io::Read`], [`std::io::Write`] and
/// [`std::io::Seek`], so a shared handle plugs into `std::io` helpers.
#[derive(Debug)]
pub struct FileHandle {
    core: Arc<SessionCore>,
    path: String,
    mode: OpenMode,
    /// `None` once closed
    stream: RwLock<Option<StreamRef>>,
}

impl FileHandle {
    pub(super) fn open(core: Arc<SessionCore>, path: &str, mode: OpenMode, hints: OpenHints) -> Result<Self> {
        core.ensure_connected("open")?;
        check_hints(&hints)
            .map_err(|reason| DfsError::invalid_argument(reason, core.context("open").with_path(path)))?;
        let raw = core.transport.open_stream(core.session, path, mode.flags(), hints);
        let stream = normalize(raw, OperationKind::Open, || core.context("open").with_path(path))?;
        core.track_stream(stream, path);
        debug!(%stream, path, %mode, "Opened file");

        Ok(Self {
            core,
            path: path.to_string(),
            mode,
            stream: RwLock::new(Some(stream)),
        })
    }

    /// The path this handle was opened with.
    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn mode(&self) -> OpenMode {
        self.mode
    }

    /// Whether the handle is open and its filesystem still connected.
    pub fn is_open(&self) -> bool {
        self.stream.read().is_some() && self.core.is_connected()
    }

    fn context(&self, operation: &'static str) -> OpContext {
        self.core.context(operation).with_path(self.path.as_str())
    }

    /// The stream reference, if the handle is usable.
    fn live(&self, stream: Option<StreamRef>, operation: &'static str) -> Result<StreamRef> {
        match stream {
            Some(stream) if self.core.is_connected() => Ok(stream),
            _ => Err(DfsError::invalid_handle(self.context(operation))),
        }
    }

    fn check_transfer(&self, len: usize, operation: &'static str) -> Result<()> {
        if len > MAX_TRANSFER {
            return Err(DfsError::invalid_argument(
                format!("transfer of {len} bytes exceeds the {MAX_TRANSFER} byte limit"),
                self.context(operation),
            ));
        }
        Ok(())
    }

    /// Reject a transfer count larger than the buffer it refers to.
    fn check_count(&self, n: i32, len: usize, operation: &'static str, stream: StreamRef) -> Result<usize> {
        let n = n as usize;
        if n > len {
            return Err(DfsError::decode(
                format!("transport reported {n} bytes for a {len} byte buffer"),
                self.context(operation).with_stream(stream),
            ));
        }
        Ok(n)
    }

    /// Read at the stream cursor, advancing it.
    ///
    /// Returns the number of bytes read. Fewer than `buf.len()` is normal
    /// and says nothing about how much data remains; `0` means end of file.
    pub fn read(&self, buf: &mut [u8]) -> Result<usize> {
        let guard = self.stream.write();
        let stream = self.live(*guard, "read")?;
        self.check_transfer(buf.len(), "read")?;

        let raw = self.core.transport.read(self.core.session, stream, buf);
        let n = normalize(raw, OperationKind::Read, || self.context("read").with_stream(stream))?;
        let n = self.check_count(n, buf.len(), "read", stream)?;
        trace!(%stream, requested = buf.len(), read = n, "read");
        Ok(n)
    }

    /// Read at `position` without moving the cursor.
    ///
    /// Takes the handle's lock shared, so positional reads run concurrently
    /// with each other.
    pub fn pread(&self, position: u64, buf: &mut [u8]) -> Result<usize> {
        let guard = self.stream.read();
        let stream = self.live(*guard, "pread")?;
        self.check_transfer(buf.len(), "pread")?;
        let Ok(offset) = i64::try_from(position) else {
            return Err(DfsError::invalid_argument(
                format!("position {position} is out of range"),
                self.context("pread"),
            ));
        };

        let raw = self.core.transport.pread(self.core.session, stream, offset, buf);
        let n = normalize(raw, OperationKind::Read, || self.context("pread").with_stream(stream))?;
        let n = self.check_count(n, buf.len(), "pread", stream)?;
        trace!(%stream, position, requested = buf.len(), read = n, "pread");
        Ok(n)
    }

    /// Write `data`, returning how many bytes the transport accepted.
    ///
    /// Append-mode handles always append, wherever the cursor is.
    pub fn write(&self, data: &[u8]) -> Result<usize> {
        let guard = self.stream.write();
        let stream = self.live(*guard, "write")?;
        self.check_transfer(data.len(), "write")?;

        let raw = self.core.transport.write(self.core.session, stream, data);
        let n = normalize(raw, OperationKind::Write, || self.context("write").with_stream(stream))?;
        let n = self.check_count(n, data.len(), "write", stream)?;
        trace!(%stream, requested = data.len(), written = n, "write");
        Ok(n)
    }

    /// Write all of `data`, retrying short writes.
    pub fn write_all(&self, mut data: &[u8]) -> Result<()> {
        while !data.is_empty() {
            let n = self.write(data)?;
            if n == 0 {
                return Err(DfsError::Io {
                    source: io::Error::from(io::ErrorKind::WriteZero),
                    context: self.context("write"),
                });
            }
            data = &data[n..];
        }
        Ok(())
    }

    /// Move the cursor to `position`.
    ///
    /// Whether this works on write-mode handles is up to the transport.
    pub fn seek(&self, position: u64) -> Result<()> {
        let guard = self.stream.write();
        let stream = self.live(*guard, "seek")?;
        let Ok(offset) = i64::try_from(position) else {
            return Err(DfsError::invalid_argument(
                format!("position {position} is out of range"),
                self.context("seek"),
            ));
        };

        let raw = self.core.transport.seek(self.core.session, stream, offset);
        normalize_status(raw, OperationKind::Seek, || self.context("seek").with_stream(stream))
    }

    /// Current cursor position.
    pub fn tell(&self) -> Result<u64> {
        let guard = self.stream.read();
        let stream = self.live(*guard, "tell")?;
        let raw = self.core.transport.tell(self.core.session, stream);
        let position = normalize(raw, OperationKind::Tell, || self.context("tell").with_stream(stream))?;
        Ok(position as u64)
    }

    /// Push buffered writes to the transport.
    pub fn flush(&self) -> Result<()> {
        let guard = self.stream.write();
        let stream = self.live(*guard, "flush")?;
        let raw = self.core.transport.flush(self.core.session, stream);
        normalize_status(raw, OperationKind::Flush, || self.context("flush").with_stream(stream))
    }

    /// Bytes readable without blocking. Advisory.
    pub fn available(&self) -> Result<usize> {
        let guard = self.stream.read();
        let stream = self.live(*guard, "available")?;
        let raw = self.core.transport.available(self.core.session, stream);
        let n = normalize(raw, OperationKind::Available, || {
            self.context("available").with_stream(stream)
        })?;
        Ok(n as usize)
    }

    /// Close the stream.
    ///
    /// The handle is closed afterwards whatever the transport reports.
    /// Closing twice, or after the filesystem disconnected, returns
    /// `InvalidHandle` without calling the transport.
    pub fn close(&self) -> Result<()> {
        let mut guard = self.stream.write();
        let Some(stream) = guard.take() else {
            return Err(DfsError::invalid_handle(self.context("close")));
        };
        self.core.untrack_stream(stream);
        if !self.core.is_connected() {
            return Err(DfsError::invalid_handle(self.context("close").with_stream(stream)));
        }

        let raw = self.core.transport.close_stream(self.core.session, stream);
        normalize_status(raw, OperationKind::Close, || self.context("close").with_stream(stream))?;
        debug!(%stream, path = %self.path, "Closed file");
        Ok(())
    }
}

impl Drop for FileHandle {
    fn drop(&mut self) {
        let Some(stream) = self.stream.get_mut().take() else {
            return;
        };
        self.core.untrack_stream(stream);
        if !self.core.is_connected() {
            return;
        }
        let raw = self.core.transport.close_stream(self.core.session, stream);
        if let Err(e) = normalize_status(raw, OperationKind::Close, || self.context("close").with_stream(stream)) {
            warn!(path = %self.path, error = %e, "Failed to close file on drop");
        }
    }
}

impl io::Read for &FileHandle {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let len = buf.len().min(MAX_TRANSFER);
        Ok(FileHandle::read(self, &mut buf[..len])?)
    }
}

impl io::Write for &FileHandle {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let len = buf.len().min(MAX_TRANSFER);
        Ok(FileHandle::write(self, &buf[..len])?)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(FileHandle::flush(self)?)
    }
}

impl io::Seek for &FileHandle {
    /// `SeekFrom::End` is resolved against the file's current size as
    /// reported by the filesystem.
    fn seek(&mut self, pos: io::SeekFrom) -> io::Result<u64> {
        let (base, offset) = match pos {
            io::SeekFrom::Start(position) => {
                FileHandle::seek(self, position)?;
                return Ok(position);
            }
            io::SeekFrom::Current(offset) => (self.tell()?, offset),
            io::SeekFrom::End(offset) => (self.core.path_info(&self.path)?.size, offset),
        };
        let target = base.checked_add_signed(offset).ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("seek to {base} {offset:+} is out of range"),
            )
        })?;
        FileHandle::seek(self, target)?;
        Ok(target)
    }
}
