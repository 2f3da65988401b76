//! A transport that corrupts selected results of a healthy one.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use oxdfs_core::codec::{RawEntryList, RawEntryRecord, RawHostTable};
use oxdfs_core::error::RawReturn;
use oxdfs_core::transport::{ConnectTarget, MemoryTransport, OpenFlags, OpenHints, SessionRef, StreamRef, Transport};

/// Delegates to a [`MemoryTransport`] and misreports whatever is switched on.
#[derive(Debug)]
pub struct FaultyTransport {
    inner: Arc<MemoryTransport>,
    /// Successful reads report one byte more than the buffer holds
    over_report_reads: AtomicBool,
    /// Successful writes report one byte more than was supplied
    over_report_writes: AtomicBool,
    /// Listings claim more entries than they carry
    inflate_entry_count: AtomicBool,
    /// Host tables lose their block list terminator
    drop_host_terminator: AtomicBool,
}

impl FaultyTransport {
    pub fn new(inner: Arc<MemoryTransport>) -> Self {
        Self {
            inner,
            over_report_reads: AtomicBool::new(false),
            over_report_writes: AtomicBool::new(false),
            inflate_entry_count: AtomicBool::new(false),
            drop_host_terminator: AtomicBool::new(false),
        }
    }

    pub fn inner(&self) -> &Arc<MemoryTransport> {
        &self.inner
    }

    pub fn over_report_reads(&self, on: bool) {
        self.over_report_reads.store(on, Ordering::SeqCst);
    }

    pub fn over_report_writes(&self, on: bool) {
        self.over_report_writes.store(on, Ordering::SeqCst);
    }

    pub fn inflate_entry_count(&self, on: bool) {
        self.inflate_entry_count.store(on, Ordering::SeqCst);
    }

    pub fn drop_host_terminator(&self, on: bool) {
        self.drop_host_terminator.store(on, Ordering::SeqCst);
    }

    fn overstate(flag: &AtomicBool, mut raw: RawReturn<i32>, len: usize) -> RawReturn<i32> {
        if flag.load(Ordering::SeqCst) && raw.value >= 0 {
            raw.value = i32::try_from(len).unwrap_or(i32::MAX - 1) + 1;
        }
        raw
    }
}

impl Transport for FaultyTransport {
    fn connect(&self, target: &ConnectTarget, user: Option<&str>) -> RawReturn<Option<SessionRef>> {
        self.inner.connect(target, user)
    }

    fn disconnect(&self, session: SessionRef) -> RawReturn<i32> {
        self.inner.disconnect(session)
    }

    fn open_stream(
        &self,
        session: SessionRef,
        path: &str,
        flags: OpenFlags,
        hints: OpenHints,
    ) -> RawReturn<Option<StreamRef>> {
        self.inner.open_stream(session, path, flags, hints)
    }

    fn close_stream(&self, session: SessionRef, stream: StreamRef) -> RawReturn<i32> {
        self.inner.close_stream(session, stream)
    }

    fn exists(&self, session: SessionRef, path: &str) -> RawReturn<i32> {
        self.inner.exists(session, path)
    }

    fn read(&self, session: SessionRef, stream: StreamRef, buf: &mut [u8]) -> RawReturn<i32> {
        let raw = self.inner.read(session, stream, buf);
        Self::overstate(&self.over_report_reads, raw, buf.len())
    }

    fn pread(&self, session: SessionRef, stream: StreamRef, position: i64, buf: &mut [u8]) -> RawReturn<i32> {
        let raw = self.inner.pread(session, stream, position, buf);
        Self::overstate(&self.over_report_reads, raw, buf.len())
    }

    fn write(&self, session: SessionRef, stream: StreamRef, data: &[u8]) -> RawReturn<i32> {
        let raw = self.inner.write(session, stream, data);
        Self::overstate(&self.over_report_writes, raw, data.len())
    }

    fn seek(&self, session: SessionRef, stream: StreamRef, position: i64) -> RawReturn<i32> {
        self.inner.seek(session, stream, position)
    }

    fn tell(&self, session: SessionRef, stream: StreamRef) -> RawReturn<i64> {
        self.inner.tell(session, stream)
    }

    fn flush(&self, session: SessionRef, stream: StreamRef) -> RawReturn<i32> {
        self.inner.flush(session, stream)
    }

    fn available(&self, session: SessionRef, stream: StreamRef) -> RawReturn<i32> {
        self.inner.available(session, stream)
    }

    fn copy(&self, session: SessionRef, src: &str, dst_session: SessionRef, dst: &str) -> RawReturn<i32> {
        self.inner.copy(session, src, dst_session, dst)
    }

    fn move_path(&self, session: SessionRef, src: &str, dst_session: SessionRef, dst: &str) -> RawReturn<i32> {
        self.inner.move_path(session, src, dst_session, dst)
    }

    fn delete(&self, session: SessionRef, path: &str) -> RawReturn<i32> {
        self.inner.delete(session, path)
    }

    fn rename(&self, session: SessionRef, old_path: &str, new_path: &str) -> RawReturn<i32> {
        self.inner.rename(session, old_path, new_path)
    }

    fn working_directory(&self, session: SessionRef) -> RawReturn<Option<String>> {
        self.inner.working_directory(session)
    }

    fn set_working_directory(&self, session: SessionRef, path: &str) -> RawReturn<i32> {
        self.inner.set_working_directory(session, path)
    }

    fn create_directory(&self, session: SessionRef, path: &str) -> RawReturn<i32> {
        self.inner.create_directory(session, path)
    }

    fn set_replication(&self, session: SessionRef, path: &str, replication: i16) -> RawReturn<i32> {
        self.inner.set_replication(session, path, replication)
    }

    fn list_directory(&self, session: SessionRef, path: &str) -> RawReturn<Option<RawEntryList>> {
        let mut raw = self.inner.list_directory(session, path);
        if self.inflate_entry_count.load(Ordering::SeqCst) {
            if let Some(list) = raw.value.as_mut() {
                list.count = list.records.len() as i32 + 3;
            }
        }
        raw
    }

    fn path_info(&self, session: SessionRef, path: &str) -> RawReturn<Option<RawEntryRecord>> {
        self.inner.path_info(session, path)
    }

    fn hosts(&self, session: SessionRef, path: &str, start: i64, length: i64) -> RawReturn<Option<RawHostTable>> {
        let mut raw = self.inner.hosts(session, path, start, length);
        if self.drop_host_terminator.load(Ordering::SeqCst) {
            if let Some(table) = raw.value.as_mut() {
                if table.rows.last().is_some_and(Option::is_none) {
                    table.rows.pop();
                }
            }
        }
        raw
    }

    fn default_block_size(&self, session: SessionRef) -> RawReturn<i64> {
        self.inner.default_block_size(session)
    }

    fn capacity(&self, session: SessionRef) -> RawReturn<i64> {
        self.inner.capacity(session)
    }

    fn used(&self, session: SessionRef) -> RawReturn<i64> {
        self.inner.used(session)
    }

    fn chown(&self, session: SessionRef, path: &str, owner: Option<&str>, group: Option<&str>) -> RawReturn<i32> {
        self.inner.chown(session, path, owner, group)
    }

    fn chmod(&self, session: SessionRef, path: &str, mode: i16) -> RawReturn<i32> {
        self.inner.chmod(session, path, mode)
    }

    fn utime(&self, session: SessionRef, path: &str, mtime: i64, atime: i64) -> RawReturn<i32> {
        self.inner.utime(session, path, mtime, atime)
    }
}
