//! In-process simulated cluster.
//!
//! `MemoryTransport` behaves like a small distributed filesystem: a single
//! namespace shared by every session, files split into fixed-size blocks,
//! and each block replicated onto a configurable set of datanodes. It follows
//! the same native conventions a real client library does:
//!
//! - writes are buffered per stream and become visible on flush or close
//! - a file has at most one writer at a time (a lease)
//! - sequential reads stop at block boundaries, so short reads are routine
//! - `O_WRONLY` alone means create-or-truncate
//!
//! A few knobs exist purely for exercising the client layer: replicas can be
//! dropped to produce ragged block maps, successful results can carry stale
//! statuses, disconnects can be made to fail, and every transport call is
//! counted.

use std::collections::{BTreeMap, HashSet};
use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::time::SystemTime;

use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, trace};

use crate::codec::{EntryKind, RawEntryList, RawEntryRecord, RawHostTable, system_time_to_seconds};
use crate::error::{RawReturn, Sentinel};

use super::{ConnectTarget, OpenFlags, OpenHints, SessionRef, StreamRef, Transport, resolve_path};

/// Default block size of a simulated cluster (128 MiB).
pub const DEFAULT_BLOCK_SIZE: u64 = 128 * 1024 * 1024;
/// Default replication factor of a simulated cluster.
pub const DEFAULT_REPLICATION: u16 = 3;
/// Default raw capacity of a simulated cluster (1 TiB).
pub const DEFAULT_CAPACITY: i64 = 1 << 40;
/// Identity used when a session connects without naming a user.
pub const AMBIENT_USER: &str = "hdfs";
/// Group assigned to new entries.
pub const DEFAULT_GROUP: &str = "supergroup";

const DIRECTORY_MODE: u16 = 0o755;
const FILE_MODE: u16 = 0o644;

#[derive(Debug, Clone)]
struct FileData {
    content: Vec<u8>,
    /// Replica hosts per block
    blocks: Vec<Vec<String>>,
}

#[derive(Debug, Clone)]
enum NodeKind {
    Directory,
    File(FileData),
}

#[derive(Debug, Clone)]
struct Node {
    kind: NodeKind,
    owner: String,
    group: String,
    permissions: u16,
    mtime: i64,
    atime: i64,
    replication: u16,
    block_size: u64,
}

impl Node {
    fn directory(owner: &str, now: i64) -> Self {
        Self {
            kind: NodeKind::Directory,
            owner: owner.to_string(),
            group: DEFAULT_GROUP.to_string(),
            permissions: DIRECTORY_MODE,
            mtime: now,
            atime: now,
            replication: 0,
            block_size: 0,
        }
    }

    fn file(owner: &str, now: i64, replication: u16, block_size: u64) -> Self {
        Self {
            kind: NodeKind::File(FileData {
                content: Vec::new(),
                blocks: Vec::new(),
            }),
            owner: owner.to_string(),
            group: DEFAULT_GROUP.to_string(),
            permissions: FILE_MODE,
            mtime: now,
            atime: now,
            replication,
            block_size,
        }
    }

    fn len(&self) -> u64 {
        match &self.kind {
            NodeKind::File(data) => data.content.len() as u64,
            NodeKind::Directory => 0,
        }
    }

    fn record(&self, path: &str) -> RawEntryRecord {
        let kind = match self.kind {
            NodeKind::Directory => EntryKind::Directory,
            NodeKind::File(_) => EntryKind::File,
        };
        RawEntryRecord {
            kind: kind.as_byte(),
            name: Some(path.as_bytes().to_vec()),
            last_mod: self.mtime,
            size: self.len() as i64,
            replication: self.replication as i16,
            block_size: self.block_size as i64,
            owner: Some(self.owner.as_bytes().to_vec()),
            group: Some(self.group.as_bytes().to_vec()),
            permissions: self.permissions as i16,
            last_access: self.atime,
        }
    }
}

#[derive(Debug)]
struct Namespace {
    nodes: BTreeMap<String, Node>,
    /// Paths with an open writer
    leases: HashSet<String>,
}

impl Namespace {
    fn new(now: i64) -> Self {
        let mut nodes = BTreeMap::new();
        nodes.insert("/".to_string(), Node::directory(AMBIENT_USER, now));
        Self {
            nodes,
            leases: HashSet::new(),
        }
    }

    fn get(&self, path: &str) -> io::Result<&Node> {
        self.nodes.get(path).ok_or_else(|| not_found(path))
    }

    fn get_mut(&mut self, path: &str) -> io::Result<&mut Node> {
        self.nodes.get_mut(path).ok_or_else(|| not_found(path))
    }

    fn require_parent_directory(&self, path: &str) -> io::Result<()> {
        let parent = parent_of(path).ok_or_else(|| invalid_input(format!("{path}: has no parent")))?;
        match self.nodes.get(parent).map(|n| &n.kind) {
            Some(NodeKind::Directory) => Ok(()),
            Some(NodeKind::File(_)) => Err(not_a_directory(parent)),
            None => Err(not_found(parent)),
        }
    }

    /// Paths of `path` and everything below it, in sorted order.
    fn subtree(&self, path: &str) -> Vec<String> {
        let prefix = child_prefix(path);
        let mut paths = vec![path.to_string()];
        paths.extend(
            self.nodes
                .range(prefix.clone()..)
                .take_while(|(p, _)| p.starts_with(&prefix))
                .map(|(p, _)| p.clone()),
        );
        paths
    }

    /// Direct children of a directory, in namespace order.
    fn children(&self, path: &str) -> Vec<(&String, &Node)> {
        let prefix = child_prefix(path);
        self.nodes
            .range(prefix.clone()..)
            .take_while(|(p, _)| p.starts_with(&prefix))
            .filter(|(p, _)| !p[prefix.len()..].contains('/'))
            .collect()
    }

    fn is_leased_below(&self, path: &str) -> bool {
        let prefix = child_prefix(path);
        self.leases
            .iter()
            .any(|leased| leased == path || leased.starts_with(&prefix))
    }
}

#[derive(Debug)]
struct SessionState {
    user: String,
    cwd: String,
}

#[derive(Debug)]
enum StreamMode {
    Read { cursor: u64 },
    Write { position: u64, pending: Vec<u8> },
}

#[derive(Debug)]
struct StreamState {
    session: SessionRef,
    path: String,
    mode: StreamMode,
}

/// Builder for [`MemoryTransport`].
#[derive(Debug, Clone)]
pub struct MemoryTransportBuilder {
    datanodes: Vec<String>,
    namenodes: Vec<(String, u16)>,
    block_size: u64,
    replication: u16,
    capacity: i64,
}

impl Default for MemoryTransportBuilder {
    fn default() -> Self {
        Self {
            datanodes: vec!["dn1".to_string(), "dn2".to_string(), "dn3".to_string()],
            namenodes: Vec::new(),
            block_size: DEFAULT_BLOCK_SIZE,
            replication: DEFAULT_REPLICATION,
            capacity: DEFAULT_CAPACITY,
        }
    }
}

impl MemoryTransportBuilder {
    /// Datanode hostnames replicas are placed on.
    pub fn datanodes<I, S>(mut self, hosts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.datanodes = hosts.into_iter().map(Into::into).collect();
        self
    }

    /// Accept remote connections to `host:port` in addition to the local
    /// and default filesystems.
    pub fn namenode(mut self, host: impl Into<String>, port: u16) -> Self {
        self.namenodes.push((host.into(), port));
        self
    }

    pub fn block_size(mut self, block_size: u64) -> Self {
        self.block_size = block_size.max(1);
        self
    }

    pub fn replication(mut self, replication: u16) -> Self {
        self.replication = replication.max(1);
        self
    }

    pub fn capacity(mut self, capacity: i64) -> Self {
        self.capacity = capacity;
        self
    }

    pub fn build(self) -> MemoryTransport {
        MemoryTransport {
            namespace: RwLock::new(Namespace::new(now_secs())),
            sessions: DashMap::new(),
            streams: DashMap::new(),
            next_session: AtomicU64::new(1),
            next_stream: AtomicU64::new(1),
            datanodes: self.datanodes,
            namenodes: self.namenodes,
            block_size: self.block_size,
            replication: self.replication,
            capacity: AtomicI64::new(self.capacity),
            spurious_status: AtomicBool::new(false),
            fail_disconnect: AtomicBool::new(false),
            calls: AtomicU64::new(0),
        }
    }
}

/// A simulated cluster shared by every session connected through it.
#[derive(Debug)]
pub struct MemoryTransport {
    namespace: RwLock<Namespace>,
    sessions: DashMap<SessionRef, SessionState>,
    streams: DashMap<StreamRef, Arc<Mutex<StreamState>>>,
    next_session: AtomicU64,
    next_stream: AtomicU64,
    datanodes: Vec<String>,
    namenodes: Vec<(String, u16)>,
    block_size: u64,
    replication: u16,
    capacity: AtomicI64,
    spurious_status: AtomicBool,
    fail_disconnect: AtomicBool,
    calls: AtomicU64,
}

impl Default for MemoryTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryTransport {
    /// A three-datanode cluster with default block size and replication.
    pub fn new() -> Self {
        Self::builder().build()
    }

    pub fn builder() -> MemoryTransportBuilder {
        MemoryTransportBuilder::default()
    }

    /// Total number of transport calls made so far.
    pub fn call_count(&self) -> u64 {
        self.calls.load(Ordering::Relaxed)
    }

    /// Number of sessions currently connected.
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Number of streams currently open.
    pub fn open_stream_count(&self) -> usize {
        self.streams.len()
    }

    /// Attach a stale status to every successful result.
    pub fn set_spurious_status(&self, enabled: bool) {
        self.spurious_status.store(enabled, Ordering::Relaxed);
    }

    /// Make disconnects release the session but report failure.
    pub fn set_disconnect_failure(&self, enabled: bool) {
        self.fail_disconnect.store(enabled, Ordering::Relaxed);
    }

    pub fn set_capacity(&self, capacity: i64) {
        self.capacity.store(capacity, Ordering::Relaxed);
    }

    /// Remove `host` from the replica list of block `block` of the file at
    /// absolute `path`. Returns `true` if a replica was removed.
    pub fn drop_replica(&self, path: &str, block: usize, host: &str) -> bool {
        let mut ns = self.namespace.write();
        let Some(Node {
            kind: NodeKind::File(data),
            ..
        }) = ns.nodes.get_mut(path)
        else {
            return false;
        };
        let Some(replicas) = data.blocks.get_mut(block) else {
            return false;
        };
        let before = replicas.len();
        replicas.retain(|h| h != host);
        before != replicas.len()
    }

    fn enter(&self, op: &'static str) {
        self.calls.fetch_add(1, Ordering::Relaxed);
        trace!(op, "memory transport call");
    }

    fn respond<T: Sentinel>(&self, result: io::Result<T>) -> RawReturn<T> {
        match result {
            Ok(value) if self.spurious_status.load(Ordering::Relaxed) => {
                RawReturn::with_status(value, io::Error::other("stale status from an earlier call"))
            }
            Ok(value) => RawReturn::ok(value),
            Err(e) => RawReturn::failed(e),
        }
    }

    fn session(&self, session: SessionRef) -> io::Result<(String, String)> {
        self.sessions
            .get(&session)
            .map(|s| (s.user.clone(), s.cwd.clone()))
            .ok_or_else(|| bad_handle(format!("unknown {session}")))
    }

    fn resolve(&self, session: SessionRef, path: &str) -> io::Result<String> {
        let (_, cwd) = self.session(session)?;
        resolve_path(&cwd, path)
    }

    fn stream(&self, session: SessionRef, stream: StreamRef) -> io::Result<Arc<Mutex<StreamState>>> {
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

    fn place_replicas(&self, block_index: usize, replication: u16) -> Vec<String> {
        let n = self.datanodes.len();
        let count = usize::from(replication).min(n);
        (0..count)
            .map(|k| self.datanodes[(block_index + k) % n].clone())
            .collect()
    }

    /// Bring a file's block list in line with its length and replication.
    fn rebalance(&self, node: &mut Node) {
        let replication = node.replication;
        let block_size = node.block_size.max(1);
        if let NodeKind::File(data) = &mut node.kind {
            let needed = (data.content.len() as u64).div_ceil(block_size) as usize;
            data.blocks.truncate(needed);
            while data.blocks.len() < needed {
                let index = data.blocks.len();
                data.blocks.push(self.place_replicas(index, replication));
            }
        }
    }

    fn do_connect(&self, target: &ConnectTarget, user: Option<&str>) -> io::Result<SessionRef> {
        if let ConnectTarget::Remote { host, port } = target
            && !self.namenodes.iter().any(|(h, p)| h == host && p == port)
        {
            return Err(io::Error::new(
                io::ErrorKind::ConnectionRefused,
                format!("no namenode listening at {host}:{port}"),
            ));
        }

        let session = SessionRef(self.next_session.fetch_add(1, Ordering::Relaxed));
        let user = user.unwrap_or(AMBIENT_USER).to_string();
        debug!(%session, filesystem = %target, user = %user, "memory session opened");
        self.sessions.insert(
            session,
            SessionState {
                user,
                cwd: "/".to_string(),
            },
        );
        Ok(session)
    }

    fn do_disconnect(&self, session: SessionRef) -> io::Result<()> {
        self.sessions
            .remove(&session)
            .ok_or_else(|| bad_handle(format!("unknown {session}")))?;

        // Streams die with their session; their leases go with them
        let orphaned: Vec<StreamRef> = self
            .streams
            .iter()
            .filter(|entry| entry.value().lock().session == session)
            .map(|entry| *entry.key())
            .collect();
        for stream in orphaned {
            if let Some((_, state)) = self.streams.remove(&stream) {
                let state = state.lock();
                if matches!(state.mode, StreamMode::Write { .. }) {
                    self.namespace.write().leases.remove(&state.path);
                }
            }
        }

        if self.fail_disconnect.load(Ordering::Relaxed) {
            return Err(io::Error::other("session released with errors"));
        }
        Ok(())
    }

    fn do_open(&self, session: SessionRef, path: &str, flags: OpenFlags, hints: OpenHints) -> io::Result<StreamRef> {
        let (user, cwd) = self.session(session)?;
        let path = resolve_path(&cwd, path)?;

        if flags.contains(OpenFlags::RDWR) || flags.contains(OpenFlags::CREATE | OpenFlags::EXCL) {
            return Err(io::Error::new(io::ErrorKind::Unsupported, "unsupported open flags"));
        }

        let mut ns = self.namespace.write();
        let mode = if flags.contains(OpenFlags::WRONLY) {
            if ns.leases.contains(&path) {
                return Err(io::Error::new(
                    io::ErrorKind::ResourceBusy,
                    format!("{path}: lease is held by another writer"),
                ));
            }
            let append = flags.contains(OpenFlags::APPEND);
            let existing = ns
                .nodes
                .get(&path)
                .map(|node| (matches!(node.kind, NodeKind::Directory), node.len()));
            let position = match existing {
                Some((true, _)) => return Err(is_a_directory(&path)),
                Some((false, len)) if append => len,
                None if append => return Err(not_found(&path)),
                Some(_) => {
                    // Truncate
                    let node = ns.get_mut(&path)?;
                    if let NodeKind::File(data) = &mut node.kind {
                        data.content.clear();
                        data.blocks.clear();
                    }
                    node.mtime = now_secs();
                    0
                }
                None => {
                    let replication = if hints.replication == 0 { self.replication } else { hints.replication };
                    let block_size = if hints.block_size == 0 { self.block_size } else { hints.block_size };
                    if i16::try_from(replication).is_err() || i64::try_from(block_size).is_err() {
                        return Err(io::Error::new(io::ErrorKind::InvalidInput, "open hints out of range"));
                    }
                    ns.require_parent_directory(&path)?;
                    ns.nodes
                        .insert(path.clone(), Node::file(&user, now_secs(), replication, block_size));
                    0
                }
            };
            ns.leases.insert(path.clone());
            StreamMode::Write {
                position,
                pending: Vec::new(),
            }
        } else {
            match ns.get(&path)?.kind {
                NodeKind::Directory => return Err(is_a_directory(&path)),
                NodeKind::File(_) => StreamMode::Read { cursor: 0 },
            }
        };
        drop(ns);

        let stream = StreamRef(self.next_stream.fetch_add(1, Ordering::Relaxed));
        debug!(%stream, path = %path, "memory stream opened");
        self.streams.insert(
            stream,
            Arc::new(Mutex::new(StreamState {
                session,
                path,
                mode,
            })),
        );
        Ok(stream)
    }

    /// Move a write stream's pending bytes into the file.
    fn commit(&self, state: &mut StreamState) -> io::Result<()> {
        let StreamMode::Write { pending, .. } = &mut state.mode else {
            return Ok(());
        };
        if pending.is_empty() {
            return Ok(());
        }
        let mut ns = self.namespace.write();
        let node = ns.get_mut(&state.path)?;
        let NodeKind::File(data) = &mut node.kind else {
            return Err(is_a_directory(&state.path));
        };
        data.content.append(pending);
        node.mtime = now_secs();
        self.rebalance(node);
        Ok(())
    }

    fn do_close(&self, session: SessionRef, stream: StreamRef) -> io::Result<()> {
        let state = self.stream(session, stream)?;
        self.streams.remove(&stream);
        let mut state = state.lock();
        let committed = self.commit(&mut state);
        if matches!(state.mode, StreamMode::Write { .. }) {
            self.namespace.write().leases.remove(&state.path);
        }
        debug!(%stream, path = %state.path, "memory stream closed");
        committed
    }

    fn do_read(&self, session: SessionRef, stream: StreamRef, buf: &mut [u8]) -> io::Result<i32> {
        let state = self.stream(session, stream)?;
        let mut state = state.lock();
        let path = state.path.clone();
        let StreamMode::Read { cursor } = &mut state.mode else {
            return Err(bad_handle(format!("{stream} is not open for reading")));
        };

        let ns = self.namespace.read();
        let node = ns.get(&path)?;
        let NodeKind::File(data) = &node.kind else {
            return Err(is_a_directory(&path));
        };
        let len = data.content.len() as u64;
        if *cursor >= len {
            return Ok(0);
        }
        // A single read never crosses a block boundary
        let block_end = (*cursor / node.block_size + 1) * node.block_size;
        let end = len.min(block_end).min(*cursor + max_transfer(buf.len()) as u64);
        let n = (end - *cursor) as usize;
        let start = *cursor as usize;
        buf[..n].copy_from_slice(&data.content[start..start + n]);
        *cursor = end;
        Ok(n as i32)
    }

    fn do_pread(&self, session: SessionRef, stream: StreamRef, position: i64, buf: &mut [u8]) -> io::Result<i32> {
        let position = u64::try_from(position).map_err(|_| invalid_input(format!("negative position {position}")))?;
        let state = self.stream(session, stream)?;
        let path = {
            let state = state.lock();
            if !matches!(state.mode, StreamMode::Read { .. }) {
                return Err(bad_handle(format!("{stream} is not open for reading")));
            }
            state.path.clone()
        };

        let ns = self.namespace.read();
        let NodeKind::File(data) = &ns.get(&path)?.kind else {
            return Err(is_a_directory(&path));
        };
        let len = data.content.len() as u64;
        if position >= len {
            return Ok(0);
        }
        let n = ((len - position) as usize).min(max_transfer(buf.len()));
        let start = position as usize;
        buf[..n].copy_from_slice(&data.content[start..start + n]);
        Ok(n as i32)
    }

    fn do_write(&self, session: SessionRef, stream: StreamRef, data: &[u8]) -> io::Result<i32> {
        let state = self.stream(session, stream)?;
        let mut state = state.lock();
        let StreamMode::Write { position, pending } = &mut state.mode else {
            return Err(bad_handle(format!("{stream} is not open for writing")));
        };
        let n = max_transfer(data.len());
        pending.extend_from_slice(&data[..n]);
        *position += n as u64;
        Ok(n as i32)
    }

    fn do_seek(&self, session: SessionRef, stream: StreamRef, position: i64) -> io::Result<()> {
        let position = u64::try_from(position).map_err(|_| invalid_input(format!("negative position {position}")))?;
        let state = self.stream(session, stream)?;
        let mut state = state.lock();
        let path = state.path.clone();
        let StreamMode::Read { cursor } = &mut state.mode else {
            return Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "seek is only supported on streams open for reading",
            ));
        };
        let len = self.namespace.read().get(&path)?.len();
        if position > len {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("cannot seek to {position}, file is {len} bytes"),
            ));
        }
        *cursor = position;
        Ok(())
    }

    fn do_tell(&self, session: SessionRef, stream: StreamRef) -> io::Result<i64> {
        let state = self.stream(session, stream)?;
        let state = state.lock();
        let position = match state.mode {
            StreamMode::Read { cursor } => cursor,
            StreamMode::Write { position, .. } => position,
        };
        Ok(position as i64)
    }

    fn do_flush(&self, session: SessionRef, stream: StreamRef) -> io::Result<()> {
        let state = self.stream(session, stream)?;
        let mut state = state.lock();
        self.commit(&mut state)
    }

    fn do_available(&self, session: SessionRef, stream: StreamRef) -> io::Result<i32> {
        let state = self.stream(session, stream)?;
        let state = state.lock();
        let StreamMode::Read { cursor } = state.mode else {
            return Err(bad_handle(format!("{stream} is not open for reading")));
        };
        let len = self.namespace.read().get(&state.path)?.len();
        Ok(max_transfer(len.saturating_sub(cursor) as usize) as i32)
    }

    fn do_copy(&self, session: SessionRef, src: &str, dst_session: SessionRef, dst: &str) -> io::Result<()> {
        let src = self.resolve(session, src)?;
        let (dst_user, dst_cwd) = self.session(dst_session)?;
        let dst = resolve_path(&dst_cwd, dst)?;

        let mut ns = self.namespace.write();
        ns.get(&src)?;
        if ns.nodes.contains_key(&dst) {
            return Err(already_exists(&dst));
        }
        if dst == src || dst.starts_with(&child_prefix(&src)) {
            return Err(invalid_input(format!("cannot copy {src} into itself")));
        }
        ns.require_parent_directory(&dst)?;

        let now = now_secs();
        for path in ns.subtree(&src) {
            let Some(node) = ns.nodes.get(&path) else {
                continue;
            };
            let mut copied = node.clone();
            copied.owner.clone_from(&dst_user);
            copied.mtime = now;
            copied.atime = now;
            let target = format!("{dst}{}", &path[src.len()..]);
            ns.nodes.insert(target, copied);
        }
        Ok(())
    }

    fn do_move(&self, session: SessionRef, src: &str, dst_session: SessionRef, dst: &str) -> io::Result<()> {
        let src = self.resolve(session, src)?;
        let dst = self.resolve(dst_session, dst)?;
        self.move_resolved(&src, &dst)
    }

    fn move_resolved(&self, src: &str, dst: &str) -> io::Result<()> {
        if src == "/" {
            return Err(invalid_input("cannot move the root directory"));
        }
        let mut ns = self.namespace.write();
        ns.get(src)?;
        if ns.nodes.contains_key(dst) {
            return Err(already_exists(dst));
        }
        if dst.starts_with(&child_prefix(src)) {
            return Err(invalid_input(format!("cannot move {src} into itself")));
        }
        if ns.is_leased_below(src) {
            return Err(io::Error::new(
                io::ErrorKind::ResourceBusy,
                format!("{src}: open for writing"),
            ));
        }
        ns.require_parent_directory(dst)?;

        for path in ns.subtree(src) {
            if let Some(node) = ns.nodes.remove(&path) {
                let target = format!("{dst}{}", &path[src.len()..]);
                ns.nodes.insert(target, node);
            }
        }
        Ok(())
    }

    fn do_delete(&self, session: SessionRef, path: &str) -> io::Result<()> {
        let path = self.resolve(session, path)?;
        if path == "/" {
            return Err(invalid_input("cannot delete the root directory"));
        }
        let mut ns = self.namespace.write();
        ns.get(&path)?;
        if ns.is_leased_below(&path) {
            return Err(io::Error::new(
                io::ErrorKind::ResourceBusy,
                format!("{path}: open for writing"),
            ));
        }
        for doomed in ns.subtree(&path) {
            ns.nodes.remove(&doomed);
        }
        Ok(())
    }

    fn do_rename(&self, session: SessionRef, old_path: &str, new_path: &str) -> io::Result<()> {
        let old_path = self.resolve(session, old_path)?;
        let new_path = self.resolve(session, new_path)?;
        self.move_resolved(&old_path, &new_path)
    }

    fn do_set_working_directory(&self, session: SessionRef, path: &str) -> io::Result<()> {
        let resolved = self.resolve(session, path)?;
        let mut state = self
            .sessions
            .get_mut(&session)
            .ok_or_else(|| bad_handle(format!("unknown {session}")))?;
        state.cwd = resolved;
        Ok(())
    }

    fn do_create_directory(&self, session: SessionRef, path: &str) -> io::Result<()> {
        let (user, cwd) = self.session(session)?;
        let path = resolve_path(&cwd, path)?;
        let now = now_secs();

        let mut ns = self.namespace.write();
        let mut current = String::new();
        for component in path.split('/').filter(|c| !c.is_empty()) {
            current.push('/');
            current.push_str(component);
            match ns.nodes.get(&current).map(|n| &n.kind) {
                Some(NodeKind::Directory) => {}
                Some(NodeKind::File(_)) => return Err(not_a_directory(&current)),
                None => {
                    ns.nodes.insert(current.clone(), Node::directory(&user, now));
                }
            }
        }
        Ok(())
    }

    fn do_set_replication(&self, session: SessionRef, path: &str, replication: i16) -> io::Result<()> {
        let path = self.resolve(session, path)?;
        let replication = u16::try_from(replication)
            .ok()
            .filter(|r| *r > 0)
            .ok_or_else(|| invalid_input(format!("invalid replication {replication}")))?;

        let mut ns = self.namespace.write();
        let node = ns.get_mut(&path)?;
        if let NodeKind::File(data) = &mut node.kind {
            node.replication = replication;
            // Re-place every block at the new factor
            data.blocks.clear();
            self.rebalance(node);
        }
        Ok(())
    }

    fn do_list(&self, session: SessionRef, path: &str) -> io::Result<RawEntryList> {
        let path = self.resolve(session, path)?;
        let ns = self.namespace.read();
        let node = ns.get(&path)?;
        let records = match node.kind {
            NodeKind::File(_) => vec![node.record(&path)],
            NodeKind::Directory => ns.children(&path).into_iter().map(|(p, n)| n.record(p)).collect(),
        };
        Ok(RawEntryList::new(records))
    }

    fn do_path_info(&self, session: SessionRef, path: &str) -> io::Result<RawEntryRecord> {
        let path = self.resolve(session, path)?;
        let ns = self.namespace.read();
        Ok(ns.get(&path)?.record(&path))
    }

    fn do_hosts(&self, session: SessionRef, path: &str, start: i64, length: i64) -> io::Result<RawHostTable> {
        let path = self.resolve(session, path)?;
        let (start, length) = match (u64::try_from(start), u64::try_from(length)) {
            (Ok(s), Ok(l)) => (s, l),
            _ => return Err(invalid_input(format!("invalid range {start}+{length}"))),
        };

        let ns = self.namespace.read();
        let node = ns.get(&path)?;
        let NodeKind::File(data) = &node.kind else {
            return Err(is_a_directory(&path));
        };
        let len = data.content.len() as u64;
        if length == 0 || start >= len {
            return Ok(RawHostTable::from_blocks::<String>(&[]));
        }
        let first = (start / node.block_size) as usize;
        let last = ((start.saturating_add(length).min(len) - 1) / node.block_size) as usize;
        Ok(RawHostTable::from_blocks(&data.blocks[first..=last]))
    }

    fn do_used(&self) -> i64 {
        let ns = self.namespace.read();
        ns.nodes
            .values()
            .filter_map(|node| match &node.kind {
                NodeKind::File(data) => Some(
                    data.blocks
                        .iter()
                        .enumerate()
                        .map(|(i, replicas)| {
                            let block_start = i as u64 * node.block_size;
                            let block_len = (data.content.len() as u64 - block_start).min(node.block_size);
                            (block_len * replicas.len() as u64) as i64
                        })
                        .sum::<i64>(),
                ),
                NodeKind::Directory => None,
            })
            .sum()
    }

    fn do_chown(&self, session: SessionRef, path: &str, owner: Option<&str>, group: Option<&str>) -> io::Result<()> {
        let path = self.resolve(session, path)?;
        let mut ns = self.namespace.write();
        let node = ns.get_mut(&path)?;
        if let Some(owner) = owner {
            node.owner = owner.to_string();
        }
        if let Some(group) = group {
            node.group = group.to_string();
        }
        Ok(())
    }

    fn do_chmod(&self, session: SessionRef, path: &str, mode: i16) -> io::Result<()> {
        let path = self.resolve(session, path)?;
        let mode = u16::try_from(mode).map_err(|_| invalid_input(format!("invalid mode {mode}")))?;
        let mut ns = self.namespace.write();
        ns.get_mut(&path)?.permissions = mode & 0o7777;
        Ok(())
    }

    fn do_utime(&self, session: SessionRef, path: &str, mtime: i64, atime: i64) -> io::Result<()> {
        let path = self.resolve(session, path)?;
        let mut ns = self.namespace.write();
        let node = ns.get_mut(&path)?;
        if mtime != 0 {
            node.mtime = mtime;
        }
        if atime != 0 {
            node.atime = atime;
        }
        Ok(())
    }
}

impl Transport for MemoryTransport {
    fn connect(&self, target: &ConnectTarget, user: Option<&str>) -> RawReturn<Option<SessionRef>> {
        self.enter("connect");
        self.respond(self.do_connect(target, user).map(Some))
    }

    fn disconnect(&self, session: SessionRef) -> RawReturn<i32> {
        self.enter("disconnect");
        self.respond(self.do_disconnect(session).map(|()| 0))
    }

    fn open_stream(
        &self,
        session: SessionRef,
        path: &str,
        flags: OpenFlags,
        hints: OpenHints,
    ) -> RawReturn<Option<StreamRef>> {
        self.enter("open_stream");
        self.respond(self.do_open(session, path, flags, hints).map(Some))
    }

    fn close_stream(&self, session: SessionRef, stream: StreamRef) -> RawReturn<i32> {
        self.enter("close_stream");
        self.respond(self.do_close(session, stream).map(|()| 0))
    }

    fn exists(&self, session: SessionRef, path: &str) -> RawReturn<i32> {
        self.enter("exists");
        let result = self
            .resolve(session, path)
            .and_then(|path| self.namespace.read().get(&path).map(|_| 0));
        self.respond(result)
    }

    fn read(&self, session: SessionRef, stream: StreamRef, buf: &mut [u8]) -> RawReturn<i32> {
        self.enter("read");
        self.respond(self.do_read(session, stream, buf))
    }

    fn pread(&self, session: SessionRef, stream: StreamRef, position: i64, buf: &mut [u8]) -> RawReturn<i32> {
        self.enter("pread");
        self.respond(self.do_pread(session, stream, position, buf))
    }

    fn write(&self, session: SessionRef, stream: StreamRef, data: &[u8]) -> RawReturn<i32> {
        self.enter("write");
        self.respond(self.do_write(session, stream, data))
    }

    fn seek(&self, session: SessionRef, stream: StreamRef, position: i64) -> RawReturn<i32> {
        self.enter("seek");
        self.respond(self.do_seek(session, stream, position).map(|()| 0))
    }

    fn tell(&self, session: SessionRef, stream: StreamRef) -> RawReturn<i64> {
        self.enter("tell");
        self.respond(self.do_tell(session, stream))
    }

    fn flush(&self, session: SessionRef, stream: StreamRef) -> RawReturn<i32> {
        self.enter("flush");
        self.respond(self.do_flush(session, stream).map(|()| 0))
    }

    fn available(&self, session: SessionRef, stream: StreamRef) -> RawReturn<i32> {
        self.enter("available");
        self.respond(self.do_available(session, stream))
    }

    fn copy(&self, session: SessionRef, src: &str, dst_session: SessionRef, dst: &str) -> RawReturn<i32> {
        self.enter("copy");
        self.respond(self.do_copy(session, src, dst_session, dst).map(|()| 0))
    }

    fn move_path(&self, session: SessionRef, src: &str, dst_session: SessionRef, dst: &str) -> RawReturn<i32> {
        self.enter("move");
        self.respond(self.do_move(session, src, dst_session, dst).map(|()| 0))
    }

    fn delete(&self, session: SessionRef, path: &str) -> RawReturn<i32> {
        self.enter("delete");
        self.respond(self.do_delete(session, path).map(|()| 0))
    }

    fn rename(&self, session: SessionRef, old_path: &str, new_path: &str) -> RawReturn<i32> {
        self.enter("rename");
        self.respond(self.do_rename(session, old_path, new_path).map(|()| 0))
    }

    fn working_directory(&self, session: SessionRef) -> RawReturn<Option<String>> {
        self.enter("working_directory");
        self.respond(self.session(session).map(|(_, cwd)| Some(cwd)))
    }

    fn set_working_directory(&self, session: SessionRef, path: &str) -> RawReturn<i32> {
        self.enter("set_working_directory");
        self.respond(self.do_set_working_directory(session, path).map(|()| 0))
    }

    fn create_directory(&self, session: SessionRef, path: &str) -> RawReturn<i32> {
        self.enter("create_directory");
        self.respond(self.do_create_directory(session, path).map(|()| 0))
    }

    fn set_replication(&self, session: SessionRef, path: &str, replication: i16) -> RawReturn<i32> {
        self.enter("set_replication");
        self.respond(self.do_set_replication(session, path, replication).map(|()| 0))
    }

    fn list_directory(&self, session: SessionRef, path: &str) -> RawReturn<Option<RawEntryList>> {
        self.enter("list_directory");
        self.respond(self.do_list(session, path).map(Some))
    }

    fn path_info(&self, session: SessionRef, path: &str) -> RawReturn<Option<RawEntryRecord>> {
        self.enter("path_info");
        self.respond(self.do_path_info(session, path).map(Some))
    }

    fn hosts(&self, session: SessionRef, path: &str, start: i64, length: i64) -> RawReturn<Option<RawHostTable>> {
        self.enter("hosts");
        self.respond(self.do_hosts(session, path, start, length).map(Some))
    }

    fn default_block_size(&self, session: SessionRef) -> RawReturn<i64> {
        self.enter("default_block_size");
        self.respond(self.session(session).map(|_| self.block_size as i64))
    }

    fn capacity(&self, session: SessionRef) -> RawReturn<i64> {
        self.enter("capacity");
        self.respond(self.session(session).map(|_| self.capacity.load(Ordering::Relaxed)))
    }

    fn used(&self, session: SessionRef) -> RawReturn<i64> {
        self.enter("used");
        self.respond(self.session(session).map(|_| self.do_used()))
    }

    fn chown(&self, session: SessionRef, path: &str, owner: Option<&str>, group: Option<&str>) -> RawReturn<i32> {
        self.enter("chown");
        self.respond(self.do_chown(session, path, owner, group).map(|()| 0))
    }

    fn chmod(&self, session: SessionRef, path: &str, mode: i16) -> RawReturn<i32> {
        self.enter("chmod");
        self.respond(self.do_chmod(session, path, mode).map(|()| 0))
    }

    fn utime(&self, session: SessionRef, path: &str, mtime: i64, atime: i64) -> RawReturn<i32> {
        self.enter("utime");
        self.respond(self.do_utime(session, path, mtime, atime).map(|()| 0))
    }
}

fn parent_of(path: &str) -> Option<&str> {
    if path == "/" {
        return None;
    }
    match path.rsplit_once('/') {
        Some(("", _)) => Some("/"),
        Some((parent, _)) => Some(parent),
        None => None,
    }
}

fn child_prefix(path: &str) -> String {
    if path == "/" { "/".to_string() } else { format!("{path}/") }
}

fn max_transfer(len: usize) -> usize {
    len.min(i32::MAX as usize)
}

fn now_secs() -> i64 {
    system_time_to_seconds(SystemTime::now())
}

fn not_found(path: &str) -> io::Error {
    io::Error::new(io::ErrorKind::NotFound, format!("{path}: no such file or directory"))
}

fn already_exists(path: &str) -> io::Error {
    io::Error::new(io::ErrorKind::AlreadyExists, format!("{path}: already exists"))
}

fn is_a_directory(path: &str) -> io::Error {
    io::Error::new(io::ErrorKind::IsADirectory, format!("{path}: is a directory"))
}

fn not_a_directory(path: &str) -> io::Error {
    io::Error::new(io::ErrorKind::NotADirectory, format!("{path}: not a directory"))
}

fn invalid_input(message: impl Into<String>) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidInput, message.into())
}

fn bad_handle(message: impl Into<String>) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidInput, message.into())
}
