//! The transport collaborator contract.
//!
//! A [`Transport`] is the component that actually talks to a storage
//! cluster. The client layer treats it as a black box that hands out opaque
//! session and stream references and reports results through
//! [`RawReturn`] values, following native client conventions:
//! `-1` or `None` for failure, with a status slot that is only meaningful
//! alongside the sentinel.
//!
//! Two implementations ship with the crate:
//!
//! - [`MemoryTransport`] - an in-process simulated cluster with datanodes,
//!   blocks and replicas
//! - [`LocalTransport`] - the host filesystem (unix, `local` feature)

pub mod memory;

#[cfg(all(unix, feature = "local"))]
pub mod local;

pub use memory::MemoryTransport;

#[cfg(all(unix, feature = "local"))]
pub use local::LocalTransport;

use std::fmt;
use std::io;

use relative_path::RelativePath;

use crate::codec::{RawEntryList, RawEntryRecord, RawHostTable};
use crate::error::RawReturn;

/// Opaque reference to a transport session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionRef(pub u64);

impl fmt::Display for SessionRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "session#{}", self.0)
    }
}

/// Opaque reference to an open stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StreamRef(pub u64);

impl fmt::Display for StreamRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "stream#{}", self.0)
    }
}

/// Which filesystem a connect call addresses.
///
/// Follows the usual host/port conventions:
///
/// - `host = ""` selects the local filesystem
/// - `host = "default"` with `port = 0` selects the transport's configured
///   default filesystem
/// - anything else is a remote namenode
///
/// # Examples
///
/// ```
/// use oxdfs_core::transport::ConnectTarget;
///
/// assert_eq!(ConnectTarget::parse("", 0), ConnectTarget::Local);
/// assert_eq!(ConnectTarget::parse("default", 0), ConnectTarget::Default);
/// assert_eq!(
///     ConnectTarget::parse("namenode", 8020),
///     ConnectTarget::Remote { host: "namenode".to_string(), port: 8020 }
/// );
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ConnectTarget {
    Local,
    Default,
    Remote { host: String, port: u16 },
}

impl ConnectTarget {
    pub fn parse(host: &str, port: u16) -> Self {
        match (host, port) {
            ("", _) => ConnectTarget::Local,
            ("default", 0) => ConnectTarget::Default,
            (host, port) => ConnectTarget::Remote {
                host: host.to_string(),
                port,
            },
        }
    }
}

impl fmt::Display for ConnectTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectTarget::Local => write!(f, "local filesystem"),
            ConnectTarget::Default => write!(f, "default filesystem"),
            ConnectTarget::Remote { host, port } => write!(f, "{host}:{port}"),
        }
    }
}

/// Open flags in `fcntl.h` style.
///
/// Only some combinations are accepted; see
/// [`OpenMode::from_flags`](crate::client::OpenMode::from_flags).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct OpenFlags(u32);

impl OpenFlags {
    pub const RDONLY: Self = Self(0);
    pub const WRONLY: Self = Self(0o1);
    pub const RDWR: Self = Self(0o2);
    pub const CREATE: Self = Self(0o100);
    pub const EXCL: Self = Self(0o200);
    pub const TRUNC: Self = Self(0o1000);
    pub const APPEND: Self = Self(0o2000);

    #[inline]
    pub const fn bits(self) -> u32 {
        self.0
    }

    #[inline]
    pub const fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    /// Whether every bit of `other` is set. `RDONLY` is the empty set.
    #[inline]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    #[inline]
    pub const fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }
}

impl std::ops::BitOr for OpenFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        self.union(rhs)
    }
}

/// Advisory tuning for a new stream. `0` means "use the cluster default".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct OpenHints {
    pub buffer_size: u32,
    pub replication: u16,
    pub block_size: u64,
}

impl OpenHints {
    pub fn new(buffer_size: u32, replication: u16, block_size: u64) -> Self {
        Self {
            buffer_size,
            replication,
            block_size,
        }
    }
}

/// Everything the client layer needs from a storage transport.
///
/// Implementations report through [`RawReturn`]: numeric results use `-1`
/// (any negative value) for failure, reference results use `None`. The
/// status slot is only trusted alongside a sentinel, so implementations may
/// leave stale statuses on successful returns.
///
/// Paths are passed through unresolved; relative paths resolve against the
/// session's working directory inside the transport.
pub trait Transport: Send + Sync + fmt::Debug {
    /// Establish a session. `user = None` means the ambient identity.
    fn connect(&self, target: &ConnectTarget, user: Option<&str>) -> RawReturn<Option<SessionRef>>;

    /// Release a session. Calling this twice for one session is undefined.
    fn disconnect(&self, session: SessionRef) -> RawReturn<i32>;

    fn open_stream(
        &self,
        session: SessionRef,
        path: &str,
        flags: OpenFlags,
        hints: OpenHints,
    ) -> RawReturn<Option<StreamRef>>;

    fn close_stream(&self, session: SessionRef, stream: StreamRef) -> RawReturn<i32>;

    /// `0` if the path exists, `-1` otherwise.
    fn exists(&self, session: SessionRef, path: &str) -> RawReturn<i32>;

    /// Read at the stream cursor, advancing it. Returns the byte count.
    fn read(&self, session: SessionRef, stream: StreamRef, buf: &mut [u8]) -> RawReturn<i32>;

    /// Read at `position` without touching the cursor.
    fn pread(&self, session: SessionRef, stream: StreamRef, position: i64, buf: &mut [u8]) -> RawReturn<i32>;

    fn write(&self, session: SessionRef, stream: StreamRef, data: &[u8]) -> RawReturn<i32>;

    fn seek(&self, session: SessionRef, stream: StreamRef, position: i64) -> RawReturn<i32>;

    fn tell(&self, session: SessionRef, stream: StreamRef) -> RawReturn<i64>;

    fn flush(&self, session: SessionRef, stream: StreamRef) -> RawReturn<i32>;

    fn available(&self, session: SessionRef, stream: StreamRef) -> RawReturn<i32>;

    /// Copy between two sessions of this transport.
    fn copy(&self, session: SessionRef, src: &str, dst_session: SessionRef, dst: &str) -> RawReturn<i32>;

    /// Move between two sessions of this transport.
    fn move_path(&self, session: SessionRef, src: &str, dst_session: SessionRef, dst: &str) -> RawReturn<i32>;

    /// Delete a file or a directory tree.
    fn delete(&self, session: SessionRef, path: &str) -> RawReturn<i32>;

    fn rename(&self, session: SessionRef, old_path: &str, new_path: &str) -> RawReturn<i32>;

    fn working_directory(&self, session: SessionRef) -> RawReturn<Option<String>>;

    fn set_working_directory(&self, session: SessionRef, path: &str) -> RawReturn<i32>;

    /// Create a directory and all missing ancestors.
    fn create_directory(&self, session: SessionRef, path: &str) -> RawReturn<i32>;

    fn set_replication(&self, session: SessionRef, path: &str, replication: i16) -> RawReturn<i32>;

    /// Raw records for a directory's children plus their count.
    fn list_directory(&self, session: SessionRef, path: &str) -> RawReturn<Option<RawEntryList>>;

    fn path_info(&self, session: SessionRef, path: &str) -> RawReturn<Option<RawEntryRecord>>;

    /// Replica hosts for each block overlapping `[start, start + length)`.
    fn hosts(&self, session: SessionRef, path: &str, start: i64, length: i64) -> RawReturn<Option<RawHostTable>>;

    fn default_block_size(&self, session: SessionRef) -> RawReturn<i64>;

    fn capacity(&self, session: SessionRef) -> RawReturn<i64>;

    fn used(&self, session: SessionRef) -> RawReturn<i64>;

    /// `None` leaves the corresponding name unchanged.
    fn chown(&self, session: SessionRef, path: &str, owner: Option<&str>, group: Option<&str>) -> RawReturn<i32>;

    fn chmod(&self, session: SessionRef, path: &str, mode: i16) -> RawReturn<i32>;

    /// Seconds since the epoch. `0` leaves the corresponding time unchanged.
    fn utime(&self, session: SessionRef, path: &str, mtime: i64, atime: i64) -> RawReturn<i32>;
}

/// Resolve `path` against `cwd` into a normalized absolute path.
pub(crate) fn resolve_path(cwd: &str, path: &str) -> io::Result<String> {
    if path.is_empty() {
        return Err(io::Error::new(io::ErrorKind::InvalidInput, "empty path"));
    }
    let normalized = if path.starts_with('/') {
        RelativePath::new(path.trim_start_matches('/')).normalize()
    } else {
        RelativePath::new(cwd.trim_start_matches('/')).join_normalized(path)
    };
    if normalized.components().next().is_some_and(|c| c.as_str() == "..") {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("{path}: escapes the root directory"),
        ));
    }
    Ok(format!("/{normalized}"))
}
