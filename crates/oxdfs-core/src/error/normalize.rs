//! Normalization of raw transport results.
//!
//! The transport reports outcomes the way native client libraries do: a
//! return value that may be a sentinel (`-1`, a null reference) plus a
//! separate status slot that may or may not be meaningful. Three shapes occur
//! in practice:
//!
//! - sentinel with no status,
//! - sentinel with a status describing the failure,
//! - a real value with a stale status left over from an earlier call.
//!
//! The sentinel decides. A status attached to a non-sentinel value is ignored,
//! because several transport calls populate it unconditionally. This is the
//! only place that judgment is made.

use std::fmt;
use std::io;

use tracing::debug;

use super::{DfsError, ErrorKind, OpContext};

/// A raw transport result: value plus side-channel status.
#[derive(Debug)]
pub struct RawReturn<T> {
    /// The returned value, possibly a sentinel.
    pub value: T,
    /// The side-channel status. Only meaningful when `value` is a sentinel.
    pub status: Option<io::Error>,
}

impl<T> RawReturn<T> {
    /// A clean success with no status.
    #[inline]
    pub fn ok(value: T) -> Self {
        Self {
            value,
            status: None,
        }
    }

    /// A value accompanied by a status, whatever the value is.
    #[inline]
    pub fn with_status(value: T, status: io::Error) -> Self {
        Self {
            value,
            status: Some(status),
        }
    }
}

impl<T: Sentinel> RawReturn<T> {
    /// A failure: the sentinel value plus the status describing it.
    #[inline]
    pub fn failed(status: io::Error) -> Self {
        Self::with_status(T::sentinel(), status)
    }

    /// A failure signalled by the sentinel alone.
    #[inline]
    pub fn bare_sentinel() -> Self {
        Self::ok(T::sentinel())
    }
}

/// Return types that carry an in-band failure sentinel.
pub trait Sentinel: Sized {
    /// The success value once the sentinel has been ruled out.
    type Output;

    /// The value signalling failure.
    fn sentinel() -> Self;

    /// `None` if `self` is the sentinel, otherwise the success value.
    fn into_success(self) -> Option<Self::Output>;
}

impl Sentinel for i32 {
    type Output = i32;

    fn sentinel() -> Self {
        -1
    }

    /// Counts and status codes are never negative; any negative value is
    /// treated as the failure sentinel.
    fn into_success(self) -> Option<i32> {
        (self >= 0).then_some(self)
    }
}

impl Sentinel for i64 {
    type Output = i64;

    fn sentinel() -> Self {
        -1
    }

    fn into_success(self) -> Option<i64> {
        (self >= 0).then_some(self)
    }
}

impl<T> Sentinel for Option<T> {
    type Output = T;

    fn sentinel() -> Self {
        None
    }

    fn into_success(self) -> Option<T> {
        self
    }
}

/// The class of operation a raw result came from.
///
/// Determines which [`ErrorKind`] a failure maps to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationKind {
    Connect,
    Disconnect,
    Open,
    Close,
    Read,
    Write,
    Seek,
    Tell,
    Flush,
    Available,
    Exists,
    /// Single-path metadata lookup, where "not found" is distinguishable.
    PathInfo,
    /// Directory listing and block location queries.
    Listing,
    /// Copy, move, delete, rename, mkdir, working directory.
    Namespace,
    /// Chown, chmod, utime, set replication.
    Attributes,
    /// Cluster-wide block size, capacity and usage.
    Statistics,
}

impl OperationKind {
    pub fn name(self) -> &'static str {
        match self {
            Self::Connect => "connect",
            Self::Disconnect => "disconnect",
            Self::Open => "open",
            Self::Close => "close",
            Self::Read => "read",
            Self::Write => "write",
            Self::Seek => "seek",
            Self::Tell => "tell",
            Self::Flush => "flush",
            Self::Available => "available",
            Self::Exists => "exists",
            Self::PathInfo => "path info",
            Self::Listing => "listing",
            Self::Namespace => "namespace",
            Self::Attributes => "attributes",
            Self::Statistics => "statistics",
        }
    }

    /// The normalized kind for a failure of this operation.
    pub fn failure_kind(self, status: &io::Error) -> ErrorKind {
        match self {
            Self::Connect | Self::Disconnect => ErrorKind::Connection,
            Self::Open => ErrorKind::Open,
            Self::PathInfo if status.kind() == io::ErrorKind::NotFound => ErrorKind::NotFound,
            _ => ErrorKind::Io,
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Normalize a raw transport result into a value or exactly one error.
///
/// `context` is only evaluated on failure.
pub fn normalize<T, F>(raw: RawReturn<T>, op: OperationKind, context: F) -> Result<T::Output, DfsError>
where
    T: Sentinel,
    F: FnOnce() -> OpContext,
{
    let RawReturn { value, status } = raw;
    match value.into_success() {
        Some(success) => {
            if let Some(stale) = status {
                debug!(operation = %op, status = %stale, "Ignoring side-channel status on successful result");
            }
            Ok(success)
        }
        None => {
            let source = status.unwrap_or_else(|| io::Error::other(format!("{op} failed without status")));
            Err(into_error(op.failure_kind(&source), source, context()))
        }
    }
}

/// Normalize a result that only signals success or failure.
pub fn normalize_status<F>(raw: RawReturn<i32>, op: OperationKind, context: F) -> Result<(), DfsError>
where
    F: FnOnce() -> OpContext,
{
    normalize(raw, op, context).map(|_| ())
}

fn into_error(kind: ErrorKind, source: io::Error, context: OpContext) -> DfsError {
    match kind {
        ErrorKind::Connection => DfsError::Connection { source, context },
        ErrorKind::Open => DfsError::Open { source, context },
        ErrorKind::NotFound => DfsError::NotFound { source, context },
        ErrorKind::Unsupported => DfsError::Unsupported {
            reason: source.to_string(),
            context,
        },
        ErrorKind::Decode => DfsError::Decode {
            reason: source.to_string(),
            context,
        },
        ErrorKind::InvalidArgument => DfsError::InvalidArgument {
            reason: source.to_string(),
            context,
        },
        ErrorKind::InvalidHandle => DfsError::InvalidHandle { context },
        ErrorKind::Io => DfsError::Io { source, context },
    }
}
