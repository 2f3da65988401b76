//! Error types for the client access layer.
//!
//! Every public operation returns [`DfsError`], a single typed error whose
//! [`kind`](DfsError::kind) is one [`ErrorKind`]. Transport results are turned
//! into these errors by the [`normalize`] module; decode failures come from
//! [`crate::codec`]; caller mistakes (bad flag combinations, empty chown
//! arguments) are rejected before the transport is ever called.

pub mod normalize;

pub use normalize::{OperationKind, RawReturn, Sentinel, normalize, normalize_status};

use std::fmt;
use std::io;

use thiserror::Error;

use crate::transport::{ConnectTarget, StreamRef};

/// Semantic category for client errors.
///
/// This is the normalized taxonomy surfaced to callers. Each [`DfsError`]
/// maps to exactly one category.
///
/// # Example
///
/// ```
/// use oxdfs_core::error::ErrorKind;
///
/// assert_eq!(ErrorKind::NotFound.to_errno(), libc::ENOENT);
/// assert_eq!(ErrorKind::InvalidHandle.name(), "InvalidHandle");
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Connect or disconnect failed.
    Connection,
    /// Operation on a disconnected filesystem or a closed file.
    InvalidHandle,
    /// Opening a file failed.
    Open,
    /// Requested mode or flag combination is known to be unsupported.
    Unsupported,
    /// Generic read/write/seek/flush/metadata failure in the transport.
    Io,
    /// The path does not exist (where distinguishable).
    NotFound,
    /// The transport returned a malformed or self-inconsistent structure.
    Decode,
    /// The caller passed arguments that can never succeed.
    InvalidArgument,
}

impl ErrorKind {
    /// Converts this category to a POSIX errno value.
    #[inline]
    pub fn to_errno(self) -> i32 {
        match self {
            Self::Connection => libc::ECONNREFUSED,
            Self::InvalidHandle => libc::EBADF,
            Self::Open => libc::EACCES,
            Self::Unsupported => libc::ENOTSUP,
            Self::Io => libc::EIO,
            Self::NotFound => libc::ENOENT,
            Self::Decode => libc::EPROTO,
            Self::InvalidArgument => libc::EINVAL,
        }
    }

    /// Returns a human-readable name for this category.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Connection => "ConnectionError",
            Self::InvalidHandle => "InvalidHandle",
            Self::Open => "OpenError",
            Self::Unsupported => "Unsupported",
            Self::Io => "IOError",
            Self::NotFound => "NotFoundError",
            Self::Decode => "DecodeError",
            Self::InvalidArgument => "InvalidArgument",
        }
    }

    fn io_kind(self) -> io::ErrorKind {
        match self {
            Self::Connection => io::ErrorKind::ConnectionRefused,
            Self::InvalidHandle | Self::InvalidArgument => io::ErrorKind::InvalidInput,
            Self::Open => io::ErrorKind::PermissionDenied,
            Self::Unsupported => io::ErrorKind::Unsupported,
            Self::Io => io::ErrorKind::Other,
            Self::NotFound => io::ErrorKind::NotFound,
            Self::Decode => io::ErrorKind::InvalidData,
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Context for a failed operation, providing debugging information.
#[derive(Debug, Clone, Default)]
pub struct OpContext {
    /// The operation being performed
    pub operation: Option<&'static str>,
    /// The path being operated on
    pub path: Option<String>,
    /// The filesystem the session is connected to
    pub target: Option<String>,
    /// The stream the operation ran against
    pub stream: Option<StreamRef>,
}

impl OpContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn for_operation(operation: &'static str) -> Self {
        Self {
            operation: Some(operation),
            ..Self::default()
        }
    }

    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = Some(path.into());
        self
    }

    pub fn with_target(mut self, target: &ConnectTarget) -> Self {
        self.target = Some(target.to_string());
        self
    }

    pub fn with_stream(mut self, stream: StreamRef) -> Self {
        self.stream = Some(stream);
        self
    }
}

impl fmt::Display for OpContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut parts = Vec::new();

        if let Some(operation) = self.operation {
            parts.push(operation.to_string());
        }
        if let Some(ref path) = self.path {
            parts.push(format!("path '{path}'"));
        }
        if let Some(ref target) = self.target {
            parts.push(format!("on {target}"));
        }
        if let Some(stream) = self.stream {
            parts.push(format!("stream {stream}"));
        }

        if parts.is_empty() {
            write!(f, "(no context)")
        } else {
            write!(f, "{}", parts.join(", "))
        }
    }
}

/// The single error type returned by every client operation.
#[derive(Error, Debug)]
pub enum DfsError {
    #[error("Connection error for {context}: {source}")]
    Connection {
        #[source]
        source: io::Error,
        context: OpContext,
    },

    #[error("Invalid handle: {context}")]
    InvalidHandle { context: OpContext },

    #[error("Open failed for {context}: {source}")]
    Open {
        #[source]
        source: io::Error,
        context: OpContext,
    },

    #[error("Unsupported for {context}: {reason}")]
    Unsupported { reason: String, context: OpContext },

    #[error("IO error for {context}: {source}")]
    Io {
        #[source]
        source: io::Error,
        context: OpContext,
    },

    #[error("Not found: {context}")]
    NotFound {
        #[source]
        source: io::Error,
        context: OpContext,
    },

    #[error("Decode error for {context}: {reason}")]
    Decode { reason: String, context: OpContext },

    #[error("Invalid argument for {context}: {reason}")]
    InvalidArgument { reason: String, context: OpContext },
}

impl DfsError {
    /// The normalized category of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            DfsError::Connection { .. } => ErrorKind::Connection,
            DfsError::InvalidHandle { .. } => ErrorKind::InvalidHandle,
            DfsError::Open { .. } => ErrorKind::Open,
            DfsError::Unsupported { .. } => ErrorKind::Unsupported,
            DfsError::Io { .. } => ErrorKind::Io,
            DfsError::NotFound { .. } => ErrorKind::NotFound,
            DfsError::Decode { .. } => ErrorKind::Decode,
            DfsError::InvalidArgument { .. } => ErrorKind::InvalidArgument,
        }
    }

    /// The context attached to this error.
    pub fn context(&self) -> &OpContext {
        match self {
            DfsError::Connection { context, .. }
            | DfsError::InvalidHandle { context }
            | DfsError::Open { context, .. }
            | DfsError::Unsupported { context, .. }
            | DfsError::Io { context, .. }
            | DfsError::NotFound { context, .. }
            | DfsError::Decode { context, .. }
            | DfsError::InvalidArgument { context, .. } => context,
        }
    }

    pub(crate) fn invalid_handle(context: OpContext) -> Self {
        DfsError::InvalidHandle { context }
    }

    pub(crate) fn unsupported(reason: impl Into<String>, context: OpContext) -> Self {
        DfsError::Unsupported {
            reason: reason.into(),
            context,
        }
    }

    pub(crate) fn invalid_argument(reason: impl Into<String>, context: OpContext) -> Self {
        DfsError::InvalidArgument {
            reason: reason.into(),
            context,
        }
    }

    pub(crate) fn decode(reason: impl Into<String>, context: OpContext) -> Self {
        DfsError::Decode {
            reason: reason.into(),
            context,
        }
    }

    /// Fill in context fields the error does not carry yet.
    ///
    /// The codec reports errors without knowing which path was queried;
    /// callers attach that here.
    #[must_use]
    pub(crate) fn in_context(mut self, outer: &OpContext) -> Self {
        let context = match &mut self {
            DfsError::Connection { context, .. }
            | DfsError::InvalidHandle { context }
            | DfsError::Open { context, .. }
            | DfsError::Unsupported { context, .. }
            | DfsError::Io { context, .. }
            | DfsError::NotFound { context, .. }
            | DfsError::Decode { context, .. }
            | DfsError::InvalidArgument { context, .. } => context,
        };
        context.operation = context.operation.or(outer.operation);
        if context.path.is_none() {
            context.path.clone_from(&outer.path);
        }
        if context.target.is_none() {
            context.target.clone_from(&outer.target);
        }
        context.stream = context.stream.or(outer.stream);
        self
    }
}

impl From<DfsError> for io::Error {
    fn from(err: DfsError) -> Self {
        let kind = err.kind().io_kind();
        io::Error::new(kind, err)
    }
}

pub type Result<T, E = DfsError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_matches_variant() {
        let err = DfsError::invalid_handle(OpContext::for_operation("read"));
        assert_eq!(err.kind(), ErrorKind::InvalidHandle);

        let err = DfsError::decode("ragged", OpContext::new());
        assert_eq!(err.kind(), ErrorKind::Decode);
    }

    #[test]
    fn test_errno_mapping_is_distinct() {
        let kinds = [
            ErrorKind::Connection,
            ErrorKind::InvalidHandle,
            ErrorKind::Open,
            ErrorKind::Unsupported,
            ErrorKind::Io,
            ErrorKind::NotFound,
            ErrorKind::Decode,
            ErrorKind::InvalidArgument,
        ];
        let mut errnos: Vec<i32> = kinds.iter().map(|k| k.to_errno()).collect();
        errnos.sort_unstable();
        errnos.dedup();
        assert_eq!(errnos.len(), kinds.len());
    }

    #[test]
    fn test_context_display() {
        let ctx = OpContext::for_operation("chmod")
            .with_path("/tmp/a")
            .with_target(&ConnectTarget::Local);
        let rendered = ctx.to_string();
        assert!(rendered.contains("chmod"));
        assert!(rendered.contains("path '/tmp/a'"));
        assert!(rendered.contains("local filesystem"));

        assert_eq!(OpContext::new().to_string(), "(no context)");
    }

    #[test]
    fn test_in_context_keeps_existing_fields() {
        let err = DfsError::decode("bad", OpContext::for_operation("hosts"))
            .in_context(&OpContext::for_operation("other").with_path("/a"));
        let ctx = err.context();
        assert_eq!(ctx.operation, Some("hosts"));
        assert_eq!(ctx.path.as_deref(), Some("/a"));
    }

    #[test]
    fn test_into_io_error_preserves_kind() {
        let err = DfsError::NotFound {
            source: io::Error::from(io::ErrorKind::NotFound),
            context: OpContext::new().with_path("/missing"),
        };
        let io_err: io::Error = err.into();
        assert_eq!(io_err.kind(), io::ErrorKind::NotFound);
    }
}
