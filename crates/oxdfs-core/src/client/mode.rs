//! Open modes.

use std::fmt;

use crate::error::{DfsError, OpContext};
use crate::transport::OpenFlags;

/// The three mutually exclusive ways a file can be opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpenMode {
    /// Sequential and positional reads, seek.
    ReadOnly,
    /// Create the file, truncating it if it exists.
    WriteCreate,
    /// Append to an existing file.
    WriteAppend,
}

impl OpenMode {
    /// Map `fcntl`-style flags onto a mode.
    ///
    /// Accepted combinations:
    ///
    /// | flags | mode |
    /// |---|---|
    /// | `RDONLY` | `ReadOnly` |
    /// | `WRONLY`, optionally with `CREATE` and/or `TRUNC` | `WriteCreate` |
    /// | `WRONLY \| APPEND` | `WriteAppend` |
    ///
    /// Read-write, exclusive create, and append combined with truncate are
    /// rejected with [`DfsError::Unsupported`]. So are `CREATE`, `TRUNC`
    /// or `APPEND` without `WRONLY`.
    ///
    /// # Examples
    ///
    /// ```
    /// use oxdfs_core::client::OpenMode;
    /// use oxdfs_core::error::ErrorKind;
    /// use oxdfs_core::transport::OpenFlags;
    ///
    /// let mode = OpenMode::from_flags(OpenFlags::WRONLY | OpenFlags::APPEND).unwrap();
    /// assert_eq!(mode, OpenMode::WriteAppend);
    ///
    /// let err = OpenMode::from_flags(OpenFlags::RDWR).unwrap_err();
    /// assert_eq!(err.kind(), ErrorKind::Unsupported);
    /// ```
    pub fn from_flags(flags: OpenFlags) -> Result<Self, DfsError> {
        let unsupported = |reason: &str| {
            DfsError::unsupported(
                format!("{reason} (flags {:#o})", flags.bits()),
                OpContext::for_operation("open"),
            )
        };

        if flags.contains(OpenFlags::RDWR) {
            return Err(unsupported("read-write access"));
        }
        if flags.contains(OpenFlags::EXCL) {
            return Err(unsupported("exclusive create"));
        }

        let known = OpenFlags::WRONLY | OpenFlags::CREATE | OpenFlags::TRUNC | OpenFlags::APPEND;
        if flags.bits() & !known.bits() != 0 {
            return Err(unsupported("unknown flag bits"));
        }

        if !flags.contains(OpenFlags::WRONLY) {
            return if flags == OpenFlags::RDONLY {
                Ok(OpenMode::ReadOnly)
            } else {
                Err(unsupported("create, truncate or append on a read-only stream"))
            };
        }

        match (flags.contains(OpenFlags::APPEND), flags.contains(OpenFlags::TRUNC)) {
            (true, true) => Err(unsupported("append combined with truncate")),
            (true, false) => Ok(OpenMode::WriteAppend),
            (false, _) => Ok(OpenMode::WriteCreate),
        }
    }

    /// The flags sent to the transport for this mode.
    pub fn flags(self) -> OpenFlags {
        match self {
            OpenMode::ReadOnly => OpenFlags::RDONLY,
            OpenMode::WriteCreate => OpenFlags::WRONLY,
            OpenMode::WriteAppend => OpenFlags::WRONLY | OpenFlags::APPEND,
        }
    }

    pub fn is_read(self) -> bool {
        self == OpenMode::ReadOnly
    }

    pub fn is_write(self) -> bool {
        !self.is_read()
    }
}

impl fmt::Display for OpenMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OpenMode::ReadOnly => write!(f, "read-only"),
            OpenMode::WriteCreate => write!(f, "write-create"),
            OpenMode::WriteAppend => write!(f, "write-append"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn test_accepted_combinations() {
        assert_eq!(OpenMode::from_flags(OpenFlags::RDONLY).unwrap(), OpenMode::ReadOnly);
        assert_eq!(OpenMode::from_flags(OpenFlags::WRONLY).unwrap(), OpenMode::WriteCreate);
        assert_eq!(
            OpenMode::from_flags(OpenFlags::WRONLY | OpenFlags::CREATE | OpenFlags::TRUNC).unwrap(),
            OpenMode::WriteCreate
        );
        assert_eq!(
            OpenMode::from_flags(OpenFlags::WRONLY | OpenFlags::APPEND).unwrap(),
            OpenMode::WriteAppend
        );
    }

    #[test]
    fn test_rejected_combinations() {
        let rejected = [
            OpenFlags::RDWR,
            OpenFlags::RDWR | OpenFlags::CREATE,
            OpenFlags::WRONLY | OpenFlags::CREATE | OpenFlags::EXCL,
            OpenFlags::WRONLY | OpenFlags::APPEND | OpenFlags::TRUNC,
            OpenFlags::CREATE,
            OpenFlags::APPEND,
            OpenFlags::from_bits(0o40000),
        ];
        for flags in rejected {
            let err = OpenMode::from_flags(flags).unwrap_err();
            assert_eq!(err.kind(), ErrorKind::Unsupported, "flags {:#o}", flags.bits());
        }
    }

    #[test]
    fn test_flags_round_trip_through_mode() {
        for mode in [OpenMode::ReadOnly, OpenMode::WriteCreate, OpenMode::WriteAppend] {
            assert_eq!(OpenMode::from_flags(mode.flags()).unwrap(), mode);
        }
    }
}
