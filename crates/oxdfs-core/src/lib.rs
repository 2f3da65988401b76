//! Client access layer for HDFS-style distributed filesystems.
//!
//! The crate wraps a [`Transport`] (the raw, sentinel-returning binding to a
//! cluster or to the host filesystem) with owned handles:
//!
//! - [`FilesystemHandle`] - a connected session with namespace, metadata and
//!   attribute operations
//! - [`FileHandle`] - an open stream with sequential and positional I/O
//! - [`SessionRegistry`] - process-wide tracking of live sessions
//!
//! # Example
//!
//! ```
//! use std::io::Read;
//! use std::sync::Arc;
//! use oxdfs_core::{FilesystemHandle, MemoryTransport, OpenMode};
//!
//! let fs = FilesystemHandle::connect(Arc::new(MemoryTransport::new()), "default", 0)?;
//!
//! let file = fs.open("/greeting", OpenMode::WriteCreate)?;
//! file.write_all(b"hello")?;
//! file.close()?;
//!
//! let file = fs.open("/greeting", OpenMode::ReadOnly)?;
//! let mut contents = String::new();
//! (&file).read_to_string(&mut contents)?;
//! assert_eq!(contents, "hello");
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

pub mod client;
pub mod codec;
pub mod config;
pub mod error;
pub mod session;
pub mod transport;

// Re-export commonly used types at crate root
pub use client::{FileHandle, FilesystemHandle, OpenMode, UTIME_UNCHANGED};
pub use codec::{BlockHostMap, EntryInfo, EntryKind};
pub use config::{ClientConfig, ConfigError};
pub use error::{DfsError, ErrorKind, Result};
pub use session::SessionRegistry;
pub use transport::{ConnectTarget, MemoryTransport, OpenFlags, OpenHints, Transport};

#[cfg(all(unix, feature = "local"))]
pub use transport::LocalTransport;
