//! Session and stream handles.
//!
//! A [`FilesystemHandle`] owns one transport session. Every [`FileHandle`]
//! opened through it shares the session and stays usable only while the
//! filesystem handle is connected.

pub mod file;
pub mod filesystem;
pub mod mode;

pub use file::FileHandle;
pub use filesystem::{DEFAULT_COPY_BUFFER_SIZE, FilesystemHandle, MAX_COPY_BUFFER_SIZE, UTIME_UNCHANGED};
pub use mode::OpenMode;
