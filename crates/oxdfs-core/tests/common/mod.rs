#![allow(dead_code)] // Not every test binary uses every helper

pub mod faulty;

use std::sync::Arc;

use oxdfs_core::client::{FilesystemHandle, OpenMode};
use oxdfs_core::session::SessionRegistry;
use oxdfs_core::transport::MemoryTransport;

/// Block size used by test clusters, small enough to span several blocks
/// with a few bytes of content.
pub const TEST_BLOCK_SIZE: u64 = 8;

/// Route tracing output through the test harness. Safe to call repeatedly.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// A three-datanode cluster with small blocks.
pub fn test_cluster() -> Arc<MemoryTransport> {
    init_tracing();
    Arc::new(MemoryTransport::builder().block_size(TEST_BLOCK_SIZE).build())
}

/// Connect to the default filesystem with a private registry.
pub fn connect(transport: &Arc<MemoryTransport>) -> (Arc<SessionRegistry>, FilesystemHandle) {
    connect_as(transport, "")
}

pub fn connect_as(transport: &Arc<MemoryTransport>, user: &str) -> (Arc<SessionRegistry>, FilesystemHandle) {
    let registry = Arc::new(SessionRegistry::new());
    let fs = FilesystemHandle::connect_with_registry(transport.clone(), "default", 0, user, registry.clone())
        .expect("Failed to connect to test cluster");
    (registry, fs)
}

/// Create (or truncate) `path` with `data`.
pub fn write_file(fs: &FilesystemHandle, path: &str, data: &[u8]) {
    let file = fs.open(path, OpenMode::WriteCreate).expect("open for write");
    file.write_all(data).expect("write");
    file.close().expect("close");
}

/// Read the whole of `path` through sequential reads.
pub fn read_file(fs: &FilesystemHandle, path: &str) -> Vec<u8> {
    let file = fs.open(path, OpenMode::ReadOnly).expect("open for read");
    let mut content = Vec::new();
    let mut buf = [0u8; 64];
    loop {
        let n = file.read(&mut buf).expect("read");
        if n == 0 {
            break;
        }
        content.extend_from_slice(&buf[..n]);
    }
    file.close().expect("close");
    content
}

/// Content of exactly `size` bytes with a repeating pattern.
pub fn sized_content(size: usize) -> Vec<u8> {
    let pattern = b"0123456789ABCDEF";
    (0..size).map(|i| pattern[i % pattern.len()]).collect()
}
