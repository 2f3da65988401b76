//! Filesystem handle behavior against the simulated cluster.
//!
//! Focus areas:
//! - session lifecycle and handle invalidation
//! - open mode validation before any transport call
//! - namespace operations and working directories
//! - metadata, block locations and attributes

mod common;

use std::time::{Duration, UNIX_EPOCH};

use common::{TEST_BLOCK_SIZE, connect, connect_as, read_file, sized_content, test_cluster, write_file};
use oxdfs_core::client::{OpenMode, UTIME_UNCHANGED};
use oxdfs_core::codec::EntryKind;
use oxdfs_core::error::ErrorKind;
use oxdfs_core::transport::OpenFlags;
use oxdfs_core::transport::OpenHints;
use oxdfs_core::transport::memory::{AMBIENT_USER, DEFAULT_CAPACITY, DEFAULT_GROUP};

// ============================================================================
// Session lifecycle
// ============================================================================

#[test]
fn test_disconnect_twice_is_invalid_handle() {
    let transport = test_cluster();
    let (_registry, fs) = connect(&transport);

    fs.disconnect().unwrap();
    let calls = transport.call_count();
    let err = fs.disconnect().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidHandle);
    assert_eq!(transport.call_count(), calls, "second disconnect reached the transport");
}

#[test]
fn test_operations_after_disconnect_fail_without_transport_calls() {
    let transport = test_cluster();
    let (_registry, fs) = connect(&transport);
    fs.disconnect().unwrap();

    let calls = transport.call_count();
    assert_eq!(fs.path_info("/").unwrap_err().kind(), ErrorKind::InvalidHandle);
    assert_eq!(fs.list_directory("/").unwrap_err().kind(), ErrorKind::InvalidHandle);
    assert_eq!(fs.open("/f", OpenMode::WriteCreate).unwrap_err().kind(), ErrorKind::InvalidHandle);
    assert_eq!(fs.used().unwrap_err().kind(), ErrorKind::InvalidHandle);
    assert_eq!(fs.exists("/").unwrap_err().kind(), ErrorKind::InvalidHandle);
    assert_eq!(transport.call_count(), calls);
}

#[test]
fn test_disconnect_invalidates_open_files() {
    let transport = test_cluster();
    let (_registry, fs) = connect(&transport);
    let file = fs.open("/open-at-disconnect", OpenMode::WriteCreate).unwrap();
    assert_eq!(fs.open_file_count(), 1);

    fs.disconnect().unwrap();
    assert_eq!(transport.open_stream_count(), 0);
    assert_eq!(file.write(b"late").unwrap_err().kind(), ErrorKind::InvalidHandle);
    assert!(!file.is_open());
}

#[test]
fn test_connection_refused() {
    let transport = test_cluster();
    let err = oxdfs_core::FilesystemHandle::connect(transport.clone(), "nowhere", 9000).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Connection);
    assert_eq!(transport.session_count(), 0);
}

#[test]
fn test_registry_shutdown_disconnects_sessions() {
    let transport = test_cluster();
    let (registry, fs) = connect(&transport);
    let _file = fs.open("/pending", OpenMode::WriteCreate).unwrap();

    let report = registry.shutdown_all();
    assert_eq!(report.disconnected, 1);
    assert!(report.is_clean());
    assert!(!fs.is_connected());
    assert!(registry.is_empty());
    assert_eq!(transport.session_count(), 0);
}

// ============================================================================
// Open modes
// ============================================================================

#[test]
fn test_unsupported_flags_rejected_before_transport() {
    let transport = test_cluster();
    let (_registry, fs) = connect(&transport);

    let calls = transport.call_count();
    for flags in [
        OpenFlags::RDWR,
        OpenFlags::WRONLY | OpenFlags::CREATE | OpenFlags::EXCL,
        OpenFlags::WRONLY | OpenFlags::APPEND | OpenFlags::TRUNC,
    ] {
        let err = fs.open_file("/f", flags, OpenHints::default()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Unsupported, "flags {:#o}", flags.bits());
    }
    assert_eq!(transport.call_count(), calls);
}

#[test]
fn test_open_missing_file_for_read() {
    let transport = test_cluster();
    let (_registry, fs) = connect(&transport);
    let err = fs.open("/missing", OpenMode::ReadOnly).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Open);
}

#[test]
fn test_second_writer_is_refused() {
    let transport = test_cluster();
    let (_registry, fs) = connect(&transport);
    let first = fs.open("/leased", OpenMode::WriteCreate).unwrap();

    let err = fs.open("/leased", OpenMode::WriteAppend).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Open);

    first.close().unwrap();
    fs.open("/leased", OpenMode::WriteAppend).unwrap().close().unwrap();
}

#[test]
fn test_append() {
    let transport = test_cluster();
    let (_registry, fs) = connect(&transport);
    write_file(&fs, "/log", b"hello,");

    let file = fs.open("/log", OpenMode::WriteAppend).unwrap();
    file.write_all(b" world!").unwrap();
    file.close().unwrap();

    assert_eq!(fs.path_info("/log").unwrap().size, 13);
    assert_eq!(read_file(&fs, "/log"), b"hello, world!");
}

#[test]
fn test_write_create_truncates() {
    let transport = test_cluster();
    let (_registry, fs) = connect(&transport);
    write_file(&fs, "/t", b"a much longer first version");
    write_file(&fs, "/t", b"short");
    assert_eq!(read_file(&fs, "/t"), b"short");
}

#[test]
fn test_open_file_with_hints() {
    let transport = test_cluster();
    let (_registry, fs) = connect(&transport);

    let file = fs
        .open_file("/hinted", OpenFlags::WRONLY | OpenFlags::CREATE, OpenHints::new(0, 2, 4))
        .unwrap();
    file.write_all(&sized_content(10)).unwrap();
    file.close().unwrap();

    let info = fs.path_info("/hinted").unwrap();
    assert_eq!(info.replication, 2);
    assert_eq!(info.block_size, 4);
    assert_eq!(fs.hosts("/hinted", 0, 10).unwrap().replica_counts(), vec![2, 2, 2]);
}

#[test]
fn test_out_of_range_hints_rejected_before_transport() {
    let transport = test_cluster();
    let (_registry, fs) = connect(&transport);
    fs.create_directory("/dir").unwrap();

    let calls = transport.call_count();
    for hints in [
        OpenHints::new(0, 40_000, 0),
        OpenHints::new(0, 0, u64::MAX),
        OpenHints::new(u32::MAX, 0, 0),
    ] {
        let err = fs
            .open_file("/dir/hinted", OpenFlags::WRONLY | OpenFlags::CREATE, hints)
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument, "{hints:?}");
        assert_eq!(err.context().path.as_deref(), Some("/dir/hinted"));
    }
    assert_eq!(transport.call_count(), calls);

    // Default hints go through the same check
    fs.set_default_hints(OpenHints::new(0, 40_000, 0));
    assert_eq!(
        fs.open("/dir/hinted", OpenMode::WriteCreate).unwrap_err().kind(),
        ErrorKind::InvalidArgument
    );

    // Nothing was created, so metadata and listings stay decodable
    assert!(!fs.exists("/dir/hinted").unwrap());
    assert!(fs.list_directory("/dir").unwrap().is_empty());
}

// ============================================================================
// Namespace
// ============================================================================

#[test]
fn test_exists() {
    let transport = test_cluster();
    let (_registry, fs) = connect(&transport);
    write_file(&fs, "/present", b"x");
    assert!(fs.exists("/present").unwrap());
    assert!(!fs.exists("/absent").unwrap());
}

#[test]
fn test_working_directory_is_per_handle() {
    let transport = test_cluster();
    let (_r1, fs) = connect(&transport);
    let (_r2, other) = connect(&transport);

    assert_eq!(fs.working_directory().unwrap(), "/");
    fs.create_directory("/user/alice").unwrap();
    fs.set_working_directory("/user/alice").unwrap();
    assert_eq!(fs.working_directory().unwrap(), "/user/alice");
    assert_eq!(other.working_directory().unwrap(), "/");

    write_file(&fs, "notes", b"relative");
    assert!(other.exists("/user/alice/notes").unwrap());
    assert_eq!(fs.path_info("../alice/notes").unwrap().size, 8);
}

#[test]
fn test_create_directory_creates_ancestors() {
    let transport = test_cluster();
    let (_registry, fs) = connect(&transport);
    fs.create_directory("/a/b/c").unwrap();
    assert!(fs.path_info("/a").unwrap().is_directory());
    assert!(fs.path_info("/a/b/c").unwrap().is_directory());
    // Already existing is fine
    fs.create_directory("/a/b").unwrap();
}

#[test]
fn test_rename_and_delete() {
    let transport = test_cluster();
    let (_registry, fs) = connect(&transport);
    fs.create_directory("/dir/sub").unwrap();
    write_file(&fs, "/dir/sub/f", b"data");

    fs.rename("/dir", "/renamed").unwrap();
    assert!(!fs.exists("/dir").unwrap());
    assert_eq!(read_file(&fs, "/renamed/sub/f"), b"data");

    fs.delete("/renamed").unwrap();
    assert!(!fs.exists("/renamed/sub/f").unwrap());
    assert_eq!(fs.delete("/renamed").unwrap_err().kind(), ErrorKind::Io);
}

#[test]
fn test_copy_and_move_on_one_cluster() {
    let transport = test_cluster();
    let (_r1, src) = connect(&transport);
    let (_r2, dst) = connect(&transport);
    write_file(&src, "/original", b"shared cluster");

    src.copy("/original", &dst, "/copied").unwrap();
    assert_eq!(read_file(&dst, "/copied"), b"shared cluster");
    assert!(src.exists("/original").unwrap());

    src.move_to("/original", &dst, "/moved").unwrap();
    assert!(!src.exists("/original").unwrap());
    assert_eq!(read_file(&dst, "/moved"), b"shared cluster");

    let err = src.copy("/moved", &dst, "/copied").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Io);
}

// ============================================================================
// Metadata
// ============================================================================

#[test]
fn test_path_info_not_found() {
    let transport = test_cluster();
    let (_registry, fs) = connect(&transport);
    let err = fs.path_info("/nope").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
    assert_eq!(err.context().path.as_deref(), Some("/nope"));
}

#[test]
fn test_list_empty_directory() {
    let transport = test_cluster();
    let (_registry, fs) = connect(&transport);
    fs.create_directory("/empty").unwrap();
    assert!(fs.list_directory("/empty").unwrap().is_empty());
}

#[test]
fn test_list_directory_entries() {
    let transport = test_cluster();
    let (_registry, fs) = connect(&transport);
    fs.create_directory("/data/nested").unwrap();
    write_file(&fs, "/data/a", b"12345");

    let entries = fs.list_directory("/data").unwrap();
    assert_eq!(entries.len(), 2);
    let file = entries.iter().find(|e| e.name == "/data/a").unwrap();
    assert_eq!(file.kind, EntryKind::File);
    assert_eq!(file.size, 5);
    assert_eq!(file.block_size, TEST_BLOCK_SIZE);
    let dir = entries.iter().find(|e| e.name == "/data/nested").unwrap();
    assert_eq!(dir.kind, EntryKind::Directory);
}

#[test]
fn test_owner_is_connecting_user() {
    let transport = test_cluster();
    let (_r1, alice) = connect_as(&transport, "alice");
    let (_r2, ambient) = connect(&transport);
    assert_eq!(alice.user(), Some("alice"));
    assert_eq!(ambient.user(), None);

    write_file(&alice, "/by-alice", b"a");
    write_file(&ambient, "/by-ambient", b"b");
    let info = alice.path_info("/by-alice").unwrap();
    assert_eq!(info.owner, "alice");
    assert_eq!(info.group, DEFAULT_GROUP);
    assert_eq!(ambient.path_info("/by-ambient").unwrap().owner, AMBIENT_USER);
}

#[test]
fn test_hosts_with_lost_replicas() {
    let transport = test_cluster();
    let (_registry, fs) = connect(&transport);
    write_file(&fs, "/ragged", &sized_content(2 * TEST_BLOCK_SIZE as usize));
    assert_eq!(fs.hosts("/ragged", 0, 16).unwrap().replica_counts(), vec![3, 3]);

    assert!(transport.drop_replica("/ragged", 1, "dn2"));
    assert!(transport.drop_replica("/ragged", 1, "dn3"));

    let map = fs.hosts("/ragged", 0, 16).unwrap();
    assert_eq!(map.replica_counts(), vec![3, 1]);
    assert_eq!(map.block(1).unwrap(), &["dn1".to_string()]);

    // Only the blocks overlapping the range
    assert_eq!(fs.hosts("/ragged", 9, 2).unwrap().replica_counts(), vec![1]);
}

#[test]
fn test_set_replication() {
    let transport = test_cluster();
    let (_registry, fs) = connect(&transport);
    write_file(&fs, "/r", &sized_content(12));

    fs.set_replication("/r", 1).unwrap();
    assert_eq!(fs.path_info("/r").unwrap().replication, 1);
    assert_eq!(fs.hosts("/r", 0, 12).unwrap().replica_counts(), vec![1, 1]);

    let err = fs.set_replication("/r", 40_000).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidArgument);
}

#[test]
fn test_statistics() {
    let transport = test_cluster();
    let (_registry, fs) = connect(&transport);
    assert_eq!(fs.default_block_size().unwrap(), TEST_BLOCK_SIZE);
    assert_eq!(fs.capacity().unwrap(), DEFAULT_CAPACITY as u64);
    assert_eq!(fs.used().unwrap(), 0);

    write_file(&fs, "/s", &sized_content(16));
    assert_eq!(fs.used().unwrap(), 48);

    transport.drop_replica("/s", 0, "dn1");
    assert_eq!(fs.used().unwrap(), 40);
}

// ============================================================================
// Attributes
// ============================================================================

#[test]
fn test_attribute_round_trip() {
    let transport = test_cluster();
    let (_registry, fs) = connect(&transport);
    write_file(&fs, "/attrs", b"x");

    fs.chown("/attrs", "root", "").unwrap();
    let info = fs.path_info("/attrs").unwrap();
    assert_eq!(info.owner, "root");
    assert_eq!(info.group, DEFAULT_GROUP);

    fs.chown("/attrs", "", "wheel").unwrap();
    let info = fs.path_info("/attrs").unwrap();
    assert_eq!(info.owner, "root");
    assert_eq!(info.group, "wheel");

    fs.chmod("/attrs", 0o666).unwrap();
    assert_eq!(fs.path_info("/attrs").unwrap().permissions, 0o666);

    let t1 = UNIX_EPOCH + Duration::from_secs(1_000_000_000);
    let t2 = UNIX_EPOCH + Duration::from_secs(1_100_000_000);
    fs.utime("/attrs", t1, t2).unwrap();
    let info = fs.path_info("/attrs").unwrap();
    assert_eq!(info.last_modified, t1);
    assert_eq!(info.last_access, t2);
}

#[test]
fn test_utime_unchanged_leaves_timestamp() {
    let transport = test_cluster();
    let (_registry, fs) = connect(&transport);
    write_file(&fs, "/times", b"x");

    let t1 = UNIX_EPOCH + Duration::from_secs(1_000_000_000);
    let t2 = UNIX_EPOCH + Duration::from_secs(1_200_000_000);
    fs.utime("/times", t1, t1).unwrap();
    fs.utime("/times", UTIME_UNCHANGED, t2).unwrap();

    let info = fs.path_info("/times").unwrap();
    assert_eq!(info.last_modified_secs(), 1_000_000_000);
    assert_eq!(info.last_access_secs(), 1_200_000_000);
}

#[test]
fn test_attributes_on_missing_path() {
    let transport = test_cluster();
    let (_registry, fs) = connect(&transport);
    assert_eq!(fs.chmod("/missing", 0o600).unwrap_err().kind(), ErrorKind::Io);
    assert_eq!(fs.chown("/missing", "root", "").unwrap_err().kind(), ErrorKind::Io);
}

// ============================================================================
// Transport quirks
// ============================================================================

#[test]
fn test_stale_status_on_success_is_ignored() {
    let transport = test_cluster();
    let (_registry, fs) = connect(&transport);
    transport.set_spurious_status(true);

    fs.create_directory("/quirky").unwrap();
    write_file(&fs, "/quirky/f", b"still fine");
    assert_eq!(read_file(&fs, "/quirky/f"), b"still fine");
    assert_eq!(fs.list_directory("/quirky").unwrap().len(), 1);
    assert!(fs.exists("/quirky/f").unwrap());
    assert_eq!(fs.used().unwrap(), 30);
    fs.disconnect().unwrap();
}

#[test]
fn test_short_reads_at_block_boundaries() {
    let transport = test_cluster();
    let (_registry, fs) = connect(&transport);
    write_file(&fs, "/blocks", &sized_content(20));

    let file = fs.open("/blocks", OpenMode::ReadOnly).unwrap();
    let mut buf = [0u8; 64];
    assert_eq!(file.read(&mut buf).unwrap(), 8);
    assert_eq!(file.read(&mut buf).unwrap(), 8);
    assert_eq!(file.read(&mut buf).unwrap(), 4);
    assert_eq!(file.read(&mut buf).unwrap(), 0);
    assert_eq!(file.pread(2, &mut buf).unwrap(), 18);
}
