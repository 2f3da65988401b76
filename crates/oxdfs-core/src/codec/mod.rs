//! Decoding of transport metadata into owned values.
//!
//! The transport hands back metadata in native shapes:
//!
//! - [`entry`] - fixed-layout entry records with an out-of-band count
//! - [`hosts`] - block/replica host tables terminated at two independent levels
//!
//! Decoding deep-copies everything. No decoded value borrows from the raw
//! structures, which the transport is free to discard once the call returns.

pub mod entry;
pub mod hosts;

pub use entry::{RawEntryList, RawEntryRecord, decode_entries, decode_entry};
pub use hosts::{RawHostTable, decode_hosts};

use std::fmt;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// The type of a filesystem entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntryKind {
    File,
    Directory,
}

impl EntryKind {
    /// Native kind byte used in raw entry records.
    pub const FILE_BYTE: u8 = b'F';
    pub const DIRECTORY_BYTE: u8 = b'D';

    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            Self::FILE_BYTE => Some(EntryKind::File),
            Self::DIRECTORY_BYTE => Some(EntryKind::Directory),
            _ => None,
        }
    }

    pub fn as_byte(self) -> u8 {
        match self {
            EntryKind::File => Self::FILE_BYTE,
            EntryKind::Directory => Self::DIRECTORY_BYTE,
        }
    }
}

/// Immutable snapshot of one entry's metadata.
///
/// Never refreshed in place; query again for fresh values.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryInfo {
    /// File or directory
    pub kind: EntryKind,
    /// Entry name as reported by the transport (usually a full path or URI)
    pub name: String,
    /// Size in bytes
    pub size: u64,
    /// Replication factor
    pub replication: u16,
    /// Block size in bytes
    pub block_size: u64,
    /// Owning user
    pub owner: String,
    /// Owning group
    pub group: String,
    /// Permission bits
    pub permissions: u16,
    /// Last modification time (second granularity)
    pub last_modified: SystemTime,
    /// Last access time (second granularity)
    pub last_access: SystemTime,
}

impl EntryInfo {
    /// Returns `true` if this entry is a file.
    pub fn is_file(&self) -> bool {
        self.kind == EntryKind::File
    }

    /// Returns `true` if this entry is a directory.
    pub fn is_directory(&self) -> bool {
        self.kind == EntryKind::Directory
    }

    /// Last modification time as seconds since the epoch.
    pub fn last_modified_secs(&self) -> i64 {
        system_time_to_seconds(self.last_modified)
    }

    /// Last access time as seconds since the epoch.
    pub fn last_access_secs(&self) -> i64 {
        system_time_to_seconds(self.last_access)
    }
}

impl fmt::Display for EntryInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{:<12}:  {}", "Name", self.name)?;
        writeln!(f, "{:<12}:  {}", "Type", char::from(self.kind.as_byte()))?;
        writeln!(f, "{:<12}:  {}", "Replication", self.replication)?;
        writeln!(f, "{:<12}:  {}", "BlockSize", self.block_size)?;
        writeln!(f, "{:<12}:  {}", "Size", self.size)?;
        writeln!(f, "{:<12}:  {}", "LastMod", self.last_modified_secs())?;
        writeln!(f, "{:<12}:  {}", "LastAccess", self.last_access_secs())?;
        writeln!(f, "{:<12}:  {}", "Owner", self.owner)?;
        writeln!(f, "{:<12}:  {}", "Group", self.group)?;
        writeln!(f, "{:<12}:  {:o}", "Permissions", self.permissions)
    }
}

/// Replica hosts per block for a queried byte range.
///
/// Ragged by nature: each block carries its own replica list, and a block
/// with no live replicas has an empty list.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BlockHostMap {
    blocks: Vec<Vec<String>>,
}

impl BlockHostMap {
    pub fn new(blocks: Vec<Vec<String>>) -> Self {
        Self { blocks }
    }

    /// Number of blocks.
    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    /// Replica hosts of block `index`.
    pub fn block(&self, index: usize) -> Option<&[String]> {
        self.blocks.get(index).map(Vec::as_slice)
    }

    pub fn iter(&self) -> impl Iterator<Item = &[String]> {
        self.blocks.iter().map(Vec::as_slice)
    }

    /// Replica count of every block, in block order.
    pub fn replica_counts(&self) -> Vec<usize> {
        self.blocks.iter().map(Vec::len).collect()
    }

    pub fn into_inner(self) -> Vec<Vec<String>> {
        self.blocks
    }
}

impl From<Vec<Vec<String>>> for BlockHostMap {
    fn from(blocks: Vec<Vec<String>>) -> Self {
        Self::new(blocks)
    }
}

/// Convert transport seconds to a `SystemTime`. Negative values predate the epoch.
pub fn seconds_to_system_time(secs: i64) -> SystemTime {
    if secs >= 0 {
        UNIX_EPOCH + Duration::from_secs(secs.unsigned_abs())
    } else {
        UNIX_EPOCH - Duration::from_secs(secs.unsigned_abs())
    }
}

/// Convert a `SystemTime` to whole seconds since the epoch (truncating).
pub fn system_time_to_seconds(time: SystemTime) -> i64 {
    match time.duration_since(UNIX_EPOCH) {
        Ok(after) => i64::try_from(after.as_secs()).unwrap_or(i64::MAX),
        Err(before) => {
            let secs = before.duration().as_secs();
            // Round toward negative infinity so sub-second offsets stay consistent
            let whole = i64::try_from(secs).unwrap_or(i64::MAX);
            if before.duration().subsec_nanos() > 0 {
                -whole - 1
            } else {
                -whole
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entry_kind_bytes() {
        assert_eq!(EntryKind::from_byte(b'F'), Some(EntryKind::File));
        assert_eq!(EntryKind::from_byte(b'D'), Some(EntryKind::Directory));
        assert_eq!(EntryKind::from_byte(b'L'), None);
        assert_eq!(EntryKind::Directory.as_byte(), b'D');
    }

    #[test]
    fn test_seconds_conversion() {
        assert_eq!(system_time_to_seconds(seconds_to_system_time(0)), 0);
        assert_eq!(system_time_to_seconds(seconds_to_system_time(1_700_000_000)), 1_700_000_000);
        assert_eq!(system_time_to_seconds(seconds_to_system_time(-86_400)), -86_400);
    }

    #[test]
    fn test_block_host_map_accessors() {
        let map = BlockHostMap::from(vec![
            vec!["dn1".to_string(), "dn2".to_string()],
            vec![],
        ]);
        assert_eq!(map.len(), 2);
        assert_eq!(map.replica_counts(), vec![2, 0]);
        assert_eq!(map.block(1), Some(&[][..]));
        assert!(map.block(2).is_none());
    }

    #[test]
    fn test_entry_display_contains_fields() {
        let info = EntryInfo {
            kind: EntryKind::File,
            name: "/tmp/a.txt".to_string(),
            size: 13,
            replication: 3,
            block_size: 1024,
            owner: "root".to_string(),
            group: "supergroup".to_string(),
            permissions: 0o644,
            last_modified: seconds_to_system_time(10),
            last_access: seconds_to_system_time(20),
        };
        let rendered = info.to_string();
        assert!(rendered.contains("/tmp/a.txt"));
        assert!(rendered.contains("Type        :  F"));
        assert!(rendered.contains("644"));
        assert!(info.is_file());
        assert!(!info.is_directory());
    }
}
