//! Entry record decoding.
//!
//! Transports return entry metadata as an array of fixed-layout records
//! whose length is reported separately. Decoding reads named fields by index
//! up to that count; it never scans for a terminator and never reinterprets
//! raw memory.

use crate::error::{DfsError, OpContext};

use super::{EntryInfo, EntryKind, seconds_to_system_time};

/// One native entry record, field for field.
///
/// Strings are raw bytes as the transport produced them; `None` models a
/// null string pointer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawEntryRecord {
    /// `b'F'` for files, `b'D'` for directories
    pub kind: u8,
    pub name: Option<Vec<u8>>,
    /// Seconds since the epoch
    pub last_mod: i64,
    pub size: i64,
    pub replication: i16,
    pub block_size: i64,
    pub owner: Option<Vec<u8>>,
    pub group: Option<Vec<u8>>,
    pub permissions: i16,
    /// Seconds since the epoch
    pub last_access: i64,
}

/// A directory listing as returned by the transport: records plus the
/// out-of-band entry count.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawEntryList {
    pub records: Vec<RawEntryRecord>,
    pub count: i32,
}

impl RawEntryList {
    /// A list whose count matches its records.
    pub fn new(records: Vec<RawEntryRecord>) -> Self {
        let count = i32::try_from(records.len()).unwrap_or(i32::MAX);
        Self { records, count }
    }
}

/// Decode a single record.
pub fn decode_entry(raw: &RawEntryRecord) -> Result<EntryInfo, DfsError> {
    let kind = EntryKind::from_byte(raw.kind)
        .ok_or_else(|| decode_error(format!("unknown entry kind byte 0x{:02x}", raw.kind)))?;

    let name = match raw.name.as_deref() {
        Some(bytes) => decode_string(bytes, "name")?,
        None => return Err(decode_error("entry has no name")),
    };

    Ok(EntryInfo {
        kind,
        name,
        size: non_negative(raw.size, "size")?,
        replication: non_negative_short(raw.replication, "replication")?,
        block_size: non_negative(raw.block_size, "block size")?,
        owner: decode_optional_string(raw.owner.as_deref(), "owner")?,
        group: decode_optional_string(raw.group.as_deref(), "group")?,
        permissions: non_negative_short(raw.permissions, "permissions")?,
        last_modified: seconds_to_system_time(raw.last_mod),
        last_access: seconds_to_system_time(raw.last_access),
    })
}

/// Decode the first `list.count` records.
///
/// The count is authoritative: a negative count or one larger than the
/// records supplied is a self-inconsistent structure. Records past the count
/// are ignored. The result is all-or-nothing.
pub fn decode_entries(list: &RawEntryList) -> Result<Vec<EntryInfo>, DfsError> {
    let count = usize::try_from(list.count)
        .map_err(|_| decode_error(format!("negative entry count {}", list.count)))?;

    if count > list.records.len() {
        return Err(decode_error(format!(
            "entry count {count} exceeds the {} records supplied",
            list.records.len()
        )));
    }

    list.records[..count]
        .iter()
        .enumerate()
        .map(|(index, raw)| {
            decode_entry(raw).map_err(|e| match e {
                DfsError::Decode { reason, context } => DfsError::Decode {
                    reason: format!("record {index}: {reason}"),
                    context,
                },
                other => other,
            })
        })
        .collect()
}

fn decode_string(bytes: &[u8], field: &str) -> Result<String, DfsError> {
    String::from_utf8(bytes.to_vec()).map_err(|e| decode_error(format!("{field} is not valid UTF-8: {e}")))
}

fn decode_optional_string(bytes: Option<&[u8]>, field: &str) -> Result<String, DfsError> {
    bytes.map_or_else(|| Ok(String::new()), |b| decode_string(b, field))
}

fn non_negative(value: i64, field: &str) -> Result<u64, DfsError> {
    u64::try_from(value).map_err(|_| decode_error(format!("negative {field}: {value}")))
}

fn non_negative_short(value: i16, field: &str) -> Result<u16, DfsError> {
    u16::try_from(value).map_err(|_| decode_error(format!("negative {field}: {value}")))
}

fn decode_error(reason: impl Into<String>) -> DfsError {
    DfsError::decode(reason, OpContext::for_operation("decode entry"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    fn record(name: &str) -> RawEntryRecord {
        RawEntryRecord {
            kind: b'F',
            name: Some(name.as_bytes().to_vec()),
            last_mod: 1_000,
            size: 13,
            replication: 3,
            block_size: 64 * 1024 * 1024,
            owner: Some(b"hdfs".to_vec()),
            group: Some(b"supergroup".to_vec()),
            permissions: 0o644,
            last_access: 2_000,
        }
    }

    #[test]
    fn test_decode_entry_fields() {
        let info = decode_entry(&record("/data/a.txt")).unwrap();
        assert_eq!(info.kind, EntryKind::File);
        assert_eq!(info.name, "/data/a.txt");
        assert_eq!(info.size, 13);
        assert_eq!(info.replication, 3);
        assert_eq!(info.owner, "hdfs");
        assert_eq!(info.permissions, 0o644);
        assert_eq!(info.last_modified_secs(), 1_000);
        assert_eq!(info.last_access_secs(), 2_000);
    }

    #[test]
    fn test_decode_entry_missing_owner_is_empty() {
        let mut raw = record("/a");
        raw.owner = None;
        raw.group = None;
        let info = decode_entry(&raw).unwrap();
        assert_eq!(info.owner, "");
        assert_eq!(info.group, "");
    }

    #[test]
    fn test_decode_entry_rejects_bad_records() {
        let mut raw = record("/a");
        raw.kind = b'?';
        assert_eq!(decode_entry(&raw).unwrap_err().kind(), ErrorKind::Decode);

        let mut raw = record("/a");
        raw.name = None;
        assert_eq!(decode_entry(&raw).unwrap_err().kind(), ErrorKind::Decode);

        let mut raw = record("/a");
        raw.size = -5;
        assert_eq!(decode_entry(&raw).unwrap_err().kind(), ErrorKind::Decode);

        let mut raw = record("/a");
        raw.name = Some(vec![0xff, 0xfe]);
        assert_eq!(decode_entry(&raw).unwrap_err().kind(), ErrorKind::Decode);
    }

    #[test]
    fn test_decode_entries_uses_count() {
        let mut list = RawEntryList::new(vec![record("/a"), record("/b"), record("/c")]);
        list.count = 2;
        let entries = decode_entries(&list).unwrap();
        let names: Vec<_> = entries.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["/a", "/b"]);
    }

    #[test]
    fn test_decode_entries_empty() {
        let entries = decode_entries(&RawEntryList::new(Vec::new())).unwrap();
        assert!(entries.is_empty());
    }

    #[test]
    fn test_decode_entries_inconsistent_count() {
        let mut list = RawEntryList::new(vec![record("/a")]);
        list.count = 4;
        assert_eq!(decode_entries(&list).unwrap_err().kind(), ErrorKind::Decode);

        list.count = -1;
        assert_eq!(decode_entries(&list).unwrap_err().kind(), ErrorKind::Decode);
    }

    #[test]
    fn test_decode_entries_is_all_or_nothing() {
        let mut bad = record("/b");
        bad.block_size = -1;
        let list = RawEntryList::new(vec![record("/a"), bad]);
        let err = decode_entries(&list).unwrap_err();
        assert!(err.to_string().contains("record 1"));
    }

    #[test]
    fn test_decoded_entry_outlives_raw() {
        let info = {
            let raw = record("/short-lived");
            decode_entry(&raw).unwrap()
        };
        assert_eq!(info.name, "/short-lived");
    }
}
