//! Block host table decoding.
//!
//! The native shape is an array of blocks, each an array of hostnames, with
//! a null terminator at both levels. Rows are independent: block 0 may have
//! three replicas and block 1 just one. Lengths are therefore discovered in
//! two phases, the outer count first and then each row's own count. No row
//! length is ever reused for another row.

use crate::error::{DfsError, OpContext};

use super::BlockHostMap;

/// A raw host table, terminators included.
///
/// `None` at the outer level ends the block list; `None` inside a row ends
/// that row's host list. Anything after a terminator is ignored.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawHostTable {
    pub rows: Vec<Option<Vec<Option<Vec<u8>>>>>,
}

impl RawHostTable {
    /// Build a properly terminated table from per-block host lists.
    pub fn from_blocks<S: AsRef<str>>(blocks: &[Vec<S>]) -> Self {
        let mut rows: Vec<Option<Vec<Option<Vec<u8>>>>> = blocks
            .iter()
            .map(|hosts| {
                let mut row: Vec<Option<Vec<u8>>> =
                    hosts.iter().map(|h| Some(h.as_ref().as_bytes().to_vec())).collect();
                row.push(None);
                Some(row)
            })
            .collect();
        rows.push(None);
        Self { rows }
    }
}

/// Decode a raw host table into an owned, ragged [`BlockHostMap`].
///
/// A missing terminator at either level means the table cannot be read
/// safely and is reported as a decode error rather than truncated.
pub fn decode_hosts(raw: &RawHostTable) -> Result<BlockHostMap, DfsError> {
    // Phase 1: block count from the outer terminator
    let block_count = terminated_len(&raw.rows)
        .ok_or_else(|| decode_error("block list has no terminator"))?;

    let mut blocks = Vec::with_capacity(block_count);
    for (index, row) in raw.rows.iter().map_while(Option::as_ref).enumerate() {
        // Phase 2: this row's own replica count
        let replica_count = terminated_len(row)
            .ok_or_else(|| decode_error(format!("host list of block {index} has no terminator")))?;

        let mut hosts = Vec::with_capacity(replica_count);
        for host in row.iter().map_while(Option::as_ref) {
            let host = String::from_utf8(host.clone())
                .map_err(|e| decode_error(format!("host name in block {index} is not valid UTF-8: {e}")))?;
            hosts.push(host);
        }
        blocks.push(hosts);
    }

    Ok(BlockHostMap::new(blocks))
}

/// Position of the first terminator.
fn terminated_len<T>(items: &[Option<T>]) -> Option<usize> {
    items.iter().position(Option::is_none)
}

fn decode_error(reason: impl Into<String>) -> DfsError {
    DfsError::decode(reason, OpContext::for_operation("decode hosts"))
}
