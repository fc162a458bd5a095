//! Table file format: manifest header plus CRC-framed journal.
//!
//! # File layout
//!
//! ```text
//! ┌───────────────────────────────────────────────────────┐
//! │  Offset  │  Size  │  Description                      │
//! ├───────────────────────────────────────────────────────┤
//! │  0       │  4     │  Magic bytes: "BRTB"              │
//! │  4       │  1     │  Version: 0x01                    │
//! │  5       │  3     │  Reserved (zero padding)          │
//! │  8       │  4     │  Manifest JSON length (u32 LE)    │
//! │  12      │  N     │  Manifest JSON (name + schema)    │
//! │  12+N    │  4     │  CRC32-C of bytes 0..(12+N)       │
//! ├───────────────────────────────────────────────────────┤
//! │  journal entries, each:                               │
//! │    length(4B) | entry JSON | crc32c(4B)               │
//! └───────────────────────────────────────────────────────┘
//! ```
//!
//! The journal tail follows the same discipline as the event log: replay
//! stops at the first framing or CRC failure and truncates the file there,
//! so an entry (ops plus checkpoint) is all-or-nothing.

use std::fs::File;
use std::io::Write;

use serde::{Deserialize, Serialize};

use breccia_crypto::crc32c;
use breccia_types::{GlobalPos, TenantId};

use crate::table::TableOp;
use crate::value::{Row, Schema, Value};
use crate::{Result, StoreError};

const MAGIC: &[u8; 4] = b"BRTB";
const VERSION: u8 = 0x01;
const HEADER_SIZE: usize = 12;
const CRC_SIZE: usize = 4;
const LEN_SIZE: usize = 4;

/// Manifest at the head of every table file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    /// Projection name (must match the file name).
    pub name: String,
    /// The registered schema.
    pub schema: Schema,
}

/// One atomic journal entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JournalEntry {
    /// A projection batch: ops grouped by tenant plus the checkpoint they
    /// advance to. This is the exactly-once unit.
    Batch {
        checkpoint: GlobalPos,
        groups: Vec<(TenantId, Vec<TableOp>)>,
    },
    /// Erasure of every row of one tenant. Does not move the checkpoint.
    Purge { tenant_id: TenantId },
    /// Compaction snapshot: the full state at a point in time. Always the
    /// first entry after the manifest in a compacted file.
    Snapshot {
        checkpoint: Option<GlobalPos>,
        rows: Vec<(TenantId, Value, Row)>,
    },
}

/// Serializes the manifest header into `buf`.
pub fn encode_manifest(manifest: &Manifest, buf: &mut Vec<u8>) {
    let json = serde_json::to_vec(manifest).expect("manifest serializes");
    buf.extend_from_slice(MAGIC);
    buf.push(VERSION);
    buf.extend_from_slice(&[0u8; 3]);
    buf.extend_from_slice(&(json.len() as u32).to_le_bytes());
    buf.extend_from_slice(&json);
    let crc = crc32c(buf);
    buf.extend_from_slice(&crc.to_le_bytes());
}

/// Reads the manifest at the head of `data`.
///
/// Returns the manifest and the offset of the first journal entry.
pub fn decode_manifest(table: &str, data: &[u8]) -> Result<(Manifest, usize)> {
    let corrupted = |offset: u64| StoreError::Corrupted {
        table: table.to_string(),
        offset,
    };

    if data.len() < HEADER_SIZE + CRC_SIZE || &data[0..4] != MAGIC {
        return Err(corrupted(0));
    }
    if data[4] != VERSION {
        return Err(corrupted(4));
    }
    let json_len = u32::from_le_bytes(data[8..12].try_into().expect("4-byte slice")) as usize;
    let total = HEADER_SIZE + json_len + CRC_SIZE;
    if data.len() < total {
        return Err(corrupted(0));
    }

    let stored_crc = u32::from_le_bytes(
        data[total - CRC_SIZE..total].try_into().expect("4-byte slice"),
    );
    if crc32c(&data[..total - CRC_SIZE]) != stored_crc {
        return Err(corrupted(0));
    }

    let manifest: Manifest = serde_json::from_slice(&data[HEADER_SIZE..HEADER_SIZE + json_len])
        .map_err(|_| corrupted(HEADER_SIZE as u64))?;
    Ok((manifest, total))
}

/// Serializes one journal entry onto `buf`.
pub fn encode_entry(entry: &JournalEntry, buf: &mut Vec<u8>) {
    let json = serde_json::to_vec(entry).expect("journal entry serializes");
    let start = buf.len();
    buf.extend_from_slice(&(json.len() as u32).to_le_bytes());
    buf.extend_from_slice(&json);
    let crc = crc32c(&buf[start..]);
    buf.extend_from_slice(&crc.to_le_bytes());
}

/// Appends an entry to the journal file and makes it durable.
pub fn append_entry(file: &mut File, entry: &JournalEntry) -> Result<()> {
    let mut buf = Vec::new();
    encode_entry(entry, &mut buf);
    file.write_all(&buf)?;
    file.sync_all()?;
    Ok(())
}

/// Replays journal entries from `data[from..]`.
///
/// Returns the decoded entries and the durable length of the file. A torn
/// or corrupt tail shows up as a durable length shorter than `data.len()`;
/// the caller truncates.
pub fn replay(data: &[u8], from: usize) -> (Vec<JournalEntry>, usize) {
    let mut entries = Vec::new();
    let mut at = from;

    while at < data.len() {
        let Some(entry_and_len) = decode_entry_at(data, at) else {
            break;
        };
        let (entry, consumed) = entry_and_len;
        entries.push(entry);
        at += consumed;
    }

    (entries, at)
}

fn decode_entry_at(data: &[u8], at: usize) -> Option<(JournalEntry, usize)> {
    if data.len() - at < LEN_SIZE + CRC_SIZE {
        return None;
    }
    let json_len =
        u32::from_le_bytes(data[at..at + LEN_SIZE].try_into().expect("4-byte slice")) as usize;
    let total = LEN_SIZE + json_len + CRC_SIZE;
    if data.len() - at < total {
        return None;
    }

    let crc_at = at + LEN_SIZE + json_len;
    let stored_crc = u32::from_le_bytes(
        data[crc_at..crc_at + CRC_SIZE]
            .try_into()
            .expect("4-byte slice"),
    );
    if crc32c(&data[at..crc_at]) != stored_crc {
        return None;
    }

    let entry: JournalEntry =
        serde_json::from_slice(&data[at + LEN_SIZE..crc_at]).ok()?;
    Some((entry, total))
}
