//! Record framing for the append-only log.
//!
//! Two kinds of records share one frame: event records (the payload-bearing
//! unit of the store) and commit records (the batch trailer that makes a
//! group of events atomic). All integers are little-endian; a CRC32-C over
//! every preceding byte of the record closes the frame.
//!
//! # Record Format
//!
//! ```text
//! magic(2B) | flags(1B) | reserved(1B) | length(4B) |
//! global_pos(8B) | stream_rev(8B) | timestamp_ms(8B) |
//! stream_id_len(2B) | tenant_id_len(2B) | command_id_len(2B) | payload_len(4B) |
//! stream_id | tenant_id | command_id | payload |
//! crc32c(4B)
//! ```
//!
//! `length` counts everything after itself (from `global_pos` through the
//! trailing CRC), so a scanner can hop records from the 8-byte prefix alone.
//!
//! A commit record reuses the frame with empty identifiers: `global_pos`
//! holds the batch's last position, `stream_rev` the batch's event count,
//! and the payload carries `batch_crc32c | entry_count | (global_pos,
//! file_offset)*` — the offset index entries since the previous trailer.

use bytes::Bytes;

use breccia_crypto::crc32c;
use breccia_types::{
    CommandId, Event, GlobalPos, StreamId, StreamRev, TenantId, Timestamp,
};

use crate::StorageError;

/// Magic bytes opening every record.
pub const MAGIC: [u8; 2] = [0xB5, 0xEC];

/// Flag bit marking a commit (batch trailer) record.
const FLAG_COMMIT: u8 = 0b0000_0001;

/// Prefix size: magic(2) + flags(1) + reserved(1) + length(4).
pub const PREFIX_SIZE: usize = 8;

/// Fixed field block: global_pos(8) + stream_rev(8) + timestamp(8) +
/// three id lengths(2 each) + payload_len(4).
const FIXED_SIZE: usize = 34;

const CRC_SIZE: usize = 4;

/// Total framing overhead of a record with empty ids and payload.
pub const RECORD_OVERHEAD: usize = PREFIX_SIZE + FIXED_SIZE + CRC_SIZE;

/// Size of one offset-index entry in a commit record's payload.
const ENTRY_SIZE: usize = 16;

/// A decoded record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Record {
    /// A stored event.
    Event(Event),
    /// A batch trailer closing the preceding run of event records.
    Commit(CommitRecord),
}

/// The batch trailer: closes a batch and indexes its records.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitRecord {
    /// Last global position of the batch.
    pub last_pos: GlobalPos,
    /// Number of event records in the batch.
    pub event_count: u64,
    /// CRC32-C over every byte of the batch's event records.
    pub batch_crc: u32,
    /// `(global_pos, file_offset)` for each event record of the batch.
    pub entries: Vec<(GlobalPos, u64)>,
}

fn put_u16(buf: &mut Vec<u8>, v: u16) {
    buf.extend_from_slice(&v.to_le_bytes());
}

fn put_u32(buf: &mut Vec<u8>, v: u32) {
    buf.extend_from_slice(&v.to_le_bytes());
}

fn put_u64(buf: &mut Vec<u8>, v: u64) {
    buf.extend_from_slice(&v.to_le_bytes());
}

fn frame(
    buf: &mut Vec<u8>,
    flags: u8,
    global_pos: u64,
    stream_rev: u64,
    timestamp_ms: u64,
    stream_id: &[u8],
    tenant_id: &[u8],
    command_id: &[u8],
    payload: &[u8],
) {
    let var_len = stream_id.len() + tenant_id.len() + command_id.len() + payload.len();
    let length = (FIXED_SIZE + var_len + CRC_SIZE) as u32;

    let start = buf.len();
    buf.reserve(PREFIX_SIZE + length as usize);

    buf.extend_from_slice(&MAGIC);
    buf.push(flags);
    buf.push(0); // reserved
    put_u32(buf, length);
    put_u64(buf, global_pos);
    put_u64(buf, stream_rev);
    put_u64(buf, timestamp_ms);
    put_u16(buf, stream_id.len() as u16);
    put_u16(buf, tenant_id.len() as u16);
    put_u16(buf, command_id.len() as u16);
    put_u32(buf, payload.len() as u32);
    buf.extend_from_slice(stream_id);
    buf.extend_from_slice(tenant_id);
    buf.extend_from_slice(command_id);
    buf.extend_from_slice(payload);

    let crc = crc32c(&buf[start..]);
    put_u32(buf, crc);
}

/// Serializes an event record onto `buf`.
pub fn encode_event(event: &Event, buf: &mut Vec<u8>) {
    frame(
        buf,
        0,
        event.global_pos.as_u64(),
        event.stream_rev.as_u64(),
        event.timestamp.as_millis(),
        event.stream_id.as_str().as_bytes(),
        event.tenant_id.as_str().as_bytes(),
        event.command_id.as_str().as_bytes(),
        &event.payload,
    );
}

/// Serializes a commit record onto `buf`.
pub fn encode_commit(commit: &CommitRecord, timestamp: Timestamp, buf: &mut Vec<u8>) {
    debug_assert_eq!(
        commit.entries.len() as u64,
        commit.event_count,
        "trailer entries must cover the batch"
    );

    let mut payload = Vec::with_capacity(8 + commit.entries.len() * ENTRY_SIZE);
    payload.extend_from_slice(&commit.batch_crc.to_le_bytes());
    payload.extend_from_slice(&(commit.entries.len() as u32).to_le_bytes());
    for (pos, offset) in &commit.entries {
        payload.extend_from_slice(&pos.as_u64().to_le_bytes());
        payload.extend_from_slice(&offset.to_le_bytes());
    }

    frame(
        buf,
        FLAG_COMMIT,
        commit.last_pos.as_u64(),
        commit.event_count,
        timestamp.as_millis(),
        b"",
        b"",
        b"",
        &payload,
    );
}

/// Returns the total on-disk size of the record starting at the head of
/// `data`, if a complete prefix is present.
pub fn frame_size(data: &[u8]) -> Option<usize> {
    if data.len() < PREFIX_SIZE {
        return None;
    }
    let length = u32::from_le_bytes(data[4..8].try_into().expect("4-byte slice")) as usize;
    Some(PREFIX_SIZE + length)
}

/// Decodes the record at the head of `data`.
///
/// Returns the record and the number of bytes consumed. The payload is a
/// zero-copy slice of `data`. `base_offset` is the file offset of the head
/// byte, used only for error context.
///
/// # Errors
///
/// - [`StorageError::UnexpectedEof`] if `data` ends mid-record
/// - [`StorageError::InvalidMagic`] if the frame doesn't open with magic
/// - [`StorageError::UnsupportedFlags`] for unknown flag bits
/// - [`StorageError::ChecksumMismatch`] if the CRC32-C fails
/// - [`StorageError::InvalidUtf8`] if an identifier is not UTF-8
pub fn decode(data: &Bytes, base_offset: u64) -> Result<(Record, usize), StorageError> {
    if data.len() < PREFIX_SIZE {
        return Err(StorageError::UnexpectedEof);
    }
    if data[0..2] != MAGIC {
        return Err(StorageError::InvalidMagic {
            offset: base_offset,
        });
    }
    let flags = data[2];
    if flags & !FLAG_COMMIT != 0 {
        return Err(StorageError::UnsupportedFlags {
            flags,
            offset: base_offset,
        });
    }

    let length = u32::from_le_bytes(data[4..8].try_into().expect("4-byte slice")) as usize;
    if length < FIXED_SIZE + CRC_SIZE {
        return Err(StorageError::UnexpectedEof);
    }
    let total = PREFIX_SIZE + length;
    if data.len() < total {
        return Err(StorageError::UnexpectedEof);
    }

    // Verify the CRC before trusting any field.
    let crc_offset = total - CRC_SIZE;
    let stored_crc = u32::from_le_bytes(
        data[crc_offset..total].try_into().expect("4-byte slice"),
    );
    if crc32c(&data[..crc_offset]) != stored_crc {
        return Err(StorageError::ChecksumMismatch {
            offset: base_offset,
        });
    }

    let global_pos = u64::from_le_bytes(data[8..16].try_into().expect("8-byte slice"));
    let stream_rev = u64::from_le_bytes(data[16..24].try_into().expect("8-byte slice"));
    let timestamp_ms = u64::from_le_bytes(data[24..32].try_into().expect("8-byte slice"));
    let stream_id_len =
        u16::from_le_bytes(data[32..34].try_into().expect("2-byte slice")) as usize;
    let tenant_id_len =
        u16::from_le_bytes(data[34..36].try_into().expect("2-byte slice")) as usize;
    let command_id_len =
        u16::from_le_bytes(data[36..38].try_into().expect("2-byte slice")) as usize;
    let payload_len =
        u32::from_le_bytes(data[38..42].try_into().expect("4-byte slice")) as usize;

    let var_len = stream_id_len + tenant_id_len + command_id_len + payload_len;
    if PREFIX_SIZE + FIXED_SIZE + var_len + CRC_SIZE != total {
        // CRC passed but lengths disagree with the frame: reject rather
        // than read out of bounds.
        return Err(StorageError::ChecksumMismatch {
            offset: base_offset,
        });
    }

    let ids_start = PREFIX_SIZE + FIXED_SIZE;
    let id_str = |from: usize, len: usize| -> Result<&str, StorageError> {
        std::str::from_utf8(&data[from..from + len]).map_err(|_| StorageError::InvalidUtf8 {
            offset: base_offset,
        })
    };

    if flags & FLAG_COMMIT != 0 {
        let payload_start = ids_start + var_len - payload_len;
        let payload = &data[payload_start..payload_start + payload_len];
        let commit = decode_commit_payload(global_pos, stream_rev, payload, base_offset)?;
        return Ok((Record::Commit(commit), total));
    }

    let stream_id = id_str(ids_start, stream_id_len)?;
    let tenant_id = id_str(ids_start + stream_id_len, tenant_id_len)?;
    let command_id = id_str(ids_start + stream_id_len + tenant_id_len, command_id_len)?;
    let payload_start = ids_start + stream_id_len + tenant_id_len + command_id_len;

    // CRC verified: positions written by the log are never zero.
    assert!(global_pos > 0, "event record with zero global position");
    assert!(stream_rev > 0, "event record with zero stream revision");

    let event = Event {
        global_pos: GlobalPos::new(global_pos),
        stream_id: StreamId::new(stream_id),
        stream_rev: StreamRev::new(stream_rev),
        tenant_id: TenantId::new(tenant_id),
        command_id: CommandId::new(command_id),
        timestamp: Timestamp::from_millis(timestamp_ms),
        payload: data.slice(payload_start..payload_start + payload_len),
    };

    Ok((Record::Event(event), total))
}

fn decode_commit_payload(
    global_pos: u64,
    stream_rev: u64,
    payload: &[u8],
    base_offset: u64,
) -> Result<CommitRecord, StorageError> {
    if payload.len() < 8 {
        return Err(StorageError::TrailerMismatch {
            offset: base_offset,
        });
    }
    let batch_crc = u32::from_le_bytes(payload[0..4].try_into().expect("4-byte slice"));
    let entry_count =
        u32::from_le_bytes(payload[4..8].try_into().expect("4-byte slice")) as usize;

    if payload.len() != 8 + entry_count * ENTRY_SIZE || entry_count as u64 != stream_rev {
        return Err(StorageError::TrailerMismatch {
            offset: base_offset,
        });
    }

    let mut entries = Vec::with_capacity(entry_count);
    for i in 0..entry_count {
        let at = 8 + i * ENTRY_SIZE;
        let pos = u64::from_le_bytes(payload[at..at + 8].try_into().expect("8-byte slice"));
        let offset =
            u64::from_le_bytes(payload[at + 8..at + 16].try_into().expect("8-byte slice"));
        if pos == 0 {
            return Err(StorageError::TrailerMismatch {
                offset: base_offset,
            });
        }
        entries.push((GlobalPos::new(pos), offset));
    }

    assert!(global_pos > 0, "commit record with zero position");

    Ok(CommitRecord {
        last_pos: GlobalPos::new(global_pos),
        event_count: entry_count as u64,
        batch_crc,
        entries,
    })
}
