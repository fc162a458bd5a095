//! Crash recovery: torn-batch detection and truncation.
//!
//! A batch is durable if and only if its trailer record is fully on disk
//! and both CRCs (the trailer's own and the batch CRC it carries) verify.
//! Recovery walks each segment batch by batch, promotes complete batches,
//! and truncates the file at the start of the first incomplete one. A
//! partially written batch is lost as a whole; the commit protocol never
//! acknowledged it.

use std::fs::{self, OpenOptions};
use std::path::Path;

use bytes::Bytes;

use breccia_crypto::crc32c;
use breccia_types::Event;

use crate::record::{decode, Record};
use crate::segment::OffsetTable;
use crate::{Result, StorageError};

/// Outcome of recovering one segment file.
#[derive(Debug)]
pub struct RecoveredSegment {
    /// First global position of the segment (from its filename).
    pub first_pos: u64,
    /// One past the last durable position in the segment.
    pub next_pos: u64,
    /// Segment size in bytes after any truncation.
    pub size_bytes: u64,
    /// Offset table rebuilt from the segment's trailers.
    pub table: OffsetTable,
    /// Byte offset the file was truncated at, if a torn batch was found.
    pub truncated_at: Option<u64>,
}

/// Recovers a single segment file.
///
/// Every durable event is passed to `on_event` in position order so the
/// caller can rebuild the stream index and idempotency index. I/O errors
/// are returned. Corruption is not an error here: it marks the torn-write
/// boundary and the file is truncated there.
pub fn recover_segment(
    path: &Path,
    first_pos: u64,
    on_event: &mut dyn FnMut(Event),
) -> Result<RecoveredSegment> {
    let data: Bytes = fs::read(path)?.into();

    let mut table = OffsetTable::new();
    let mut pos: usize = 0;
    // Start of the batch currently being accumulated; everything before it
    // is durable.
    let mut batch_start: usize = 0;
    let mut pending: Vec<(Event, u64)> = Vec::new();
    let mut next_pos = first_pos;
    let mut torn: Option<u64> = None;

    while pos < data.len() {
        match decode(&data.slice(pos..), pos as u64) {
            Ok((Record::Event(event), consumed)) => {
                pending.push((event, pos as u64));
                pos += consumed;
            }
            Ok((Record::Commit(commit), consumed)) => {
                let batch_bytes = &data[batch_start..pos];
                let trailer_ok = commit.batch_crc == crc32c(batch_bytes)
                    && commit.event_count == pending.len() as u64
                    && commit
                        .entries
                        .iter()
                        .zip(pending.iter())
                        .all(|(&(entry_pos, entry_off), (event, off))| {
                            entry_pos == event.global_pos && entry_off == *off
                        })
                    && pending
                        .last()
                        .is_some_and(|(event, _)| event.global_pos == commit.last_pos);

                if !trailer_ok {
                    torn = Some(batch_start as u64);
                    break;
                }

                for (event, offset) in pending.drain(..) {
                    assert_eq!(
                        event.global_pos.as_u64(),
                        next_pos,
                        "recovered positions must be contiguous"
                    );
                    table.append(offset);
                    next_pos += 1;
                    on_event(event);
                }
                pos += consumed;
                batch_start = pos;
            }
            Err(StorageError::Io(e)) => return Err(StorageError::Io(e)),
            Err(_) => {
                // Framing/CRC failure: the batch containing this byte range
                // never completed.
                torn = Some(batch_start as u64);
                break;
            }
        }
    }

    // EOF inside a batch (events present, trailer missing).
    if torn.is_none() && !pending.is_empty() {
        torn = Some(batch_start as u64);
    }

    let size_bytes = match torn {
        Some(at) if (at as usize) < data.len() => {
            tracing::warn!(
                segment = %path.display(),
                truncate_at = at,
                lost_bytes = data.len() as u64 - at,
                "torn batch found during recovery, truncating segment"
            );
            let file = OpenOptions::new().write(true).open(path)?;
            file.set_len(at)?;
            file.sync_all()?;
            at
        }
        _ => data.len() as u64,
    };

    Ok(RecoveredSegment {
        first_pos,
        next_pos,
        size_bytes,
        table,
        truncated_at: torn,
    })
}
