//! Commit batch serialization.
//!
//! The writer serializes every command of a group-commit drain into one
//! contiguous buffer: each command's events followed by that command's
//! trailer record, then the whole buffer goes to disk with a single
//! `write` + `fsync`. Preparing the bytes up front keeps the file write a
//! straight `write_all` with no seeking and no partial frames.

use breccia_crypto::crc32c;
use breccia_types::{Event, GlobalPos, Timestamp};

use crate::record::{encode_commit, encode_event, CommitRecord};

/// Serialization buffer for one group-commit drain.
#[derive(Debug)]
pub struct CommitBuffer {
    buf: Vec<u8>,
    /// File offset at which `buf` will be written.
    base_offset: u64,
    default_capacity: usize,
}

impl CommitBuffer {
    /// Creates a buffer with the given initial capacity.
    pub fn new(default_capacity: usize) -> Self {
        Self {
            buf: Vec::with_capacity(default_capacity),
            base_offset: 0,
            default_capacity,
        }
    }

    /// Resets the buffer for a new drain landing at `base_offset`.
    pub fn begin(&mut self, base_offset: u64) {
        self.buf.clear();
        if self.buf.capacity() > self.default_capacity * 4 {
            // A huge batch shouldn't pin its peak allocation forever.
            self.buf = Vec::with_capacity(self.default_capacity);
        }
        self.base_offset = base_offset;
    }

    /// Serializes one command's events plus their trailer record.
    ///
    /// Returns the `(global_pos, absolute_file_offset)` entries of the
    /// batch's event records, in order.
    ///
    /// # Panics
    ///
    /// Panics if `events` is empty. Empty batches are a caller bug.
    pub fn push_batch(&mut self, events: &[Event], timestamp: Timestamp) -> Vec<(GlobalPos, u64)> {
        assert!(!events.is_empty(), "cannot serialize an empty batch");

        let batch_start = self.buf.len();
        let mut entries = Vec::with_capacity(events.len());

        for event in events {
            entries.push((event.global_pos, self.base_offset + self.buf.len() as u64));
            encode_event(event, &mut self.buf);
        }

        let batch_crc = crc32c(&self.buf[batch_start..]);
        let commit = CommitRecord {
            last_pos: events.last().expect("batch was non-empty").global_pos,
            event_count: events.len() as u64,
            batch_crc,
            entries: entries.clone(),
        };
        encode_commit(&commit, timestamp, &mut self.buf);

        entries
    }

    /// The serialized bytes of the drain so far.
    pub fn bytes(&self) -> &[u8] {
        &self.buf
    }

    /// Returns `true` if nothing has been serialized since `begin`.
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Number of serialized bytes.
    pub fn len(&self) -> usize {
        self.buf.len()
    }
}
