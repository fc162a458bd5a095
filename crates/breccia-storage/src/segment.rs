//! Segment metadata and per-segment offset tables.
//!
//! The log is a sequence of segments, each a single file named
//! `events-<first_global_pos>.seg`. Global positions are contiguous across
//! the store, so within one segment a record's position maps to an index in
//! a plain offset array — constant-time lookup with eight bytes per record.
//!
//! Offset tables live in memory only. They are rebuilt from segment trailers
//! during recovery, never persisted.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use breccia_types::GlobalPos;

/// Formats a segment filename from its first global position.
pub fn segment_file_name(first_pos: u64) -> String {
    format!("events-{first_pos:020}.seg")
}

/// Parses a segment filename back into its first global position.
pub fn parse_segment_file_name(name: &str) -> Option<u64> {
    let digits = name.strip_prefix("events-")?.strip_suffix(".seg")?;
    if digits.len() != 20 || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}

/// Maps in-segment record index → byte offset.
///
/// # Invariants
///
/// - `offsets[i]` is the byte offset where the segment's `i`-th event
///   record starts
/// - offsets are strictly increasing (append-only file)
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OffsetTable {
    offsets: Vec<u64>,
}

impl OffsetTable {
    /// Creates an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records the byte offset of the next event record.
    ///
    /// # Panics
    ///
    /// Debug builds panic if `offset` does not increase monotonically.
    pub fn append(&mut self, offset: u64) {
        debug_assert!(
            self.offsets.last().is_none_or(|&last| offset > last),
            "offset {offset} must be greater than last {:?}",
            self.offsets.last()
        );
        self.offsets.push(offset);
    }

    /// Looks up the byte offset of the `index`-th record in the segment.
    #[must_use]
    pub fn lookup(&self, index: u64) -> Option<u64> {
        self.offsets.get(index as usize).copied()
    }

    /// Number of indexed records.
    #[must_use]
    pub fn len(&self) -> usize {
        self.offsets.len()
    }

    /// Returns `true` if no records are indexed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.offsets.is_empty()
    }
}

/// Metadata for a single segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentMeta {
    /// First global position stored in this segment.
    pub first_pos: u64,
    /// One past the last global position in this segment. For the active
    /// segment this is the next position to be assigned.
    pub next_pos: u64,
    /// Size of the segment file in bytes.
    pub size_bytes: u64,
}

/// Where a record lives on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordLocation {
    /// First position of the owning segment (identifies the file).
    pub segment_first: u64,
    /// Path of the segment file.
    pub path: PathBuf,
    /// Byte offset of the record inside the segment.
    pub offset: u64,
}

/// The ordered set of segments plus their offset tables.
///
/// Shared between the single writer (which appends and rotates) and readers
/// (which take brief shared locks to resolve positions, then read segment
/// files without any lock; committed bytes are immutable).
#[derive(Debug)]
pub struct SegmentMap {
    dir: PathBuf,
    /// Segments in ascending `first_pos` order. Never empty after open.
    segments: Vec<SegmentMeta>,
    /// Offset tables keyed by `first_pos`.
    tables: HashMap<u64, OffsetTable>,
}

impl SegmentMap {
    /// Creates an empty map rooted at `dir`.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            segments: Vec::new(),
            tables: HashMap::new(),
        }
    }

    /// Returns the segment directory.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Returns the path of the segment starting at `first_pos`.
    pub fn segment_path(&self, first_pos: u64) -> PathBuf {
        self.dir.join(segment_file_name(first_pos))
    }

    /// Adds a recovered segment. Segments must be added in ascending order.
    pub fn push_segment(&mut self, meta: SegmentMeta, table: OffsetTable) {
        debug_assert!(
            self.segments.last().is_none_or(|s| s.next_pos == meta.first_pos),
            "segments must be contiguous"
        );
        debug_assert_eq!(
            meta.next_pos - meta.first_pos,
            table.len() as u64,
            "offset table must cover the segment"
        );
        self.tables.insert(meta.first_pos, table);
        self.segments.push(meta);
    }

    /// Returns the active (last) segment.
    pub fn active(&self) -> &SegmentMeta {
        self.segments.last().expect("segment map is never empty")
    }

    /// Returns the next global position to be assigned.
    pub fn next_pos(&self) -> u64 {
        self.active().next_pos
    }

    /// Finds the segment containing `pos`.
    pub fn find(&self, pos: GlobalPos) -> Option<&SegmentMeta> {
        let pos = pos.as_u64();
        match self
            .segments
            .binary_search_by_key(&pos, |s| s.first_pos)
        {
            Ok(idx) => Some(&self.segments[idx]),
            Err(0) => None,
            Err(idx) => {
                let seg = &self.segments[idx - 1];
                (pos < seg.next_pos).then_some(seg)
            }
        }
    }

    /// Resolves a position to its on-disk location.
    pub fn locate(&self, pos: GlobalPos) -> Option<RecordLocation> {
        let seg = self.find(pos)?;
        let table = self.tables.get(&seg.first_pos)?;
        let offset = table.lookup(pos.as_u64() - seg.first_pos)?;
        Some(RecordLocation {
            segment_first: seg.first_pos,
            path: self.segment_path(seg.first_pos),
            offset,
        })
    }

    /// Publishes a committed batch: extends the active offset table and
    /// advances the active segment metadata.
    ///
    /// Called strictly after the batch bytes are durable.
    pub fn publish_commit(&mut self, entries: &[(GlobalPos, u64)], new_size: u64) {
        let active = self.segments.last_mut().expect("segment map is never empty");
        let first = active.first_pos;
        let table = self.tables.get_mut(&first).expect("active table exists");

        for &(pos, offset) in entries {
            debug_assert_eq!(
                pos.as_u64(),
                first + table.len() as u64,
                "published positions must be contiguous"
            );
            table.append(offset);
        }
        if let Some(&(last, _)) = entries.last() {
            active.next_pos = last.as_u64() + 1;
        }
        active.size_bytes = new_size;
    }

    /// Starts a new active segment beginning at `first_pos`.
    pub fn rotate(&mut self, first_pos: u64) -> PathBuf {
        debug_assert_eq!(first_pos, self.next_pos(), "rotation must not skip positions");
        self.segments.push(SegmentMeta {
            first_pos,
            next_pos: first_pos,
            size_bytes: 0,
        });
        self.tables.insert(first_pos, OffsetTable::new());
        self.segment_path(first_pos)
    }

    /// Number of segments.
    pub fn segment_count(&self) -> usize {
        self.segments.len()
    }

    /// Iterates segment metadata in order.
    pub fn segments(&self) -> impl Iterator<Item = &SegmentMeta> {
        self.segments.iter()
    }
}
