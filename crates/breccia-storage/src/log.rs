//! The durable event log: writer handle and read handle.
//!
//! [`EventLog`] is owned by the single writer; it appends serialized commit
//! buffers, fsyncs, publishes offsets, and rotates segments past the size
//! cap. [`LogReader`] is a cheap clone handed to readers and projection
//! workers: it resolves positions under a brief shared lock, then reads
//! segment files with no lock held; bytes at published positions are
//! immutable.

use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use bytes::Bytes;

use breccia_types::{Event, GlobalPos};

use crate::record::{self, Record};
use crate::recovery::recover_segment;
use crate::segment::{
    parse_segment_file_name, OffsetTable, RecordLocation, SegmentMap, SegmentMeta,
};
use crate::{Result, StorageError, DEFAULT_MAX_SEGMENT_BYTES};

/// Tuning knobs for the log.
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Segment size cap; a segment that grows past this rolls over.
    pub max_segment_bytes: u64,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            max_segment_bytes: DEFAULT_MAX_SEGMENT_BYTES,
        }
    }
}

/// Writer half of the log. Exactly one exists per store.
#[derive(Debug)]
pub struct EventLog {
    map: Arc<RwLock<SegmentMap>>,
    /// Handle to the active segment, opened for append.
    active: File,
    /// Cached size of the active segment (authoritative between appends).
    active_size: u64,
    config: LogConfig,
}

impl EventLog {
    /// Opens the log under `dir`, running crash recovery on every segment.
    ///
    /// Each durable event is replayed to `on_event` in global order so the
    /// caller can rebuild its in-memory indexes. Creates the directory and
    /// the first segment if the log is empty.
    pub fn open(
        dir: impl Into<PathBuf>,
        config: LogConfig,
        on_event: &mut dyn FnMut(Event),
    ) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;

        let mut firsts: Vec<u64> = fs::read_dir(&dir)?
            .filter_map(|entry| {
                let entry = entry.ok()?;
                let name = entry.file_name();
                parse_segment_file_name(name.to_str()?)
            })
            .collect();
        firsts.sort_unstable();

        let mut map = SegmentMap::new(&dir);

        if firsts.is_empty() {
            let path = dir.join(crate::segment::segment_file_name(1));
            File::create(&path)?.sync_all()?;
            sync_dir(&dir)?;
            map.push_segment(
                SegmentMeta {
                    first_pos: 1,
                    next_pos: 1,
                    size_bytes: 0,
                },
                OffsetTable::new(),
            );
        } else {
            let mut expected_first = firsts[0];
            if expected_first != 1 {
                return Err(StorageError::Corrupted {
                    segment: expected_first,
                    offset: 0,
                });
            }
            let count = firsts.len();
            for (idx, first_pos) in firsts.into_iter().enumerate() {
                if first_pos != expected_first {
                    return Err(StorageError::Corrupted {
                        segment: first_pos,
                        offset: 0,
                    });
                }
                let path = map.segment_path(first_pos);
                let recovered = recover_segment(&path, first_pos, on_event)?;
                if recovered.truncated_at.is_some() && idx + 1 != count {
                    // A torn batch in a non-final segment means the tail
                    // segments were written after corruption — refuse.
                    return Err(StorageError::Corrupted {
                        segment: first_pos,
                        offset: recovered.truncated_at.unwrap_or(0),
                    });
                }
                expected_first = recovered.next_pos;
                map.push_segment(
                    SegmentMeta {
                        first_pos,
                        next_pos: recovered.next_pos,
                        size_bytes: recovered.size_bytes,
                    },
                    recovered.table,
                );
            }
        }

        let active_meta = *map.active();
        let active_path = map.segment_path(active_meta.first_pos);
        let active = OpenOptions::new().append(true).open(&active_path)?;

        tracing::info!(
            dir = %dir.display(),
            segments = map.segment_count(),
            next_pos = map.next_pos(),
            "event log opened"
        );

        Ok(Self {
            map: Arc::new(RwLock::new(map)),
            active,
            active_size: active_meta.size_bytes,
            config,
        })
    }

    /// Returns a read handle sharing this log's segment map.
    pub fn reader(&self) -> LogReader {
        LogReader {
            map: Arc::clone(&self.map),
        }
    }

    /// Next global position the log will assign.
    pub fn next_pos(&self) -> u64 {
        self.map.read().expect("segment map lock poisoned").next_pos()
    }

    /// File offset at which the next commit buffer will land.
    pub fn base_offset(&self) -> u64 {
        self.active_size
    }

    /// Appends a serialized drain and makes it durable.
    ///
    /// `entries` are the `(position, absolute_offset)` pairs of every event
    /// record in `data`, in order. The segment map — and therefore every
    /// reader — only observes the new records after `fsync` has returned.
    /// Rotation to a fresh segment happens after publishing, once the
    /// active segment exceeds the size cap.
    pub fn append(&mut self, data: &[u8], entries: &[(GlobalPos, u64)]) -> Result<()> {
        debug_assert!(!data.is_empty(), "cannot append an empty drain");

        self.active.write_all(data)?;
        self.active.sync_all()?;

        self.active_size += data.len() as u64;
        {
            let mut map = self.map.write().expect("segment map lock poisoned");
            map.publish_commit(entries, self.active_size);
        }

        if self.active_size >= self.config.max_segment_bytes {
            self.rotate()?;
        }

        Ok(())
    }

    /// Closes the active segment and starts a new one.
    fn rotate(&mut self) -> Result<()> {
        // The old segment is already durable; just switch files.
        let (old_first, path, next_pos) = {
            let mut map = self.map.write().expect("segment map lock poisoned");
            let old_first = map.active().first_pos;
            let next_pos = map.next_pos();
            let path = map.rotate(next_pos);
            (old_first, path, next_pos)
        };

        let file = File::create(&path)?;
        file.sync_all()?;
        if let Some(parent) = path.parent() {
            sync_dir(parent)?;
        }
        self.active = OpenOptions::new().append(true).open(&path)?;
        self.active_size = 0;

        tracing::info!(
            old_segment = old_first,
            new_segment = next_pos,
            "rotated segment"
        );
        Ok(())
    }
}

/// Read half of the log. Cloneable; never blocks the writer for the
/// duration of file I/O.
#[derive(Debug, Clone)]
pub struct LogReader {
    map: Arc<RwLock<SegmentMap>>,
}

impl LogReader {
    fn locate(&self, pos: GlobalPos) -> Option<RecordLocation> {
        self.map
            .read()
            .expect("segment map lock poisoned")
            .locate(pos)
    }

    /// Reads events in global order starting at `from`, up to `max_count`
    /// events, never past `head` (the published durable head).
    ///
    /// Reaching `head` or the end of the log returns the partial result.
    pub fn read_global(
        &self,
        from: GlobalPos,
        max_count: usize,
        head: Option<GlobalPos>,
    ) -> Result<Vec<Event>> {
        let Some(head) = head else {
            return Ok(Vec::new());
        };
        if max_count == 0 || from > head {
            return Ok(Vec::new());
        }

        let mut events = Vec::with_capacity(max_count.min(1024));
        let mut cursor = from;

        while events.len() < max_count && cursor <= head {
            let Some(location) = self.locate(cursor) else {
                break;
            };
            self.scan_segment(&location, head, max_count, &mut events, &mut cursor)?;
        }

        Ok(events)
    }

    /// Scans one segment sequentially from `location`, appending events
    /// until `max_count`, `head`, or end of segment. Leaves `cursor` at the
    /// next position to fetch.
    fn scan_segment(
        &self,
        location: &RecordLocation,
        head: GlobalPos,
        max_count: usize,
        events: &mut Vec<Event>,
        cursor: &mut GlobalPos,
    ) -> Result<()> {
        let file = File::open(&location.path)?;
        let mut reader = BufReader::new(file);
        reader.seek(SeekFrom::Start(location.offset))?;
        let mut offset = location.offset;

        loop {
            match read_one_record(&mut reader, offset, location.segment_first)? {
                None => break, // end of segment
                Some((Record::Commit(_), consumed)) => {
                    offset += consumed as u64;
                }
                Some((Record::Event(event), consumed)) => {
                    offset += consumed as u64;
                    let pos = event.global_pos;
                    debug_assert_eq!(pos, *cursor, "global scan must be gapless");
                    events.push(event);
                    *cursor = pos.next();
                    if events.len() >= max_count || pos >= head {
                        break;
                    }
                }
            }
        }
        Ok(())
    }

    /// Reads the event records at the given positions.
    ///
    /// Positions must be published (≤ head); unknown positions are an
    /// error. Consecutive positions in the same segment share one file
    /// handle.
    pub fn read_positions(&self, positions: &[GlobalPos]) -> Result<Vec<Event>> {
        let mut events = Vec::with_capacity(positions.len());
        let mut open: Option<(u64, File)> = None;

        for &pos in positions {
            let location = self.locate(pos).ok_or(StorageError::Corrupted {
                segment: 0,
                offset: pos.as_u64(),
            })?;

            let reuse = open
                .as_ref()
                .is_some_and(|(first, _)| *first == location.segment_first);
            if !reuse {
                open = Some((location.segment_first, File::open(&location.path)?));
            }
            let (_, file) = open.as_mut().expect("file handle just ensured");

            file.seek(SeekFrom::Start(location.offset))?;
            let mut reader = BufReader::new(&mut *file);
            let record = read_one_record(&mut reader, location.offset, location.segment_first)?;
            match record {
                Some((Record::Event(event), _)) if event.global_pos == pos => {
                    events.push(event);
                }
                _ => {
                    return Err(StorageError::Corrupted {
                        segment: location.segment_first,
                        offset: location.offset,
                    })
                }
            }
        }

        Ok(events)
    }

    /// Rebuilds the position run for one stream by scanning
    /// segment trailers and record headers. Used when a cold stream's
    /// locator list was evicted.
    pub fn scan_stream_positions(
        &self,
        stream_id: &breccia_types::StreamId,
        head: Option<GlobalPos>,
    ) -> Result<Vec<GlobalPos>> {
        let Some(head) = head else {
            return Ok(Vec::new());
        };

        let mut positions = Vec::new();
        let mut cursor = GlobalPos::FIRST;
        // Full scan in batches; cold-stream rebuild is deliberately the
        // slow path.
        const SCAN_BATCH: usize = 4096;
        loop {
            let batch = self.read_global(cursor, SCAN_BATCH, Some(head))?;
            if batch.is_empty() {
                break;
            }
            cursor = batch.last().expect("non-empty batch").global_pos.next();
            positions.extend(
                batch
                    .into_iter()
                    .filter(|e| &e.stream_id == stream_id)
                    .map(|e| e.global_pos),
            );
            if cursor > head {
                break;
            }
        }
        Ok(positions)
    }
}

/// Reads one record from `reader`, or `None` at a clean end of file.
fn read_one_record(
    reader: &mut impl Read,
    offset: u64,
    segment_first: u64,
) -> Result<Option<(Record, usize)>> {
    let mut prefix = [0u8; record::PREFIX_SIZE];
    match reader.read_exact(&mut prefix) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    let total = record::frame_size(&prefix).expect("prefix is complete");
    let mut frame = vec![0u8; total];
    frame[..record::PREFIX_SIZE].copy_from_slice(&prefix);
    reader
        .read_exact(&mut frame[record::PREFIX_SIZE..])
        .map_err(|_| StorageError::Corrupted {
            segment: segment_first,
            offset,
        })?;

    let data = Bytes::from(frame);
    let (decoded, consumed) = decode_read_path(&data, offset, segment_first)?;
    Ok(Some((decoded, consumed)))
}

/// Decode wrapper that maps any failure on published bytes to `Corrupted`.
fn decode_read_path(
    data: &Bytes,
    offset: u64,
    segment_first: u64,
) -> Result<(Record, usize)> {
    record::decode(data, offset).map_err(|e| match e {
        StorageError::Io(io) => StorageError::Io(io),
        _ => StorageError::Corrupted {
            segment: segment_first,
            offset,
        },
    })
}

/// Syncs the log directory itself so newly created segment files survive a
/// crash of the containing directory entry.
pub fn sync_dir(dir: &Path) -> Result<()> {
    // Windows cannot open directories for sync; best-effort there.
    if let Ok(handle) = File::open(dir) {
        let _ = handle.sync_all();
    }
    Ok(())
}
